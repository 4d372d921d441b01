//! PTY session lifecycle: create/attach/detach/destroy, with output
//! buffered while no browser socket is attached so a page reload or a
//! flaky connection doesn't lose terminal history.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use sa_domain::error::{Error, Result};
use sa_domain::model::PtySession;
use sa_domain::wire::{RunnerRequestKind, TerminalServerFrame};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::runner::registry::{RunnerRegistry, DEFAULT_RPC_TIMEOUT_MS};

/// Cap on buffered output chunks held for a detached session. Past this,
/// the oldest chunks are dropped — a reattaching client gets recent
/// scrollback, not a full unbounded log.
const MAX_BUFFERED_CHUNKS: usize = 2_000;

pub type TerminalSink = mpsc::Sender<TerminalServerFrame>;

struct TerminalHandle {
    session: PtySession,
    user_id: String,
    client: Mutex<Option<TerminalSink>>,
    buffer: Mutex<VecDeque<String>>,
    /// Set when the browser disconnects without sending `Close`. Cleared
    /// again on reattach. `None` means either never detached or closed.
    detached_at: Mutex<Option<Instant>>,
}

/// Pod-local registry of PTY sessions brokered through this pod. A
/// session's *runner* side lives wherever that user's runner is
/// connected (possibly a different pod) and is reached through
/// [`RunnerRegistry`]; this registry only tracks the browser-facing
/// half: which socket (if any) is attached, and what to replay when one
/// reconnects.
pub struct TerminalRegistry {
    runners: Arc<RunnerRegistry>,
    sessions: RwLock<HashMap<String, Arc<TerminalHandle>>>,
    detach_ttl: Duration,
}

impl TerminalRegistry {
    pub fn new(runners: Arc<RunnerRegistry>, detach_ttl: Duration) -> Self {
        Self {
            runners,
            sessions: RwLock::new(HashMap::new()),
            detach_ttl,
        }
    }

    /// Ask the user's runner to open a PTY and register the resulting
    /// session locally, attached to `client` from the start.
    pub async fn create(
        &self,
        user_id: &str,
        sandbox_id: &str,
        cols: u16,
        rows: u16,
        client: TerminalSink,
    ) -> Result<String> {
        let payload = self
            .runners
            .send_runner_request(
                user_id,
                RunnerRequestKind::PtyCreate,
                serde_json::json!({ "sandbox_id": sandbox_id, "cols": cols, "rows": rows }),
                DEFAULT_RPC_TIMEOUT_MS,
            )
            .await?;
        let session_uuid = payload
            .get("session_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
            .unwrap_or_else(Uuid::new_v4);
        let session_id = session_uuid.to_string();

        let handle = Arc::new(TerminalHandle {
            session: PtySession {
                session_id: session_uuid,
                sandbox_id: sandbox_id.to_string(),
                cols,
                rows,
                created_at: Utc::now(),
                closed_at: None,
            },
            user_id: user_id.to_string(),
            client: Mutex::new(Some(client)),
            buffer: Mutex::new(VecDeque::new()),
            detached_at: Mutex::new(None),
        });
        self.sessions.write().insert(session_id.clone(), handle);
        Ok(session_id)
    }

    /// Reattach a browser socket to an existing (possibly detached)
    /// session, replaying any output buffered while it was away.
    pub fn attach(&self, session_id: &str, client: TerminalSink) -> Result<()> {
        let handle = self
            .sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::Other(format!("no such terminal session: {session_id}")))?;

        let backlog: Vec<String> = handle.buffer.lock().drain(..).collect();
        for chunk in backlog {
            if client
                .try_send(TerminalServerFrame::Output { data: chunk })
                .is_err()
            {
                break;
            }
        }
        *handle.client.lock() = Some(client);
        *handle.detached_at.lock() = None;
        Ok(())
    }

    /// Browser socket disconnected without an explicit `Close` — start
    /// buffering output and the TTL countdown toward destruction.
    pub fn detach(&self, session_id: &str) {
        if let Some(handle) = self.sessions.read().get(session_id) {
            *handle.client.lock() = None;
            *handle.detached_at.lock() = Some(Instant::now());
        }
    }

    /// Deliver output arriving from the runner: straight to the attached
    /// socket if one is present, otherwise onto the replay buffer.
    pub fn push_output(&self, session_id: &str, data_base64: String) {
        let Some(handle) = self.sessions.read().get(session_id).cloned() else {
            return;
        };
        let client = handle.client.lock().clone();
        match client {
            Some(sink) => {
                let _ = sink.try_send(TerminalServerFrame::Output { data: data_base64 });
            }
            None => {
                let mut buf = handle.buffer.lock();
                buf.push_back(data_base64);
                while buf.len() > MAX_BUFFERED_CHUNKS {
                    buf.pop_front();
                }
            }
        }
    }

    /// The runner's process exited — notify the attached socket (if
    /// any) and tear the session down.
    pub fn notify_exit(&self, session_id: &str, code: Option<i32>) {
        if let Some(handle) = self.sessions.write().remove(session_id) {
            if let Some(sink) = handle.client.lock().clone() {
                let _ = sink.try_send(TerminalServerFrame::Exit { code });
            }
        }
    }

    pub async fn send_input(&self, session_id: &str, data_base64: String) -> Result<()> {
        let user_id = self.owning_user(session_id)?;
        self.runners
            .send_runner_request(
                &user_id,
                RunnerRequestKind::PtyInput,
                serde_json::json!({ "session_id": session_id, "data": data_base64 }),
                DEFAULT_RPC_TIMEOUT_MS,
            )
            .await?;
        Ok(())
    }

    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<()> {
        let user_id = self.owning_user(session_id)?;
        self.runners
            .send_runner_request(
                &user_id,
                RunnerRequestKind::PtyResize,
                serde_json::json!({ "session_id": session_id, "cols": cols, "rows": rows }),
                DEFAULT_RPC_TIMEOUT_MS,
            )
            .await?;
        Ok(())
    }

    /// Explicit close: ask the runner to kill the PTY and drop the
    /// session immediately, bypassing the detach TTL.
    pub async fn close(&self, session_id: &str) -> Result<()> {
        let user_id = self.owning_user(session_id)?;
        let result = self
            .runners
            .send_runner_request(
                &user_id,
                RunnerRequestKind::PtyClose,
                serde_json::json!({ "session_id": session_id }),
                DEFAULT_RPC_TIMEOUT_MS,
            )
            .await;
        self.sessions.write().remove(session_id);
        result.map(|_| ())
    }

    fn owning_user(&self, session_id: &str) -> Result<String> {
        self.sessions
            .read()
            .get(session_id)
            .map(|h| h.user_id.clone())
            .ok_or_else(|| Error::Other(format!("no such terminal session: {session_id}")))
    }

    /// Destroy any session that has been detached longer than the TTL.
    /// Called from the gateway's periodic pruning sweep.
    pub async fn prune_expired(&self) {
        let expired: Vec<String> = self
            .sessions
            .read()
            .iter()
            .filter_map(|(id, h)| {
                let detached_long_enough = h
                    .detached_at
                    .lock()
                    .map(|at| at.elapsed() >= self.detach_ttl)
                    .unwrap_or(false);
                detached_long_enough.then(|| id.clone())
            })
            .collect();
        for id in expired {
            tracing::info!(session_id = %id, "terminal session expired while detached");
            let _ = self.close(&id).await;
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}
