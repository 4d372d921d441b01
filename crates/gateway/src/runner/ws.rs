//! WebSocket endpoint for a user's connected runner CLI.
//!
//! Generalizes `nodes::ws`'s pod-local registry + reader/writer-task
//! split to the runner RPC protocol (`sa_domain::wire::RunnerMessage`):
//! the pod that terminates this socket becomes "home" for the user's
//! runner until it disconnects, relaying requests addressed to it from
//! any pod (see [`RunnerRegistry`]) and forwarding proactive PTY pushes
//! into [`TerminalRegistry`].

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use sa_domain::wire::{close_codes, runner_push, RunnerMessage};

use crate::state::AppState;

fn token_eq(a: &str, b: &str) -> bool {
    let ha = Sha256::digest(a.as_bytes());
    let hb = Sha256::digest(b.as_bytes());
    bool::from(ha.ct_eq(&hb))
}

#[derive(Debug, Deserialize)]
pub struct RunnerWsQuery {
    pub user_id: String,
    #[serde(default)]
    pub token: Option<String>,
}

/// Per-user runner tokens, `SA_RUNNER_TOKENS="user1:tokA,user2:tokB"` —
/// mirrors `nodes::ws`'s `SA_NODE_TOKENS` convention. Unset means dev
/// mode: any runner may connect as any user.
pub async fn runner_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<RunnerWsQuery>,
) -> impl IntoResponse {
    if let Ok(tokens_raw) = std::env::var("SA_RUNNER_TOKENS") {
        let provided = query.token.as_deref().unwrap_or("");
        let valid = tokens_raw.split(',').any(|pair| {
            if let Some((uid, tok)) = pair.trim().split_once(':') {
                uid == query.user_id && token_eq(tok, provided)
            } else {
                false
            }
        });
        if !valid {
            return ws
                .on_upgrade(|socket| async move {
                    close_with(socket, close_codes::RUNNER_AUTH_FAILED, "invalid or missing runner token").await;
                })
                .into_response();
        }
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, query.user_id))
        .into_response()
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: String) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (sink_tx, mut sink_rx) = tokio::sync::mpsc::channel::<RunnerMessage>(256);

    state.runners.register_local(user_id.clone(), sink_tx);
    if let Some(bus) = &state.event_bus {
        if let Err(e) = bus.set_runner_online(&user_id, 120).await {
            tracing::warn!(user_id = %user_id, error = %e, "failed to mark runner online");
        }
    }
    tracing::info!(user_id = %user_id, "runner connected");

    let writer = tokio::spawn(async move {
        while let Some(msg) = sink_rx.recv().await {
            let Ok(json) = serde_json::to_string(&msg) else {
                continue;
            };
            if ws_sink.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => {
                let Ok(runner_msg) = serde_json::from_str::<RunnerMessage>(&text) else {
                    tracing::debug!(user_id = %user_id, "ignoring unparseable runner message");
                    continue;
                };
                handle_inbound(&state, &user_id, runner_msg).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    writer.abort();
    state.runners.remove_local(&user_id);
    tracing::info!(user_id = %user_id, "runner disconnected");
}

async fn handle_inbound(state: &AppState, user_id: &str, msg: RunnerMessage) {
    match msg.kind.as_str() {
        runner_push::PTY_OUTPUT => {
            let Some(session_id) = msg.payload.get("session_id").and_then(|v| v.as_str()) else {
                return;
            };
            let Some(data) = msg.payload.get("data").and_then(|v| v.as_str()) else {
                return;
            };
            state.terminals.push_output(session_id, data.to_string());
        }
        runner_push::PTY_EXIT => {
            let Some(session_id) = msg.payload.get("session_id").and_then(|v| v.as_str()) else {
                return;
            };
            let code = msg.payload.get("code").and_then(|v| v.as_i64()).map(|c| c as i32);
            state.terminals.notify_exit(session_id, code);
        }
        _ => {
            // A `*_result` reply to a request some pod is awaiting.
            if let Some(id) = &msg.id {
                if let Err(e) = state.runners.publish_response(id, &msg).await {
                    tracing::warn!(user_id = %user_id, error = %e, "failed to publish runner response");
                }
            } else {
                tracing::debug!(user_id = %user_id, kind = %msg.kind, "unexpected runner message with no id");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_eq_constant_time_compares_equal_strings() {
        assert!(token_eq("abc", "abc"));
        assert!(!token_eq("abc", "abd"));
    }
}
