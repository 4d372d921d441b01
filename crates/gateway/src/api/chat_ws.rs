//! Chat Gateway WebSocket endpoint — the browser-facing half of a turn.
//!
//! Generalizes `nodes::ws::node_ws`/`handle_socket` (split sink/stream,
//! `mpsc` outbound channel, spawned writer + inline reader loop) from the
//! node-tool protocol to the browser-chat protocol: a client message
//! dispatches into `runtime::worker`, and every event the worker produces
//! (plus anything relayed from the `chat:{cid}` bus channel, for the case
//! where a turn was dispatched from a different pod) is written back as a
//! tagged JSON frame.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use sa_domain::wire::{close_codes, ClientFrame, ServerFrame};

use crate::runtime::worker::{self, ChatDispatchInput, WorkerOutbound, WorkerSink};
use crate::state::AppState;

/// Safety-net TTL refreshed by the heartbeat — matches the presence key's
/// TTL in `sa_domain::config::EventBusConfig` (120 s in the teacher's
/// default config), with enough margin under it that two missed beats
/// still don't let presence lapse.
const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(25);

fn token_eq(provided: &str, expected_hash: &[u8]) -> bool {
    let provided_hash = Sha256::digest(provided.as_bytes());
    bool::from(provided_hash.as_slice().ct_eq(expected_hash))
}

#[derive(Debug, Deserialize)]
pub struct ChatWsQuery {
    pub topic_id: Uuid,
    pub user_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

pub async fn chat_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<ChatWsQuery>,
) -> impl IntoResponse {
    // Step 1: verify the auth token; reject with a specific close code on
    // failure rather than the generic node-endpoint 401, since a
    // WebSocket upgrade can't carry a response body a browser will show.
    if let Some(expected_hash) = &state.api_token_hash {
        let provided = query.token.as_deref().unwrap_or("");
        if !token_eq(provided, expected_hash) {
            return ws
                .on_upgrade(|socket| async move {
                    close_with(socket, close_codes::SESSION_ACCESS_DENIED, "invalid or missing token").await;
                })
                .into_response();
        }
    }

    // Step 2: look up the topic; reject cross-user access. A topic that
    // doesn't exist yet is fine — `get_or_create_topic` below seeds it.
    if let Some(topic) = state.chat_store.get_topic(query.topic_id) {
        if topic.user_id != query.user_id {
            return ws
                .on_upgrade(|socket| async move {
                    close_with(socket, close_codes::TOPIC_MISMATCH, "topic does not belong to this user").await;
                })
                .into_response();
        }
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, query))
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

async fn handle_socket(socket: WebSocket, state: AppState, query: ChatWsQuery) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    let session_id = query.session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let topic_id = query.topic_id;
    let user_id = query.user_id.clone();
    let agent_id = query.agent_id.clone();

    // Step 3 & 4: attribution resolution and the (CE-build) lifecycle
    // hook, which is a no-op here — an EE build would register the
    // connection toward a per-user parallel-chat limit.
    state.chat_store.get_or_create_topic(topic_id, &user_id, &agent_id);
    state.chat_store.attribution(topic_id, &agent_id);
    let cid = format!("{session_id}:{topic_id}");

    // Step 5: presence, set before the first frame is sent so a worker
    // racing to finish a turn immediately after connect still sees the
    // user as present.
    if let Some(bus) = &state.event_bus {
        if let Err(e) = bus.set_presence(&user_id).await {
            tracing::warn!(%topic_id, error = %e, "failed to set presence on connect");
        }
    }

    let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::channel::<WorkerOutbound>(256);

    // Step 6a: bus-to-socket relay. Lets a turn dispatched by a worker on
    // a different pod (this gateway always dispatches locally, but the
    // channel exists for the general multi-pod deployment) still reach
    // this browser.
    let bus_relay = state.event_bus.clone().map(|bus| {
        let tx = outbound_tx.clone();
        let channel = format!("chat:{cid}");
        tokio::spawn(async move {
            let mut stream = match bus.subscribe(&channel).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "chat bus relay subscribe failed");
                    return;
                }
            };
            while let Some(bytes) = stream.next().await {
                if let Ok(event) = serde_json::from_slice(&bytes) {
                    if tx.send(WorkerOutbound::Turn(event)).await.is_err() {
                        break;
                    }
                }
            }
        })
    });

    // Step 6b: heartbeat — ping every 25s and refresh the presence TTL.
    let heartbeat = {
        let tx = outbound_tx.clone();
        let bus = state.event_bus.clone();
        let user_id = user_id.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                interval.tick().await;
                if tx.send(WorkerOutbound::Control(ServerFrame::Ping)).await.is_err() {
                    break;
                }
                if let Some(bus) = &bus {
                    let _ = bus.set_presence(&user_id).await;
                }
            }
        })
    };

    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let json = match &msg {
                WorkerOutbound::Turn(event) => serde_json::to_string(event),
                WorkerOutbound::Control(frame) => serde_json::to_string(frame),
            };
            let Ok(text) = json else { continue };
            if ws_sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => {
                let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) else {
                    tracing::debug!(%topic_id, "ignoring unparseable client frame");
                    continue;
                };
                handle_client_frame(&state, topic_id, &session_id, &user_id, &agent_id, &cid, frame, &outbound_tx)
                    .await;
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
            _ => {}
        }
    }

    // Graceful close: cancel relay and heartbeat, delete the presence key
    // immediately (don't wait for the TTL), close the pub/sub
    // subscription (dropping the relay task does this).
    heartbeat.abort();
    if let Some(relay) = bus_relay {
        relay.abort();
    }
    writer.abort();
    // Deliberately does not abort any turn still running for this topic —
    // a disconnect degrades to the push-notification path
    // (`notify::maybe_notify_completion`), it doesn't cancel the work.
    tracing::info!(%topic_id, user_id = %user_id, "chat socket disconnected");
}

async fn handle_client_frame(
    state: &AppState,
    topic_id: Uuid,
    session_id: &str,
    user_id: &str,
    agent_id: &str,
    cid: &str,
    frame: ClientFrame,
    outbound: &WorkerSink,
) {
    match frame {
        ClientFrame::Pong => {}
        ClientFrame::Abort => {
            state.cancel_map.cancel(cid);
            if let Some(bus) = &state.event_bus {
                if let Err(e) = bus.set_abort(&topic_id.to_string()).await {
                    tracing::warn!(%topic_id, error = %e, "failed to set abort key");
                }
            }
        }
        ClientFrame::UserQuestionResponse { data } => {
            if let Err(e) = worker::resume_chat_from_interrupt(state.clone(), topic_id, data, outbound.clone()).await
            {
                let _ = outbound
                    .send(WorkerOutbound::Turn(sa_domain::stream::ChatStreamEvent::Error {
                        error_code: "resume_failed".into(),
                        error_category: "question".into(),
                        detail: e.to_string(),
                    }))
                    .await;
            }
        }
        ClientFrame::Regenerate => {
            let Some(message) = state.chat_store.latest_user_message(topic_id) else {
                return;
            };
            dispatch_message(state, topic_id, session_id, user_id, agent_id, message, None, outbound).await;
        }
        ClientFrame::Message {
            message,
            file_ids: _,
            context: _,
            client_id,
        } => {
            // Attachment linking (`file_ids`) and arbitrary `context` are
            // out of scope here — the storage layer and tool
            // implementations they'd feed into aren't part of this crate.
            dispatch_message(state, topic_id, session_id, user_id, agent_id, message, client_id, outbound).await;
        }
    }
}

async fn dispatch_message(
    state: &AppState,
    topic_id: Uuid,
    session_id: &str,
    user_id: &str,
    agent_id: &str,
    message: String,
    client_id: Option<String>,
    outbound: &WorkerSink,
) {
    let input = ChatDispatchInput {
        topic_id,
        session_id: session_id.to_string(),
        user_id: user_id.to_string(),
        agent_id: agent_id.to_string(),
        user_message: message,
    };
    if let Some(turn_id) = worker::dispatch_chat_turn(state.clone(), input, outbound.clone()).await {
        let _ = outbound
            .send(WorkerOutbound::Control(ServerFrame::MessageAck {
                message_id: turn_id.to_string(),
                client_id,
            }))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_eq_rejects_wrong_token() {
        let expected_hash = Sha256::digest(b"secret").to_vec();
        assert!(token_eq("secret", &expected_hash));
        assert!(!token_eq("wrong", &expected_hash));
    }
}
