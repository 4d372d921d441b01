//! Terminal WebSocket endpoint — browser PTY passthrough over
//! [`TerminalRegistry`]. One socket may create a session, detach on
//! disconnect, and be replaced by a different socket reattaching with
//! the same `session_id` later; the registry (not this handler) owns
//! session identity across that churn.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use sa_domain::wire::{close_codes, TerminalClientFrame, TerminalServerFrame};

use crate::state::AppState;

fn token_eq(provided: &str, expected_hash: &[u8]) -> bool {
    let provided_hash = Sha256::digest(provided.as_bytes());
    bool::from(provided_hash.as_slice().ct_eq(expected_hash))
}

#[derive(Debug, Deserialize)]
pub struct TerminalWsQuery {
    pub user_id: String,
    #[serde(default)]
    pub sandbox_id: Option<String>,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default)]
    pub token: Option<String>,
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

pub async fn terminal_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<TerminalWsQuery>,
) -> impl IntoResponse {
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

async fn handle_socket(socket: WebSocket, state: AppState, query: TerminalWsQuery) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (client_tx, mut client_rx) = tokio::sync::mpsc::channel::<TerminalServerFrame>(64);

    let writer = tokio::spawn(async move {
        while let Some(frame) = client_rx.recv().await {
            let Ok(json) = serde_json::to_string(&frame) else {
                continue;
            };
            if ws_sink.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    let mut session_id: Option<String> = None;

    while let Some(Ok(msg)) = ws_stream.next().await {
        let Message::Text(text) = msg else {
            if matches!(msg, Message::Close(_)) {
                break;
            }
            continue;
        };
        let Ok(frame) = serde_json::from_str::<TerminalClientFrame>(&text) else {
            continue;
        };

        match frame {
            TerminalClientFrame::Create => {
                let Some(sandbox_id) = query.sandbox_id.as_deref() else {
                    let _ = client_tx
                        .send(TerminalServerFrame::Error {
                            message: "sandbox_id is required to create a terminal session".into(),
                        })
                        .await;
                    continue;
                };
                match state
                    .terminals
                    .create(&query.user_id, sandbox_id, query.cols, query.rows, client_tx.clone())
                    .await
                {
                    Ok(id) => {
                        session_id = Some(id.clone());
                        let _ = client_tx.send(TerminalServerFrame::Created { session_id: id }).await;
                    }
                    Err(e) => {
                        let _ = client_tx
                            .send(TerminalServerFrame::Error { message: e.to_string() })
                            .await;
                    }
                }
            }
            TerminalClientFrame::Attach { session_id: target } => match state.terminals.attach(&target, client_tx.clone()) {
                Ok(()) => {
                    session_id = Some(target.clone());
                    let _ = client_tx
                        .send(TerminalServerFrame::Attached { session_id: target })
                        .await;
                }
                Err(_) => {
                    let _ = client_tx
                        .send(TerminalServerFrame::AttachFailed {
                            message: "Session expired or not found".into(),
                        })
                        .await;
                }
            },
            TerminalClientFrame::Input { data } => {
                if let Some(id) = &session_id {
                    if let Err(e) = state.terminals.send_input(id, data).await {
                        tracing::warn!(session_id = %id, error = %e, "pty input failed");
                    }
                }
            }
            TerminalClientFrame::Resize { cols, rows } => {
                if let Some(id) = &session_id {
                    if let Err(e) = state.terminals.resize(id, cols, rows).await {
                        tracing::warn!(session_id = %id, error = %e, "pty resize failed");
                    }
                }
            }
            TerminalClientFrame::Close => {
                if let Some(id) = session_id.take() {
                    let _ = state.terminals.close(&id).await;
                }
                break;
            }
            TerminalClientFrame::Ping => {
                let _ = client_tx.send(TerminalServerFrame::Pong).await;
            }
        }
    }

    // Disconnected without an explicit `close` — leave the session alive,
    // buffering output, until the detach TTL prunes it or a later socket
    // re-attaches.
    if let Some(id) = &session_id {
        state.terminals.detach(id);
    }
    writer.abort();
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

    #[test]
    fn default_dimensions_are_reasonable() {
        assert_eq!(default_cols(), 80);
        assert_eq!(default_rows(), 24);
    }
}
