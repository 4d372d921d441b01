use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Chat Gateway WS protocol (browser <-> gateway)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Frames a browser client sends over the chat WebSocket. One socket is
/// bound to exactly one `(session_id, topic_id)` at connection time
/// (carried in the URL/handshake, not in these frames).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Heartbeat reply; handled before any DB work.
    Pong,
    /// Cancel the turn currently running on this connection.
    Abort,
    /// Answer a clarifying question the agent asked mid-turn.
    UserQuestionResponse { data: QuestionResponseData },
    /// Re-run the most recent user message on this topic.
    Regenerate,
    /// A normal user message, starting a new turn.
    Message {
        message: String,
        #[serde(default)]
        file_ids: Vec<String>,
        #[serde(default)]
        context: Option<serde_json::Value>,
        #[serde(default)]
        client_id: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionResponseData {
    pub question_id: String,
    #[serde(default)]
    pub selected_options: Option<Vec<String>>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub timed_out: Option<bool>,
}

/// Gateway-originated frames that are *not* one of
/// [`crate::stream::ChatStreamEvent`]'s own kinds. A turn's events are
/// sent to the browser by serializing the `ChatStreamEvent` directly
/// (it carries its own `type` tag); these frames share the same flat
/// `{"type": ..., ...}` wire shape so the client sees one unified
/// stream of tagged JSON objects regardless of which enum produced
/// them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// The user message was saved; echoes `client_id` for optimistic-UI
    /// reconciliation on the browser.
    MessageAck {
        message_id: String,
        client_id: Option<String>,
    },
    /// The assistant message was durably persisted.
    MessageSaved {
        stream_id: String,
        db_id: String,
        created_at: chrono::DateTime<chrono::Utc>,
    },
    /// The turn was cancelled by user abort.
    StreamAborted {
        stream_id: String,
        reason: String,
        partial_content_length: usize,
        tokens_consumed: u32,
    },
    /// A turn has been dispatched and is waiting on the graph to start
    /// streaming.
    Loading,
    /// The pre-dispatch balance check refused to start the turn.
    InsufficientBalance {
        error_code: String,
        action_required: String,
        stream_id: Option<String>,
    },
    /// Heartbeat; also used by the gateway to refresh the presence key.
    Ping,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runner protocol (gateway <-> connected runner CLI)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Framed JSON envelope exchanged with a connected runner. Every
/// request/response pair shares an `id`; proactive pushes (`pty_output`,
/// `pty_exit`) carry no `id`. Responses use a `type` ending in
/// `_result` with `success` and, on failure, `payload.error` set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
}

/// Request kinds the gateway may dispatch to a runner. `kind()` is the
/// wire `type` string; responses arrive as `"{kind}_result"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerRequestKind {
    Exec,
    ReadFile,
    WriteFile,
    ListFiles,
    FindFiles,
    SearchInFiles,
    PtyCreate,
    PtyInput,
    PtyResize,
    PtyClose,
    SandboxCreate,
    SandboxDelete,
}

impl RunnerRequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exec => "exec",
            Self::ReadFile => "read_file",
            Self::WriteFile => "write_file",
            Self::ListFiles => "list_files",
            Self::FindFiles => "find_files",
            Self::SearchInFiles => "search_in_files",
            Self::PtyCreate => "pty_create",
            Self::PtyInput => "pty_input",
            Self::PtyResize => "pty_resize",
            Self::PtyClose => "pty_close",
            Self::SandboxCreate => "sandbox_create",
            Self::SandboxDelete => "sandbox_delete",
        }
    }

    pub fn result_type(self) -> String {
        format!("{}_result", self.as_str())
    }
}

/// Proactive (no `id`) pushes a runner may send without being asked.
pub mod runner_push {
    pub const PTY_OUTPUT: &str = "pty_output";
    pub const PTY_EXIT: &str = "pty_exit";
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Terminal protocol (browser <-> gateway, PTY passthrough)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Input/output bytes are base64-encoded for byte safety (a PTY is not
/// guaranteed to emit valid UTF-8 mid-escape-sequence).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalClientFrame {
    /// Create a new PTY session (sends `pty_create` to the runner).
    Create,
    /// Reattach to an existing (possibly detached) session.
    Attach { session_id: String },
    Input { data: String },
    Resize { cols: u16, rows: u16 },
    Close,
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalServerFrame {
    Created { session_id: String },
    Attached { session_id: String },
    AttachFailed { message: String },
    Output { data: String },
    Exit { code: Option<i32> },
    Error { message: String },
    Pong,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// WebSocket close codes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub mod close_codes {
    /// Missing or invalid runner auth token.
    pub const RUNNER_AUTH_FAILED: u16 = 4001;
    /// Session access denied (cross-user).
    pub const SESSION_ACCESS_DENIED: u16 = 4003;
    /// Topic does not belong to the session, or doesn't exist.
    pub const TOPIC_MISMATCH: u16 = 4004;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frame_message_tags_correctly() {
        let frame = ClientFrame::Message {
            message: "hi".into(),
            file_ids: vec!["f1".into()],
            context: None,
            client_id: Some("c1".into()),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["client_id"], "c1");
    }

    #[test]
    fn client_frame_pong_has_no_payload() {
        let frame = ClientFrame::Pong;
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "pong");
    }

    #[test]
    fn chat_stream_event_and_server_frame_share_the_type_tag_namespace() {
        let turn_json = serde_json::to_value(crate::stream::ChatStreamEvent::Message {
            content: "hi".into(),
        })
        .unwrap();
        assert_eq!(turn_json["type"], "message");
        let control_json = serde_json::to_value(ServerFrame::Ping).unwrap();
        assert_eq!(control_json["type"], "ping");
    }

    #[test]
    fn server_frame_message_ack_roundtrips() {
        let frame = ServerFrame::MessageAck {
            message_id: "m1".into(),
            client_id: Some("c1".into()),
        };
        let json = serde_json::to_string(&frame).unwrap();
        let back: ServerFrame = serde_json::from_str(&json).unwrap();
        match back {
            ServerFrame::MessageAck { message_id, .. } => assert_eq!(message_id, "m1"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn runner_request_kind_result_type() {
        assert_eq!(RunnerRequestKind::PtyInput.result_type(), "pty_input_result");
    }

    #[test]
    fn runner_message_roundtrips() {
        let msg = RunnerMessage {
            id: Some("r1".into()),
            kind: "exec_result".into(),
            payload: serde_json::json!({"success": true}),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: RunnerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id.as_deref(), Some("r1"));
        assert_eq!(back.kind, "exec_result");
    }

    #[test]
    fn terminal_client_frame_attach_roundtrips() {
        let frame = TerminalClientFrame::Attach {
            session_id: "s1".into(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "attach");
        assert_eq!(json["session_id"], "s1");
    }

    #[test]
    fn terminal_server_frame_attach_failed_roundtrips() {
        let frame = TerminalServerFrame::AttachFailed {
            message: "Session expired or not found".into(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "attach_failed");
    }
}
