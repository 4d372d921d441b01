use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// A boxed async stream, used for LLM streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Events emitted during LLM streaming (provider-agnostic).
///
/// Allows: dashboard live output, Discord/Telegram typing indicators,
/// partial responses, tool call assembly.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    /// A text token chunk.
    #[serde(rename = "token")]
    Token { text: String },

    /// A reasoning/thinking token chunk, emitted by providers that
    /// stream a separate reasoning channel (e.g. DeepSeek's
    /// `reasoning_content`) ahead of the final answer text.
    #[serde(rename = "thinking")]
    Thinking { text: String },

    /// A tool call has started.
    #[serde(rename = "tool_call_started")]
    ToolCallStarted { call_id: String, tool_name: String },

    /// Incremental tool call argument data.
    #[serde(rename = "tool_call_delta")]
    ToolCallDelta { call_id: String, delta: String },

    /// A tool call is complete with full arguments.
    #[serde(rename = "tool_call_finished")]
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },

    /// Stream is finished.
    #[serde(rename = "done")]
    Done {
        usage: Option<Usage>,
        finish_reason: Option<String>,
    },

    /// An error occurred during streaming.
    #[serde(rename = "error")]
    Error { message: String },
}

/// Token usage for a completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Events emitted by the agent graph over the lifetime of one chat turn,
/// consumed once by the chat worker and republished (modulo the
/// worker's own bookkeeping) to the gateway's `chat:{cid}` channel.
///
/// This is the exact event protocol the agent graph is pluggable behind
/// (see [`crate::agentgraph::AgentGraph`]): any implementation — a
/// hand-written scheduler, a graph-library wrapper — need only emit this
/// enum in the right order. A conforming stream ends with exactly one of
/// `StreamingEnd` (no further events), `Message`, `AskUserQuestion`, or
/// `Error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatStreamEvent {
    /// The assistant message row has been allocated; `stream_id`
    /// correlates every subsequent event of this answer.
    StreamingStart { stream_id: String },
    /// Incremental assistant text, appended to `full_content`.
    StreamingChunk { stream_id: String, text: String },
    /// The stream is done. `agent_state`, if present, is the
    /// authoritative final content overriding the concatenation of
    /// chunks (e.g. a graph node that post-processed the raw text).
    StreamingEnd {
        stream_id: String,
        agent_state: Option<AgentRunState>,
    },
    /// Token usage for the completion just produced. `total` defaults to
    /// `input + output` when the graph doesn't report it directly.
    TokenUsage {
        model: String,
        tier: String,
        input: u32,
        output: u32,
        total: Option<u32>,
        cache_read_tokens: Option<u32>,
    },
    /// The model is invoking a tool. Indexed by `tool_call_id`.
    ToolCallRequest {
        tool_call_id: String,
        node_id: String,
        name: String,
        arguments: serde_json::Value,
    },
    /// A dispatched tool call has returned. `status`/`error`/a `false`
    /// `success` field inside `result` all count as failure for billing
    /// purposes — the worker classifies this, not the graph.
    ToolCallResponse {
        tool_call_id: String,
        status: Option<String>,
        error: Option<String>,
        result: serde_json::Value,
    },
    ThinkingStart,
    ThinkingChunk { text: String },
    ThinkingEnd,
    AgentStart { node_id: String },
    AgentEnd { node_id: String },
    NodeStart { node_id: String, node_name: String },
    NodeEnd { node_id: String },
    /// File ids produced by a tool during this turn, to be linked to the
    /// assistant message.
    GeneratedFiles { file_ids: Vec<String> },
    /// Citations gathered during this turn; buffered by the worker and
    /// bulk-persisted at finalization.
    SearchCitations { citations: Vec<Citation> },
    /// The agent needs clarification before it can continue. Ends the
    /// turn without settlement; resumable via a new turn at `thread_id`.
    AskUserQuestion {
        question_id: String,
        thread_id: String,
        question: String,
        options: Option<Vec<String>>,
        allow_text_input: bool,
        timeout_seconds: u64,
    },
    /// Non-streaming finalize: the graph produced its answer in one
    /// shot rather than incrementally.
    Message { content: String },
    /// The graph failed. `detail` carries partial content, if any.
    Error {
        error_code: String,
        error_category: String,
        detail: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub url: String,
    pub title: Option<String>,
    pub snippet: Option<String>,
}

/// Per-node timeline produced by a completed/cancelled agent run,
/// carried by `StreamingEnd` when the graph wants to override the
/// plain concatenation of chunks with its own canonical output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRunState {
    pub final_content: String,
    pub timeline: Vec<String>,
    pub node_order: Vec<String>,
    pub node_outputs: std::collections::HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_stream_event_tags_by_type() {
        let ev = ChatStreamEvent::Message {
            content: "done".into(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["content"], "done");
    }

    #[test]
    fn streaming_start_carries_stream_id() {
        let ev = ChatStreamEvent::StreamingStart {
            stream_id: "s1".into(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "streaming_start");
        assert_eq!(json["stream_id"], "s1");
    }

    #[test]
    fn roundtrips_through_json() {
        let ev = ChatStreamEvent::ToolCallRequest {
            tool_call_id: "c1".into(),
            node_id: "n1".into(),
            name: "exec".into(),
            arguments: serde_json::json!({"cmd": "ls"}),
        };
        let json = serde_json::to_string(&ev).unwrap();
        let back: ChatStreamEvent = serde_json::from_str(&json).unwrap();
        match back {
            ChatStreamEvent::ToolCallRequest { tool_call_id, name, .. } => {
                assert_eq!(tool_call_id, "c1");
                assert_eq!(name, "exec");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn ask_user_question_roundtrips() {
        let ev = ChatStreamEvent::AskUserQuestion {
            question_id: "q1".into(),
            thread_id: "t1".into(),
            question: "which file?".into(),
            options: None,
            allow_text_input: true,
            timeout_seconds: 300,
        };
        let json = serde_json::to_string(&ev).unwrap();
        let back: ChatStreamEvent = serde_json::from_str(&json).unwrap();
        match back {
            ChatStreamEvent::AskUserQuestion { question_id, timeout_seconds, .. } => {
                assert_eq!(question_id, "q1");
                assert_eq!(timeout_seconds, 300);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
