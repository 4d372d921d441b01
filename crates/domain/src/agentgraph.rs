use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::model::Attribution;
use crate::stream::{BoxStream, ChatStreamEvent};

/// Everything an agent graph needs to run one turn: the user's message,
/// the topic it belongs to, and who to bill/credit for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTurnInput {
    pub topic_id: Uuid,
    pub turn_id: Uuid,
    pub stream_id: String,
    pub user_id: String,
    pub sandbox_id: Option<String>,
    pub user_message: String,
    pub attribution: Attribution,
}

/// Everything needed to re-enter a paused graph at the point it asked a
/// clarifying question, injecting the user's answer as graph state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResumeInput {
    pub thread_id: String,
    pub question_id: String,
    pub answer_text: Option<String>,
    pub answer_options: Option<Vec<String>>,
    pub new_stream_id: String,
}

/// The boundary between the chat worker and the tool-using agent itself.
///
/// The agent graph's internals (planning, tool orchestration, memory) are
/// an external collaborator — this crate only defines the contract: feed
/// it a turn, get back a stream of [`ChatStreamEvent`]s. Implementations
/// decide how tool calls are dispatched (including sandbox execution);
/// the worker only consumes the resulting stream and handles
/// wallet/settlement bookkeeping around it.
#[async_trait]
pub trait AgentGraph: Send + Sync {
    /// Stable identifier for the agent this graph implements, used for
    /// attribution and pricing lookups.
    fn agent_id(&self) -> &str;

    /// Run one turn to completion, returning a live stream of events.
    /// A conforming stream ends with exactly one of `StreamingEnd`,
    /// `Message`, `AskUserQuestion`, or `Error`.
    async fn run_turn(&self, input: AgentTurnInput) -> Result<BoxStream<'static, ChatStreamEvent>>;

    /// Re-enter a graph paused at `resume.thread_id` with the user's
    /// answer to its clarifying question, then run the same event loop
    /// as a fresh turn. Implementations that never emit
    /// `AskUserQuestion` can leave this as the default, which errors.
    async fn resume_turn(
        &self,
        _resume: AgentResumeInput,
    ) -> Result<BoxStream<'static, ChatStreamEvent>> {
        Err(crate::error::Error::Other(
            "this agent graph does not support resuming from an interrupt".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ForkMode;

    #[test]
    fn agent_turn_input_serializes() {
        let input = AgentTurnInput {
            topic_id: Uuid::nil(),
            turn_id: Uuid::nil(),
            stream_id: "s1".into(),
            user_id: "u1".into(),
            sandbox_id: None,
            user_message: "hello".into(),
            attribution: Attribution {
                agent_id: "assistant".into(),
                marketplace_id: None,
                developer_user_id: None,
                fork_mode: ForkMode::Original,
            },
        };
        let json = serde_json::to_string(&input).unwrap();
        assert!(json.contains("\"user_id\":\"u1\""));
    }
}
