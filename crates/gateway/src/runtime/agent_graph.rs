//! Default [`AgentGraph`]: the teacher's LLM tool loop generalized to
//! emit [`ChatStreamEvent`]s instead of [`TurnEvent`]s.
//!
//! This is deliberately a flat ReAct loop (one node, "llm") rather than a
//! multi-node planning graph — `node_id`/`node_name` on every event are
//! always `"llm"`. A richer graph implementation can swap in behind the
//! same [`AgentGraph`] trait without the worker changing at all.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use futures_util::StreamExt;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use async_trait::async_trait;
use sa_domain::agentgraph::{AgentGraph, AgentResumeInput, AgentTurnInput};
use sa_domain::error::{Error, Result};
use sa_domain::stream::{BoxStream, ChatStreamEvent, StreamEvent};
use sa_domain::tool::{Message, ToolCall};
use sa_providers::ChatRequest;

use crate::runtime::tools;
use crate::state::AppState;

const MAX_TOOL_LOOPS: usize = 25;
const LLM_NODE_ID: &str = "llm";
const DEFAULT_TIER: &str = "standard";

/// Per-topic message history, standing in for the teacher's
/// session-scoped transcript since the graph boundary has no database
/// of its own — conversation continuity across turns is purely this
/// in-memory cache, keyed by the topic the graph was asked to run under.
pub struct LocalAgentGraph {
    state: AppState,
    topic_histories: Arc<RwLock<HashMap<Uuid, Vec<Message>>>>,
}

impl LocalAgentGraph {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            topic_histories: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn take_history(&self, topic_id: Uuid) -> Vec<Message> {
        self.topic_histories
            .read()
            .get(&topic_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl AgentGraph for LocalAgentGraph {
    fn agent_id(&self) -> &str {
        "local"
    }

    async fn run_turn(&self, input: AgentTurnInput) -> Result<BoxStream<'static, ChatStreamEvent>> {
        let mut messages = self.take_history(input.topic_id);
        messages.push(Message::user(&input.user_message));

        let (tx, rx) = mpsc::channel(64);
        let state = self.state.clone();
        let topic_id = input.topic_id;
        let stream_id = input.stream_id.clone();
        let histories = self.topic_histories.clone();
        tokio::spawn(async move {
            let final_messages = run_local_turn(&state, topic_id, stream_id, messages, tx).await;
            histories.write().insert(topic_id, final_messages);
        });
        Ok(receiver_stream(rx))
    }

    async fn resume_turn(
        &self,
        resume: AgentResumeInput,
    ) -> Result<BoxStream<'static, ChatStreamEvent>> {
        let topic_id = Uuid::parse_str(&resume.thread_id)
            .map_err(|_| Error::Other(format!("bad thread_id: {}", resume.thread_id)))?;

        let answer = resume
            .answer_text
            .or_else(|| resume.answer_options.and_then(|o| o.into_iter().next()))
            .unwrap_or_default();

        let mut messages = self.take_history(topic_id);
        messages.push(Message::user(&answer));

        let (tx, rx) = mpsc::channel(64);
        let state = self.state.clone();
        let stream_id = resume.new_stream_id.clone();
        let histories = self.topic_histories.clone();
        tokio::spawn(async move {
            let final_messages = run_local_turn(&state, topic_id, stream_id, messages, tx).await;
            histories.write().insert(topic_id, final_messages);
        });
        Ok(receiver_stream(rx))
    }
}

/// The event loop itself. Returns the final message history (including
/// everything accumulated this turn) so the caller can persist it back
/// into the per-topic cache. Never returns an error: failures are
/// reported through `ChatStreamEvent::Error` on the channel, matching
/// the "fatal internal errors become an `error` event" policy.
async fn run_local_turn(
    state: &AppState,
    topic_id: Uuid,
    stream_id: String,
    mut messages: Vec<Message>,
    tx: mpsc::Sender<ChatStreamEvent>,
) -> Vec<Message> {
    let _ = tx
        .send(ChatStreamEvent::StreamingStart {
            stream_id: stream_id.clone(),
        })
        .await;
    let _ = tx
        .send(ChatStreamEvent::AgentStart {
            node_id: LLM_NODE_ID.into(),
        })
        .await;

    let (provider, model) = match crate::runtime::resolve_provider(state, None, None, None) {
        Ok(p) => p,
        Err(e) => {
            let _ = tx
                .send(ChatStreamEvent::Error {
                    error_code: "no_provider".into(),
                    error_category: "fatal_internal".into(),
                    detail: e.to_string(),
                })
                .await;
            return messages;
        }
    };

    let tool_defs = tools::build_tool_definitions(state, None);
    let mut full_content = String::new();

    for loop_idx in 0..MAX_TOOL_LOOPS {
        let _ = tx
            .send(ChatStreamEvent::NodeStart {
                node_id: LLM_NODE_ID.into(),
                node_name: "llm".into(),
            })
            .await;

        let req = ChatRequest {
            messages: messages.clone(),
            tools: tool_defs.clone(),
            temperature: Some(0.2),
            max_tokens: None,
            response_format: Default::default(),
            model: model.clone(),
        };

        let mut stream = match provider.chat_stream(req).await {
            Ok(s) => s,
            Err(e) => {
                let _ = tx
                    .send(ChatStreamEvent::Error {
                        error_code: "provider_error".into(),
                        error_category: "transient_backend".into(),
                        detail: e.to_string(),
                    })
                    .await;
                return messages;
            }
        };

        let mut chunk_buf = String::new();
        let mut pending_tool_calls: Vec<ToolCall> = Vec::new();
        let mut tc_bufs: HashMap<String, (String, String)> = HashMap::new();
        let mut usage: Option<sa_domain::stream::Usage> = None;

        while let Some(event_result) = stream.next().await {
            let event = match event_result {
                Ok(e) => e,
                Err(e) => {
                    let _ = tx
                        .send(ChatStreamEvent::Error {
                            error_code: "provider_stream_error".into(),
                            error_category: "transient_backend".into(),
                            detail: e.to_string(),
                        })
                        .await;
                    return messages;
                }
            };

            match event {
                StreamEvent::Thinking { text } => {
                    let _ = tx.send(ChatStreamEvent::ThinkingChunk { text }).await;
                }
                StreamEvent::Token { text } => {
                    chunk_buf.push_str(&text);
                    full_content.push_str(&text);
                    let _ = tx
                        .send(ChatStreamEvent::StreamingChunk {
                            stream_id: stream_id.clone(),
                            text,
                        })
                        .await;
                }
                StreamEvent::ToolCallStarted { call_id, tool_name } => {
                    tc_bufs.insert(call_id, (tool_name, String::new()));
                }
                StreamEvent::ToolCallDelta { call_id, delta } => {
                    if let Some((_, args)) = tc_bufs.get_mut(&call_id) {
                        args.push_str(&delta);
                    }
                }
                StreamEvent::ToolCallFinished {
                    call_id,
                    tool_name,
                    arguments,
                } => {
                    pending_tool_calls.push(ToolCall {
                        call_id: call_id.clone(),
                        tool_name,
                        arguments,
                    });
                    tc_bufs.remove(&call_id);
                }
                StreamEvent::Done { usage: u, .. } => {
                    usage = u;
                }
                StreamEvent::Error { message } => {
                    let _ = tx
                        .send(ChatStreamEvent::Error {
                            error_code: "provider_error".into(),
                            error_category: "fatal_internal".into(),
                            detail: message,
                        })
                        .await;
                    return messages;
                }
            }
        }

        // Providers that only stream start+delta (no explicit "finished").
        for (call_id, (name, args_str)) in tc_bufs.drain() {
            let arguments = if args_str.trim().is_empty() {
                Value::Object(Default::default())
            } else {
                serde_json::from_str(&args_str).unwrap_or_else(|_| Value::Object(Default::default()))
            };
            pending_tool_calls.push(ToolCall {
                call_id,
                tool_name: name,
                arguments,
            });
        }

        if let Some(u) = &usage {
            let _ = tx
                .send(ChatStreamEvent::TokenUsage {
                    model: model.clone().unwrap_or_else(|| provider.provider_id().to_string()),
                    tier: DEFAULT_TIER.into(),
                    input: u.prompt_tokens,
                    output: u.completion_tokens,
                    total: Some(u.total_tokens),
                    cache_read_tokens: None,
                })
                .await;
        }

        let _ = tx
            .send(ChatStreamEvent::NodeEnd {
                node_id: LLM_NODE_ID.into(),
            })
            .await;

        if pending_tool_calls.is_empty() {
            if !chunk_buf.is_empty() {
                messages.push(Message::assistant(&chunk_buf));
            }
            let _ = tx
                .send(ChatStreamEvent::AgentEnd {
                    node_id: LLM_NODE_ID.into(),
                })
                .await;
            let agent_state = if full_content.is_empty() {
                None
            } else {
                Some(sa_domain::stream::AgentRunState {
                    final_content: full_content.clone(),
                    timeline: vec![LLM_NODE_ID.to_string()],
                    node_order: vec![LLM_NODE_ID.to_string()],
                    node_outputs: HashMap::new(),
                })
            };
            let _ = tx
                .send(ChatStreamEvent::StreamingEnd {
                    stream_id: stream_id.clone(),
                    agent_state,
                })
                .await;
            return messages;
        }

        if loop_idx + 1 >= MAX_TOOL_LOOPS {
            let _ = tx
                .send(ChatStreamEvent::Error {
                    error_code: "tool_loop_exceeded".into(),
                    error_category: "fatal_internal".into(),
                    detail: "exceeded maximum tool-call loop iterations".into(),
                })
                .await;
            return messages;
        }

        messages.push(build_assistant_tool_message(&chunk_buf, &pending_tool_calls));

        for tc in &pending_tool_calls {
            let _ = tx
                .send(ChatStreamEvent::ToolCallRequest {
                    tool_call_id: tc.call_id.clone(),
                    node_id: LLM_NODE_ID.into(),
                    name: tc.tool_name.clone(),
                    arguments: tc.arguments.clone(),
                })
                .await;
        }

        let dispatches = pending_tool_calls.iter().map(|tc| {
            let state = state;
            let name = tc.tool_name.clone();
            let args = tc.arguments.clone();
            async move { tools::dispatch_tool(state, &name, &args, None, None, Some(topic_id)).await }
        });
        let results = join_all(dispatches).await;

        for (tc, (content, is_error)) in pending_tool_calls.iter().zip(results.into_iter()) {
            let parsed: Value = serde_json::from_str(&content).unwrap_or(Value::String(content.clone()));
            let _ = tx
                .send(ChatStreamEvent::ToolCallResponse {
                    tool_call_id: tc.call_id.clone(),
                    status: Some(if is_error { "error" } else { "success" }.into()),
                    error: is_error.then(|| content.clone()),
                    result: parsed,
                })
                .await;
            messages.push(Message::tool_result(&tc.call_id, &content));

            // Per §4.1: after propagating a tool_call_response, check the
            // abort signal and break the loop gracefully if it's set. The
            // key itself stays live for the worker, which owns clearing
            // it at the end of the abort path.
            if let Some(bus) = &state.event_bus {
                if bus.is_abort_set(&topic_id.to_string()).await.unwrap_or(false) {
                    return messages;
                }
            }
        }
    }

    messages
}

/// Mirrors `runtime::turn::build_assistant_tool_message`: an assistant
/// message carrying both the text produced so far and the tool-use
/// content parts the model asked for, so the next provider call sees a
/// well-formed conversation.
fn build_assistant_tool_message(text: &str, tool_calls: &[ToolCall]) -> Message {
    use sa_domain::tool::{ContentPart, MessageContent, Role};
    let mut parts = Vec::new();
    if !text.is_empty() {
        parts.push(ContentPart::Text { text: text.to_string() });
    }
    for tc in tool_calls {
        parts.push(ContentPart::ToolUse {
            id: tc.call_id.clone(),
            name: tc.tool_name.clone(),
            input: tc.arguments.clone(),
        });
    }
    Message {
        role: Role::Assistant,
        content: MessageContent::Parts(parts),
    }
}

/// Adapts an `mpsc::Receiver` into the `BoxStream` the [`AgentGraph`]
/// trait returns, without pulling in a separate `tokio-stream`
/// dependency just for `ReceiverStream`.
fn receiver_stream(mut rx: mpsc::Receiver<ChatStreamEvent>) -> BoxStream<'static, ChatStreamEvent> {
    Box::pin(async_stream::stream! {
        while let Some(item) = rx.recv().await {
            yield item;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_tool_message_carries_both_text_and_tool_use() {
        let tc = ToolCall {
            call_id: "c1".into(),
            tool_name: "exec".into(),
            arguments: serde_json::json!({"command": "ls"}),
        };
        let msg = build_assistant_tool_message("thinking...", &[tc]);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "assistant");
        assert!(json["content"].is_array());
    }
}
