//! Chat Worker: drives one turn of a pluggable [`AgentGraph`] to
//! completion, persisting into [`ChatStore`](super::chat_store::ChatStore)
//! and settling credits against the wallet as events arrive.
//!
//! One turn is one spawned task, registered in the shared [`CancelMap`]
//! under the topic's connection key so an `abort` frame from any pod can
//! reach it. The task owns nothing the rest of the gateway needs
//! synchronously — everything it produces is relayed to the chat
//! gateway's WebSocket handler over an outbound channel, and everything
//! it persists goes through `ChatStore`/`SettlementService`, both safe to
//! share across tasks.

use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::Instrument;
use uuid::Uuid;

use std::collections::HashMap;

use sa_domain::agentgraph::{AgentGraph, AgentResumeInput, AgentTurnInput};
use sa_domain::error::Error;
use sa_domain::model::{AgentRunStatus, InterruptState, TurnStatus};
use sa_domain::stream::{ChatStreamEvent, Citation};
use sa_domain::wire::{QuestionResponseData, ServerFrame};

use pz_ledger::PricingTable;

use crate::state::AppState;

use super::tracking::{self, TrackingContext};

/// A flat per-invocation credit cost charged for every tool call,
/// regardless of which tool ran. There's no per-tool pricing config to
/// draw on (tool cost varies by sandbox time, not by token volume like
/// LLM usage does) — a single platform-wide rate is the simplest thing
/// that bills *something* for tool use without inventing a pricing
/// dimension the spec never asked for.
const TOOL_CALL_CREDITS: f64 = 0.1;

/// Everything needed to dispatch a new turn from a freshly-received chat
/// message. `agent_id` is the topic's agent at connect time, used only
/// to seed attribution the first time a topic is touched.
#[derive(Debug, Clone)]
pub struct ChatDispatchInput {
    pub topic_id: Uuid,
    pub session_id: String,
    pub user_id: String,
    pub agent_id: String,
    pub user_message: String,
}

/// One item relayed from the worker to the chat gateway's WebSocket
/// handler. `ChatStreamEvent` and `ServerFrame` share the same flat
/// `{"type": ...}` wire shape (see `sa_domain::wire`), so the handler
/// can serialize either arm directly without re-wrapping it.
#[derive(Debug, Clone)]
pub enum WorkerOutbound {
    Turn(ChatStreamEvent),
    Control(ServerFrame),
}

pub type WorkerSink = mpsc::Sender<WorkerOutbound>;

/// Dispatch a new turn. Performs the pre-dispatch balance check
/// synchronously (refusing to even start a turn a zero-balance user
/// can't pay for) and otherwise returns immediately; the turn itself
/// runs in a spawned task that streams events to `outbound` until it
/// reaches one of the four terminal outcomes (completed / aborted /
/// interrupted / errored).
pub async fn dispatch_chat_turn(
    state: AppState,
    input: ChatDispatchInput,
    outbound: WorkerSink,
) -> Option<Uuid> {
    if !state.wallet.has_positive_balance(&input.user_id) {
        let _ = outbound
            .send(WorkerOutbound::Control(ServerFrame::InsufficientBalance {
                error_code: "insufficient_balance".into(),
                action_required: "top_up".into(),
                stream_id: None,
            }))
            .await;
        return None;
    }

    let agent_graph = match state.agent_graph.clone() {
        Some(g) => g,
        None => {
            let _ = outbound
                .send(WorkerOutbound::Turn(ChatStreamEvent::Error {
                    error_code: "no_agent_graph".into(),
                    error_category: "configuration".into(),
                    detail: "no agent graph is configured for this gateway".into(),
                }))
                .await;
            return None;
        }
    };

    state
        .chat_store
        .get_or_create_topic(input.topic_id, &input.user_id, &input.agent_id);
    let stream_id = Uuid::new_v4().to_string();
    let turn = state.chat_store.create_turn(
        input.session_id.clone(),
        input.topic_id,
        input.user_id.clone(),
        stream_id.clone(),
        input.user_message.clone(),
    );
    let attribution = state.chat_store.attribution(input.topic_id, &input.agent_id);

    let session_key = turn.connection_id();
    let cancel_token = state.cancel_map.register(&session_key);
    let turn_id = turn.turn_id;

    let _ = outbound.send(WorkerOutbound::Control(ServerFrame::Loading)).await;

    let turn_input = AgentTurnInput {
        topic_id: input.topic_id,
        turn_id,
        stream_id,
        user_id: input.user_id.clone(),
        sandbox_id: None,
        user_message: input.user_message.clone(),
        attribution: attribution.clone(),
    };

    let ctx = TrackingContext {
        turn_id,
        topic_id: input.topic_id,
        user_id: input.user_id.clone(),
        attribution,
    };
    let span = tracing::info_span!(
        "chat_worker",
        %turn_id,
        topic_id = %input.topic_id,
        user_id = %input.user_id,
    );

    tokio::spawn(
        tracking::scope(ctx, move || async move {
            if cancel_token.is_cancelled() {
                return;
            }
            let stream_result = agent_graph.run_turn(turn_input).await;
            drive_turn(state, turn_id, session_key, stream_result, outbound).await;
        })
        .instrument(span),
    );

    Some(turn_id)
}

/// Re-enter a turn paused on a clarifying question. Validates the
/// answer against the event-bus question state before touching the
/// agent graph at all, so a stale or mismatched answer never reaches it.
pub async fn resume_chat_from_interrupt(
    state: AppState,
    topic_id: Uuid,
    data: QuestionResponseData,
    outbound: WorkerSink,
) -> Result<Uuid, Error> {
    let turn = state
        .chat_store
        .latest_turn(topic_id)
        .ok_or_else(|| Error::QuestionMismatch("no turn awaiting a question on this topic".into()))?;
    if turn.status != TurnStatus::Interrupted {
        return Err(Error::QuestionMismatch("this topic has no turn awaiting an answer".into()));
    }
    let interrupt = turn
        .interrupt
        .clone()
        .ok_or_else(|| Error::QuestionMismatch("turn has no recorded interrupt".into()))?;
    if interrupt.question_id != data.question_id {
        return Err(Error::QuestionMismatch("question_id does not match the pending interrupt".into()));
    }

    let cid = turn.connection_id();
    let Some(bus) = state.event_bus.as_ref() else {
        return Err(Error::EventBus("event bus is not connected".into()));
    };
    if !bus.question_is_live(&cid, &data.question_id).await.unwrap_or(false) {
        return Err(Error::QuestionExpired(data.question_id.clone()));
    }
    bus.clear_pending_question(&cid, &data.question_id).await.ok();

    let agent_graph = state
        .agent_graph
        .clone()
        .ok_or_else(|| Error::Other("no agent graph is configured for this gateway".into()))?;

    let new_stream_id = Uuid::new_v4().to_string();
    let turn_id = turn.turn_id;
    let user_id = turn.user_id.clone();

    state.chat_store.update_turn(turn_id, |t| {
        t.stream_id = new_stream_id.clone();
        t.status = TurnStatus::Running;
        t.interrupt = None;
    });

    let cancel_token = state.cancel_map.register(&cid);
    let resume_input = AgentResumeInput {
        thread_id: interrupt.thread_id,
        question_id: data.question_id,
        answer_text: data.text,
        answer_options: data.selected_options,
        new_stream_id,
    };
    let attribution = state.chat_store.attribution(topic_id, &turn.user_id);

    let ctx = TrackingContext {
        turn_id,
        topic_id,
        user_id: user_id.clone(),
        attribution,
    };
    let span = tracing::info_span!("chat_worker", %turn_id, %topic_id, resumed = true);

    tokio::spawn(
        tracking::scope(ctx, move || async move {
            if cancel_token.is_cancelled() {
                return;
            }
            let stream_result = agent_graph.resume_turn(resume_input).await;
            drive_turn(state, turn_id, cid, stream_result, outbound).await;
        })
        .instrument(span),
    );

    Ok(turn_id)
}

/// Consume the agent graph's event stream for one turn to its terminal
/// outcome: forward every event to the browser as it arrives, persist
/// into `ChatStore`, account credits against the wallet, then finalize.
async fn drive_turn(
    state: AppState,
    turn_id: Uuid,
    session_key: String,
    stream_result: Result<sa_domain::stream::BoxStream<'static, ChatStreamEvent>, Error>,
    outbound: WorkerSink,
) {
    let Some(turn) = state.chat_store.get_turn(turn_id) else {
        state.cancel_map.remove(&session_key);
        return;
    };
    let topic_id = turn.topic_id;
    let user_id = turn.user_id.clone();
    let session_id = turn.session_id.clone();
    let message_id = turn.ai_message_id;
    let agent_run_id = turn.agent_run_id;
    let abort_key = topic_id.to_string();
    let pricing = PricingTable::from_config(&state.config.ledger);
    let attribution = state.chat_store.attribution(topic_id, &user_id);
    // tool_call_id -> tool name, so a later ToolCallResponse (which
    // carries no name of its own) can still be billed/recorded by it.
    let mut tool_call_names: HashMap<String, String> = HashMap::new();

    let mut stream = match stream_result {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(%turn_id, error = %e, "agent graph failed to start turn");
            finalize_errored(&state, turn_id, topic_id, &user_id, agent_run_id, &outbound, e.to_string()).await;
            state.cancel_map.remove(&session_key);
            return;
        }
    };

    let mut generated_files: Vec<String> = Vec::new();
    let mut citations: Vec<Citation> = Vec::new();
    let mut tokens_consumed: u32 = 0;
    let mut outcome = TurnStatus::Completed;
    let mut error_detail: Option<String> = None;

    while let Some(event) = stream.next().await {
        let mut stop = false;

        match &event {
            ChatStreamEvent::StreamingChunk { text, .. } => {
                state.chat_store.update_turn(turn_id, |t| t.full_content.push_str(text));
            }
            ChatStreamEvent::ThinkingChunk { text } => {
                state.chat_store.update_turn(turn_id, |t| t.thinking_content.push_str(text));
            }
            ChatStreamEvent::StreamingEnd { agent_state, .. } => {
                if let Some(final_state) = agent_state {
                    state.chat_store.update_turn(turn_id, |t| {
                        t.full_content = final_state.final_content.clone();
                    });
                    if let Some(run_id) = agent_run_id {
                        state.chat_store.update_agent_run(run_id, |r| {
                            r.node_data.timeline = final_state.timeline.clone();
                            r.node_data.node_order = final_state.node_order.clone();
                            r.node_data.node_outputs = final_state.node_outputs.clone();
                        });
                    }
                }
                stop = true;
            }
            ChatStreamEvent::Message { content } => {
                state.chat_store.update_turn(turn_id, |t| t.full_content = content.clone());
                stop = true;
            }
            ChatStreamEvent::TokenUsage { model, tier, input, output, total, .. } => {
                let total_tokens = total.unwrap_or(input + output);
                tokens_consumed = tokens_consumed.saturating_add(total_tokens);
                let units = total_tokens as f64 / 1000.0;
                let raw = pricing.calculate_llm_credits(tier, units);
                let credits = pricing.calculate_settlement_total(raw);
                if credits > 0.0 {
                    let cost_usd = pricing.calculate_llm_cost_usd(model, *input, *output);
                    state.settlement.open_llm_record(
                        turn_id,
                        &user_id,
                        credits,
                        &attribution,
                        &session_id,
                        topic_id,
                        message_id,
                        tier,
                        model,
                        *input,
                        *output,
                        cost_usd,
                    );
                }
            }
            ChatStreamEvent::AgentStart { node_id } => {
                if let Some(run_id) = agent_run_id {
                    state.chat_store.update_agent_run(run_id, |r| {
                        r.node_data.timeline.push(format!("agent_start:{node_id}"));
                    });
                }
            }
            ChatStreamEvent::AgentEnd { node_id } => {
                if let Some(run_id) = agent_run_id {
                    state.chat_store.update_agent_run(run_id, |r| {
                        r.node_data.timeline.push(format!("agent_end:{node_id}"));
                    });
                }
            }
            ChatStreamEvent::NodeStart { node_id, node_name } => {
                if let Some(run_id) = agent_run_id {
                    state.chat_store.update_agent_run(run_id, |r| {
                        r.node_data.timeline.push(format!("node_start:{node_id}"));
                        r.node_data.node_order.push(node_id.clone());
                        r.node_data.node_names.insert(node_id.clone(), node_name.clone());
                    });
                }
            }
            ChatStreamEvent::NodeEnd { node_id } => {
                if let Some(run_id) = agent_run_id {
                    state.chat_store.update_agent_run(run_id, |r| {
                        r.node_data.timeline.push(format!("node_end:{node_id}"));
                    });
                }
            }
            ChatStreamEvent::ToolCallRequest { tool_call_id, node_id, name, .. } => {
                let call_uuid = Uuid::parse_str(tool_call_id).unwrap_or_else(|_| Uuid::new_v4());
                tool_call_names.insert(tool_call_id.clone(), name.clone());
                state.chat_store.update_turn(turn_id, |t| {
                    t.tool_calls_by_node.entry(node_id.clone()).or_default().push(call_uuid);
                });
                if let Some(run_id) = agent_run_id {
                    state.chat_store.update_agent_run(run_id, |r| {
                        r.node_data.timeline.push(format!("tool_call:{name}"));
                        r.node_data.tool_calls.entry(node_id.clone()).or_default().push(call_uuid);
                    });
                }
            }
            ChatStreamEvent::ToolCallResponse { tool_call_id, status, error, result } => {
                let failed = error.is_some()
                    || status.as_deref() == Some("error")
                    || result.get("success").and_then(|v| v.as_bool()) == Some(false);
                if !failed {
                    let raw = pricing.calculate_tool_cost(TOOL_CALL_CREDITS);
                    let credits = pricing.calculate_settlement_total(raw);
                    let tool_name = tool_call_names
                        .get(tool_call_id)
                        .cloned()
                        .unwrap_or_else(|| "unknown".into());
                    state.settlement.open_tool_record(
                        turn_id,
                        &user_id,
                        credits,
                        &attribution,
                        &session_id,
                        topic_id,
                        message_id,
                        &tool_name,
                    );
                }
                if let Some(bus) = &state.event_bus {
                    if bus.is_abort_set(&abort_key).await.unwrap_or(false) {
                        outcome = TurnStatus::Aborted;
                        stop = true;
                    }
                }
            }
            ChatStreamEvent::GeneratedFiles { file_ids } => {
                generated_files.extend(file_ids.iter().cloned());
            }
            ChatStreamEvent::SearchCitations { citations: new_citations } => {
                citations.extend(new_citations.iter().cloned());
            }
            ChatStreamEvent::AskUserQuestion { question_id, thread_id, timeout_seconds, .. } => {
                let cid = turn.connection_id();
                if let Some(bus) = &state.event_bus {
                    if let Err(e) = bus
                        .set_pending_question(&cid, thread_id, question_id, *timeout_seconds)
                        .await
                    {
                        tracing::warn!(%turn_id, error = %e, "failed to record pending question");
                    }
                }
                state.chat_store.update_turn(turn_id, |t| {
                    t.interrupt = Some(InterruptState {
                        question_id: question_id.clone(),
                        thread_id: thread_id.clone(),
                        timeout_seconds: *timeout_seconds,
                        asked_at: Utc::now(),
                    });
                });
                outcome = TurnStatus::Interrupted;
                stop = true;
            }
            ChatStreamEvent::Error { detail, .. } => {
                outcome = TurnStatus::Errored;
                error_detail = Some(detail.clone());
                stop = true;
            }
            _ => {}
        }

        if outbound.send(WorkerOutbound::Turn(event)).await.is_err() {
            // Browser side is gone; keep draining/billing the turn to
            // completion rather than leaving it stuck mid-flight, but
            // stop trying to deliver further output.
        }

        if !stop {
            if let Some(bus) = &state.event_bus {
                if matches!(outcome, TurnStatus::Completed)
                    && bus.is_abort_set(&abort_key).await.unwrap_or(false)
                {
                    outcome = TurnStatus::Aborted;
                    stop = true;
                }
            }
        }

        if stop {
            break;
        }
    }

    match outcome {
        TurnStatus::Interrupted => {
            finalize_interrupted(&state, turn_id, &session_key).await;
        }
        TurnStatus::Aborted => {
            if let Some(bus) = &state.event_bus {
                let _ = bus.take_abort(&abort_key).await;
            }
            finalize_aborted(&state, turn_id, topic_id, &user_id, agent_run_id, &outbound, tokens_consumed).await;
            state.cancel_map.remove(&session_key);
        }
        TurnStatus::Errored => {
            finalize_errored(
                &state,
                turn_id,
                topic_id,
                &user_id,
                agent_run_id,
                &outbound,
                error_detail.unwrap_or_else(|| "agent graph reported an error".into()),
            )
            .await;
            state.cancel_map.remove(&session_key);
        }
        TurnStatus::Completed | TurnStatus::Running => {
            finalize_completed(&state, turn_id, topic_id, &user_id, agent_run_id).await;
            state.cancel_map.remove(&session_key);
        }
    }

    let _ = (generated_files, citations);
}

async fn finalize_completed(
    state: &AppState,
    turn_id: Uuid,
    topic_id: Uuid,
    user_id: &str,
    agent_run_id: Option<Uuid>,
) {
    state.chat_store.update_turn(turn_id, |t| {
        t.status = TurnStatus::Completed;
        t.finished_at = Some(Utc::now());
    });
    if let Some(run_id) = agent_run_id {
        state
            .chat_store
            .finalize_agent_run(run_id, turn_id, topic_id, user_id, AgentRunStatus::Completed);
    }
    let deducted = state.settlement.settle_turn(turn_id, user_id);
    if deducted > 0.0 {
        let attribution = state.chat_store.attribution(topic_id, user_id);
        state.developer_rewards.reward_for_turn(
            &attribution,
            turn_id,
            deducted,
            state.config.ledger.developer_revenue_share,
        );
    }
    state.chat_store.touch_topic(topic_id);
    super::title::maybe_generate_title(state.clone(), topic_id);
    super::notify::maybe_notify_completion(state.clone(), topic_id, user_id.to_string());
}

async fn finalize_aborted(
    state: &AppState,
    turn_id: Uuid,
    topic_id: Uuid,
    user_id: &str,
    agent_run_id: Option<Uuid>,
    outbound: &WorkerSink,
    tokens_consumed: u32,
) {
    let partial_len = state
        .chat_store
        .get_turn(turn_id)
        .map(|t| t.full_content.len())
        .unwrap_or(0);
    state.chat_store.update_turn(turn_id, |t| {
        t.status = TurnStatus::Aborted;
        t.finished_at = Some(Utc::now());
    });
    // Creates a cancelled AgentRun if the graph never got far enough to
    // touch one before the abort landed.
    state.chat_store.finalize_agent_run(
        agent_run_id.unwrap_or_else(Uuid::new_v4),
        turn_id,
        topic_id,
        user_id,
        AgentRunStatus::Cancelled,
    );
    state.settlement.settle_turn(turn_id, user_id);
    let turn = state.chat_store.get_turn(turn_id);
    let stream_id = turn.map(|t| t.stream_id).unwrap_or_default();
    let _ = outbound
        .send(WorkerOutbound::Control(ServerFrame::StreamAborted {
            stream_id,
            reason: "user_abort".into(),
            partial_content_length: partial_len,
            tokens_consumed,
        }))
        .await;
}

async fn finalize_interrupted(state: &AppState, turn_id: Uuid, session_key: &str) {
    // Turn stays logically alive awaiting `resume_chat_from_interrupt`;
    // settlement is skipped per the event's contract (no cost attached
    // to a question that hasn't been answered yet). The cancel token is
    // still dropped since nothing is running until the resume re-spawns
    // one.
    let _ = turn_id;
    state.cancel_map.remove(session_key);
}

async fn finalize_errored(
    state: &AppState,
    turn_id: Uuid,
    topic_id: Uuid,
    user_id: &str,
    agent_run_id: Option<Uuid>,
    outbound: &WorkerSink,
    detail: String,
) {
    state.chat_store.update_turn(turn_id, |t| {
        t.status = TurnStatus::Errored;
        t.finished_at = Some(Utc::now());
    });
    state.chat_store.finalize_agent_run(
        agent_run_id.unwrap_or_else(Uuid::new_v4),
        turn_id,
        topic_id,
        user_id,
        AgentRunStatus::Failed,
    );
    state.settlement.settle_turn(turn_id, user_id);
    let _ = outbound
        .send(WorkerOutbound::Turn(ChatStreamEvent::Error {
            error_code: "turn_failed".into(),
            error_category: "internal".into(),
            detail,
        }))
        .await;
}

/// Recover turns left `Pending` by a worker that crashed mid-stream.
/// Meant to be driven by a periodic sweep (mirrors
/// `SettlementService::sweep_orphaned_since`'s own doc comment) — called
/// with the time the sweep last ran so it only ever reconciles records
/// newer than the previous pass.
pub fn sweep_orphaned_consume_records(state: &AppState, since: chrono::DateTime<Utc>) -> Vec<Uuid> {
    state.settlement.sweep_orphaned_since(since)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_credits_is_a_positive_flat_rate() {
        assert!(TOOL_CALL_CREDITS > 0.0);
    }
}
