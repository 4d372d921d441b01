use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Chat topics & turns
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A chat thread. One topic maps to one sandbox and one conversation
/// transcript; multiple browser connections may attach to the same
/// topic_id across pods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTopic {
    pub topic_id: Uuid,
    pub user_id: String,
    pub agent_id: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single user-message-to-final-answer exchange within a topic. Owned
/// exclusively by whichever worker picked it up until it reaches a
/// terminal status; `interrupt` is populated exactly while the turn is
/// paused on a clarifying question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub turn_id: Uuid,
    pub session_id: String,
    pub topic_id: Uuid,
    pub user_id: String,
    pub stream_id: String,
    pub ai_message_id: Option<Uuid>,
    pub user_message: String,
    pub full_content: String,
    pub thinking_content: String,
    /// Tool calls grouped by the graph node that issued them, in the
    /// shape persisted on the AgentRun's `node_data.tool_calls`.
    pub tool_calls_by_node: std::collections::HashMap<String, Vec<Uuid>>,
    pub agent_run_id: Option<Uuid>,
    pub interrupt: Option<InterruptState>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: TurnStatus,
}

impl ChatTurn {
    /// `{session_id}:{topic_id}` — the routing key used for event-bus
    /// channels and presence/abort/question keys.
    pub fn connection_id(&self) -> String {
        format!("{}:{}", self.session_id, self.topic_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Running,
    Completed,
    Aborted,
    Interrupted,
    Errored,
}

/// The agent graph's own execution record for a turn: which nodes ran,
/// in what order, and what each produced. Allocated once per
/// `ChatTurn` (same lifetime as `ChatTurn.agent_run_id`) and updated
/// incrementally as the graph streams `AgentStart`/`NodeStart`/
/// `ToolCallRequest` events, then finalized when the turn reaches a
/// terminal outcome. A resumed turn (answered clarifying question)
/// reuses the same `agent_run_id` rather than allocating a new one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub agent_run_id: Uuid,
    pub turn_id: Uuid,
    pub topic_id: Uuid,
    pub user_id: String,
    pub status: AgentRunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub node_data: AgentRunNodeData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRunStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
}

/// The shape persisted in `AgentRun.node_data`: a coarse event timeline
/// plus structured per-node bookkeeping, enough to reconstruct what the
/// graph did without replaying the raw `ChatStreamEvent` stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentRunNodeData {
    /// Ordered log of `"{event}:{node_id}"` markers (`node_start:plan`,
    /// `tool_call:exec`, ...), in emission order.
    pub timeline: Vec<String>,
    /// Node ids in the order they started, first start wins on repeats.
    pub node_order: Vec<String>,
    /// node_id -> human-readable node name, from `NodeStart`.
    pub node_names: std::collections::HashMap<String, String>,
    /// node_id -> final output text, from the graph's `StreamingEnd`
    /// summary.
    pub node_outputs: std::collections::HashMap<String, String>,
    /// node_id -> tool_call_ids issued by that node.
    pub tool_calls: std::collections::HashMap<String, Vec<Uuid>>,
}

/// A paused clarifying-question interrupt, created when the agent graph
/// emits `ask_user_question`. Mirrored into three event-bus keys
/// (`question_thread`, `question_active`, `question_timeout`) so any pod
/// can validate a resume request without reaching the worker that
/// created it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptState {
    pub question_id: String,
    pub thread_id: String,
    pub timeout_seconds: u64,
    pub asked_at: DateTime<Utc>,
}

/// A recurring or one-shot autonomous agent turn, driven by a cron-like
/// schedule rather than a live user message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub task_id: Uuid,
    pub user_id: String,
    pub agent_id: String,
    pub prompt: String,
    pub schedule_type: ScheduleType,
    pub next_fire_at: DateTime<Utc>,
    pub run_count: u32,
    pub max_runs: Option<u32>,
    pub status: ScheduledTaskStatus,
    /// Id of the run that produced this task, when created by a prior
    /// auto-explore turn rather than the REST API.
    pub external_task_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleType {
    Once,
    Interval { seconds: u64 },
    Cron { expression: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledTaskStatus {
    Active,
    Paused,
    Exhausted,
    Cancelled,
}

/// Who gets credit (and payment) for a turn: the agent's author, and
/// optionally a marketplace listing and forked-agent developer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attribution {
    pub agent_id: String,
    pub marketplace_id: Option<String>,
    pub developer_user_id: Option<String>,
    pub fork_mode: ForkMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForkMode {
    /// The agent is the original, unmodified listing.
    Original,
    /// The agent was forked from another developer's listing.
    Forked,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wallet & settlement
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A user's credit balance, split into three buckets drained in a fixed
/// order: free grants first, then paid top-ups, then earned (developer
/// reward) credits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub user_id: String,
    pub free_balance: f64,
    pub paid_balance: f64,
    pub earned_balance: f64,
    /// Denormalized cache of `free_balance + paid_balance +
    /// earned_balance`, maintained alongside the buckets by every
    /// `WalletLedger` mutation rather than recomputed, so it can be
    /// compared directly against `total_credited - total_consumed`.
    pub virtual_total: f64,
    /// Lifetime sum of every credit ever applied to this wallet.
    pub total_credited: f64,
    /// Lifetime sum of every debit ever applied to this wallet.
    pub total_consumed: f64,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn total_balance(&self) -> f64 {
        self.free_balance + self.paid_balance + self.earned_balance
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WalletBucket {
    Free,
    Paid,
    Earned,
}

/// An append-only record of one debit or credit against a single bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: Uuid,
    pub user_id: String,
    pub bucket: WalletBucket,
    /// Positive for credits, negative for debits.
    pub delta: f64,
    pub reason: String,
    pub turn_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    /// Balance of `bucket` immediately after this entry was applied.
    pub balance_after: f64,
    /// Wallet `total_balance()` immediately after this entry was applied.
    pub total_balance_after: f64,
}

/// What a [`ConsumeRecord`] bills for. LLM records carry token/model
/// detail; tool-call records carry the tool name. Kept as a tag rather
/// than two separate tables so settlement can sum both kinds in one
/// pass per turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumeRecordKind {
    Llm,
    ToolCall,
}

/// A pending-to-settled record of what a turn actually cost, reconciled
/// against the wallet once the turn finishes (or is swept as orphaned).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumeRecord {
    pub record_id: Uuid,
    pub turn_id: Uuid,
    pub user_id: String,
    pub kind: ConsumeRecordKind,
    pub estimated_credits: f64,
    pub actual_credits: Option<f64>,
    pub status: ConsumeStatus,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,

    pub session_id: Option<String>,
    pub topic_id: Option<Uuid>,
    pub message_id: Option<Uuid>,

    /// Who this spend is attributed to, for developer reward accounting.
    pub agent_id: Option<String>,
    pub marketplace_id: Option<String>,
    pub developer_user_id: Option<String>,

    /// Populated for `kind == Llm`.
    pub tier: Option<String>,
    pub model: Option<String>,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    /// Estimated USD cost of the underlying provider call, independent
    /// of the credit price charged to the user — admin/payout accounting
    /// only, never shown to the end user.
    pub cost_usd: Option<f64>,

    /// Populated for `kind == ToolCall`.
    pub tool_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumeStatus {
    Pending,
    Success,
    Failed,
}

/// A developer's accumulated earnings from other users running their
/// published agents, denominated in the same credit unit as wallets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeveloperEarning {
    pub developer_user_id: String,
    pub agent_id: String,
    pub marketplace_id: Option<String>,
    pub turn_id: Uuid,
    pub credits: f64,
    /// The gross credits the turn consumed that this earning was a
    /// revenue-share cut of — lets the marketplace dashboard show a
    /// developer's take alongside the spend that produced it.
    pub total_consumed: f64,
    pub fork_mode: ForkMode,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sandboxes, runners, terminals
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The binding between a chat topic and its backing execution sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxBinding {
    pub topic_id: Uuid,
    pub sandbox_id: String,
    pub backend: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

/// A connected runner's last-known presence, as published to the event
/// bus. Advisory only — a stale entry does not block dispatch, it only
/// affects scheduling preference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerPresence {
    pub runner_id: String,
    pub user_id: String,
    pub pod_id: String,
    pub last_heartbeat: DateTime<Utc>,
}

/// A persistent PTY session that survives browser disconnects; output
/// produced while nobody is attached is buffered (TTL-bound) in the
/// event bus so a reconnect can replay it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PtySession {
    pub session_id: Uuid,
    pub sandbox_id: String,
    pub cols: u16,
    pub rows: u16,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wallet_total_sums_all_buckets() {
        let w = Wallet {
            user_id: "u1".into(),
            free_balance: 10.0,
            paid_balance: 5.0,
            earned_balance: 2.5,
            virtual_total: 17.5,
            total_credited: 17.5,
            total_consumed: 0.0,
            updated_at: Utc::now(),
        };
        assert!((w.total_balance() - 17.5).abs() < f64::EPSILON);
    }
}
