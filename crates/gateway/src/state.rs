use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use pz_eventbus::EventBus;
use pz_ledger::{DeveloperRewardService, SettlementService, WalletLedger};
use pz_sandbox::SandboxManager;
use sa_domain::agentgraph::AgentGraph;
use sa_domain::config::Config;
use sa_memory::provider::SerialMemoryProvider;
use sa_providers::registry::ProviderRegistry;
use sa_sessions::{IdentityResolver, LifecycleManager, SessionStore, TranscriptWriter};
use sa_skills::registry::SkillsRegistry;
use sa_mcp_client::McpManager;
use sa_tools::ProcessManager;

use crate::api::inbound::DedupeStore;
use crate::nodes::registry::NodeRegistry;
use crate::nodes::router::ToolRouter;
use crate::runner::registry::RunnerRegistry;
use crate::runtime::agent::AgentManager;
use crate::runtime::approval::ApprovalStore;
use crate::runtime::cancel::CancelMap;
use crate::runtime::deliveries::DeliveryStore;
use crate::runtime::quota::QuotaTracker;
use crate::runtime::runs::RunStore;
use crate::runtime::schedules::ScheduleStore;
use crate::runtime::session_lock::SessionLockMap;
use crate::runtime::tasks::{TaskRunner, TaskStore};
use crate::skills::SkillEngine;
use crate::terminal::TerminalRegistry;
use crate::workspace::bootstrap::BootstrapTracker;
use crate::workspace::files::WorkspaceReader;

/// Wired LLM tier-routing state, present only when `[llm.router]` is
/// enabled in config. `classifier` is `None` until the embedding model
/// is reachable; `status`/`classify` degrade accordingly.
pub struct SmartRouterState {
    pub default_profile: sa_domain::config::RoutingProfile,
    pub tiers: sa_domain::config::TierConfig,
    pub classifier: Option<sa_providers::classifier::EmbeddingClassifier>,
    pub decisions: sa_providers::decisions::DecisionLog,
}

/// Cached user facts with a TTL.
#[derive(Clone)]
pub struct CachedUserFacts {
    pub content: String,
    pub fetched_at: Instant,
}

/// Cached tool definitions keyed on (node generation, policy fingerprint).
#[derive(Clone)]
pub struct CachedToolDefs {
    pub defs: Arc<Vec<sa_domain::tool::ToolDefinition>>,
    pub generation: u64,
    pub policy_key: String,
}

/// Shared application state passed to all API handlers.
///
/// Fields are grouped by concern:
/// - **Core services** — config, memory, LLM providers
/// - **Session management** — sessions, identity, lifecycle, transcripts
/// - **Context & skills** — workspace, skills, bootstrap, skill engine
/// - **Runtime** — runs, schedules, deliveries, agents, processes
/// - **Nodes & tools** — node registry, tool router, cancel map
/// - **Security & caching** — token hashes, command deny list, caches
#[derive(Clone)]
pub struct AppState {
    // ── Core services ─────────────────────────────────────────────────
    pub config: Arc<Config>,
    pub memory: Arc<dyn SerialMemoryProvider>,
    pub llm: Arc<ProviderRegistry>,

    // ── Session management ────────────────────────────────────────────
    pub sessions: Arc<SessionStore>,
    pub identity: Arc<IdentityResolver>,
    pub lifecycle: Arc<LifecycleManager>,
    pub transcripts: Arc<TranscriptWriter>,
    pub session_locks: Arc<SessionLockMap>,

    // ── Context & skills ──────────────────────────────────────────────
    pub skills: Arc<SkillsRegistry>,
    pub workspace: Arc<WorkspaceReader>,
    pub bootstrap: Arc<BootstrapTracker>,
    /// Callable skill engine (web.fetch, etc.).
    pub skill_engine: Arc<SkillEngine>,

    // ── Runtime ───────────────────────────────────────────────────────
    /// Run execution tracker.
    pub run_store: Arc<RunStore>,
    /// Schedule store (cron jobs).
    pub schedule_store: Arc<ScheduleStore>,
    /// Delivery store (inbox notifications from scheduled runs).
    pub delivery_store: Arc<DeliveryStore>,
    /// Sub-agent manager. `None` if no agents are configured.
    pub agents: Option<Arc<AgentManager>>,
    pub processes: Arc<ProcessManager>,
    pub cancel_map: Arc<CancelMap>,
    /// Per-agent daily token/cost quota tracker (distinct from the
    /// per-user wallet below — this bounds one agent's aggregate usage,
    /// the wallet bounds one user's spend).
    pub quota_tracker: Arc<QuotaTracker>,
    pub task_store: Arc<TaskStore>,
    pub task_runner: Arc<TaskRunner>,

    // ── MCP (Model Context Protocol) servers ────────────────────────────
    /// MCP server connections and tool registry.
    pub mcp: Arc<McpManager>,

    // ── Nodes & tools ─────────────────────────────────────────────────
    pub nodes: Arc<NodeRegistry>,
    pub tool_router: Arc<ToolRouter>,

    // ── Inbound ───────────────────────────────────────────────────────
    /// Idempotency store for inbound event deduplication.
    pub dedupe: Arc<DedupeStore>,

    // ── Admin & import ────────────────────────────────────────────────
    /// Root directory for import staging (e.g. `./data/import`).
    pub import_root: PathBuf,
    /// Path to the loaded config file, kept for admin reload endpoints.
    pub config_path: PathBuf,
    /// Fired to tell long-running background tasks to wind down.
    pub shutdown_tx: Arc<tokio::sync::Notify>,

    // ── Event fabric, sandboxing, settlement ──────────────────────────
    /// Cross-pod event bus: pub/sub channels plus presence/abort/question
    /// TTL keys. Connecting is required at startup (sandboxing, runner
    /// dispatch, and terminal routing all depend on it); wrapped in
    /// `Option` only so handlers that don't need it can be written
    /// without threading a bare `Arc` through test fixtures.
    pub event_bus: Option<Arc<EventBus>>,
    pub sandboxes: Arc<SandboxManager>,
    pub wallet: Arc<WalletLedger>,
    pub settlement: Arc<SettlementService>,
    pub developer_rewards: Arc<DeveloperRewardService>,
    /// Pod-local registry of connected runner CLI WebSockets.
    pub runners: Arc<RunnerRegistry>,
    /// Pod-local registry of PTY sessions brokered through this pod.
    pub terminals: Arc<TerminalRegistry>,
    /// In-memory chat topic/turn store the worker and chat gateway both
    /// drive. No relational persistence per spec §1.
    pub chat_store: Arc<crate::runtime::chat_store::ChatStore>,
    /// The pluggable agent graph the chat worker drives. `None` only
    /// during the brief window in `build_app_state` before it's wired
    /// in (mirrors `agents`'s two-phase construction, since the graph's
    /// default implementation holds a clone of this very `AppState`).
    pub agent_graph: Option<Arc<dyn AgentGraph>>,

    // ── LLM tier routing (teacher-only, out of scope per spec §1's
    // "model provider adapters" exclusion — carried as-is since
    // `runtime::resolve_provider` still consults it) ──────────────────
    pub smart_router: Option<Arc<SmartRouterState>>,

    // ── Security (startup-computed) ───────────────────────────────────
    /// SHA-256 hash of the API bearer token (read once at startup).
    /// `None` = dev mode (no auth enforced).
    pub api_token_hash: Option<Vec<u8>>,
    /// SHA-256 hash of the admin bearer token (read once at startup).
    /// `None` = dev mode (admin endpoints accessible without auth).
    pub admin_token_hash: Option<Vec<u8>>,
    /// Precompiled exec denied-pattern regexes (compiled once at startup).
    pub denied_command_set: Arc<regex::RegexSet>,
    /// Precompiled exec approval-pattern regexes (compiled once at startup).
    pub approval_command_set: Arc<regex::RegexSet>,
    /// Pending exec approvals awaiting human decision.
    pub approval_store: Arc<ApprovalStore>,

    // ── Caches ────────────────────────────────────────────────────────
    /// Per-user TTL cache for user facts (avoids network calls every turn).
    pub user_facts_cache: Arc<RwLock<HashMap<String, CachedUserFacts>>>,
    /// Cached tool definitions keyed on policy fingerprint; invalidated by
    /// node registry generation counter.
    pub tool_defs_cache: Arc<RwLock<HashMap<String, CachedToolDefs>>>,
}
