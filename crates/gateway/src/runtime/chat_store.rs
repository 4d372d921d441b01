//! In-memory store for chat topics and turns.
//!
//! The relational schema each row would normally live in is explicitly
//! out of scope (see `spec.md` §1); this mirrors the teacher's own
//! `RunStore`/`SessionStore` pattern — a `parking_lot::RwLock`-guarded
//! map behind a small struct API, no trait, no persistence.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use sa_domain::model::{
    AgentRun, AgentRunNodeData, AgentRunStatus, Attribution, ChatTopic, ChatTurn, ForkMode,
    TurnStatus,
};

/// Default placeholder title a freshly created topic carries until
/// `TitleGenerator` replaces it with something derived from the
/// conversation.
pub const PLACEHOLDER_TITLE: &str = "New chat";

pub struct ChatStore {
    topics: RwLock<HashMap<Uuid, ChatTopic>>,
    turns: RwLock<HashMap<Uuid, ChatTurn>>,
    /// Turn ids for a topic, oldest first — lets `regenerate` find the
    /// most recent user message and lets the title trigger count
    /// messages without scanning the whole `turns` map.
    topic_turns: RwLock<HashMap<Uuid, Vec<Uuid>>>,
    /// Developer-reward attribution resolved once per topic at connect
    /// time. Kept alongside rather than on `ChatTopic` itself since
    /// attribution is a gateway-layer concern the domain model doesn't
    /// need to carry.
    attributions: RwLock<HashMap<Uuid, Attribution>>,
    /// One row per `ChatTurn.agent_run_id`, created alongside the turn
    /// and updated as the graph streams node/tool events.
    agent_runs: RwLock<HashMap<Uuid, AgentRun>>,
}

impl ChatStore {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            turns: RwLock::new(HashMap::new()),
            topic_turns: RwLock::new(HashMap::new()),
            attributions: RwLock::new(HashMap::new()),
            agent_runs: RwLock::new(HashMap::new()),
        }
    }

    /// Attribution resolved for a topic, defaulting to an unattributed
    /// original (no marketplace listing, no developer payout) the
    /// first time it's asked for.
    pub fn attribution(&self, topic_id: Uuid, agent_id: &str) -> Attribution {
        if let Some(a) = self.attributions.read().get(&topic_id) {
            return a.clone();
        }
        let default = Attribution {
            agent_id: agent_id.to_string(),
            marketplace_id: None,
            developer_user_id: None,
            fork_mode: ForkMode::Original,
        };
        self.attributions
            .write()
            .entry(topic_id)
            .or_insert(default)
            .clone()
    }

    pub fn set_attribution(&self, topic_id: Uuid, attribution: Attribution) {
        self.attributions.write().insert(topic_id, attribution);
    }

    /// Fetch a topic, creating it with a placeholder title on first
    /// touch — a browser session's first message is the common case
    /// that has no prior REST-created topic to look up.
    pub fn get_or_create_topic(&self, topic_id: Uuid, user_id: &str, agent_id: &str) -> ChatTopic {
        if let Some(t) = self.topics.read().get(&topic_id) {
            return t.clone();
        }
        let now = Utc::now();
        let topic = ChatTopic {
            topic_id,
            user_id: user_id.to_string(),
            agent_id: agent_id.to_string(),
            title: Some(PLACEHOLDER_TITLE.to_string()),
            created_at: now,
            updated_at: now,
        };
        self.topics.write().entry(topic_id).or_insert(topic).clone()
    }

    pub fn get_topic(&self, topic_id: Uuid) -> Option<ChatTopic> {
        self.topics.read().get(&topic_id).cloned()
    }

    pub fn touch_topic(&self, topic_id: Uuid) {
        if let Some(t) = self.topics.write().get_mut(&topic_id) {
            t.updated_at = Utc::now();
        }
    }

    pub fn set_topic_title(&self, topic_id: Uuid, title: String) {
        if let Some(t) = self.topics.write().get_mut(&topic_id) {
            t.title = Some(title);
        }
    }

    /// Number of turns recorded for a topic so far — used by the
    /// "≤ 3 messages and title still a placeholder" auto-title trigger.
    pub fn topic_turn_count(&self, topic_id: Uuid) -> usize {
        self.topic_turns
            .read()
            .get(&topic_id)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    pub fn create_turn(
        &self,
        session_id: String,
        topic_id: Uuid,
        user_id: String,
        stream_id: String,
        user_message: String,
    ) -> ChatTurn {
        let now = Utc::now();
        let agent_run_id = Uuid::new_v4();
        let turn = ChatTurn {
            turn_id: Uuid::new_v4(),
            session_id,
            topic_id,
            user_id: user_id.clone(),
            stream_id,
            ai_message_id: None,
            user_message,
            full_content: String::new(),
            thinking_content: String::new(),
            tool_calls_by_node: HashMap::new(),
            agent_run_id: Some(agent_run_id),
            interrupt: None,
            started_at: now,
            finished_at: None,
            status: TurnStatus::Running,
        };
        self.turns.write().insert(turn.turn_id, turn.clone());
        self.topic_turns
            .write()
            .entry(topic_id)
            .or_default()
            .push(turn.turn_id);
        self.agent_runs.write().insert(
            agent_run_id,
            AgentRun {
                agent_run_id,
                turn_id: turn.turn_id,
                topic_id,
                user_id,
                status: AgentRunStatus::Running,
                started_at: now,
                ended_at: None,
                duration_ms: None,
                node_data: AgentRunNodeData::default(),
            },
        );
        turn
    }

    pub fn get_agent_run(&self, agent_run_id: Uuid) -> Option<AgentRun> {
        self.agent_runs.read().get(&agent_run_id).cloned()
    }

    /// Apply `f` to an agent run under the write lock, e.g. to append to
    /// its node timeline as events stream in.
    pub fn update_agent_run(&self, agent_run_id: Uuid, f: impl FnOnce(&mut AgentRun)) {
        if let Some(run) = self.agent_runs.write().get_mut(&agent_run_id) {
            f(run);
        }
    }

    /// Transition an agent run to a terminal status and stamp its
    /// duration. If the run doesn't exist yet (the graph never got far
    /// enough to touch it before the turn ended) creates one directly in
    /// that terminal status instead — every `agent_run_id` handed out by
    /// `create_turn` must resolve to exactly one row.
    pub fn finalize_agent_run(
        &self,
        agent_run_id: Uuid,
        turn_id: Uuid,
        topic_id: Uuid,
        user_id: &str,
        status: AgentRunStatus,
    ) {
        let now = Utc::now();
        let mut runs = self.agent_runs.write();
        match runs.get_mut(&agent_run_id) {
            Some(run) => {
                run.status = status;
                run.ended_at = Some(now);
                run.duration_ms = Some((now - run.started_at).num_milliseconds());
            }
            None => {
                runs.insert(
                    agent_run_id,
                    AgentRun {
                        agent_run_id,
                        turn_id,
                        topic_id,
                        user_id: user_id.to_string(),
                        status,
                        started_at: now,
                        ended_at: Some(now),
                        duration_ms: Some(0),
                        node_data: AgentRunNodeData::default(),
                    },
                );
            }
        }
    }

    pub fn get_turn(&self, turn_id: Uuid) -> Option<ChatTurn> {
        self.turns.read().get(&turn_id).cloned()
    }

    /// Apply `f` to a turn under the write lock and return its result,
    /// or `None` if the turn doesn't exist.
    pub fn update_turn<R>(&self, turn_id: Uuid, f: impl FnOnce(&mut ChatTurn) -> R) -> Option<R> {
        let mut turns = self.turns.write();
        turns.get_mut(&turn_id).map(f)
    }

    /// Most recent user message text on a topic, for `regenerate`.
    pub fn latest_user_message(&self, topic_id: Uuid) -> Option<String> {
        let ids = self.topic_turns.read().get(&topic_id)?.clone();
        let turns = self.turns.read();
        ids.iter()
            .rev()
            .find_map(|id| turns.get(id))
            .map(|t| t.user_message.clone())
    }

    /// Most recent turn on a topic, used to find a running turn to
    /// attach an `abort` to, or the in-flight interrupt for a resume.
    pub fn latest_turn(&self, topic_id: Uuid) -> Option<ChatTurn> {
        let ids = self.topic_turns.read().get(&topic_id)?.clone();
        let turns = self.turns.read();
        ids.iter().rev().find_map(|id| turns.get(id)).cloned()
    }
}

impl Default for ChatStore {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedChatStore = Arc<ChatStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_topic_is_idempotent() {
        let store = ChatStore::new();
        let id = Uuid::new_v4();
        let a = store.get_or_create_topic(id, "u1", "agent1");
        let b = store.get_or_create_topic(id, "u1", "agent1");
        assert_eq!(a.created_at, b.created_at);
        assert_eq!(a.title.as_deref(), Some(PLACEHOLDER_TITLE));
    }

    #[test]
    fn create_turn_tracks_topic_order() {
        let store = ChatStore::new();
        let topic_id = Uuid::new_v4();
        store.create_turn(
            "s1".into(),
            topic_id,
            "u1".into(),
            "stream1".into(),
            "first".into(),
        );
        store.create_turn(
            "s1".into(),
            topic_id,
            "u1".into(),
            "stream2".into(),
            "second".into(),
        );
        assert_eq!(store.topic_turn_count(topic_id), 2);
        assert_eq!(store.latest_user_message(topic_id).as_deref(), Some("second"));
    }

    #[test]
    fn update_turn_mutates_in_place() {
        let store = ChatStore::new();
        let topic_id = Uuid::new_v4();
        let turn = store.create_turn(
            "s1".into(),
            topic_id,
            "u1".into(),
            "stream1".into(),
            "hi".into(),
        );
        store.update_turn(turn.turn_id, |t| {
            t.full_content.push_str("hello");
            t.status = TurnStatus::Completed;
        });
        let updated = store.get_turn(turn.turn_id).unwrap();
        assert_eq!(updated.full_content, "hello");
        assert_eq!(updated.status, TurnStatus::Completed);
    }

    #[test]
    fn create_turn_allocates_exactly_one_agent_run() {
        let store = ChatStore::new();
        let topic_id = Uuid::new_v4();
        let turn = store.create_turn("s1".into(), topic_id, "u1".into(), "stream1".into(), "hi".into());
        let run_id = turn.agent_run_id.expect("agent_run_id must be set at creation");

        store.update_agent_run(run_id, |r| {
            r.node_data.node_order.push("plan".into());
            r.node_data.timeline.push("node_start:plan".into());
        });

        let run = store.get_agent_run(run_id).unwrap();
        assert_eq!(run.status, AgentRunStatus::Running);
        assert_eq!(run.node_data.node_order, vec!["plan".to_string()]);

        store.finalize_agent_run(run_id, turn.turn_id, topic_id, "u1", AgentRunStatus::Completed);
        let finished = store.get_agent_run(run_id).unwrap();
        assert_eq!(finished.status, AgentRunStatus::Completed);
        assert!(finished.ended_at.is_some());
        assert!(finished.duration_ms.is_some());
    }

    #[test]
    fn finalize_agent_run_creates_one_if_missing() {
        let store = ChatStore::new();
        let run_id = Uuid::new_v4();
        let turn_id = Uuid::new_v4();
        let topic_id = Uuid::new_v4();
        store.finalize_agent_run(run_id, turn_id, topic_id, "u1", AgentRunStatus::Cancelled);
        let run = store.get_agent_run(run_id).unwrap();
        assert_eq!(run.status, AgentRunStatus::Cancelled);
        assert_eq!(run.turn_id, turn_id);
    }
}
