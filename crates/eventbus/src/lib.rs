//! Cross-pod event bus: Redis pub/sub for fan-out, plus a handful of
//! TTL-keyed values (presence, abort signals, sandbox locks) that every
//! gateway pod needs to agree on regardless of which pod holds the
//! in-process state for a given topic.

use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use redis::AsyncCommands;
use sa_domain::config::EventBusConfig;
use sa_domain::error::{Error, Result};

/// Handle to the shared Redis-backed event bus. Cheap to clone — holds a
/// [`redis::aio::ConnectionManager`], which multiplexes commands over a
/// single auto-reconnecting connection and is safe to share across tasks
/// for the lifetime of the process (the gateway wires one `EventBus` per
/// pod into `AppState`, not one per connection).
#[derive(Clone)]
pub struct EventBus {
    client: redis::Client,
    conn: redis::aio::ConnectionManager,
    prefix: String,
    presence_ttl: Duration,
    abort_ttl: Duration,
}

impl EventBus {
    pub async fn connect(config: &EventBusConfig) -> Result<Self> {
        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(|e| Error::EventBus(format!("invalid redis_url: {e}")))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| Error::EventBus(format!("connect failed: {e}")))?;
        Ok(Self {
            client,
            conn,
            prefix: config.key_prefix.clone(),
            presence_ttl: Duration::from_secs(config.presence_ttl_seconds),
            abort_ttl: Duration::from_secs(config.abort_ttl_seconds),
        })
    }

    fn key(&self, parts: &[&str]) -> String {
        join_key(&self.prefix, parts)
    }

    // ── pub/sub ──────────────────────────────────────────────────────

    pub async fn publish(&self, channel: &str, payload: impl Into<Vec<u8>>) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .publish(self.key(&["ch", channel]), payload.into())
            .await
            .map_err(|e| Error::EventBus(format!("publish {channel}: {e}")))?;
        Ok(())
    }

    /// Subscribe to a channel, returning a stream of raw payloads. Opens a
    /// dedicated pub/sub connection (Redis requires this — a connection
    /// in subscriber mode cannot run other commands).
    pub async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<impl Stream<Item = Bytes> + Send + 'static> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| Error::EventBus(format!("pubsub connect: {e}")))?;
        let full_channel = self.key(&["ch", channel]);
        pubsub
            .subscribe(&full_channel)
            .await
            .map_err(|e| Error::EventBus(format!("subscribe {channel}: {e}")))?;
        let stream = pubsub
            .into_on_message()
            .map(|msg| Bytes::copy_from_slice(msg.get_payload_bytes()));
        Ok(stream)
    }

    // ── presence ─────────────────────────────────────────────────────

    pub fn presence_key(&self, user_id: &str) -> String {
        self.key(&["presence", user_id])
    }

    /// Mark a user online, refreshing the TTL. Best-effort: presence is a
    /// scheduling hint, never a correctness requirement.
    pub async fn set_presence(&self, user_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = self.presence_key(user_id);
        let ttl = self.presence_ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(key, "1", ttl)
            .await
            .map_err(|e| Error::EventBus(format!("set_presence: {e}")))
    }

    pub async fn is_present(&self, user_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn
            .exists(self.presence_key(user_id))
            .await
            .map_err(|e| Error::EventBus(format!("is_present: {e}")))?;
        Ok(exists)
    }

    // ── abort signal ─────────────────────────────────────────────────

    pub fn abort_key(&self, turn_id: &str) -> String {
        self.key(&["abort", turn_id])
    }

    pub async fn set_abort(&self, turn_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let ttl = self.abort_ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(self.abort_key(turn_id), "1", ttl)
            .await
            .map_err(|e| Error::EventBus(format!("set_abort: {e}")))
    }

    /// Non-destructive peek: has an abort been requested for this turn?
    /// Used mid-turn by the agent graph to stop emitting events; the key
    /// itself is cleared by the worker at the end of the abort path via
    /// [`take_abort`](Self::take_abort), not here.
    pub async fn is_abort_set(&self, turn_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        conn.exists(self.abort_key(turn_id))
            .await
            .map_err(|e| Error::EventBus(format!("is_abort_set: {e}")))
    }

    /// Check-and-clear: returns `true` exactly once per abort request.
    pub async fn take_abort(&self, turn_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let key = self.abort_key(turn_id);
        let existed: i32 = redis::cmd("GETDEL")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map(|v: Option<String>| if v.is_some() { 1 } else { 0 })
            .map_err(|e| Error::EventBus(format!("take_abort: {e}")))?;
        Ok(existed == 1)
    }

    // ── sandbox lock / binding ───────────────────────────────────────

    pub fn sandbox_key(&self, topic_id: &str) -> String {
        self.key(&["sandbox", topic_id])
    }

    pub fn sandbox_lock_key(&self, topic_id: &str) -> String {
        self.key(&["sandbox-lock", topic_id])
    }

    /// Record which sandbox_id is bound to a topic, so other pods racing
    /// to the same topic pick up the winner's sandbox instead of
    /// creating their own. TTL matches the sandbox idle lifetime, not
    /// the (much shorter) creation lock.
    pub async fn set_sandbox_binding(
        &self,
        topic_id: &str,
        sandbox_id: &str,
        ttl_seconds: u64,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(self.sandbox_key(topic_id), sandbox_id, ttl_seconds.max(1))
            .await
            .map_err(|e| Error::EventBus(format!("set_sandbox_binding: {e}")))
    }

    pub async fn get_sandbox_binding(&self, topic_id: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(self.sandbox_key(topic_id))
            .await
            .map_err(|e| Error::EventBus(format!("get_sandbox_binding: {e}")))
    }

    /// Atomically acquire the sandbox-creation lock for a topic. Returns
    /// `true` if this caller now holds it. `token` should be unique per
    /// attempt (e.g. a uuid) so only the holder can release it.
    pub async fn acquire_sandbox_lock(
        &self,
        topic_id: &str,
        token: &str,
        ttl_ms: u64,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let key = self.sandbox_lock_key(topic_id);
        let ok: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::EventBus(format!("acquire_sandbox_lock: {e}")))?;
        Ok(ok.is_some())
    }

    /// Release the lock, but only if `token` still matches the current
    /// holder (avoids releasing a lock another attempt already acquired
    /// after this one's TTL expired).
    pub async fn release_sandbox_lock(&self, topic_id: &str, token: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = self.sandbox_lock_key(topic_id);
        const SCRIPT: &str = r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                return redis.call("DEL", KEYS[1])
            else
                return 0
            end
        "#;
        let _: i32 = redis::Script::new(SCRIPT)
            .key(&key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Error::EventBus(format!("release_sandbox_lock: {e}")))?;
        Ok(())
    }

    // ── runner presence ──────────────────────────────────────────────

    pub fn runner_online_key(&self, runner_id: &str) -> String {
        self.key(&["runner-online", runner_id])
    }

    pub async fn set_runner_online(&self, runner_id: &str, ttl_seconds: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(self.runner_online_key(runner_id), "1", ttl_seconds.max(1))
            .await
            .map_err(|e| Error::EventBus(format!("set_runner_online: {e}")))
    }

    // ── clarifying-question state ─────────────────────────────────────
    //
    // Three keys bound to the connection (`cid`), not the question: a
    // turn can raise several questions in sequence, but only one is ever
    // active. `question_thread` survives across resumes so the graph can
    // be re-entered at the right point; `question_active` is what a
    // `user_question_response` frame is checked against; the per-question
    // timeout key is what expires a stale answer.

    pub fn question_thread_key(&self, cid: &str) -> String {
        self.key(&["question_thread", cid])
    }

    pub fn question_active_key(&self, cid: &str) -> String {
        self.key(&["question_active", cid])
    }

    pub fn question_timeout_key(&self, cid: &str, question_id: &str) -> String {
        self.key(&["question_timeout", cid, question_id])
    }

    /// Record the question this connection is now waiting on. Called
    /// when `ask_user_question` is emitted.
    pub async fn set_pending_question(
        &self,
        cid: &str,
        thread_id: &str,
        question_id: &str,
        timeout_seconds: u64,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let ttl = timeout_seconds.max(1);
        conn.set_ex::<_, _, ()>(self.question_thread_key(cid), thread_id, ttl)
            .await
            .map_err(|e| Error::EventBus(format!("set_pending_question(thread): {e}")))?;
        conn.set_ex::<_, _, ()>(self.question_active_key(cid), question_id, ttl)
            .await
            .map_err(|e| Error::EventBus(format!("set_pending_question(active): {e}")))?;
        conn.set_ex::<_, _, ()>(self.question_timeout_key(cid, question_id), "1", ttl)
            .await
            .map_err(|e| Error::EventBus(format!("set_pending_question(timeout): {e}")))
    }

    /// The thread id stashed for this connection, if a question is
    /// (or was recently) active. Does not consume it.
    pub async fn get_question_thread(&self, cid: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(self.question_thread_key(cid))
            .await
            .map_err(|e| Error::EventBus(format!("get_question_thread: {e}")))
    }

    /// The active question id for this connection, if any.
    pub async fn get_active_question(&self, cid: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(self.question_active_key(cid))
            .await
            .map_err(|e| Error::EventBus(format!("get_active_question: {e}")))
    }

    /// Whether `question_id`'s per-question timeout key is still live —
    /// if it has expired, a late answer is rejected as `timed_out`.
    pub async fn question_is_live(&self, cid: &str, question_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        conn.exists(self.question_timeout_key(cid, question_id))
            .await
            .map_err(|e| Error::EventBus(format!("question_is_live: {e}")))
    }

    /// Clear all question state for this connection — called once the
    /// resume path validates and consumes the answer.
    pub async fn clear_pending_question(&self, cid: &str, question_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(self.question_thread_key(cid))
            .await
            .map_err(|e| Error::EventBus(format!("clear_pending_question(thread): {e}")))?;
        let _: () = conn
            .del(self.question_active_key(cid))
            .await
            .map_err(|e| Error::EventBus(format!("clear_pending_question(active): {e}")))?;
        let _: () = conn
            .del(self.question_timeout_key(cid, question_id))
            .await
            .map_err(|e| Error::EventBus(format!("clear_pending_question(timeout): {e}")))?;
        Ok(())
    }
}

fn join_key(prefix: &str, parts: &[&str]) -> String {
    let mut s = prefix.to_string();
    for p in parts {
        s.push(':');
        s.push_str(p);
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_key_namespaces_under_prefix() {
        assert_eq!(join_key("pz", &["presence", "u1"]), "pz:presence:u1");
        assert_eq!(
            join_key("pz", &["sandbox-lock", "t1"]),
            "pz:sandbox-lock:t1"
        );
    }

    #[test]
    fn join_key_single_part() {
        assert_eq!(join_key("pz", &["ch"]), "pz:ch");
    }
}
