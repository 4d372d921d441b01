//! Best-effort push-notification dispatch for completed turns.
//!
//! A turn that finishes while nobody has the tab open is the case this
//! exists for — the event-bus presence key (refreshed by `Ping` frames
//! on the chat WebSocket) tells us whether the browser is likely still
//! watching; if not, this degrades to whatever out-of-band notification
//! channel is configured (push, email, nothing). Failure here never
//! touches turn finalization — it's wired in after settlement, not
//! before it, and every error is swallowed with a log line.

use async_trait::async_trait;
use uuid::Uuid;

use crate::state::AppState;

/// A channel capable of telling a user, outside the live WebSocket, that
/// something happened. Implementations own their own delivery mechanism
/// (web push, APNs, a notifications table) — this crate only defines
/// the seam and a no-op default so a gateway with nothing configured
/// still compiles and runs.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify_turn_completed(&self, user_id: &str, topic_id: Uuid, preview: &str);
}

/// Default sink for gateways with no push provider wired in. Logs at
/// debug level so the degradation is visible without being noisy.
pub struct NoopNotificationSink;

#[async_trait]
impl NotificationSink for NoopNotificationSink {
    async fn notify_turn_completed(&self, user_id: &str, topic_id: Uuid, _preview: &str) {
        tracing::debug!(user_id, %topic_id, "no notification sink configured, dropping");
    }
}

/// If the user isn't present on any gateway pod (per the event bus'
/// presence key), dispatch a best-effort completion notification. Runs
/// in a spawned task so a slow or failing push provider never delays
/// turn finalization.
pub fn maybe_notify_completion(state: AppState, topic_id: Uuid, user_id: String) {
    tokio::spawn(async move {
        let Some(bus) = state.event_bus.as_ref() else {
            return;
        };
        match bus.is_present(&user_id).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(%topic_id, error = %e, "presence check failed, skipping notification");
                return;
            }
        }
        let preview = state
            .chat_store
            .latest_turn(topic_id)
            .map(|t| super::truncate_str(&t.full_content, 140))
            .unwrap_or_default();
        NoopNotificationSink
            .notify_turn_completed(&user_id, topic_id, &preview)
            .await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_sink_does_not_panic() {
        NoopNotificationSink
            .notify_turn_completed("u1", Uuid::new_v4(), "hello")
            .await;
    }
}
