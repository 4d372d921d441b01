//! Per-turn tracking context for usage attribution.
//!
//! Mirrors the original's `ContextVar`-based `TrackingContext`
//! (`consume_service.py`): a value set once at turn start and read by
//! deeply nested tool/LLM-usage recorders without threading it through
//! every call site. The Rust analogue of a task-scoped `ContextVar` is
//! `tokio::task_local!` — scoped to the `spawn`ed turn task, not a
//! process-wide `static`, so concurrent turns never see each other's
//! context.

use uuid::Uuid;

use sa_domain::model::Attribution;

/// Identity and attribution for the turn currently executing on this task.
#[derive(Debug, Clone)]
pub struct TrackingContext {
    pub turn_id: Uuid,
    pub topic_id: Uuid,
    pub user_id: String,
    pub attribution: Attribution,
}

tokio::task_local! {
    static TRACKING_CONTEXT: TrackingContext;
}

/// Runs `f` with `ctx` installed as the task-local tracking context for
/// its duration. Use this to wrap the whole turn future at dispatch
/// time; anything the future awaits (including spawned sub-tasks that
/// `.await` inline) can read it back with [`current`].
pub async fn scope<F, Fut, R>(ctx: TrackingContext, f: F) -> R
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = R>,
{
    TRACKING_CONTEXT.scope(ctx, f()).await
}

/// Reads the tracking context for the turn driving the current task, if
/// one is installed. `None` outside of a [`scope`]d turn (e.g. in unit
/// tests that exercise a recorder directly).
pub fn current() -> Option<TrackingContext> {
    TRACKING_CONTEXT.try_with(|c| c.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::model::ForkMode;

    fn ctx() -> TrackingContext {
        TrackingContext {
            turn_id: Uuid::new_v4(),
            topic_id: Uuid::new_v4(),
            user_id: "u1".into(),
            attribution: Attribution {
                agent_id: "agent1".into(),
                marketplace_id: None,
                developer_user_id: None,
                fork_mode: ForkMode::Original,
            },
        }
    }

    #[tokio::test]
    async fn current_is_none_outside_scope() {
        assert!(current().is_none());
    }

    #[tokio::test]
    async fn current_reads_back_the_installed_context() {
        let c = ctx();
        let turn_id = c.turn_id;
        let seen = scope(c, || async { current().map(|c| c.turn_id) }).await;
        assert_eq!(seen, Some(turn_id));
    }

    #[tokio::test]
    async fn nested_scopes_are_task_isolated() {
        let a = ctx();
        let b = ctx();
        let (ra, rb) = tokio::join!(
            scope(a.clone(), || async { current().unwrap().turn_id }),
            scope(b.clone(), || async { current().unwrap().turn_id }),
        );
        assert_eq!(ra, a.turn_id);
        assert_eq!(rb, b.turn_id);
    }
}
