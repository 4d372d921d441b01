//! Auto-title generation: the first few turns of a new topic still
//! carry [`chat_store::PLACEHOLDER_TITLE`](super::chat_store::PLACEHOLDER_TITLE);
//! once there's enough conversation to summarize, a short descriptive
//! title is generated in the background and swapped in without blocking
//! the turn that triggered it.

use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use sa_domain::error::{Error, Result};
use sa_providers::traits::ChatRequest;
use sa_providers::LlmProvider;

use crate::state::AppState;

use super::chat_store::PLACEHOLDER_TITLE;

/// Topics past this many turns keep whatever title they started with —
/// generating one past the opening exchange would retitle an
/// established conversation out from under the user.
const TITLE_ELIGIBLE_TURN_COUNT: usize = 3;
const MAX_TITLE_CHARS: usize = 60;

/// Produces a short title from a conversation's opening message.
/// Abstracted behind a trait so a non-LLM title strategy (e.g. "first
/// N words of the message") can stand in for tests or budget-conscious
/// deployments without touching the call sites below.
#[async_trait]
pub trait TitleGenerator: Send + Sync {
    async fn generate_title(&self, user_message: &str) -> Result<String>;
}

/// Calls an [`LlmProvider`] with a short, low-temperature prompt — the
/// same non-streaming `provider.chat` shape
/// [`compact::generate_summary`](super::compact::generate_summary) uses
/// for transcript summaries.
pub struct LlmTitleGenerator {
    provider: Arc<dyn LlmProvider>,
}

impl LlmTitleGenerator {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl TitleGenerator for LlmTitleGenerator {
    async fn generate_title(&self, user_message: &str) -> Result<String> {
        let prompt = format!(
            "Write a short title (at most six words, no quotes, no trailing \
             punctuation) summarizing what this chat is about based on the \
             user's opening message:\n\n{user_message}"
        );
        let req = ChatRequest {
            messages: vec![sa_domain::tool::Message::user(&prompt)],
            tools: vec![],
            temperature: Some(0.2),
            max_tokens: Some(32),
            response_format: Default::default(),
            model: None,
        };
        let resp = self
            .provider
            .chat(req)
            .await
            .map_err(|e| Error::Provider {
                provider: "title_generation".into(),
                message: e.to_string(),
            })?;
        Ok(clean_title(&resp.content))
    }
}

fn clean_title(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('"').trim();
    super::truncate_str(trimmed, MAX_TITLE_CHARS)
}

/// If `topic_id`'s title is still the placeholder and it's early enough
/// in the conversation to be worth summarizing, spawn a background task
/// to generate and set a real one. Best-effort and fire-and-forget: a
/// title that never lands just leaves the placeholder in place.
pub fn maybe_generate_title(state: AppState, topic_id: Uuid) {
    let Some(topic) = state.chat_store.get_topic(topic_id) else {
        return;
    };
    if topic.title.as_deref() != Some(PLACEHOLDER_TITLE) {
        return;
    }
    if state.chat_store.topic_turn_count(topic_id) > TITLE_ELIGIBLE_TURN_COUNT {
        return;
    }
    let Some(seed_message) = state.chat_store.latest_user_message(topic_id) else {
        return;
    };

    tokio::spawn(async move {
        let provider = state
            .llm
            .for_role("summarizer")
            .or_else(|| state.llm.for_role("executor"))
            .or_else(|| state.llm.iter().next().map(|(_, p)| p.clone()));
        let Some(provider) = provider else {
            return;
        };
        let generator = LlmTitleGenerator::new(provider);
        match generator.generate_title(&seed_message).await {
            Ok(title) if !title.is_empty() => {
                state.chat_store.set_topic_title(topic_id, title);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(%topic_id, error = %e, "title generation failed");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_title_strips_quotes_and_whitespace() {
        assert_eq!(clean_title("  \"Deploying the API\"  "), "Deploying the API");
    }

    #[test]
    fn clean_title_truncates_long_output() {
        let long = "x".repeat(200);
        assert!(clean_title(&long).len() <= MAX_TITLE_CHARS);
    }
}
