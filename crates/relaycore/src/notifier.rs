//! Seam to the outbound Telegram Bot API.
//!
//! The relay never awaits a notifier while holding shared state; callers copy
//! what they need first. Failures come back as values, not errors.

use async_trait::async_trait;
use serde::Serialize;

/// Telegram caps message text at 4096 chars; leave room for the header.
pub const MAX_ANSWER_CHARS: usize = 3800;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum NotifyOutcome {
    Delivered,
    Failed(String),
}

impl NotifyOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, NotifyOutcome::Delivered)
    }
}

/// Article result posted back through `answerWebAppQuery`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebAppAnswer {
    pub result_id: String,
    pub title: String,
    pub text: String,
}

impl WebAppAnswer {
    /// Builds an answer whose text echoes `body`, truncated on a char boundary.
    pub fn echo(result_id: impl Into<String>, title: impl Into<String>, body: &str) -> Self {
        Self {
            result_id: result_id.into(),
            title: title.into(),
            text: truncate_chars(body, MAX_ANSWER_CHARS),
        }
    }
}

pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Answers the Mini App query that submitted data.
    async fn answer_web_app_query(&self, query_id: &str, answer: WebAppAnswer) -> NotifyOutcome;

    /// Sends a plain text message to the admin chat.
    async fn notify_admin(&self, text: &str) -> NotifyOutcome;
}

/// Notifier that delivers nowhere, for runs without a bot token.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn answer_web_app_query(&self, _query_id: &str, _answer: WebAppAnswer) -> NotifyOutcome {
        NotifyOutcome::Failed("notifier disabled".to_string())
    }

    async fn notify_admin(&self, _text: &str) -> NotifyOutcome {
        NotifyOutcome::Failed("notifier disabled".to_string())
    }
}
