//! Telegram Bot API implementation of the relay notifier.

use anyhow::Context;
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use relaycore::notifier::{Notifier, NotifyOutcome, WebAppAnswer};
use reqwest::ClientBuilder;
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use teloxide::prelude::*;
use teloxide::types::{InlineQueryResult, InlineQueryResultArticle, InputMessageContent, InputMessageContentText};
use teloxide::RequestError;
use tracing::{info, warn};

/// Per-request HTTP timeout for Bot API calls
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Retries after the first attempt
pub const MAX_RETRIES: usize = 3;

fn backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(500))
        .with_max_delay(Duration::from_secs(10))
        .with_max_times(MAX_RETRIES)
        .with_jitter()
}

/// Network failures and flood control are worth another attempt; API
/// rejections (bad query id, chat not found) are not.
fn is_transient(err: &RequestError) -> bool {
    matches!(err, RequestError::Network(_) | RequestError::RetryAfter(_))
}

fn log_retry(err: &RequestError, delay: Duration) {
    warn!("Bot API call failed ({}), retrying in {:?}", err, delay);
}

fn outcome<T>(result: Result<T, RequestError>) -> NotifyOutcome {
    match result {
        Ok(_) => NotifyOutcome::Delivered,
        Err(e) => NotifyOutcome::Failed(e.to_string()),
    }
}

pub struct TelegramNotifier {
    bot: Bot,
    admin_chat: Option<ChatId>,
}

impl TelegramNotifier {
    /// Creates a bot client with a bounded request timeout.
    pub fn new(token: &SecretString, admin_id: Option<i64>) -> anyhow::Result<Self> {
        let client = ClientBuilder::new()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client for the Bot API")?;
        Ok(Self {
            bot: Bot::with_client(token.expose_secret(), client),
            admin_chat: admin_id.map(ChatId),
        })
    }

    /// Bot username via `getMe`, used when none is configured.
    pub async fn resolve_username(&self) -> Option<String> {
        let result = (|| async { self.bot.get_me().await })
            .retry(backoff())
            .when(is_transient)
            .notify(log_retry)
            .await;

        match result {
            Ok(me) => {
                let username = me.user.username.clone();
                info!("Bot username resolved: {:?}", username);
                username
            }
            Err(e) => {
                warn!("getMe failed: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn answer_web_app_query(&self, query_id: &str, answer: WebAppAnswer) -> NotifyOutcome {
        let result = InlineQueryResult::Article(InlineQueryResultArticle::new(
            answer.result_id,
            answer.title,
            InputMessageContent::Text(InputMessageContentText::new(answer.text)),
        ));

        let sent = (|| async { self.bot.answer_web_app_query(query_id, result.clone()).await })
            .retry(backoff())
            .when(is_transient)
            .notify(log_retry)
            .await;
        outcome(sent)
    }

    async fn notify_admin(&self, text: &str) -> NotifyOutcome {
        let Some(chat) = self.admin_chat else {
            return NotifyOutcome::Failed("admin chat not configured".to_string());
        };

        let sent = (|| async { self.bot.send_message(chat, text).await })
            .retry(backoff())
            .when(is_transient)
            .notify(log_retry)
            .await;
        outcome(sent)
    }
}
