//! Telegram adapter: direct delivery through the Bot API `sendMessage` call.

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};

use crate::channels::{ChannelAdapter, Cleared, SendOutcome};

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Telegram adapter.
///
/// Payload field: `text`. The approval target is the chat ID.
pub struct TelegramAdapter {
    bot_token: SecretString,
    api_base: String,
    client: reqwest::Client,
}

impl TelegramAdapter {
    pub fn new(bot_token: SecretString) -> Self {
        Self {
            bot_token,
            api_base: DEFAULT_API_BASE.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Build from `TELEGRAM_BOT_TOKEN`. Returns `None` when unset (channel disabled).
    pub fn from_env() -> Option<Self> {
        let token = std::env::var("TELEGRAM_BOT_TOKEN").ok()?;
        let mut adapter = Self::new(SecretString::from(token));
        if let Ok(base) = std::env::var("TELEGRAM_API_BASE") {
            adapter.api_base = base;
        }
        Some(adapter)
    }

    /// Point the adapter at a different Bot API host.
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.api_base.trim_end_matches('/'),
            self.bot_token.expose_secret()
        )
    }
}

/// Map a non-success Bot API reply onto retry semantics.
///
/// 429 and 5xx are transient; any other 4xx (bad chat, blocked bot,
/// malformed request) will fail the same way next time.
fn classify_status(status: StatusCode, body: &str) -> SendOutcome {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        SendOutcome::RetryableError(format!("Telegram API {status}: {body}"))
    } else {
        SendOutcome::FatalError(format!("Telegram API {status}: {body}"))
    }
}

#[async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, cleared: &Cleared) -> SendOutcome {
        let Some(text) = cleared.payload_str("text") else {
            return SendOutcome::FatalError("payload has no text".into());
        };
        // A split send could deliver half a message and then retry the
        // whole thing, so oversized drafts are refused outright.
        if text.chars().count() > TELEGRAM_MAX_MESSAGE_LENGTH {
            return SendOutcome::FatalError(format!(
                "text exceeds {TELEGRAM_MAX_MESSAGE_LENGTH} characters"
            ));
        }

        let body = serde_json::json!({
            "chat_id": cleared.approval().target,
            "text": text,
        });

        let resp = match self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                // Strip the URL: it embeds the bot token.
                return SendOutcome::RetryableError(format!(
                    "Telegram request failed: {}",
                    e.without_url()
                ));
            }
        };

        let status = resp.status();
        if status.is_success() {
            tracing::info!(approval_id = %cleared.approval().id, "Telegram message sent");
            return SendOutcome::Sent;
        }

        let err_body = resp.text().await.unwrap_or_default();
        tracing::warn!(status = ?status, "Telegram sendMessage failed");
        classify_status(status, &err_body)
    }
}
