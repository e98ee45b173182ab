//! Email adapter: direct delivery over SMTP via lettre.

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};

use crate::channels::{ChannelAdapter, Cleared, SendOutcome};
use crate::error::ChannelError;

// ── Configuration ───────────────────────────────────────────────────

/// SMTP configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl EmailConfig {
    /// Build config from environment variables.
    /// Returns `None` if `EMAIL_SMTP_HOST` is not set (channel disabled).
    pub fn from_env() -> Option<Self> {
        let smtp_host = std::env::var("EMAIL_SMTP_HOST").ok()?;

        let smtp_port: u16 = std::env::var("EMAIL_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("EMAIL_USERNAME").unwrap_or_default();
        let password = SecretString::from(std::env::var("EMAIL_PASSWORD").unwrap_or_default());
        let from_address = std::env::var("EMAIL_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        Some(Self {
            smtp_host,
            smtp_port,
            username,
            password,
            from_address,
        })
    }
}

// ── Adapter ─────────────────────────────────────────────────────────

/// Direct email adapter.
///
/// Payload fields: `subject` (optional) and `body` (required). The approval
/// target is the recipient address.
pub struct EmailAdapter {
    config: EmailConfig,
    transport: SmtpTransport,
}

impl EmailAdapter {
    pub fn new(config: EmailConfig) -> Result<Self, ChannelError> {
        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );

        let transport = SmtpTransport::relay(&config.smtp_host)
            .map_err(|e| ChannelError::StartupFailed {
                name: "email".into(),
                reason: format!("SMTP relay error: {e}"),
            })?
            .port(config.smtp_port)
            .credentials(creds)
            .build();

        Ok(Self { config, transport })
    }
}

/// Build the outgoing message. Errors here are permanent.
pub(crate) fn build_message(
    from: &str,
    to: &str,
    subject: &str,
    body: &str,
) -> Result<Message, String> {
    Message::builder()
        .from(from.parse().map_err(|e| format!("Invalid from address: {e}"))?)
        .to(to.parse().map_err(|e| format!("Invalid to address: {e}"))?)
        .subject(subject)
        .body(body.to_string())
        .map_err(|e| format!("Failed to build email: {e}"))
}

/// Map an SMTP error onto retry semantics: 5xx replies are permanent,
/// everything else (4xx, timeouts, connection trouble) is worth retrying.
fn classify_smtp_error(e: &lettre::transport::smtp::Error) -> SendOutcome {
    if e.is_permanent() {
        SendOutcome::FatalError(format!("SMTP permanent failure: {e}"))
    } else if e.is_timeout() {
        SendOutcome::RetryableError(format!("SMTP timeout: {e}"))
    } else {
        SendOutcome::RetryableError(format!("SMTP send failed: {e}"))
    }
}

#[async_trait]
impl ChannelAdapter for EmailAdapter {
    fn name(&self) -> &str {
        "email"
    }

    async fn send(&self, cleared: &Cleared) -> SendOutcome {
        let Some(body) = cleared.payload_str("body") else {
            return SendOutcome::FatalError("payload has no body".into());
        };
        let subject = cleared.payload_str("subject").unwrap_or("");
        let to = &cleared.approval().target;

        let message = match build_message(&self.config.from_address, to, subject, body) {
            Ok(m) => m,
            Err(reason) => return SendOutcome::FatalError(reason),
        };

        let transport = self.transport.clone();
        match tokio::task::spawn_blocking(move || transport.send(&message)).await {
            Ok(Ok(_)) => {
                tracing::info!(approval_id = %cleared.approval().id, "Email sent to {to}");
                SendOutcome::Sent
            }
            Ok(Err(e)) => classify_smtp_error(&e),
            Err(e) => SendOutcome::RetryableError(format!("SMTP task panicked: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_builds_for_valid_addresses() {
        assert!(build_message("me@example.com", "you@example.com", "Hi", "Body").is_ok());
    }

    #[test]
    fn invalid_recipient_is_reported() {
        let err = build_message("me@example.com", "not an address", "Hi", "Body").unwrap_err();
        assert!(err.contains("Invalid to address"));
    }

    #[tokio::test]
    async fn missing_body_is_fatal_without_network() {
        let adapter = EmailAdapter::new(EmailConfig {
            smtp_host: "smtp.example.com".into(),
            smtp_port: 587,
            username: "me".into(),
            password: SecretString::from("pw".to_string()),
            from_address: "me@example.com".into(),
        })
        .unwrap();
        let cleared = Cleared::new(crate::approval::Approval::new(
            "email",
            "you@example.com",
            serde_json::json!({"subject": "no body"}),
        ));
        assert!(matches!(adapter.send(&cleared).await, SendOutcome::FatalError(_)));
    }
}
