//! Email gateway — SMTP via lettre for outbound.
//!
//! lettre's transport is synchronous, so sends run inside `spawn_blocking`.

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use tracing::warn;

use crate::error::GatewayError;
use crate::gateway::{Channel, ChannelGateway, DispatchReceipt, DispatchRequest};

// ── Configuration ───────────────────────────────────────────────────

/// SMTP configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from_address: String,
    /// Used when the message body does not carry its own `Subject:` line.
    pub default_subject: String,
}

impl SmtpConfig {
    /// Build config from environment variables.
    /// Returns `None` if `SMTP_HOST` is not set (channel disabled).
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("SMTP_HOST").ok()?;

        let port: u16 = std::env::var("SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("SMTP_USERNAME").unwrap_or_default();
        let password = std::env::var("SMTP_PASSWORD").unwrap_or_default();
        let from_address = std::env::var("SMTP_FROM_ADDRESS").unwrap_or_else(|_| username.clone());
        let default_subject = std::env::var("SMTP_DEFAULT_SUBJECT")
            .unwrap_or_else(|_| "Growing your online store".to_string());

        Some(Self {
            host,
            port,
            username,
            password,
            from_address,
            default_subject,
        })
    }
}

/// Split a leading `Subject:` line off a message body, if one is present.
pub fn extract_subject<'a>(content: &'a str, default: &str) -> (String, &'a str) {
    if content.starts_with("Subject: ")
        && let Some(pos) = content.find('\n')
    {
        let subject = content[9..pos].trim().to_string();
        let body = content[pos + 1..].trim_start();
        return (subject, body);
    }
    (default.to_string(), content)
}

// ── Gateway ─────────────────────────────────────────────────────────

/// SMTP email gateway.
pub struct SmtpGateway {
    config: SmtpConfig,
}

impl SmtpGateway {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }
}

/// Send one email (blocking — run in spawn_blocking).
fn send_smtp(config: &SmtpConfig, to: &str, content: &str) -> Result<DispatchReceipt, GatewayError> {
    let (subject, body) = extract_subject(content, &config.default_subject);

    let from = match config.from_address.parse() {
        Ok(addr) => addr,
        Err(e) => {
            warn!("Invalid SMTP from address {}: {e}", config.from_address);
            return Ok(DispatchReceipt::rejected());
        }
    };
    let to_addr = match to.parse() {
        Ok(addr) => addr,
        Err(e) => {
            warn!("Invalid recipient address {to}: {e}");
            return Ok(DispatchReceipt::rejected());
        }
    };

    let email = Message::builder()
        .from(from)
        .to(to_addr)
        .subject(subject)
        .body(body.to_string())
        .map_err(|e| GatewayError::Network {
            channel: Channel::Email,
            reason: format!("Failed to build email: {e}"),
        })?;

    let creds = Credentials::new(config.username.clone(), config.password.clone());
    let transport = SmtpTransport::relay(&config.host)
        .map_err(|e| GatewayError::Network {
            channel: Channel::Email,
            reason: format!("SMTP relay error: {e}"),
        })?
        .port(config.port)
        .credentials(creds)
        .build();

    transport.send(&email).map_err(|e| GatewayError::Network {
        channel: Channel::Email,
        reason: format!("SMTP send failed: {e}"),
    })?;

    tracing::info!("Email sent to {to}");
    Ok(DispatchReceipt::delivered(None))
}

#[async_trait]
impl ChannelGateway for SmtpGateway {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, request: &DispatchRequest) -> Result<DispatchReceipt, GatewayError> {
        let config = self.config.clone();
        let to = request.to.clone();
        let content = request.content.clone();

        tokio::task::spawn_blocking(move || send_smtp(&config, &to, &content))
            .await
            .map_err(|e| GatewayError::Network {
                channel: Channel::Email,
                reason: format!("SMTP task join error: {e}"),
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_subject_present() {
        let (subject, body) = extract_subject("Subject: Hello World\nThis is the body", "Default");
        assert_eq!(subject, "Hello World");
        assert_eq!(body, "This is the body");
    }

    #[test]
    fn extract_subject_missing() {
        let (subject, body) = extract_subject("Just a plain message", "Default");
        assert_eq!(subject, "Default");
        assert_eq!(body, "Just a plain message");
    }

    #[test]
    fn extract_subject_no_newline() {
        let (subject, body) = extract_subject("Subject: Only subject", "Default");
        assert_eq!(subject, "Default");
        assert_eq!(body, "Subject: Only subject");
    }

    #[test]
    fn extract_subject_with_body_whitespace() {
        let (subject, body) = extract_subject("Subject: Test\n\n  Body with leading space", "Default");
        assert_eq!(subject, "Test");
        assert_eq!(body, "Body with leading space");
    }
}
