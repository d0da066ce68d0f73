//! Generic HTTP gateway — JSON POST to a provider webhook endpoint.
//!
//! Voice, chat, CRM, contract, and payment providers all speak the same
//! shape here: one endpoint per provider, bearer auth, idempotency key in a
//! header, and an optional `{"status": ..., "ref": ...}` body in the reply.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::warn;

use crate::error::GatewayError;
use crate::gateway::{Channel, ChannelGateway, DispatchReceipt, DispatchRequest, DispatchStatus};

/// Configuration for one HTTP provider.
#[derive(Debug, Clone)]
pub struct HttpGatewayConfig {
    pub channel: Channel,
    pub base_url: String,
    pub token: Option<SecretString>,
}

impl HttpGatewayConfig {
    /// Build config from environment variables.
    /// Returns `None` if `{PREFIX}_GATEWAY_URL` is not set (channel disabled).
    pub fn from_env(channel: Channel, prefix: &str) -> Option<Self> {
        let base_url = std::env::var(format!("{prefix}_GATEWAY_URL")).ok()?;
        let token = std::env::var(format!("{prefix}_GATEWAY_TOKEN"))
            .ok()
            .map(SecretString::from);
        Some(Self {
            channel,
            base_url,
            token,
        })
    }
}

/// HTTP provider gateway.
pub struct HttpGateway {
    config: HttpGatewayConfig,
    client: reqwest::Client,
}

impl HttpGateway {
    pub fn new(config: HttpGatewayConfig, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { config, client }
    }
}

#[async_trait]
impl ChannelGateway for HttpGateway {
    fn channel(&self) -> Channel {
        self.config.channel
    }

    async fn send(&self, request: &DispatchRequest) -> Result<DispatchReceipt, GatewayError> {
        let channel = self.config.channel;
        let mut req = self
            .client
            .post(&self.config.base_url)
            .header("Idempotency-Key", &request.idempotency_key)
            .json(&serde_json::json!({
                "lead_id": request.lead_id,
                "to": request.to,
                "content": request.content,
            }));
        if let Some(token) = &self.config.token {
            req = req.bearer_auth(token.expose_secret());
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout { channel }
            } else {
                GatewayError::Network {
                    channel,
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if status.is_success() {
            // Providers may report a non-delivered verdict in the body
            let body: serde_json::Value = response.json().await.unwrap_or_default();
            let verdict = match body.get("status").and_then(|s| s.as_str()) {
                Some("failed") => DispatchStatus::Failed,
                Some("rejected") => DispatchStatus::Rejected,
                _ => DispatchStatus::Delivered,
            };
            let provider_ref = ["id", "ref", "sid"]
                .iter()
                .find_map(|k| body.get(*k).and_then(|v| v.as_str()))
                .map(String::from);
            return Ok(DispatchReceipt {
                status: verdict,
                provider_ref,
            });
        }

        if status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error() {
            return Err(GatewayError::Network {
                channel,
                reason: format!("HTTP {status}"),
            });
        }

        // Remaining 4xx codes are provider refusals
        let body = response.text().await.unwrap_or_default();
        warn!(
            channel = %channel,
            lead_id = %request.lead_id,
            %status,
            "Dispatch rejected by provider: {body}"
        );
        Ok(DispatchReceipt::rejected())
    }
}
