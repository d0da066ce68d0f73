//! Channel gateways — the uniform dispatch seam in front of every external
//! provider (voice, email, chat, CRM, contract, payment).
//!
//! The [`GatewayRegistry`] owns retries, backoff, and idempotency. Individual
//! gateways only translate one provider's API; they never retry themselves.

pub mod email;
pub mod http;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::GatewayError;

pub use email::{SmtpConfig, SmtpGateway};
pub use http::{HttpGateway, HttpGatewayConfig};

/// Outreach and transactional channels a dispatch can go out on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Voice,
    Email,
    Chat,
    /// CRM sync and onboarding kickoff.
    Crm,
    /// Contract e-sign provider.
    Contract,
    /// Payment link provider.
    Payment,
}

impl Channel {
    /// Channels that carry conversation with the lead.
    pub fn outreach() -> [Channel; 3] {
        [Self::Voice, Self::Email, Self::Chat]
    }

    pub fn is_outreach(self) -> bool {
        matches!(self, Self::Voice | Self::Email | Self::Chat)
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Voice => "voice",
            Self::Email => "email",
            Self::Chat => "chat",
            Self::Crm => "crm",
            Self::Contract => "contract",
            Self::Payment => "payment",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Channel {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "voice" => Ok(Self::Voice),
            "email" => Ok(Self::Email),
            "chat" => Ok(Self::Chat),
            "crm" => Ok(Self::Crm),
            "contract" => Ok(Self::Contract),
            "payment" => Ok(Self::Payment),
            _ => Err(format!("Unknown channel: {s}")),
        }
    }
}

/// Provider's verdict on a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    /// Provider accepted the dispatch.
    Delivered,
    /// Provider processed the request but the dispatch did not go through
    /// (e.g. call could not be connected).
    Failed,
    /// Provider refused the request outright (bad address, policy). Never
    /// retried.
    Rejected,
}

/// One outbound dispatch.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub lead_id: Uuid,
    pub channel: Channel,
    /// Channel address (phone number, email, handle, or provider customer key).
    pub to: String,
    pub content: String,
    /// `{lead_id}:{seq}` — stable across retries of the same logical send so
    /// providers can deduplicate.
    pub idempotency_key: String,
}

impl DispatchRequest {
    pub fn new(
        lead_id: Uuid,
        channel: Channel,
        to: impl Into<String>,
        content: impl Into<String>,
        seq: u64,
    ) -> Self {
        Self {
            lead_id,
            channel,
            to: to.into(),
            content: content.into(),
            idempotency_key: format!("{lead_id}:{seq}"),
        }
    }
}

/// What came back from the provider.
#[derive(Debug, Clone)]
pub struct DispatchReceipt {
    pub status: DispatchStatus,
    /// Provider-side reference (message SID, call ID) when one was returned.
    pub provider_ref: Option<String>,
}

impl DispatchReceipt {
    pub fn delivered(provider_ref: Option<String>) -> Self {
        Self {
            status: DispatchStatus::Delivered,
            provider_ref,
        }
    }

    pub fn rejected() -> Self {
        Self {
            status: DispatchStatus::Rejected,
            provider_ref: None,
        }
    }
}

/// One provider integration. Implementations translate a [`DispatchRequest`]
/// into the provider's API and report transport failures as errors, provider
/// verdicts as receipts.
#[async_trait]
pub trait ChannelGateway: Send + Sync {
    fn channel(&self) -> Channel;

    async fn send(&self, request: &DispatchRequest) -> Result<DispatchReceipt, GatewayError>;
}

/// Exponential backoff with jitter: `base * 2^(attempt-1)` plus up to 250ms.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
    exp + jitter
}

/// Recently delivered idempotency keys, FIFO-bounded.
struct DeliveredCache {
    keys: HashSet<String>,
    order: VecDeque<String>,
    cap: usize,
}

impl DeliveredCache {
    fn new(cap: usize) -> Self {
        Self {
            keys: HashSet::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    fn insert(&mut self, key: String) {
        if self.keys.contains(&key) {
            return;
        }
        if self.order.len() >= self.cap
            && let Some(oldest) = self.order.pop_front()
        {
            self.keys.remove(&oldest);
        }
        self.keys.insert(key.clone());
        self.order.push_back(key);
    }
}

/// Routes dispatches to the right gateway and wraps every call in the retry,
/// timeout, and idempotency policy.
pub struct GatewayRegistry {
    gateways: HashMap<Channel, Arc<dyn ChannelGateway>>,
    delivered: Mutex<DeliveredCache>,
    attempts: u32,
    backoff_base: Duration,
    call_timeout: Duration,
}

impl GatewayRegistry {
    pub fn new(attempts: u32, backoff_base: Duration, call_timeout: Duration) -> Self {
        Self {
            gateways: HashMap::new(),
            delivered: Mutex::new(DeliveredCache::new(4096)),
            attempts: attempts.max(1),
            backoff_base,
            call_timeout,
        }
    }

    /// Register a gateway for its channel, replacing any previous one.
    pub fn register(&mut self, gateway: Arc<dyn ChannelGateway>) {
        self.gateways.insert(gateway.channel(), gateway);
    }

    /// Whether a gateway is configured for this channel.
    pub fn supports(&self, channel: Channel) -> bool {
        self.gateways.contains_key(&channel)
    }

    /// Outreach channels that have a configured gateway, in dispatch order.
    pub fn outreach_channels(&self) -> Vec<Channel> {
        Channel::outreach()
            .into_iter()
            .filter(|c| self.supports(*c))
            .collect()
    }

    /// Dispatch with the full policy: duplicate suppression, per-attempt
    /// timeout, exponential backoff on transient failures. A definitive
    /// provider verdict (delivered, failed, rejected) is never retried.
    pub async fn dispatch(
        &self,
        request: &DispatchRequest,
    ) -> Result<DispatchReceipt, GatewayError> {
        {
            let cache = self.delivered.lock().unwrap_or_else(|e| e.into_inner());
            if cache.contains(&request.idempotency_key) {
                debug!(
                    lead_id = %request.lead_id,
                    channel = %request.channel,
                    key = %request.idempotency_key,
                    "Suppressing duplicate dispatch"
                );
                return Ok(DispatchReceipt::delivered(None));
            }
        }

        let gateway = self
            .gateways
            .get(&request.channel)
            .ok_or(GatewayError::NotConfigured {
                channel: request.channel,
            })?;

        let mut attempt = 1;
        loop {
            let outcome = match tokio::time::timeout(self.call_timeout, gateway.send(request)).await
            {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Timeout {
                    channel: request.channel,
                }),
            };

            match outcome {
                Ok(receipt) => {
                    if receipt.status == DispatchStatus::Delivered {
                        let mut cache = self.delivered.lock().unwrap_or_else(|e| e.into_inner());
                        cache.insert(request.idempotency_key.clone());
                    }
                    debug!(
                        lead_id = %request.lead_id,
                        channel = %request.channel,
                        status = ?receipt.status,
                        attempt,
                        "Dispatch completed"
                    );
                    return Ok(receipt);
                }
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    let delay = backoff_delay(self.backoff_base, attempt);
                    warn!(
                        lead_id = %request.lead_id,
                        channel = %request.channel,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Transient gateway failure, retrying: {e}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
