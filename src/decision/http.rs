//! HTTP decision engine adapter — JSON POST to a configured endpoint.
//!
//! The request carries the lead context, recent history, and the prompt kind;
//! the response body is parsed with the tolerant decision parser. How the
//! endpoint composes its answer is its own concern.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::decision::{Decision, DecisionEngine, PromptKind, parse_decision};
use crate::error::DecisionError;
use crate::lead::{Interaction, Lead};

/// How much history travels with each request.
const HISTORY_WINDOW: usize = 20;

/// Configuration for the decision endpoint.
#[derive(Debug, Clone)]
pub struct HttpDecisionEngineConfig {
    pub url: String,
    pub token: Option<SecretString>,
}

impl HttpDecisionEngineConfig {
    /// Build config from environment variables.
    /// Returns `None` if `DECISION_ENGINE_URL` is not set.
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("DECISION_ENGINE_URL").ok()?;
        let token = std::env::var("DECISION_ENGINE_TOKEN")
            .ok()
            .map(SecretString::from);
        Some(Self { url, token })
    }
}

/// Decision engine backed by an HTTP endpoint.
pub struct HttpDecisionEngine {
    config: HttpDecisionEngineConfig,
    client: reqwest::Client,
}

impl HttpDecisionEngine {
    pub fn new(config: HttpDecisionEngineConfig, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { config, client }
    }
}

#[async_trait]
impl DecisionEngine for HttpDecisionEngine {
    async fn decide(
        &self,
        lead: &Lead,
        history: &[Interaction],
        kind: PromptKind,
    ) -> Result<Decision, DecisionError> {
        let window: Vec<serde_json::Value> = history
            .iter()
            .rev()
            .take(HISTORY_WINDOW)
            .rev()
            .map(|i| {
                serde_json::json!({
                    "direction": i.direction,
                    "channel": i.channel,
                    "summary": i.summary,
                    "outcome": i.outcome,
                })
            })
            .collect();

        let body = serde_json::json!({
            "prompt_kind": kind,
            "lead": {
                "name": lead.name,
                "company": lead.company,
                "score": lead.score,
                "stage": lead.stage,
                "deal_value": lead.deal_value.to_string(),
                "objection_count": lead.objection_count,
            },
            "history": window,
        });

        let mut request = self.client.post(&self.config.url).json(&body);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| DecisionError::Unavailable {
                reason: if e.is_timeout() {
                    "decision call timed out".to_string()
                } else {
                    e.to_string()
                },
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DecisionError::Unavailable {
                reason: format!("HTTP {status}"),
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| DecisionError::Unavailable {
                reason: e.to_string(),
            })?;

        parse_decision(&text)
    }
}
