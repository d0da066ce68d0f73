//! Escalation notifier — delivers human-handoff alerts with full context.
//!
//! Also carries the deal-closed notification, which is a celebration ping,
//! not a handoff: the lead stays in the automated pipeline.

use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::error::NotifierError;
use crate::lead::{HandoffEvent, Lead};
use crate::quotes::ServicePackage;

/// Outbound notifications to the humans running the pipeline.
#[async_trait]
pub trait EscalationNotifier: Send + Sync {
    /// Deliver one handoff alert. Called exactly once per [`HandoffEvent`].
    async fn notify_handoff(&self, handoff: &HandoffEvent, lead: &Lead)
    -> Result<(), NotifierError>;

    /// Announce that the closing chain (contract + payment link) went out.
    async fn notify_deal_closed(
        &self,
        lead: &Lead,
        package: &ServicePackage,
    ) -> Result<(), NotifierError>;
}

/// Webhook notifier — Slack-style JSON POST to a configured URL.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            url: url.into(),
            client,
        }
    }

    async fn post(&self, text: String) -> Result<(), NotifierError> {
        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .map_err(|e| NotifierError::Delivery(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NotifierError::Delivery(format!(
                "HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl EscalationNotifier for WebhookNotifier {
    async fn notify_handoff(
        &self,
        handoff: &HandoffEvent,
        lead: &Lead,
    ) -> Result<(), NotifierError> {
        let company = lead.company.as_deref().unwrap_or("unknown company");
        let text = format!(
            ":rotating_light: *Human handoff needed*\n\
             Lead: {} ({company})\n\
             Lead ID: {}\n\
             Stage: {}\n\
             Reason: {}\n\n\
             Conversation so far:\n{}",
            lead.name, lead.id, lead.stage, handoff.reason, handoff.transcript,
        );
        self.post(text).await
    }

    async fn notify_deal_closed(
        &self,
        lead: &Lead,
        package: &ServicePackage,
    ) -> Result<(), NotifierError> {
        let text = format!(
            ":tada: *Deal closing for {}*\n{} at ₹{}/month — contract and payment link sent.",
            lead.name, package.name, package.monthly_price,
        );
        self.post(text).await
    }
}

/// Fallback notifier used when no webhook URL is configured: alerts land in
/// the structured log instead of a chat channel.
pub struct TracingNotifier;

#[async_trait]
impl EscalationNotifier for TracingNotifier {
    async fn notify_handoff(
        &self,
        handoff: &HandoffEvent,
        lead: &Lead,
    ) -> Result<(), NotifierError> {
        info!(
            lead_id = %lead.id,
            lead = %lead.name,
            reason = %handoff.reason,
            "HUMAN HANDOFF NEEDED\n{}",
            handoff.transcript,
        );
        Ok(())
    }

    async fn notify_deal_closed(
        &self,
        lead: &Lead,
        package: &ServicePackage,
    ) -> Result<(), NotifierError> {
        info!(
            lead_id = %lead.id,
            lead = %lead.name,
            package = %package.tier,
            "Deal closing — contract and payment link sent"
        );
        Ok(())
    }
}
