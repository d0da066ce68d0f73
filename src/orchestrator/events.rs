//! Pipeline events — everything the orchestrator reacts to.
//!
//! Serializable so a deferred event can be parked in the scheduler's durable
//! queue and replayed after a decision-engine outage or a restart.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gateway::Channel;

/// One unit of work for the orchestrator, scoped to a single lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// A freshly ingested lead needs its initial outreach.
    LeadSourced { lead_id: Uuid },
    /// The lead sent us something (reply, chat message, call transcript).
    InboundMessage {
        lead_id: Uuid,
        channel: Channel,
        content: String,
    },
    /// A reply turn whose decision call was deferred; compose and send now.
    RespondDue { lead_id: Uuid },
    /// A scheduled follow-up came due. `attempt` is 1-based.
    FollowUpDue { lead_id: Uuid, attempt: u32 },
    /// An outbound call went unanswered.
    CallUnanswered { lead_id: Uuid, detail: String },
    /// Contract provider confirmed a signature.
    ContractSigned { lead_id: Uuid },
    /// Payment provider confirmed capture.
    PaymentCaptured { lead_id: Uuid },
    /// Onboarding kickoff acknowledged; the pipeline is complete.
    OnboardingAcknowledged { lead_id: Uuid },
}

impl PipelineEvent {
    /// The lead this event belongs to.
    pub fn lead_id(&self) -> Uuid {
        match self {
            Self::LeadSourced { lead_id }
            | Self::InboundMessage { lead_id, .. }
            | Self::RespondDue { lead_id }
            | Self::FollowUpDue { lead_id, .. }
            | Self::CallUnanswered { lead_id, .. }
            | Self::ContractSigned { lead_id }
            | Self::PaymentCaptured { lead_id }
            | Self::OnboardingAcknowledged { lead_id } => *lead_id,
        }
    }

    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::LeadSourced { .. } => "lead_sourced",
            Self::InboundMessage { .. } => "inbound_message",
            Self::RespondDue { .. } => "respond_due",
            Self::FollowUpDue { .. } => "follow_up_due",
            Self::CallUnanswered { .. } => "call_unanswered",
            Self::ContractSigned { .. } => "contract_signed",
            Self::PaymentCaptured { .. } => "payment_captured",
            Self::OnboardingAcknowledged { .. } => "onboarding_acknowledged",
        }
    }
}
