//! Lead data model — leads, interactions, scheduled actions, handoffs.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gateway::Channel;
use crate::lead::Stage;

/// A prospective customer tracked through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    /// Unique lead ID. Immutable once assigned.
    pub id: Uuid,
    /// Contact name.
    pub name: String,
    /// Company, if known.
    pub company: Option<String>,
    /// Email address.
    pub email: Option<String>,
    /// Phone number (voice calls).
    pub phone: Option<String>,
    /// Chat/messaging handle. Falls back to phone for SMS-style providers.
    pub chat_handle: Option<String>,
    /// Lead score, 0-100. Set at sourcing; the decision engine may adjust it.
    pub score: u8,
    /// Current pipeline stage.
    pub stage: Stage,
    /// Estimated deal value.
    pub deal_value: Decimal,
    /// Objections raised since the last inbound-driven reset.
    pub objection_count: u32,
    /// Follow-ups sent since the last inbound reply.
    pub followup_count: u32,
    /// Last outbound dispatch for this lead.
    pub last_outbound_at: Option<DateTime<Utc>>,
    /// Last inbound reply from this lead.
    pub last_inbound_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency version. Bumped on every committed write.
    pub version: u64,
    /// When the lead was sourced.
    pub created_at: DateTime<Utc>,
    /// Last committed write.
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    /// Create a new `Sourced` lead. Score is clamped to 0-100.
    pub fn new(name: impl Into<String>, score: u8) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            company: None,
            email: None,
            phone: None,
            chat_handle: None,
            score: score.min(100),
            stage: Stage::Sourced,
            deal_value: Decimal::ZERO,
            objection_count: 0,
            followup_count: 0,
            last_outbound_at: None,
            last_inbound_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_company(mut self, company: impl Into<String>) -> Self {
        self.company = Some(company.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    pub fn with_chat_handle(mut self, handle: impl Into<String>) -> Self {
        self.chat_handle = Some(handle.into());
        self
    }

    pub fn with_deal_value(mut self, value: Decimal) -> Self {
        self.deal_value = value;
        self
    }

    /// The address this lead can be reached at on a given channel.
    ///
    /// Transactional channels (CRM, contract, payment) key off the email
    /// address, matching how those providers identify a customer.
    pub fn address_for(&self, channel: Channel) -> Option<&str> {
        match channel {
            Channel::Voice => self.phone.as_deref(),
            Channel::Chat => self.chat_handle.as_deref().or(self.phone.as_deref()),
            Channel::Email | Channel::Crm | Channel::Contract | Channel::Payment => {
                self.email.as_deref()
            }
        }
    }

    /// Outreach channels this lead has an address for, in dispatch order.
    pub fn reachable_channels(&self) -> Vec<Channel> {
        [Channel::Voice, Channel::Email, Channel::Chat]
            .into_iter()
            .filter(|c| self.address_for(*c).is_some())
            .collect()
    }

    /// The channel the lead last replied on, if any conversation happened,
    /// falling back to the first reachable channel.
    pub fn preferred_channel(&self, last_inbound: Option<Channel>) -> Option<Channel> {
        last_inbound
            .filter(|c| self.address_for(*c).is_some())
            .or_else(|| self.reachable_channels().into_iter().next())
    }
}

/// Direction of an interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outbound,
    Inbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Outbound => write!(f, "outbound"),
            Self::Inbound => write!(f, "inbound"),
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "outbound" => Ok(Self::Outbound),
            "inbound" => Ok(Self::Inbound),
            _ => Err(format!("Unknown direction: {s}")),
        }
    }
}

/// Outcome of an interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Provider accepted the dispatch.
    Delivered,
    /// Dispatch failed after the retry budget.
    Failed,
    /// Lead responded (inbound) or picked up (voice).
    Answered,
    /// Call went unanswered.
    NoResponse,
    /// Dispatch fate unknown (persistence failed after dispatch). Reconciled
    /// on the next event for the lead.
    Unknown,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Answered => "answered",
            Self::NoResponse => "no_response",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Outcome {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            "answered" => Ok(Self::Answered),
            "no_response" => Ok(Self::NoResponse),
            "unknown" => Ok(Self::Unknown),
            _ => Err(format!("Unknown outcome: {s}")),
        }
    }
}

/// One logged outreach or inbound event. Append-only; never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub lead_id: Uuid,
    /// Per-lead sequence number, starting at 1.
    pub seq: u64,
    pub channel: Channel,
    pub direction: Direction,
    /// Content summary (message text, transcript, or outcome note).
    pub summary: String,
    pub outcome: Outcome,
    pub occurred_at: DateTime<Utc>,
}

impl Interaction {
    pub fn outbound(
        lead_id: Uuid,
        seq: u64,
        channel: Channel,
        summary: impl Into<String>,
        outcome: Outcome,
    ) -> Self {
        Self {
            lead_id,
            seq,
            channel,
            direction: Direction::Outbound,
            summary: summary.into(),
            outcome,
            occurred_at: Utc::now(),
        }
    }

    pub fn inbound(lead_id: Uuid, seq: u64, channel: Channel, summary: impl Into<String>) -> Self {
        Self {
            lead_id,
            seq,
            channel,
            direction: Direction::Inbound,
            summary: summary.into(),
            outcome: Outcome::Answered,
            occurred_at: Utc::now(),
        }
    }
}

/// Render an interaction log as a human-readable transcript, oldest first.
pub fn render_transcript(interactions: &[Interaction]) -> String {
    let mut out = String::new();
    for i in interactions {
        out.push_str(&format!(
            "[{} {} {} {}] {}\n",
            i.occurred_at.format("%Y-%m-%d %H:%M UTC"),
            i.direction,
            i.channel,
            i.outcome,
            i.summary,
        ));
    }
    out
}

/// Kind of a deferred action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Timed follow-up nudge.
    FollowUp,
    /// A deferred pipeline event to replay (e.g. after decision outage).
    RetryEvent,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FollowUp => write!(f, "follow_up"),
            Self::RetryEvent => write!(f, "retry_event"),
        }
    }
}

impl std::str::FromStr for ActionKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "follow_up" => Ok(Self::FollowUp),
            "retry_event" => Ok(Self::RetryEvent),
            _ => Err(format!("Unknown action kind: {s}")),
        }
    }
}

/// A deferred action owned by the scheduler until due.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledAction {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub kind: ActionKind,
    pub due_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    /// How many times this action has been handed back for retry.
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
}

impl ScheduledAction {
    pub fn new(
        lead_id: Uuid,
        kind: ActionKind,
        due_at: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            lead_id,
            kind,
            due_at,
            payload,
            attempt: 0,
            created_at: Utc::now(),
        }
    }
}

/// A record signaling the lead must be handled by a human.
///
/// Produced only by the orchestrator, consumed once by the escalation
/// notifier. Terminal for automation on that lead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffEvent {
    pub id: Uuid,
    pub lead_id: Uuid,
    /// Which trigger fired (keyword rule label, threshold description).
    pub reason: String,
    /// Rendered interaction log at the time of the handoff.
    pub transcript: String,
    pub created_at: DateTime<Utc>,
}

impl HandoffEvent {
    pub fn new(lead_id: Uuid, reason: impl Into<String>, transcript: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            lead_id,
            reason: reason.into(),
            transcript: transcript.into(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn new_lead_starts_sourced() {
        let lead = Lead::new("Asha Patel", 80);
        assert_eq!(lead.stage, Stage::Sourced);
        assert_eq!(lead.score, 80);
        assert_eq!(lead.version, 0);
        assert_eq!(lead.followup_count, 0);
    }

    #[test]
    fn score_clamped_to_100() {
        let lead = Lead::new("Asha Patel", 250);
        assert_eq!(lead.score, 100);
    }

    #[test]
    fn address_lookup_per_channel() {
        let lead = Lead::new("Asha Patel", 70)
            .with_email("asha@shopwala.in")
            .with_phone("+919876543210");

        assert_eq!(lead.address_for(Channel::Email), Some("asha@shopwala.in"));
        assert_eq!(lead.address_for(Channel::Voice), Some("+919876543210"));
        // Chat falls back to phone when no handle is set
        assert_eq!(lead.address_for(Channel::Chat), Some("+919876543210"));
        // Transactional channels key off email
        assert_eq!(lead.address_for(Channel::Contract), Some("asha@shopwala.in"));
        assert_eq!(lead.address_for(Channel::Payment), Some("asha@shopwala.in"));
    }

    #[test]
    fn reachable_channels_skip_missing_addresses() {
        let lead = Lead::new("Asha Patel", 70).with_email("asha@shopwala.in");
        assert_eq!(lead.reachable_channels(), vec![Channel::Email]);

        let lead = Lead::new("Ravi Kumar", 60)
            .with_phone("+911112223334")
            .with_email("ravi@example.in");
        assert_eq!(
            lead.reachable_channels(),
            vec![Channel::Voice, Channel::Email, Channel::Chat]
        );
    }

    #[test]
    fn preferred_channel_reuses_last_inbound() {
        let lead = Lead::new("Asha Patel", 70)
            .with_email("asha@shopwala.in")
            .with_phone("+919876543210");
        assert_eq!(lead.preferred_channel(Some(Channel::Chat)), Some(Channel::Chat));
        // Unreachable last-inbound channel falls back to the first reachable one
        let email_only = Lead::new("Meera Iyer", 50).with_email("meera@example.in");
        assert_eq!(
            email_only.preferred_channel(Some(Channel::Voice)),
            Some(Channel::Email)
        );
    }

    #[test]
    fn transcript_renders_oldest_first() {
        let id = Uuid::new_v4();
        let log = vec![
            Interaction::outbound(id, 1, Channel::Email, "Intro pitch", Outcome::Delivered),
            Interaction::inbound(id, 2, Channel::Email, "Tell me more"),
        ];
        let text = render_transcript(&log);
        let intro = text.find("Intro pitch").unwrap();
        let reply = text.find("Tell me more").unwrap();
        assert!(intro < reply);
        assert!(text.contains("outbound"));
        assert!(text.contains("answered"));
    }

    #[test]
    fn deal_value_builder() {
        let lead = Lead::new("Asha Patel", 70).with_deal_value(dec!(35000));
        assert_eq!(lead.deal_value, dec!(35000));
    }

    #[test]
    fn enum_string_roundtrips() {
        for o in [
            Outcome::Delivered,
            Outcome::Failed,
            Outcome::Answered,
            Outcome::NoResponse,
            Outcome::Unknown,
        ] {
            let parsed: Outcome = o.to_string().parse().unwrap();
            assert_eq!(parsed, o);
        }
        for k in [ActionKind::FollowUp, ActionKind::RetryEvent] {
            let parsed: ActionKind = k.to_string().parse().unwrap();
            assert_eq!(parsed, k);
        }
        for d in [Direction::Outbound, Direction::Inbound] {
            let parsed: Direction = d.to_string().parse().unwrap();
            assert_eq!(parsed, d);
        }
    }
}
