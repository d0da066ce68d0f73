//! Decision engine seam — the black-box strategy function consulted on every
//! pipeline event.
//!
//! The engine is pure request/response from the orchestrator's view: given a
//! lead and its conversation history it returns the next action and message
//! content. Every failure mode (transport, timeout, malformed output) maps to
//! [`DecisionError::Unavailable`]; the orchestrator never guesses an action.

pub mod http;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::DecisionError;
use crate::lead::{Interaction, Lead};
use crate::quotes::PackageTier;

pub use http::{HttpDecisionEngine, HttpDecisionEngineConfig};

/// Which conversational turn the engine is being asked to compose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    /// First touch for a freshly sourced lead.
    Opening,
    /// Reply turn after an inbound message.
    Reply,
    /// Timed nudge number `n` (1-based).
    FollowUp(u32),
}

/// What the engine wants the pipeline to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum NextAction {
    /// Keep the conversation going with the decision's message.
    Continue,
    /// The lead raised an objection; the message answers it.
    HandleObjection,
    /// Ready to quote. `package` is the engine's tier hint.
    SendQuote { package: Option<PackageTier> },
    /// Quote accepted; kick off contract and payment.
    Close { package: Option<PackageTier> },
    /// The engine itself wants a human on this lead.
    HumanHandoff { reason: String },
    /// Nothing to send this turn.
    NoAction,
}

/// One decision from the engine.
#[derive(Debug, Clone)]
pub struct Decision {
    pub action: NextAction,
    /// Message content to send, for actions that send one.
    pub message: String,
    pub confidence: f32,
    /// Updated deal-value estimate, when the engine produced one.
    pub estimated_value: Option<Decimal>,
    /// Adjusted lead score, when the engine produced one.
    pub score: Option<u8>,
}

/// The decision seam. Implementations must be side-effect-free: the
/// orchestrator may retry a call that timed out.
#[async_trait]
pub trait DecisionEngine: Send + Sync {
    async fn decide(
        &self,
        lead: &Lead,
        history: &[Interaction],
        kind: PromptKind,
    ) -> Result<Decision, DecisionError>;
}

// ── Response parsing ────────────────────────────────────────────────

/// Raw engine response shape.
#[derive(Debug, Deserialize)]
struct RawDecision {
    action: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    package: Option<String>,
    #[serde(default)]
    estimated_value: Option<serde_json::Value>,
    #[serde(default)]
    score: Option<u8>,
}

/// Parse an engine response into a [`Decision`].
///
/// Tolerates markdown-fenced or prose-wrapped JSON. Unknown package hints
/// degrade to `None` (the orchestrator falls back to its default tier);
/// unknown actions are a malformed response and map to `Unavailable`.
pub fn parse_decision(raw: &str) -> Result<Decision, DecisionError> {
    let json_str = extract_json_object(raw);
    let parsed: RawDecision =
        serde_json::from_str(&json_str).map_err(|e| DecisionError::Unavailable {
            reason: format!("malformed response: {e}"),
        })?;

    let package = parsed.package.as_deref().and_then(|s| s.parse().ok());

    let action = match parsed.action.as_str() {
        "continue" | "respond" => NextAction::Continue,
        "handle_objection" | "objection" => NextAction::HandleObjection,
        "send_quote" | "ready_to_quote" | "quote" => NextAction::SendQuote { package },
        "close" | "close_deal" => NextAction::Close { package },
        "human_handoff" | "handoff" | "escalate" => NextAction::HumanHandoff {
            reason: if parsed.reason.is_empty() {
                "engine requested handoff".to_string()
            } else {
                parsed.reason
            },
        },
        "no_action" | "none" | "wait" => NextAction::NoAction,
        other => {
            return Err(DecisionError::Unavailable {
                reason: format!("unknown action '{other}'"),
            });
        }
    };

    Ok(Decision {
        action,
        message: parsed.message,
        confidence: parsed.confidence.clamp(0.0, 1.0),
        estimated_value: parsed.estimated_value.as_ref().and_then(parse_value),
        score: parsed.score.map(|s| s.min(100)),
    })
}

/// Deal values may arrive as a JSON number or a string.
fn parse_value(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.to_string().parse().ok(),
        _ => None,
    }
}

/// Extract a JSON object from engine output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parse_continue() {
        let raw = r#"{"action": "continue", "message": "Thanks for the reply!", "confidence": 0.8}"#;
        let decision = parse_decision(raw).unwrap();
        assert_eq!(decision.action, NextAction::Continue);
        assert_eq!(decision.message, "Thanks for the reply!");
        assert!((decision.confidence - 0.8).abs() < 0.01);
    }

    #[test]
    fn parse_send_quote_with_package() {
        let raw = r#"{"action": "send_quote", "message": "Here is our offer", "package": "premium"}"#;
        let decision = parse_decision(raw).unwrap();
        assert_eq!(
            decision.action,
            NextAction::SendQuote {
                package: Some(PackageTier::Premium)
            }
        );
    }

    #[test]
    fn unknown_package_hint_degrades_to_none() {
        let raw = r#"{"action": "close", "package": "platinum"}"#;
        let decision = parse_decision(raw).unwrap();
        assert_eq!(decision.action, NextAction::Close { package: None });
    }

    #[test]
    fn parse_handoff_with_reason() {
        let raw = r#"{"action": "human_handoff", "reason": "asked about custom integration"}"#;
        let decision = parse_decision(raw).unwrap();
        assert_eq!(
            decision.action,
            NextAction::HumanHandoff {
                reason: "asked about custom integration".into()
            }
        );
    }

    #[test]
    fn parse_handoff_without_reason_gets_default() {
        let raw = r#"{"action": "handoff"}"#;
        let decision = parse_decision(raw).unwrap();
        assert!(matches!(decision.action, NextAction::HumanHandoff { .. }));
    }

    #[test]
    fn parse_estimated_value_number_or_string() {
        let raw = r#"{"action": "continue", "estimated_value": 35000}"#;
        assert_eq!(
            parse_decision(raw).unwrap().estimated_value,
            Some(dec!(35000))
        );
        let raw = r#"{"action": "continue", "estimated_value": "75000.50"}"#;
        assert_eq!(
            parse_decision(raw).unwrap().estimated_value,
            Some(dec!(75000.50))
        );
    }

    #[test]
    fn parse_score_clamped() {
        let raw = r#"{"action": "no_action", "score": 150}"#;
        assert_eq!(parse_decision(raw).unwrap().score, Some(100));
    }

    #[test]
    fn parse_confidence_clamped() {
        let raw = r#"{"action": "continue", "confidence": 1.7}"#;
        assert!((parse_decision(raw).unwrap().confidence - 1.0).abs() < 0.01);
    }

    #[test]
    fn unknown_action_is_unavailable() {
        let raw = r#"{"action": "teleport"}"#;
        assert!(matches!(
            parse_decision(raw),
            Err(DecisionError::Unavailable { .. })
        ));
    }

    #[test]
    fn malformed_json_is_unavailable() {
        assert!(matches!(
            parse_decision("not json at all"),
            Err(DecisionError::Unavailable { .. })
        ));
    }

    #[test]
    fn parse_response_wrapped_in_markdown() {
        let raw = "Here you go:\n```json\n{\"action\": \"no_action\"}\n```";
        let decision = parse_decision(raw).unwrap();
        assert_eq!(decision.action, NextAction::NoAction);
    }

    #[test]
    fn parse_response_embedded_in_prose() {
        let raw = "My call: {\"action\": \"continue\", \"message\": \"hi\"} end.";
        let decision = parse_decision(raw).unwrap();
        assert_eq!(decision.action, NextAction::Continue);
    }

    #[test]
    fn prompt_kind_serde() {
        assert_eq!(
            serde_json::to_string(&PromptKind::Opening).unwrap(),
            "\"opening\""
        );
        let json = serde_json::to_string(&PromptKind::FollowUp(2)).unwrap();
        let parsed: PromptKind = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, PromptKind::FollowUp(2));
    }
}
