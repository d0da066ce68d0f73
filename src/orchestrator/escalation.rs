//! Handoff trigger rules — when a lead needs a human.
//!
//! Two kinds of trigger: compiled keyword rules over inbound text (case-study
//! requests, contract/legal talk) and numeric thresholds over the lead row
//! (deal value, cumulative objections). Thresholds are configuration; the
//! rules here only carry the matching mechanism.

use regex::Regex;
use rust_decimal::Decimal;
use tracing::debug;

use crate::config::PipelineConfig;
use crate::lead::Lead;

/// One keyword trigger with a compiled regex.
struct TriggerRule {
    /// Short label used as the handoff reason prefix.
    label: &'static str,
    regex: Regex,
}

/// Compiled escalation rules, built once at startup.
pub struct EscalationRules {
    message_rules: Vec<TriggerRule>,
    deal_value_threshold: Decimal,
    objection_limit: u32,
}

impl EscalationRules {
    /// Build the default rule set with thresholds from config.
    pub fn from_config(config: &PipelineConfig) -> Self {
        let message_rules = vec![
            TriggerRule {
                label: "case study / reference request",
                regex: Regex::new(r"(?i)\b(case stud(y|ies)|references?|testimonials?|proof of results)\b").unwrap(),
            },
            TriggerRule {
                label: "contract / legal terms",
                regex: Regex::new(
                    r"(?i)\b(contracts?|legal|terms and conditions|refund policy|agreements?|liability)\b",
                )
                .unwrap(),
            },
        ];
        Self {
            message_rules,
            deal_value_threshold: config.escalation_deal_value,
            objection_limit: config.escalation_objection_limit,
        }
    }

    /// Check inbound text against the keyword rules.
    pub fn match_message(&self, text: &str) -> Option<String> {
        for rule in &self.message_rules {
            if rule.regex.is_match(text) {
                debug!(rule = rule.label, "Escalation keyword rule matched");
                return Some(rule.label.to_string());
            }
        }
        None
    }

    /// Check the lead row against the numeric thresholds.
    pub fn over_threshold(&self, lead: &Lead) -> Option<String> {
        if lead.deal_value > self.deal_value_threshold {
            return Some(format!(
                "deal value {} exceeds threshold {}",
                lead.deal_value, self.deal_value_threshold
            ));
        }
        if lead.objection_count >= self.objection_limit {
            return Some(format!(
                "objection limit reached ({} of {})",
                lead.objection_count, self.objection_limit
            ));
        }
        None
    }
}
