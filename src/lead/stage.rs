//! Pipeline stage state machine.

use serde::{Deserialize, Serialize};

/// Stage of a lead in the sales pipeline.
///
/// The main line runs `Sourced` through `Onboarded` one step at a time.
/// `Lost` and `Escalated` are absorbing: once entered, no automated
/// transition leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Lead ingested, no outreach yet.
    Sourced,
    /// First outbound dispatch delivered.
    Contacted,
    /// Lead has replied at least once.
    Engaged,
    /// Objection handling in progress.
    Negotiating,
    /// Quote sent, awaiting contract.
    Quoted,
    /// Contract signed, awaiting payment.
    Contracted,
    /// Payment captured, awaiting onboarding.
    Paid,
    /// Onboarding acknowledged. Pipeline complete.
    Onboarded,
    /// Went cold after the follow-up ladder ran out.
    Lost,
    /// Handed to a human. Automation frozen.
    Escalated,
}

impl Stage {
    /// Check if this stage allows transitioning to another stage.
    ///
    /// The main line advances one step at a time. `Escalated` is reachable
    /// from any non-terminal stage; `Lost` only from the unresponsive
    /// conversation stages. Nothing leaves a terminal stage.
    pub fn can_transition_to(&self, target: Stage) -> bool {
        use Stage::*;

        if target == Escalated {
            return !self.is_terminal();
        }

        matches!(
            (self, target),
            // Main line, one step at a time
            (Sourced, Contacted)
                | (Contacted, Engaged)
                | (Engaged, Negotiating)
                | (Negotiating, Quoted)
                | (Quoted, Contracted)
                | (Contracted, Paid)
                | (Paid, Onboarded)
                // Went cold while waiting on a reply
                | (Contacted, Lost)
                | (Engaged, Lost)
                | (Negotiating, Lost)
        )
    }

    /// Check if this is a terminal stage (no automated transitions out).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Onboarded | Self::Lost | Self::Escalated)
    }

    /// Check if the lead is still in play (not terminal).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Stages eligible for the follow-up ladder: the lead has been contacted
    /// but nothing external (quote, contract, payment) is pending yet.
    pub fn follows_up(&self) -> bool {
        matches!(self, Self::Contacted | Self::Engaged | Self::Negotiating)
    }

    /// All stages, main line first, for stable iteration in summaries.
    pub fn all() -> [Stage; 10] {
        use Stage::*;
        [
            Sourced,
            Contacted,
            Engaged,
            Negotiating,
            Quoted,
            Contracted,
            Paid,
            Onboarded,
            Lost,
            Escalated,
        ]
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Sourced => "sourced",
            Self::Contacted => "contacted",
            Self::Engaged => "engaged",
            Self::Negotiating => "negotiating",
            Self::Quoted => "quoted",
            Self::Contracted => "contracted",
            Self::Paid => "paid",
            Self::Onboarded => "onboarded",
            Self::Lost => "lost",
            Self::Escalated => "escalated",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sourced" => Ok(Self::Sourced),
            "contacted" => Ok(Self::Contacted),
            "engaged" => Ok(Self::Engaged),
            "negotiating" => Ok(Self::Negotiating),
            "quoted" => Ok(Self::Quoted),
            "contracted" => Ok(Self::Contracted),
            "paid" => Ok(Self::Paid),
            "onboarded" => Ok(Self::Onboarded),
            "lost" => Ok(Self::Lost),
            "escalated" => Ok(Self::Escalated),
            _ => Err(format!("Unknown stage: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn main_line_advances_one_step() {
        assert!(Stage::Sourced.can_transition_to(Stage::Contacted));
        assert!(Stage::Contacted.can_transition_to(Stage::Engaged));
        assert!(Stage::Engaged.can_transition_to(Stage::Negotiating));
        assert!(Stage::Negotiating.can_transition_to(Stage::Quoted));
        assert!(Stage::Quoted.can_transition_to(Stage::Contracted));
        assert!(Stage::Contracted.can_transition_to(Stage::Paid));
        assert!(Stage::Paid.can_transition_to(Stage::Onboarded));
    }

    #[test]
    fn main_line_never_skips() {
        assert!(!Stage::Sourced.can_transition_to(Stage::Engaged));
        assert!(!Stage::Contacted.can_transition_to(Stage::Quoted));
        assert!(!Stage::Engaged.can_transition_to(Stage::Quoted));
        assert!(!Stage::Quoted.can_transition_to(Stage::Paid));
        assert!(!Stage::Contracted.can_transition_to(Stage::Onboarded));
    }

    #[test]
    fn main_line_never_goes_backward() {
        assert!(!Stage::Engaged.can_transition_to(Stage::Contacted));
        assert!(!Stage::Quoted.can_transition_to(Stage::Negotiating));
        assert!(!Stage::Paid.can_transition_to(Stage::Contracted));
    }

    #[test]
    fn escalated_reachable_from_any_active_stage() {
        for stage in Stage::all() {
            if stage.is_terminal() {
                assert!(!stage.can_transition_to(Stage::Escalated), "{stage}");
            } else {
                assert!(stage.can_transition_to(Stage::Escalated), "{stage}");
            }
        }
    }

    #[test]
    fn lost_only_from_conversation_stages() {
        assert!(Stage::Contacted.can_transition_to(Stage::Lost));
        assert!(Stage::Engaged.can_transition_to(Stage::Lost));
        assert!(Stage::Negotiating.can_transition_to(Stage::Lost));
        assert!(!Stage::Sourced.can_transition_to(Stage::Lost));
        assert!(!Stage::Quoted.can_transition_to(Stage::Lost));
        assert!(!Stage::Paid.can_transition_to(Stage::Lost));
    }

    #[test]
    fn terminal_stages_absorb() {
        for terminal in [Stage::Onboarded, Stage::Lost, Stage::Escalated] {
            for target in Stage::all() {
                assert!(
                    !terminal.can_transition_to(target),
                    "{terminal} -> {target} should be illegal"
                );
            }
        }
    }

    #[test]
    fn terminal_stages() {
        assert!(Stage::Onboarded.is_terminal());
        assert!(Stage::Lost.is_terminal());
        assert!(Stage::Escalated.is_terminal());
        assert!(!Stage::Sourced.is_terminal());
        assert!(!Stage::Negotiating.is_terminal());
    }

    #[test]
    fn follow_up_eligibility() {
        assert!(Stage::Contacted.follows_up());
        assert!(Stage::Engaged.follows_up());
        assert!(Stage::Negotiating.follows_up());
        assert!(!Stage::Sourced.follows_up());
        assert!(!Stage::Quoted.follows_up());
        assert!(!Stage::Escalated.follows_up());
    }

    #[test]
    fn stage_display_roundtrip() {
        for stage in Stage::all() {
            let parsed: Stage = stage.to_string().parse().unwrap();
            assert_eq!(parsed, stage);
        }
    }

    #[test]
    fn stage_serde_snake_case() {
        let json = serde_json::to_string(&Stage::Negotiating).unwrap();
        assert_eq!(json, "\"negotiating\"");
        let parsed: Stage = serde_json::from_str("\"contacted\"").unwrap();
        assert_eq!(parsed, Stage::Contacted);
    }
}
