//! Configuration types.

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::quotes::PackageTier;

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Follow-up offsets from the last outbound, one per rung of the ladder.
    /// The ladder length is also the give-up point (lead goes `Lost`).
    pub followup_offsets: Vec<chrono::Duration>,
    /// Dispatch attempts per gateway call before recording a failure.
    pub gateway_attempts: u32,
    /// Base delay for gateway retry backoff (doubled per attempt, jittered).
    pub gateway_backoff_base: Duration,
    /// Per-attempt gateway call timeout.
    pub gateway_timeout: Duration,
    /// Immediate decision-engine retries before deferring the event.
    pub decision_retries: u32,
    /// How far out a deferred event is rescheduled when the decision engine
    /// stays unavailable.
    pub decision_defer: chrono::Duration,
    /// Decision engine call timeout.
    pub decision_timeout: Duration,
    /// Maximum pipeline events processed concurrently (distinct leads).
    pub max_concurrent_events: usize,
    /// Scheduler tick interval.
    pub tick_interval: Duration,
    /// Cron schedule for the stranded-lead sweep.
    pub sweep_schedule: String,
    /// Deal value above which the lead is handed to a human.
    pub escalation_deal_value: Decimal,
    /// Objection count at which the lead is handed to a human.
    pub escalation_objection_limit: u32,
    /// Package pitched when neither the decision engine nor the deal value
    /// picks one.
    pub default_package: PackageTier,
    /// How long a rendered quote stays valid.
    pub quote_valid_days: i64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            followup_offsets: vec![
                chrono::Duration::days(2),
                chrono::Duration::days(5),
                chrono::Duration::days(10),
            ],
            gateway_attempts: 3,
            gateway_backoff_base: Duration::from_millis(500),
            gateway_timeout: Duration::from_secs(10),
            decision_retries: 2,
            decision_defer: chrono::Duration::minutes(5),
            decision_timeout: Duration::from_secs(15),
            max_concurrent_events: 32,
            tick_interval: Duration::from_secs(30), // scheduler resolution
            sweep_schedule: "0 0 */2 * * *".to_string(), // every 2 hours
            escalation_deal_value: dec!(50000),
            escalation_objection_limit: 3,
            default_package: PackageTier::Growth,
            quote_valid_days: 7,
        }
    }
}

impl PipelineConfig {
    /// Maximum follow-ups before a non-responsive lead goes `Lost`.
    pub fn max_followups(&self) -> u32 {
        self.followup_offsets.len() as u32
    }

    /// Defaults overlaid with any `LEADFLOW_*` environment overrides.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(days) = std::env::var("LEADFLOW_FOLLOWUP_OFFSET_DAYS")
            .ok()
            .map(|s| {
                s.split(',')
                    .filter_map(|d| d.trim().parse::<i64>().ok())
                    .map(chrono::Duration::days)
                    .collect::<Vec<_>>()
            })
            .filter(|offsets| !offsets.is_empty())
        {
            cfg.followup_offsets = days;
        }
        if let Some(n) = std::env::var("LEADFLOW_MAX_CONCURRENT_EVENTS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            cfg.max_concurrent_events = n;
        }
        if let Some(secs) = std::env::var("LEADFLOW_TICK_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            cfg.tick_interval = Duration::from_secs(secs);
        }
        if let Ok(schedule) = std::env::var("LEADFLOW_SWEEP_SCHEDULE") {
            cfg.sweep_schedule = schedule;
        }
        if let Some(value) = std::env::var("LEADFLOW_ESCALATION_DEAL_VALUE")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            cfg.escalation_deal_value = value;
        }
        if let Some(limit) = std::env::var("LEADFLOW_OBJECTION_LIMIT")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            cfg.escalation_objection_limit = limit;
        }
        if let Some(tier) = std::env::var("LEADFLOW_DEFAULT_PACKAGE")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            cfg.default_package = tier;
        }
        if let Some(days) = std::env::var("LEADFLOW_QUOTE_VALID_DAYS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            cfg.quote_valid_days = days;
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_followup_ladder() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.max_followups(), 3);
        assert_eq!(cfg.followup_offsets[0], chrono::Duration::days(2));
        assert_eq!(cfg.followup_offsets[1], chrono::Duration::days(5));
        assert_eq!(cfg.followup_offsets[2], chrono::Duration::days(10));
        assert_eq!(cfg.escalation_objection_limit, 3);
    }
}
