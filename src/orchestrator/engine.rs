//! Orchestrator — the pipeline state machine.
//!
//! Every [`PipelineEvent`] is processed the same way: snapshot the lead under
//! its lock, run decision and gateway I/O outside the lock, then commit the
//! resulting state with a version check. A conflicting commit is re-applied
//! once from a fresh snapshot; a second conflict parks the event in the
//! scheduler and it replays on the next tick. The interaction log is the
//! source of truth for what actually went out, so a replayed event reuses its
//! sequence numbers and the gateway registry suppresses the duplicate sends.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::decision::{Decision, DecisionEngine, NextAction, PromptKind};
use crate::error::{Error, OrchestratorError, SchedulerError, StoreError};
use crate::gateway::{
    Channel, DispatchRequest, DispatchStatus, GatewayRegistry, backoff_delay,
};
use crate::lead::{
    ActionKind, Direction, HandoffEvent, Interaction, Lead, Outcome, ScheduledAction, Stage,
    render_transcript,
};
use crate::notifier::EscalationNotifier;
use crate::orchestrator::escalation::EscalationRules;
use crate::orchestrator::events::PipelineEvent;
use crate::orchestrator::locks::LeadLocks;
use crate::quotes::{PackageTier, render_quote};
use crate::scheduler::Scheduler;
use crate::store::{LeadCommit, LeadStore};

/// Everything the orchestrator drives. Seams are trait objects so tests swap
/// in scripted engines and recording gateways.
pub struct Orchestrator {
    store: Arc<dyn LeadStore>,
    decision: Arc<dyn DecisionEngine>,
    gateways: Arc<GatewayRegistry>,
    scheduler: Arc<Scheduler>,
    notifier: Arc<dyn EscalationNotifier>,
    rules: EscalationRules,
    locks: LeadLocks,
    config: PipelineConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn LeadStore>,
        decision: Arc<dyn DecisionEngine>,
        gateways: Arc<GatewayRegistry>,
        scheduler: Arc<Scheduler>,
        notifier: Arc<dyn EscalationNotifier>,
        config: PipelineConfig,
    ) -> Self {
        let rules = EscalationRules::from_config(&config);
        Self {
            store,
            decision,
            gateways,
            scheduler,
            notifier,
            rules,
            locks: LeadLocks::new(),
            config,
        }
    }

    /// Process one event end to end, absorbing failures into the log.
    ///
    /// A version conflict means another event for the same lead committed
    /// between our snapshot and our write; the handler re-runs against fresh
    /// state. If the lead is still contended after one retry, the event is
    /// parked and replays on a later tick.
    pub async fn process(&self, event: PipelineEvent) {
        let lead_id = event.lead_id();
        debug!(lead_id = %lead_id, event = event.label(), "Processing event");

        match self.apply(&event).await {
            Ok(()) => {}
            Err(e) if is_conflict(&e) => {
                warn!(lead_id = %lead_id, event = event.label(), "Commit conflicted, re-applying");
                match self.apply(&event).await {
                    Ok(()) => {}
                    Err(e) if is_conflict(&e) => {
                        if let Err(e) = self.defer(lead_id, &event).await {
                            error!(lead_id = %lead_id, "Failed to park contended event: {e}");
                        }
                    }
                    Err(e) => {
                        error!(lead_id = %lead_id, event = event.label(), "Event failed: {e}");
                    }
                }
            }
            Err(e) => {
                error!(lead_id = %lead_id, event = event.label(), "Event failed: {e}");
            }
        }
    }

    async fn apply(&self, event: &PipelineEvent) -> Result<(), Error> {
        match event {
            PipelineEvent::LeadSourced { lead_id } => self.initial_outreach(*lead_id).await,
            PipelineEvent::InboundMessage {
                lead_id,
                channel,
                content,
            } => self.inbound(*lead_id, *channel, content).await,
            PipelineEvent::RespondDue { lead_id } => self.respond(*lead_id).await,
            PipelineEvent::FollowUpDue { lead_id, attempt } => {
                self.follow_up(*lead_id, *attempt).await
            }
            PipelineEvent::CallUnanswered { lead_id, detail } => {
                self.call_unanswered(*lead_id, detail).await
            }
            PipelineEvent::ContractSigned { lead_id } => {
                self.confirm(*lead_id, Stage::Contracted, "Contract signed")
                    .await
            }
            PipelineEvent::PaymentCaptured { lead_id } => {
                self.confirm(*lead_id, Stage::Paid, "Payment captured").await
            }
            PipelineEvent::OnboardingAcknowledged { lead_id } => {
                self.confirm(*lead_id, Stage::Onboarded, "Onboarding acknowledged")
                    .await
            }
        }
    }

    // ── Event handlers ──────────────────────────────────────────────

    /// First touch: consult the engine for an opening, fan the pitch out to
    /// every reachable channel, and start the follow-up ladder once anything
    /// lands.
    async fn initial_outreach(&self, lead_id: Uuid) -> Result<(), Error> {
        let (lead, _) = self.snapshot(lead_id).await?;
        if lead.stage != Stage::Sourced {
            debug!(lead_id = %lead_id, stage = %lead.stage, "Lead already contacted, skipping");
            return Ok(());
        }

        let Some(decision) = self
            .decide_with_retry(&lead, &[], PromptKind::Opening)
            .await
        else {
            return self
                .defer(lead_id, &PipelineEvent::LeadSourced { lead_id })
                .await;
        };

        let mut updated = lead.clone();
        apply_decision_fields(&mut updated, &decision);
        if let Some(reason) = self.rules.over_threshold(&updated) {
            return self.escalate(updated, lead.version, reason, &[], &[]).await;
        }

        let channels: Vec<Channel> = lead
            .reachable_channels()
            .into_iter()
            .filter(|c| self.gateways.supports(*c))
            .collect();
        if channels.is_empty() {
            return Err(OrchestratorError::NoReachableChannel { id: lead_id }.into());
        }

        let mut seq = self.store.next_seq(lead_id).await?;
        let mut interactions = Vec::with_capacity(channels.len());
        for channel in channels {
            let interaction = self
                .dispatch_outbound(&lead, channel, &decision.message, seq)
                .await;
            seq += 1;
            interactions.push(interaction);
        }
        let delivered = interactions
            .iter()
            .any(|i| i.outcome == Outcome::Delivered);

        let mut schedule = Vec::new();
        if delivered {
            updated.stage = Stage::Contacted;
            updated.last_outbound_at = Some(Utc::now());
            schedule.push(self.followup_action(lead_id, 1));
            info!(lead_id = %lead_id, "Initial outreach delivered");
        } else {
            warn!(lead_id = %lead_id, "Initial outreach failed on every channel");
        }

        self.commit_lead(&updated, lead.version, &interactions, &schedule, &[], None)
            .await
    }

    /// Inbound reply: commit the message (and any escalation it triggers)
    /// first, then run the reply turn against the committed state.
    async fn inbound(&self, lead_id: Uuid, channel: Channel, content: &str) -> Result<(), Error> {
        let (lead, history) = self.snapshot(lead_id).await?;
        if lead.stage == Stage::Escalated {
            // Frozen: a human owns the conversation now
            debug!(lead_id = %lead_id, "Inbound on escalated lead, ignoring");
            return Ok(());
        }
        if lead.stage.is_terminal() {
            warn!(lead_id = %lead_id, stage = %lead.stage, "Inbound on terminal lead, ignoring");
            return Ok(());
        }

        let seq = self.store.next_seq(lead_id).await?;
        let message = Interaction::inbound(lead_id, seq, channel, content);

        let mut updated = lead.clone();
        updated.last_inbound_at = Some(Utc::now());
        updated.followup_count = 0;
        if updated.stage == Stage::Contacted {
            updated.stage = Stage::Engaged;
        }

        if let Some(reason) = self.rules.match_message(content) {
            let mut log = history.clone();
            log.push(message.clone());
            return self
                .escalate(updated, lead.version, reason, &[message], &log)
                .await;
        }

        // An answer cancels every pending follow-up before anything else
        let cancel = self.pending_followups(lead_id).await?;
        self.commit_lead(&updated, lead.version, &[message], &[], &cancel, None)
            .await?;

        self.respond(lead_id).await
    }

    /// Reply turn: consult the engine against the full history and act on its
    /// verdict. Runs from committed state so a deferred turn replays cleanly.
    async fn respond(&self, lead_id: Uuid) -> Result<(), Error> {
        let (lead, history) = self.snapshot(lead_id).await?;
        if !lead.stage.is_active() {
            debug!(lead_id = %lead_id, stage = %lead.stage, "Reply turn on settled lead, skipping");
            return Ok(());
        }

        let Some(decision) = self
            .decide_with_retry(&lead, &history, PromptKind::Reply)
            .await
        else {
            return self
                .defer(lead_id, &PipelineEvent::RespondDue { lead_id })
                .await;
        };

        let mut updated = lead.clone();
        apply_decision_fields(&mut updated, &decision);

        // A fresh deal-value estimate can push the lead over the handoff line
        // before any message goes out.
        if let Some(reason) = self.rules.over_threshold(&updated) {
            return self
                .escalate(updated, lead.version, reason, &[], &history)
                .await;
        }

        match decision.action {
            NextAction::NoAction => {
                let schedule = self.ladder_restart(&updated).await?;
                self.commit_lead(&updated, lead.version, &[], &schedule, &[], None)
                    .await
            }
            NextAction::Continue => {
                self.send_reply(updated, lead.version, &history, &decision.message)
                    .await
            }
            NextAction::HandleObjection => {
                updated.objection_count += 1;
                if updated.stage == Stage::Engaged {
                    updated.stage = Stage::Negotiating;
                }
                if let Some(reason) = self.rules.over_threshold(&updated) {
                    return self
                        .escalate(updated, lead.version, reason, &[], &history)
                        .await;
                }
                self.send_reply(updated, lead.version, &history, &decision.message)
                    .await
            }
            NextAction::SendQuote { package } => {
                self.send_quote(updated, lead.version, &history, package)
                    .await
            }
            NextAction::Close { package } => {
                self.close_deal(updated, lead.version, &history, package, &decision.message)
                    .await
            }
            NextAction::HumanHandoff { reason } => {
                self.escalate(updated, lead.version, reason, &[], &history)
                    .await
            }
        }
    }

    /// Timed nudge. The final rung still goes out; the lead goes `Lost` in
    /// the same commit.
    async fn follow_up(&self, lead_id: Uuid, attempt: u32) -> Result<(), Error> {
        let (lead, history) = self.snapshot(lead_id).await?;
        if !lead.stage.follows_up() {
            // The lead moved on (replied, quoted, escalated) before this fired
            debug!(lead_id = %lead_id, stage = %lead.stage, attempt, "Follow-up no longer applies");
            return Ok(());
        }
        // A rung the tick claimed just before a reply committed is stale: the
        // reply reset the counter and queued its own rung. A live rung is
        // always the next one up, with nothing else pending.
        if attempt != lead.followup_count + 1
            || !self.pending_followups(lead_id).await?.is_empty()
        {
            debug!(
                lead_id = %lead_id,
                attempt,
                followup_count = lead.followup_count,
                "Follow-up superseded, skipping"
            );
            return Ok(());
        }

        let Some(decision) = self
            .decide_with_retry(&lead, &history, PromptKind::FollowUp(attempt))
            .await
        else {
            return self
                .defer(lead_id, &PipelineEvent::FollowUpDue { lead_id, attempt })
                .await;
        };

        let mut updated = lead.clone();
        apply_decision_fields(&mut updated, &decision);

        if let NextAction::HumanHandoff { reason } = decision.action {
            return self
                .escalate(updated, lead.version, reason, &[], &history)
                .await;
        }
        if let Some(reason) = self.rules.over_threshold(&updated) {
            return self
                .escalate(updated, lead.version, reason, &[], &history)
                .await;
        }

        let Some(channel) = self.outbound_channel(&lead, &history) else {
            return Err(OrchestratorError::NoReachableChannel { id: lead_id }.into());
        };
        let seq = self.store.next_seq(lead_id).await?;
        let interaction = self
            .dispatch_outbound(&lead, channel, &decision.message, seq)
            .await;

        updated.followup_count = attempt;
        updated.last_outbound_at = Some(Utc::now());

        let mut schedule = Vec::new();
        let mut cancel = Vec::new();
        if attempt >= self.config.max_followups() {
            updated.stage = Stage::Lost;
            cancel = self.pending_followups(lead_id).await?;
            info!(lead_id = %lead_id, attempt, "Follow-up ladder exhausted, lead lost");
        } else {
            schedule.push(self.followup_action(lead_id, attempt + 1));
        }

        self.commit_lead(
            &updated,
            lead.version,
            std::slice::from_ref(&interaction),
            &schedule,
            &cancel,
            None,
        )
        .await
    }

    /// An outbound call rang out. Log it; the follow-up ladder already covers
    /// the next touch.
    async fn call_unanswered(&self, lead_id: Uuid, detail: &str) -> Result<(), Error> {
        let (lead, _) = self.snapshot(lead_id).await?;
        let seq = self.store.next_seq(lead_id).await?;
        let interaction =
            Interaction::outbound(lead_id, seq, Channel::Voice, detail, Outcome::NoResponse);
        self.commit_lead(
            &lead,
            lead.version,
            std::slice::from_ref(&interaction),
            &[],
            &[],
            None,
        )
        .await
    }

    /// Provider confirmation webhook: advance exactly one stage and sync the
    /// CRM. An out-of-order confirmation is discarded, a repeated one is a
    /// no-op.
    async fn confirm(&self, lead_id: Uuid, target: Stage, note: &str) -> Result<(), Error> {
        let (lead, _) = self.snapshot(lead_id).await?;
        if lead.stage == target {
            debug!(lead_id = %lead_id, stage = %target, "Duplicate confirmation, ignoring");
            return Ok(());
        }
        if !lead.stage.can_transition_to(target) {
            warn!(
                lead_id = %lead_id,
                stage = %lead.stage,
                target = %target,
                "Out-of-order confirmation discarded"
            );
            return Ok(());
        }

        let mut updated = lead.clone();
        updated.stage = target;

        let mut seq = self.store.next_seq(lead_id).await?;
        let mut interactions = Vec::new();
        if self.gateways.supports(Channel::Crm) && lead.address_for(Channel::Crm).is_some() {
            let sync = format!("{note} — stage {target}");
            interactions.push(self.dispatch_outbound(&lead, Channel::Crm, &sync, seq).await);
            seq += 1;
        }
        // Payment landing kicks off onboarding in the same breath
        if target == Stage::Paid
            && self.gateways.supports(Channel::Crm)
            && lead.address_for(Channel::Crm).is_some()
        {
            let kickoff = format!(
                "Start onboarding for {}: welcome sequence, kickoff call, account setup",
                lead.name
            );
            interactions.push(
                self.dispatch_outbound(&lead, Channel::Crm, &kickoff, seq)
                    .await,
            );
        }

        if target == Stage::Onboarded {
            info!(lead_id = %lead_id, "Pipeline complete: lead onboarded");
        } else {
            info!(lead_id = %lead_id, stage = %target, "{note}");
        }
        self.commit_lead(&updated, lead.version, &interactions, &[], &[], None)
            .await
    }

    // ── Decision actions ────────────────────────────────────────────

    async fn send_reply(
        &self,
        mut updated: Lead,
        expected: u64,
        history: &[Interaction],
        message: &str,
    ) -> Result<(), Error> {
        // The ball is back in the lead's court after our reply, so the nudge
        // ladder starts over from rung one.
        let schedule = self.ladder_restart(&updated).await?;
        if message.is_empty() {
            warn!(lead_id = %updated.id, "Engine returned an empty reply, committing state only");
            return self
                .commit_lead(&updated, expected, &[], &schedule, &[], None)
                .await;
        }
        let Some(channel) = self.outbound_channel(&updated, history) else {
            return Err(OrchestratorError::NoReachableChannel { id: updated.id }.into());
        };
        let seq = self.store.next_seq(updated.id).await?;
        let interaction = self
            .dispatch_outbound(&updated, channel, message, seq)
            .await;
        updated.last_outbound_at = Some(Utc::now());
        self.commit_lead(
            &updated,
            expected,
            std::slice::from_ref(&interaction),
            &schedule,
            &[],
            None,
        )
        .await
    }

    /// Quote turn. A deal priced over the handoff threshold goes to a human
    /// instead of getting an automated quote.
    async fn send_quote(
        &self,
        mut updated: Lead,
        expected: u64,
        history: &[Interaction],
        hint: Option<PackageTier>,
    ) -> Result<(), Error> {
        let tier = hint
            .or_else(|| PackageTier::for_deal_value(updated.deal_value))
            .unwrap_or(self.config.default_package);
        let package = tier.package();

        if updated.deal_value.is_zero() {
            updated.deal_value = package.monthly_price;
        }
        if let Some(reason) = self.rules.over_threshold(&updated) {
            return self.escalate(updated, expected, reason, &[], history).await;
        }

        let valid_until = Utc::now() + chrono::Duration::days(self.config.quote_valid_days);
        let body = render_quote(&updated.name, &package, valid_until);

        let Some(channel) = self.outbound_channel(&updated, history) else {
            return Err(OrchestratorError::NoReachableChannel { id: updated.id }.into());
        };
        let seq = self.store.next_seq(updated.id).await?;
        let interaction = self.dispatch_outbound(&updated, channel, &body, seq).await;

        updated.last_outbound_at = Some(Utc::now());
        if updated.stage.can_transition_to(Stage::Quoted) {
            updated.stage = Stage::Quoted;
        } else {
            warn!(
                lead_id = %updated.id,
                stage = %updated.stage,
                "Quote sent before negotiation stage, holding stage"
            );
        }
        info!(lead_id = %updated.id, package = %tier, "Quote sent");
        self.commit_lead(
            &updated,
            expected,
            std::slice::from_ref(&interaction),
            &[],
            &[],
            None,
        )
        .await
    }

    /// Closing chain: confirmation message to the lead, contract for
    /// signature, payment link, CRM sync. The signed/paid webhooks advance
    /// the stage from here.
    async fn close_deal(
        &self,
        mut updated: Lead,
        expected: u64,
        history: &[Interaction],
        hint: Option<PackageTier>,
        message: &str,
    ) -> Result<(), Error> {
        let tier = hint
            .or_else(|| PackageTier::for_deal_value(updated.deal_value))
            .unwrap_or(self.config.default_package);
        let package = tier.package();

        if updated.deal_value.is_zero() {
            updated.deal_value = package.monthly_price;
        }
        if let Some(reason) = self.rules.over_threshold(&updated) {
            return self.escalate(updated, expected, reason, &[], history).await;
        }
        if updated.address_for(Channel::Contract).is_none() {
            return self
                .escalate(
                    updated,
                    expected,
                    "ready to close but no email on file for the contract".to_string(),
                    &[],
                    history,
                )
                .await;
        }

        let mut seq = self.store.next_seq(updated.id).await?;
        let mut interactions = Vec::new();

        if !message.is_empty()
            && let Some(channel) = self.outbound_channel(&updated, history)
        {
            interactions.push(self.dispatch_outbound(&updated, channel, message, seq).await);
            seq += 1;
        }

        let contract = format!(
            "Service agreement for {}: {} at ₹{}/month",
            updated.name, package.name, package.monthly_price
        );
        let payment = format!(
            "Payment link for {}: first month of {}, ₹{}",
            updated.name, package.name, package.monthly_price
        );
        for (channel, content) in [(Channel::Contract, contract), (Channel::Payment, payment)] {
            if self.gateways.supports(channel) {
                interactions.push(self.dispatch_outbound(&updated, channel, &content, seq).await);
                seq += 1;
            } else {
                warn!(lead_id = %updated.id, channel = %channel, "No gateway for closing step");
            }
        }
        if self.gateways.supports(Channel::Crm) && updated.address_for(Channel::Crm).is_some() {
            let sync = format!("Deal closing: {} at ₹{}/month", package.name, package.monthly_price);
            interactions.push(self.dispatch_outbound(&updated, Channel::Crm, &sync, seq).await);
        }

        updated.last_outbound_at = Some(Utc::now());
        if updated.stage.can_transition_to(Stage::Quoted) {
            updated.stage = Stage::Quoted;
        }
        info!(lead_id = %updated.id, package = %tier, "Closing chain dispatched");

        if let Err(e) = self.notifier.notify_deal_closed(&updated, &package).await {
            warn!(lead_id = %updated.id, "Deal-closed notification failed: {e}");
        }

        self.commit_lead(&updated, expected, &interactions, &[], &[], None)
            .await
    }

    /// Hand the lead to a human: freeze the stage, cancel everything pending,
    /// record the handoff, alert. At most one handoff ever fires per lead.
    async fn escalate(
        &self,
        mut updated: Lead,
        expected: u64,
        reason: String,
        interactions: &[Interaction],
        full_log: &[Interaction],
    ) -> Result<(), Error> {
        let lead_id = updated.id;
        if updated.stage == Stage::Escalated || self.store.handoff_exists(lead_id).await? {
            debug!(lead_id = %lead_id, "Handoff already recorded, skipping");
            return Ok(());
        }

        updated.stage = Stage::Escalated;
        let cancel: Vec<Uuid> = self
            .store
            .actions_for(lead_id)
            .await?
            .into_iter()
            .map(|a| a.id)
            .collect();

        // The handoff record travels in the stage-freeze commit: a lead can
        // never end up Escalated with nothing for a human to pick up.
        let handoff = HandoffEvent::new(lead_id, reason.clone(), render_transcript(full_log));
        self.commit_lead(
            &updated,
            expected,
            interactions,
            &[],
            &cancel,
            Some(&handoff),
        )
        .await?;
        info!(lead_id = %lead_id, reason = %reason, "Lead escalated to a human");

        if let Err(e) = self.notifier.notify_handoff(&handoff, &updated).await {
            // The handoff stands; the record is queryable even if the alert
            // never arrived
            error!(lead_id = %lead_id, "Handoff notification failed: {e}");
        }
        Ok(())
    }

    // ── Plumbing ────────────────────────────────────────────────────

    /// Consistent read of the lead row and its interaction log.
    async fn snapshot(&self, lead_id: Uuid) -> Result<(Lead, Vec<Interaction>), Error> {
        let _guard = self.locks.acquire(lead_id).await;
        let lead = self
            .store
            .get_lead(lead_id)
            .await?
            .ok_or(OrchestratorError::LeadNotFound { id: lead_id })?;
        let history = self.store.interactions(lead_id).await?;
        Ok((lead, history))
    }

    /// Version-checked commit under the lead lock. A non-conflict failure
    /// after dispatch leaves `outcome=unknown` markers so the log never
    /// silently loses a send.
    async fn commit_lead(
        &self,
        lead: &Lead,
        expected: u64,
        interactions: &[Interaction],
        schedule: &[ScheduledAction],
        cancel: &[Uuid],
        handoff: Option<&HandoffEvent>,
    ) -> Result<(), Error> {
        let _guard = self.locks.acquire(lead.id).await;
        let result = self
            .store
            .commit(LeadCommit {
                lead: Some(lead),
                expected_version: expected,
                interactions,
                schedule,
                cancel_actions: cancel,
                handoff,
            })
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(StoreError::VersionConflict { id, .. }) => {
                Err(OrchestratorError::Conflict { id }.into())
            }
            Err(e) => {
                for interaction in interactions
                    .iter()
                    .filter(|i| i.direction == Direction::Outbound)
                {
                    let mut marker = interaction.clone();
                    marker.outcome = Outcome::Unknown;
                    if let Err(mark_err) = self.store.append_interaction(&marker).await {
                        error!(
                            lead_id = %lead.id,
                            "Failed to record unknown-outcome marker: {mark_err}"
                        );
                    }
                }
                Err(e.into())
            }
        }
    }

    /// Engine call with a short in-line retry budget. `None` means the engine
    /// stayed unavailable and the caller should defer its event.
    async fn decide_with_retry(
        &self,
        lead: &Lead,
        history: &[Interaction],
        kind: PromptKind,
    ) -> Option<Decision> {
        let mut attempt = 1;
        loop {
            let outcome = tokio::time::timeout(
                self.config.decision_timeout,
                self.decision.decide(lead, history, kind),
            )
            .await;

            match outcome {
                Ok(Ok(decision)) => return Some(decision),
                Ok(Err(e)) if attempt <= self.config.decision_retries => {
                    warn!(lead_id = %lead.id, attempt, "Decision engine failed, retrying: {e}");
                }
                Err(_) if attempt <= self.config.decision_retries => {
                    warn!(lead_id = %lead.id, attempt, "Decision engine timed out, retrying");
                }
                Ok(Err(e)) => {
                    warn!(lead_id = %lead.id, "Decision engine unavailable: {e}");
                    return None;
                }
                Err(_) => {
                    warn!(lead_id = %lead.id, "Decision engine unavailable: timed out");
                    return None;
                }
            }
            tokio::time::sleep(backoff_delay(self.config.gateway_backoff_base, attempt)).await;
            attempt += 1;
        }
    }

    /// Park an event in the durable queue; it replays after the defer window.
    async fn defer(&self, lead_id: Uuid, event: &PipelineEvent) -> Result<(), Error> {
        let payload = serde_json::to_value(event)
            .map_err(|e| SchedulerError::Payload(e.to_string()))?;
        let due = Utc::now() + self.config.decision_defer;
        self.scheduler
            .schedule(lead_id, ActionKind::RetryEvent, due, payload)
            .await?;
        warn!(lead_id = %lead_id, event = event.label(), "Event deferred");
        Ok(())
    }

    /// Send one message through the registry and record what happened.
    async fn dispatch_outbound(
        &self,
        lead: &Lead,
        channel: Channel,
        content: &str,
        seq: u64,
    ) -> Interaction {
        let Some(to) = lead.address_for(channel) else {
            warn!(lead_id = %lead.id, channel = %channel, "No address for channel");
            return Interaction::outbound(lead.id, seq, channel, content, Outcome::Failed);
        };
        let request = DispatchRequest::new(lead.id, channel, to, content, seq);
        let outcome = match self.gateways.dispatch(&request).await {
            Ok(receipt) if receipt.status == DispatchStatus::Delivered => Outcome::Delivered,
            Ok(receipt) => {
                warn!(lead_id = %lead.id, channel = %channel, status = ?receipt.status, "Dispatch not delivered");
                Outcome::Failed
            }
            Err(e) => {
                warn!(lead_id = %lead.id, channel = %channel, "Dispatch failed: {e}");
                Outcome::Failed
            }
        };
        Interaction::outbound(lead.id, seq, channel, content, outcome)
    }

    /// The channel a reply or nudge should go out on: wherever the lead last
    /// wrote to us, falling back to the first reachable configured channel.
    fn outbound_channel(&self, lead: &Lead, history: &[Interaction]) -> Option<Channel> {
        let last_inbound = history
            .iter()
            .rev()
            .find(|i| i.direction == Direction::Inbound)
            .map(|i| i.channel);
        last_inbound
            .filter(|c| lead.address_for(*c).is_some() && self.gateways.supports(*c))
            .or_else(|| {
                lead.reachable_channels()
                    .into_iter()
                    .find(|c| self.gateways.supports(*c))
            })
    }

    /// Build rung `attempt` of the follow-up ladder, due one configured
    /// offset from now.
    fn followup_action(&self, lead_id: Uuid, attempt: u32) -> ScheduledAction {
        let index = (attempt as usize - 1).min(self.config.followup_offsets.len() - 1);
        ScheduledAction::new(
            lead_id,
            ActionKind::FollowUp,
            Utc::now() + self.config.followup_offsets[index],
            serde_json::json!({ "attempt": attempt }),
        )
    }

    /// The rung to queue once a reply turn leaves the lead holding our
    /// latest message. Empty when the stage has moved past nudging or a rung
    /// is already waiting.
    async fn ladder_restart(&self, lead: &Lead) -> Result<Vec<ScheduledAction>, Error> {
        if lead.stage.follows_up() && self.pending_followups(lead.id).await?.is_empty() {
            Ok(vec![self.followup_action(lead.id, lead.followup_count + 1)])
        } else {
            Ok(Vec::new())
        }
    }

    async fn pending_followups(&self, lead_id: Uuid) -> Result<Vec<Uuid>, Error> {
        Ok(self
            .store
            .actions_for(lead_id)
            .await?
            .into_iter()
            .filter(|a| a.kind == ActionKind::FollowUp)
            .map(|a| a.id)
            .collect())
    }
}

fn apply_decision_fields(lead: &mut Lead, decision: &Decision) {
    if let Some(score) = decision.score {
        lead.score = score;
    }
    if let Some(value) = decision.estimated_value {
        lead.deal_value = value;
    }
}

fn is_conflict(e: &Error) -> bool {
    matches!(
        e,
        Error::Orchestrator(OrchestratorError::Conflict { .. })
            | Error::Store(StoreError::VersionConflict { .. })
    )
}

/// Spawn the event loop: pull events off the queue and process each on its
/// own task, bounded by a semaphore.
pub fn spawn_event_loop(
    orchestrator: Arc<Orchestrator>,
    mut events: mpsc::Receiver<PipelineEvent>,
    max_concurrent: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
        while let Some(event) = events.recv().await {
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move {
                orchestrator.process(event).await;
                drop(permit);
            });
        }
        info!("Event queue closed, event loop stopping");
    })
}
