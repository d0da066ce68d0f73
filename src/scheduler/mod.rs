//! Scheduler — durable queue of deferred actions with a tick loop.
//!
//! Actions live in the store's `scheduled_actions` table so follow-up
//! horizons of up to ten days survive a restart. The tick claims each due
//! action by deleting its row first; only a successful delete delivers the
//! action, which is what makes firing exactly-once even with several
//! processes ticking the same table.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::SchedulerError;
use crate::lead::{ActionKind, ScheduledAction, Stage};
use crate::orchestrator::PipelineEvent;
use crate::store::LeadStore;

/// Durable deferred-action queue over the lead store.
pub struct Scheduler {
    store: Arc<dyn LeadStore>,
    events: mpsc::Sender<PipelineEvent>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn LeadStore>, events: mpsc::Sender<PipelineEvent>) -> Self {
        Self { store, events }
    }

    /// Enqueue a deferred action. Returns its id for later cancellation.
    pub async fn schedule(
        &self,
        lead_id: Uuid,
        kind: ActionKind,
        due_at: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Result<Uuid, SchedulerError> {
        let action = ScheduledAction::new(lead_id, kind, due_at, payload);
        self.store.insert_action(&action).await?;
        Ok(action.id)
    }

    /// Remove a pending action. Returns whether it was still pending.
    pub async fn cancel(&self, action_id: Uuid) -> Result<bool, SchedulerError> {
        Ok(self.store.delete_action(action_id).await?)
    }

    /// Remove all pending actions for a lead, optionally limited to one kind.
    pub async fn cancel_for_lead(
        &self,
        lead_id: Uuid,
        kind: Option<ActionKind>,
    ) -> Result<usize, SchedulerError> {
        Ok(self.store.cancel_actions_for(lead_id, kind).await?)
    }

    /// Total number of pending actions.
    pub async fn pending_count(&self) -> Result<u64, SchedulerError> {
        Ok(self.store.pending_action_count().await?)
    }

    /// Deliver every action due at or before `now` to the orchestrator,
    /// exactly once each, in (due time, insertion) order.
    ///
    /// Public so tests can drive time directly instead of waiting on the
    /// interval task.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        let due = self.store.due_actions(now).await?;
        let mut delivered = 0;

        for action in due {
            // Claim by delete: a row that is already gone was taken by
            // another ticker (or cancelled) and must not fire here.
            if !self.store.delete_action(action.id).await? {
                continue;
            }

            let event = match event_for(&action) {
                Ok(event) => event,
                Err(e) => {
                    error!(
                        action_id = %action.id,
                        lead_id = %action.lead_id,
                        "Dropping malformed scheduled action: {e}"
                    );
                    continue;
                }
            };

            debug!(
                action_id = %action.id,
                lead_id = %action.lead_id,
                kind = %action.kind,
                event = event.label(),
                "Scheduled action due"
            );

            if self.events.send(event).await.is_err() {
                warn!("Event queue closed, stopping tick");
                break;
            }
            delivered += 1;
        }

        Ok(delivered)
    }
}

/// Translate a claimed action into the event the orchestrator processes.
fn event_for(action: &ScheduledAction) -> Result<PipelineEvent, SchedulerError> {
    match action.kind {
        ActionKind::FollowUp => {
            let attempt = action
                .payload
                .get("attempt")
                .and_then(|v| v.as_u64())
                .unwrap_or(1) as u32;
            Ok(PipelineEvent::FollowUpDue {
                lead_id: action.lead_id,
                attempt,
            })
        }
        ActionKind::RetryEvent => serde_json::from_value(action.payload.clone())
            .map_err(|e| SchedulerError::Payload(e.to_string())),
    }
}

/// Spawn the interval task that ticks the scheduler.
pub fn spawn_tick_task(scheduler: Arc<Scheduler>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = scheduler.tick(Utc::now()).await {
                error!("Scheduler tick failed: {e}");
            }
        }
    })
}

/// Spawn the cron-driven sweep that re-enqueues `Sourced` leads which never
/// got their initial outreach (e.g. ingested while the process was down).
pub fn spawn_sweep_task(
    store: Arc<dyn LeadStore>,
    events: mpsc::Sender<PipelineEvent>,
    schedule: cron::Schedule,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                warn!("Sweep schedule has no upcoming fire times, stopping sweep");
                break;
            };
            let wait = (next - Utc::now())
                .to_std()
                .unwrap_or(Duration::from_secs(0));
            tokio::time::sleep(wait).await;

            // Small grace window so a lead mid-ingestion is not swept twice.
            let cutoff = Utc::now() - chrono::Duration::minutes(5);
            let stranded = match store.list_stale_leads(Stage::Sourced, cutoff).await {
                Ok(leads) => leads,
                Err(e) => {
                    error!("Outreach sweep query failed: {e}");
                    continue;
                }
            };

            if stranded.is_empty() {
                continue;
            }
            info!(count = stranded.len(), "Sweeping stranded sourced leads");
            for lead in stranded {
                if events
                    .send(PipelineEvent::LeadSourced { lead_id: lead.id })
                    .await
                    .is_err()
                {
                    warn!("Event queue closed, stopping sweep");
                    return;
                }
            }
        }
    })
}

/// Parse the configured sweep schedule, falling back to the default when the
/// expression is invalid.
pub fn sweep_schedule(expr: &str) -> cron::Schedule {
    cron::Schedule::from_str(expr).unwrap_or_else(|e| {
        warn!("Invalid sweep schedule '{expr}', using every 2 hours: {e}");
        cron::Schedule::from_str("0 0 */2 * * *").expect("default sweep schedule parses")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lead::Lead;
    use crate::store::LibSqlStore;

    async fn harness() -> (Arc<LibSqlStore>, Scheduler, mpsc::Receiver<PipelineEvent>) {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let (tx, rx) = mpsc::channel(16);
        let scheduler = Scheduler::new(store.clone(), tx);
        (store, scheduler, rx)
    }

    async fn seeded_lead(store: &LibSqlStore) -> Lead {
        let lead = Lead::new("Asha Patel", 75).with_email("asha@shopwala.in");
        store.insert_lead(&lead).await.unwrap();
        lead
    }

    #[tokio::test]
    async fn due_followup_fires_exactly_once() {
        let (store, scheduler, mut rx) = harness().await;
        let lead = seeded_lead(&store).await;

        scheduler
            .schedule(
                lead.id,
                ActionKind::FollowUp,
                Utc::now() - chrono::Duration::seconds(1),
                serde_json::json!({"attempt": 2}),
            )
            .await
            .unwrap();

        assert_eq!(scheduler.tick(Utc::now()).await.unwrap(), 1);
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            PipelineEvent::FollowUpDue {
                lead_id: lead.id,
                attempt: 2
            }
        );

        // A second tick finds nothing — the row was claimed by delete
        assert_eq!(scheduler.tick(Utc::now()).await.unwrap(), 0);
        assert_eq!(scheduler.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn future_actions_do_not_fire_early() {
        let (store, scheduler, mut rx) = harness().await;
        let lead = seeded_lead(&store).await;

        scheduler
            .schedule(
                lead.id,
                ActionKind::FollowUp,
                Utc::now() + chrono::Duration::days(2),
                serde_json::json!({"attempt": 1}),
            )
            .await
            .unwrap();

        assert_eq!(scheduler.tick(Utc::now()).await.unwrap(), 0);
        // Moving the clock past the due time delivers it
        assert_eq!(
            scheduler
                .tick(Utc::now() + chrono::Duration::days(3))
                .await
                .unwrap(),
            1
        );
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn equal_due_times_deliver_fifo() {
        let (store, scheduler, mut rx) = harness().await;
        let lead = seeded_lead(&store).await;

        let due = Utc::now() - chrono::Duration::seconds(1);
        for attempt in 1..=3u32 {
            scheduler
                .schedule(
                    lead.id,
                    ActionKind::FollowUp,
                    due,
                    serde_json::json!({"attempt": attempt}),
                )
                .await
                .unwrap();
        }

        assert_eq!(scheduler.tick(Utc::now()).await.unwrap(), 3);
        for expected in 1..=3u32 {
            match rx.recv().await.unwrap() {
                PipelineEvent::FollowUpDue { attempt, .. } => assert_eq!(attempt, expected),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn cancelled_action_never_fires() {
        let (store, scheduler, mut rx) = harness().await;
        let lead = seeded_lead(&store).await;

        let id = scheduler
            .schedule(
                lead.id,
                ActionKind::FollowUp,
                Utc::now() - chrono::Duration::seconds(1),
                serde_json::json!({"attempt": 1}),
            )
            .await
            .unwrap();

        assert!(scheduler.cancel(id).await.unwrap());
        assert_eq!(scheduler.tick(Utc::now()).await.unwrap(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn retry_event_replays_the_parked_event() {
        let (store, scheduler, mut rx) = harness().await;
        let lead = seeded_lead(&store).await;

        let parked = PipelineEvent::RespondDue { lead_id: lead.id };
        scheduler
            .schedule(
                lead.id,
                ActionKind::RetryEvent,
                Utc::now() - chrono::Duration::seconds(1),
                serde_json::to_value(&parked).unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(scheduler.tick(Utc::now()).await.unwrap(), 1);
        assert_eq!(rx.recv().await.unwrap(), parked);
    }

    #[tokio::test]
    async fn malformed_retry_payload_is_dropped_not_fatal() {
        let (store, scheduler, mut rx) = harness().await;
        let lead = seeded_lead(&store).await;

        scheduler
            .schedule(
                lead.id,
                ActionKind::RetryEvent,
                Utc::now() - chrono::Duration::seconds(1),
                serde_json::json!({"kind": "not_a_real_event"}),
            )
            .await
            .unwrap();

        assert_eq!(scheduler.tick(Utc::now()).await.unwrap(), 0);
        assert!(rx.try_recv().is_err());
        // The bad row was still consumed
        assert_eq!(scheduler.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn actions_survive_store_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scheduler.db");

        let lead = Lead::new("Asha Patel", 75).with_email("asha@shopwala.in");
        {
            let store = Arc::new(LibSqlStore::new_local(&path).await.unwrap());
            store.insert_lead(&lead).await.unwrap();
            let (tx, _rx) = mpsc::channel(4);
            let scheduler = Scheduler::new(store, tx);
            scheduler
                .schedule(
                    lead.id,
                    ActionKind::FollowUp,
                    Utc::now() + chrono::Duration::days(10),
                    serde_json::json!({"attempt": 3}),
                )
                .await
                .unwrap();
        }

        let store = Arc::new(LibSqlStore::new_local(&path).await.unwrap());
        let (tx, mut rx) = mpsc::channel(4);
        let scheduler = Scheduler::new(store, tx);
        assert_eq!(scheduler.pending_count().await.unwrap(), 1);
        assert_eq!(
            scheduler
                .tick(Utc::now() + chrono::Duration::days(11))
                .await
                .unwrap(),
            1
        );
        match rx.recv().await.unwrap() {
            PipelineEvent::FollowUpDue { lead_id, attempt } => {
                assert_eq!(lead_id, lead.id);
                assert_eq!(attempt, 3);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn invalid_sweep_expression_falls_back() {
        let schedule = sweep_schedule("not a cron line");
        assert!(schedule.upcoming(Utc).next().is_some());
    }
}
