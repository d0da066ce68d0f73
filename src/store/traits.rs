//! `LeadStore` trait — single async interface for all pipeline persistence.
//!
//! Covers leads, their append-only interaction log, the durable scheduled
//! action queue, and handoff records. One backend implements all of it so a
//! lead commit can span tables atomically.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::lead::{ActionKind, HandoffEvent, Interaction, Lead, ScheduledAction, Stage};

/// One atomic per-lead write: the updated lead row (version-checked), any
/// interactions appended, any scheduled actions created or cancelled, and an
/// optional handoff record, all in the same breath.
#[derive(Debug, Default)]
pub struct LeadCommit<'a> {
    /// Lead fields to write. The stored version becomes `expected_version + 1`
    /// regardless of `lead.version`; the caller's copy is stale after commit.
    pub lead: Option<&'a Lead>,
    /// Version the caller snapshotted. The commit fails with
    /// [`StoreError::VersionConflict`] if the row moved on.
    pub expected_version: u64,
    /// Interactions to append.
    pub interactions: &'a [Interaction],
    /// Scheduled actions to enqueue.
    pub schedule: &'a [ScheduledAction],
    /// Scheduled action IDs to cancel.
    pub cancel_actions: &'a [Uuid],
    /// Handoff record written with the `Escalated` stage change, so a lead
    /// can never freeze without its handoff on file.
    pub handoff: Option<&'a HandoffEvent>,
}

/// Backend-agnostic store trait covering leads, interactions, scheduled
/// actions, and handoffs.
#[async_trait]
pub trait LeadStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), StoreError>;

    // ── Leads ───────────────────────────────────────────────────────

    /// Insert a new lead. Fails with `Duplicate` if the ID is taken.
    async fn insert_lead(&self, lead: &Lead) -> Result<(), StoreError>;

    /// Get a lead by ID.
    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, StoreError>;

    /// Look a lead up by any channel address (email, phone, or chat handle).
    async fn find_lead_by_address(&self, address: &str) -> Result<Option<Lead>, StoreError>;

    /// Version-checked write of a lead row on its own.
    async fn update_lead(&self, lead: &Lead, expected_version: u64) -> Result<(), StoreError>;

    /// Atomically apply a [`LeadCommit`].
    async fn commit(&self, commit: LeadCommit<'_>) -> Result<(), StoreError>;

    /// All leads in a given stage, oldest first.
    async fn list_leads_by_stage(&self, stage: Stage) -> Result<Vec<Lead>, StoreError>;

    /// All leads, newest first.
    async fn list_leads(&self) -> Result<Vec<Lead>, StoreError>;

    /// Leads sitting in `stage` whose last write predates `before`.
    async fn list_stale_leads(
        &self,
        stage: Stage,
        before: DateTime<Utc>,
    ) -> Result<Vec<Lead>, StoreError>;

    /// Lead count per stage (stages with no leads are omitted).
    async fn stage_counts(&self) -> Result<Vec<(Stage, u64)>, StoreError>;

    // ── Interactions ────────────────────────────────────────────────

    /// Append one interaction outside a commit (used for `outcome=unknown`
    /// records when the lead row itself could not be written).
    async fn append_interaction(&self, interaction: &Interaction) -> Result<(), StoreError>;

    /// Full interaction log for a lead, ordered by sequence number.
    async fn interactions(&self, lead_id: Uuid) -> Result<Vec<Interaction>, StoreError>;

    /// Next free interaction sequence number for a lead (starts at 1).
    async fn next_seq(&self, lead_id: Uuid) -> Result<u64, StoreError>;

    // ── Scheduled actions ───────────────────────────────────────────

    /// Enqueue a scheduled action.
    async fn insert_action(&self, action: &ScheduledAction) -> Result<(), StoreError>;

    /// Remove an action from the queue. Returns whether it was still there,
    /// which is how the tick claims an action exactly once.
    async fn delete_action(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Cancel all pending actions for a lead, optionally limited to one kind.
    /// Returns how many were removed.
    async fn cancel_actions_for(
        &self,
        lead_id: Uuid,
        kind: Option<ActionKind>,
    ) -> Result<usize, StoreError>;

    /// Actions due at or before `now`, ordered by due time then insertion.
    async fn due_actions(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledAction>, StoreError>;

    /// Pending actions for one lead, soonest first.
    async fn actions_for(&self, lead_id: Uuid) -> Result<Vec<ScheduledAction>, StoreError>;

    /// Total number of pending actions.
    async fn pending_action_count(&self) -> Result<u64, StoreError>;

    // ── Handoffs ────────────────────────────────────────────────────

    /// Record a handoff event.
    async fn insert_handoff(&self, handoff: &HandoffEvent) -> Result<(), StoreError>;

    /// Whether a handoff already exists for this lead.
    async fn handoff_exists(&self, lead_id: Uuid) -> Result<bool, StoreError>;
}
