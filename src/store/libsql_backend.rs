//! libSQL backend — async `LeadStore` implementation.
//!
//! Supports local file and in-memory databases. All writes that must be
//! atomic per lead (row update + interaction append + schedule changes) go
//! through a single transaction guarded by a store-level write lock, since
//! the backend shares one connection.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, TransactionBehavior, params};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::lead::{ActionKind, HandoffEvent, Interaction, Lead, ScheduledAction, Stage};
use crate::store::migrations;
use crate::store::traits::{LeadCommit, LeadStore};

/// libSQL store backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    /// Serializes multi-statement transactions on the shared connection.
    write_lock: Mutex<()>,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Open(format!("Failed to create database directory: {e}")))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        };
        store.run_migrations().await?;
        info!(path = %path.display(), "Lead store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to create in-memory database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    // Try RFC 3339 first (our canonical write format)
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    // Try SQLite datetime() output with fractional seconds
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    // Try SQLite datetime() output without fractional seconds
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<DateTime<Utc>>` to libsql Value (RFC 3339 text).
fn opt_datetime(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(dt.to_rfc3339()),
        None => libsql::Value::Null,
    }
}

/// Map a libsql Row to a Lead.
///
/// Column order matches LEAD_COLUMNS.
fn row_to_lead(row: &libsql::Row) -> Result<Lead, StoreError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| StoreError::Query(format!("lead id column: {e}")))?;
    let stage_str: String = row
        .get(7)
        .map_err(|e| StoreError::Query(format!("lead stage column: {e}")))?;
    let value_str: String = row.get(8).unwrap_or_else(|_| "0".to_string());
    let last_outbound: Option<String> = row.get(11).ok();
    let last_inbound: Option<String> = row.get(12).ok();
    let created_str: String = row.get(14).unwrap_or_default();
    let updated_str: String = row.get(15).unwrap_or_default();

    let id = Uuid::parse_str(&id_str)
        .map_err(|e| StoreError::Serialization(format!("lead id {id_str}: {e}")))?;
    let stage: Stage = stage_str
        .parse()
        .map_err(|e| StoreError::Serialization(format!("lead {id_str}: {e}")))?;
    let deal_value: Decimal = value_str
        .parse()
        .map_err(|e| StoreError::Serialization(format!("lead {id_str} deal_value: {e}")))?;

    Ok(Lead {
        id,
        name: row.get(1).unwrap_or_default(),
        company: row.get(2).ok(),
        email: row.get(3).ok(),
        phone: row.get(4).ok(),
        chat_handle: row.get(5).ok(),
        score: row.get::<i64>(6).unwrap_or(0) as u8,
        stage,
        deal_value,
        objection_count: row.get::<i64>(9).unwrap_or(0) as u32,
        followup_count: row.get::<i64>(10).unwrap_or(0) as u32,
        last_outbound_at: parse_optional_datetime(&last_outbound),
        last_inbound_at: parse_optional_datetime(&last_inbound),
        version: row.get::<i64>(13).unwrap_or(0) as u64,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Map a libsql Row to an Interaction. Column order matches INTERACTION_COLUMNS.
fn row_to_interaction(row: &libsql::Row) -> Result<Interaction, StoreError> {
    let lead_id_str: String = row
        .get(0)
        .map_err(|e| StoreError::Query(format!("interaction lead_id column: {e}")))?;
    let channel_str: String = row.get(2).unwrap_or_default();
    let direction_str: String = row.get(3).unwrap_or_default();
    let outcome_str: String = row.get(5).unwrap_or_default();
    let occurred_str: String = row.get(6).unwrap_or_default();

    let lead_id = Uuid::parse_str(&lead_id_str)
        .map_err(|e| StoreError::Serialization(format!("interaction lead_id: {e}")))?;

    Ok(Interaction {
        lead_id,
        seq: row.get::<i64>(1).unwrap_or(0) as u64,
        channel: channel_str
            .parse()
            .map_err(|e| StoreError::Serialization(format!("interaction channel: {e}")))?,
        direction: direction_str
            .parse()
            .map_err(|e| StoreError::Serialization(format!("interaction direction: {e}")))?,
        summary: row.get(4).unwrap_or_default(),
        outcome: outcome_str
            .parse()
            .map_err(|e| StoreError::Serialization(format!("interaction outcome: {e}")))?,
        occurred_at: parse_datetime(&occurred_str),
    })
}

/// Map a libsql Row to a ScheduledAction. Column order matches ACTION_COLUMNS.
fn row_to_action(row: &libsql::Row) -> Result<ScheduledAction, StoreError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| StoreError::Query(format!("action id column: {e}")))?;
    let lead_id_str: String = row.get(1).unwrap_or_default();
    let kind_str: String = row.get(2).unwrap_or_default();
    let due_str: String = row.get(3).unwrap_or_default();
    let payload_str: String = row.get(4).unwrap_or_else(|_| "{}".to_string());
    let created_str: String = row.get(6).unwrap_or_default();

    Ok(ScheduledAction {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| StoreError::Serialization(format!("action id {id_str}: {e}")))?,
        lead_id: Uuid::parse_str(&lead_id_str)
            .map_err(|e| StoreError::Serialization(format!("action lead_id: {e}")))?,
        kind: kind_str
            .parse()
            .map_err(|e| StoreError::Serialization(format!("action kind: {e}")))?,
        due_at: parse_datetime(&due_str),
        payload: serde_json::from_str(&payload_str)
            .map_err(|e| StoreError::Serialization(format!("action payload: {e}")))?,
        attempt: row.get::<i64>(5).unwrap_or(0) as u32,
        created_at: parse_datetime(&created_str),
    })
}

// ── Shared statements ───────────────────────────────────────────────

const LEAD_COLUMNS: &str = "id, name, company, email, phone, chat_handle, score, stage, deal_value, objection_count, followup_count, last_outbound_at, last_inbound_at, version, created_at, updated_at";

const INTERACTION_COLUMNS: &str = "lead_id, seq, channel, direction, summary, outcome, occurred_at";

const ACTION_COLUMNS: &str = "id, lead_id, kind, due_at, payload, attempt, created_at";

/// Version-checked lead row update. Returns affected row count; the stored
/// version becomes `expected_version + 1`.
async fn update_lead_stmt(
    conn: &Connection,
    lead: &Lead,
    expected_version: u64,
) -> Result<u64, StoreError> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE leads SET name = ?1, company = ?2, email = ?3, phone = ?4, chat_handle = ?5,
            score = ?6, stage = ?7, deal_value = ?8, objection_count = ?9, followup_count = ?10,
            last_outbound_at = ?11, last_inbound_at = ?12, version = ?13, updated_at = ?14
         WHERE id = ?15 AND version = ?16",
        params![
            lead.name.clone(),
            opt_text_owned(lead.company.clone()),
            opt_text_owned(lead.email.clone()),
            opt_text_owned(lead.phone.clone()),
            opt_text_owned(lead.chat_handle.clone()),
            lead.score as i64,
            lead.stage.to_string(),
            lead.deal_value.to_string(),
            lead.objection_count as i64,
            lead.followup_count as i64,
            opt_datetime(lead.last_outbound_at),
            opt_datetime(lead.last_inbound_at),
            (expected_version + 1) as i64,
            now,
            lead.id.to_string(),
            expected_version as i64,
        ],
    )
    .await
    .map_err(|e| StoreError::Query(format!("update_lead: {e}")))
}

/// Classify a zero-row lead update as missing-row or stale-version.
async fn lead_update_miss(
    conn: &Connection,
    id: Uuid,
    expected: u64,
) -> Result<StoreError, StoreError> {
    let mut rows = conn
        .query(
            "SELECT version FROM leads WHERE id = ?1",
            params![id.to_string()],
        )
        .await
        .map_err(|e| StoreError::Query(format!("lead version check: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => {
            let found: i64 = row.get(0).unwrap_or(0);
            Ok(StoreError::VersionConflict {
                id,
                expected,
                found: found as u64,
            })
        }
        _ => Ok(StoreError::NotFound {
            entity: "lead".to_string(),
            id: id.to_string(),
        }),
    }
}

async fn insert_interaction_stmt(
    conn: &Connection,
    interaction: &Interaction,
) -> Result<(), StoreError> {
    conn.execute(
        &format!(
            "INSERT INTO interactions ({INTERACTION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
        ),
        params![
            interaction.lead_id.to_string(),
            interaction.seq as i64,
            interaction.channel.to_string(),
            interaction.direction.to_string(),
            interaction.summary.clone(),
            interaction.outcome.to_string(),
            interaction.occurred_at.to_rfc3339(),
        ],
    )
    .await
    .map_err(|e| StoreError::Query(format!("insert_interaction: {e}")))?;
    Ok(())
}

async fn insert_action_stmt(conn: &Connection, action: &ScheduledAction) -> Result<(), StoreError> {
    let payload = serde_json::to_string(&action.payload)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    conn.execute(
        &format!(
            "INSERT INTO scheduled_actions ({ACTION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
        ),
        params![
            action.id.to_string(),
            action.lead_id.to_string(),
            action.kind.to_string(),
            action.due_at.to_rfc3339(),
            payload,
            action.attempt as i64,
            action.created_at.to_rfc3339(),
        ],
    )
    .await
    .map_err(|e| StoreError::Query(format!("insert_action: {e}")))?;
    Ok(())
}

async fn insert_handoff_stmt(conn: &Connection, handoff: &HandoffEvent) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO handoffs (id, lead_id, reason, transcript, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            handoff.id.to_string(),
            handoff.lead_id.to_string(),
            handoff.reason.clone(),
            handoff.transcript.clone(),
            handoff.created_at.to_rfc3339(),
        ],
    )
    .await
    .map_err(|e| StoreError::Query(format!("insert_handoff: {e}")))?;
    Ok(())
}

/// Apply every statement of a commit on one connection (inside a transaction).
async fn apply_commit(conn: &Connection, commit: &LeadCommit<'_>) -> Result<(), StoreError> {
    if let Some(lead) = commit.lead {
        let affected = update_lead_stmt(conn, lead, commit.expected_version).await?;
        if affected == 0 {
            return Err(lead_update_miss(conn, lead.id, commit.expected_version).await?);
        }
    }
    for interaction in commit.interactions {
        insert_interaction_stmt(conn, interaction).await?;
    }
    for action in commit.schedule {
        insert_action_stmt(conn, action).await?;
    }
    for id in commit.cancel_actions {
        conn.execute(
            "DELETE FROM scheduled_actions WHERE id = ?1",
            params![id.to_string()],
        )
        .await
        .map_err(|e| StoreError::Query(format!("cancel_action: {e}")))?;
    }
    if let Some(handoff) = commit.handoff {
        insert_handoff_stmt(conn, handoff).await?;
    }
    Ok(())
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl LeadStore for LibSqlStore {
    async fn run_migrations(&self) -> Result<(), StoreError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Leads ───────────────────────────────────────────────────────

    async fn insert_lead(&self, lead: &Lead) -> Result<(), StoreError> {
        let conn = self.conn();
        let affected = conn
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO leads ({LEAD_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
                ),
                params![
                    lead.id.to_string(),
                    lead.name.clone(),
                    opt_text_owned(lead.company.clone()),
                    opt_text_owned(lead.email.clone()),
                    opt_text_owned(lead.phone.clone()),
                    opt_text_owned(lead.chat_handle.clone()),
                    lead.score as i64,
                    lead.stage.to_string(),
                    lead.deal_value.to_string(),
                    lead.objection_count as i64,
                    lead.followup_count as i64,
                    opt_datetime(lead.last_outbound_at),
                    opt_datetime(lead.last_inbound_at),
                    lead.version as i64,
                    lead.created_at.to_rfc3339(),
                    lead.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("insert_lead: {e}")))?;

        if affected == 0 {
            return Err(StoreError::Duplicate { id: lead.id });
        }
        debug!(lead_id = %lead.id, stage = %lead.stage, "Lead inserted into DB");
        Ok(())
    }

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_lead: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_lead(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_lead: {e}"))),
        }
    }

    async fn find_lead_by_address(&self, address: &str) -> Result<Option<Lead>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {LEAD_COLUMNS} FROM leads
                     WHERE email = ?1 OR phone = ?1 OR chat_handle = ?1 LIMIT 1"
                ),
                params![address],
            )
            .await
            .map_err(|e| StoreError::Query(format!("find_lead_by_address: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_lead(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("find_lead_by_address: {e}"))),
        }
    }

    async fn update_lead(&self, lead: &Lead, expected_version: u64) -> Result<(), StoreError> {
        let conn = self.conn();
        let affected = update_lead_stmt(conn, lead, expected_version).await?;
        if affected == 0 {
            return Err(lead_update_miss(conn, lead.id, expected_version).await?);
        }
        debug!(lead_id = %lead.id, version = expected_version + 1, "Lead updated in DB");
        Ok(())
    }

    async fn commit(&self, commit: LeadCommit<'_>) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| StoreError::Query(format!("commit begin: {e}")))?;

        match apply_commit(&tx, &commit).await {
            Ok(()) => tx
                .commit()
                .await
                .map_err(|e| StoreError::Query(format!("commit: {e}"))),
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn list_leads_by_stage(&self, stage: Stage) -> Result<Vec<Lead>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {LEAD_COLUMNS} FROM leads WHERE stage = ?1 ORDER BY created_at ASC"
                ),
                params![stage.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_leads_by_stage: {e}")))?;

        let mut leads = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_lead(&row) {
                Ok(lead) => leads.push(lead),
                Err(e) => {
                    tracing::warn!("Skipping lead row: {e}");
                }
            }
        }
        Ok(leads)
    }

    async fn list_leads(&self) -> Result<Vec<Lead>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {LEAD_COLUMNS} FROM leads ORDER BY created_at DESC"),
                (),
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_leads: {e}")))?;

        let mut leads = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_lead(&row) {
                Ok(lead) => leads.push(lead),
                Err(e) => {
                    tracing::warn!("Skipping lead row: {e}");
                }
            }
        }
        Ok(leads)
    }

    async fn list_stale_leads(
        &self,
        stage: Stage,
        before: DateTime<Utc>,
    ) -> Result<Vec<Lead>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {LEAD_COLUMNS} FROM leads
                     WHERE stage = ?1 AND updated_at < ?2 ORDER BY updated_at ASC"
                ),
                params![stage.to_string(), before.to_rfc3339()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_stale_leads: {e}")))?;

        let mut leads = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_lead(&row) {
                Ok(lead) => leads.push(lead),
                Err(e) => {
                    tracing::warn!("Skipping stale lead row: {e}");
                }
            }
        }
        Ok(leads)
    }

    async fn stage_counts(&self) -> Result<Vec<(Stage, u64)>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query("SELECT stage, COUNT(*) FROM leads GROUP BY stage", ())
            .await
            .map_err(|e| StoreError::Query(format!("stage_counts: {e}")))?;

        let mut counts = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let stage_str: String = row.get(0).unwrap_or_default();
            let count: i64 = row.get(1).unwrap_or(0);
            match stage_str.parse::<Stage>() {
                Ok(stage) => counts.push((stage, count as u64)),
                Err(e) => tracing::warn!("Skipping stage count row: {e}"),
            }
        }
        Ok(counts)
    }

    // ── Interactions ────────────────────────────────────────────────

    async fn append_interaction(&self, interaction: &Interaction) -> Result<(), StoreError> {
        insert_interaction_stmt(self.conn(), interaction).await?;
        debug!(
            lead_id = %interaction.lead_id,
            seq = interaction.seq,
            outcome = %interaction.outcome,
            "Interaction appended"
        );
        Ok(())
    }

    async fn interactions(&self, lead_id: Uuid) -> Result<Vec<Interaction>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {INTERACTION_COLUMNS} FROM interactions
                     WHERE lead_id = ?1 ORDER BY seq ASC"
                ),
                params![lead_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("interactions: {e}")))?;

        let mut log = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_interaction(&row) {
                Ok(i) => log.push(i),
                Err(e) => {
                    tracing::warn!("Skipping interaction row: {e}");
                }
            }
        }
        Ok(log)
    }

    async fn next_seq(&self, lead_id: Uuid) -> Result<u64, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM interactions WHERE lead_id = ?1",
                params![lead_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("next_seq: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let seq: i64 = row.get(0).unwrap_or(1);
                Ok(seq as u64)
            }
            _ => Ok(1),
        }
    }

    // ── Scheduled actions ───────────────────────────────────────────

    async fn insert_action(&self, action: &ScheduledAction) -> Result<(), StoreError> {
        insert_action_stmt(self.conn(), action).await?;
        debug!(
            action_id = %action.id,
            lead_id = %action.lead_id,
            kind = %action.kind,
            due_at = %action.due_at.to_rfc3339(),
            "Action scheduled"
        );
        Ok(())
    }

    async fn delete_action(&self, id: Uuid) -> Result<bool, StoreError> {
        let conn = self.conn();
        let count = conn
            .execute(
                "DELETE FROM scheduled_actions WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("delete_action: {e}")))?;
        Ok(count > 0)
    }

    async fn cancel_actions_for(
        &self,
        lead_id: Uuid,
        kind: Option<ActionKind>,
    ) -> Result<usize, StoreError> {
        let conn = self.conn();
        let count = if let Some(kind) = kind {
            conn.execute(
                "DELETE FROM scheduled_actions WHERE lead_id = ?1 AND kind = ?2",
                params![lead_id.to_string(), kind.to_string()],
            )
            .await
        } else {
            conn.execute(
                "DELETE FROM scheduled_actions WHERE lead_id = ?1",
                params![lead_id.to_string()],
            )
            .await
        }
        .map_err(|e| StoreError::Query(format!("cancel_actions_for: {e}")))?;

        if count > 0 {
            debug!(lead_id = %lead_id, count, "Cancelled scheduled actions");
        }
        Ok(count as usize)
    }

    async fn due_actions(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledAction>, StoreError> {
        let conn = self.conn();
        // rowid tiebreak keeps equal due times in insertion order
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {ACTION_COLUMNS} FROM scheduled_actions
                     WHERE due_at <= ?1 ORDER BY due_at ASC, rowid ASC"
                ),
                params![now.to_rfc3339()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("due_actions: {e}")))?;

        let mut actions = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_action(&row) {
                Ok(a) => actions.push(a),
                Err(e) => {
                    tracing::warn!("Skipping action row: {e}");
                }
            }
        }
        Ok(actions)
    }

    async fn actions_for(&self, lead_id: Uuid) -> Result<Vec<ScheduledAction>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {ACTION_COLUMNS} FROM scheduled_actions
                     WHERE lead_id = ?1 ORDER BY due_at ASC, rowid ASC"
                ),
                params![lead_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("actions_for: {e}")))?;

        let mut actions = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_action(&row) {
                Ok(a) => actions.push(a),
                Err(e) => {
                    tracing::warn!("Skipping action row: {e}");
                }
            }
        }
        Ok(actions)
    }

    async fn pending_action_count(&self) -> Result<u64, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query("SELECT COUNT(*) FROM scheduled_actions", ())
            .await
            .map_err(|e| StoreError::Query(format!("pending_action_count: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row.get(0).unwrap_or(0);
                Ok(count as u64)
            }
            _ => Ok(0),
        }
    }

    // ── Handoffs ────────────────────────────────────────────────────

    async fn insert_handoff(&self, handoff: &HandoffEvent) -> Result<(), StoreError> {
        insert_handoff_stmt(self.conn(), handoff).await?;
        info!(lead_id = %handoff.lead_id, reason = %handoff.reason, "Handoff recorded");
        Ok(())
    }

    async fn handoff_exists(&self, lead_id: Uuid) -> Result<bool, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM handoffs WHERE lead_id = ?1",
                params![lead_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("handoff_exists: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row.get(0).unwrap_or(0);
                Ok(count > 0)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Channel;
    use crate::lead::Outcome;
    use rust_decimal_macros::dec;

    async fn memory_store() -> LibSqlStore {
        LibSqlStore::new_memory().await.unwrap()
    }

    fn sample_lead() -> Lead {
        Lead::new("Asha Patel", 75)
            .with_email("asha@shopwala.in")
            .with_phone("+919876543210")
            .with_company("ShopWala")
    }

    #[tokio::test]
    async fn insert_and_get_roundtrip() {
        let store = memory_store().await;
        let lead = sample_lead();
        store.insert_lead(&lead).await.unwrap();

        let loaded = store.get_lead(lead.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "Asha Patel");
        assert_eq!(loaded.stage, Stage::Sourced);
        assert_eq!(loaded.email.as_deref(), Some("asha@shopwala.in"));
        assert_eq!(loaded.version, 0);
    }

    #[tokio::test]
    async fn duplicate_insert_rejected() {
        let store = memory_store().await;
        let lead = sample_lead();
        store.insert_lead(&lead).await.unwrap();
        let err = store.insert_lead(&lead).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { .. }));
    }

    #[tokio::test]
    async fn find_by_any_address() {
        let store = memory_store().await;
        let lead = sample_lead();
        store.insert_lead(&lead).await.unwrap();

        let by_email = store.find_lead_by_address("asha@shopwala.in").await.unwrap();
        assert_eq!(by_email.map(|l| l.id), Some(lead.id));
        let by_phone = store.find_lead_by_address("+919876543210").await.unwrap();
        assert_eq!(by_phone.map(|l| l.id), Some(lead.id));
        let miss = store.find_lead_by_address("nobody@example.com").await.unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn stale_version_update_conflicts() {
        let store = memory_store().await;
        let mut lead = sample_lead();
        store.insert_lead(&lead).await.unwrap();

        lead.stage = Stage::Contacted;
        store.update_lead(&lead, 0).await.unwrap();

        // Second writer with the same snapshot loses
        lead.stage = Stage::Engaged;
        let err = store.update_lead(&lead, 0).await.unwrap_err();
        match err {
            StoreError::VersionConflict { expected, found, .. } => {
                assert_eq!(expected, 0);
                assert_eq!(found, 1);
            }
            other => panic!("expected VersionConflict, got {other}"),
        }
    }

    #[tokio::test]
    async fn commit_writes_lead_log_and_schedule_atomically() {
        let store = memory_store().await;
        let mut lead = sample_lead();
        store.insert_lead(&lead).await.unwrap();

        lead.stage = Stage::Contacted;
        lead.deal_value = dec!(35000);
        let interaction =
            Interaction::outbound(lead.id, 1, Channel::Email, "Intro pitch", Outcome::Delivered);
        let followup = ScheduledAction::new(
            lead.id,
            ActionKind::FollowUp,
            Utc::now() + chrono::Duration::days(2),
            serde_json::json!({"attempt": 1}),
        );

        store
            .commit(LeadCommit {
                lead: Some(&lead),
                expected_version: 0,
                interactions: std::slice::from_ref(&interaction),
                schedule: std::slice::from_ref(&followup),
                cancel_actions: &[],
                handoff: None,
            })
            .await
            .unwrap();

        let loaded = store.get_lead(lead.id).await.unwrap().unwrap();
        assert_eq!(loaded.stage, Stage::Contacted);
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.deal_value, dec!(35000));
        assert_eq!(store.interactions(lead.id).await.unwrap().len(), 1);
        assert_eq!(store.next_seq(lead.id).await.unwrap(), 2);
        assert_eq!(store.pending_action_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn conflicted_commit_leaves_no_partial_writes() {
        let store = memory_store().await;
        let mut lead = sample_lead();
        store.insert_lead(&lead).await.unwrap();

        lead.stage = Stage::Contacted;
        store.update_lead(&lead, 0).await.unwrap(); // bumps to v1

        let interaction =
            Interaction::outbound(lead.id, 1, Channel::Email, "Intro pitch", Outcome::Delivered);
        let err = store
            .commit(LeadCommit {
                lead: Some(&lead),
                expected_version: 0, // stale
                interactions: std::slice::from_ref(&interaction),
                schedule: &[],
                cancel_actions: &[],
                handoff: None,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::VersionConflict { .. }));
        assert!(store.interactions(lead.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn commit_carries_the_handoff_in_the_same_transaction() {
        let store = memory_store().await;
        let mut lead = sample_lead();
        store.insert_lead(&lead).await.unwrap();

        lead.stage = Stage::Escalated;
        let handoff = HandoffEvent::new(lead.id, "contract_terms", "transcript");
        store
            .commit(LeadCommit {
                lead: Some(&lead),
                expected_version: 0,
                handoff: Some(&handoff),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(store.handoff_exists(lead.id).await.unwrap());
        assert_eq!(store.get_lead(lead.id).await.unwrap().unwrap().stage, Stage::Escalated);

        // A conflicted commit rolls the handoff back with the stage change
        let mut other = Lead::new("Ravi Kumar", 60).with_email("ravi@example.in");
        store.insert_lead(&other).await.unwrap();
        other.stage = Stage::Contacted;
        store.update_lead(&other, 0).await.unwrap(); // bumps to v1

        other.stage = Stage::Escalated;
        let orphan = HandoffEvent::new(other.id, "deal value", "transcript");
        let err = store
            .commit(LeadCommit {
                lead: Some(&other),
                expected_version: 0, // stale
                handoff: Some(&orphan),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
        assert!(!store.handoff_exists(other.id).await.unwrap());
    }

    #[tokio::test]
    async fn delete_action_claims_exactly_once() {
        let store = memory_store().await;
        let lead = sample_lead();
        store.insert_lead(&lead).await.unwrap();

        let action = ScheduledAction::new(
            lead.id,
            ActionKind::FollowUp,
            Utc::now(),
            serde_json::json!({}),
        );
        store.insert_action(&action).await.unwrap();

        assert!(store.delete_action(action.id).await.unwrap());
        assert!(!store.delete_action(action.id).await.unwrap());
    }

    #[tokio::test]
    async fn due_actions_fifo_for_equal_due_times() {
        let store = memory_store().await;
        let lead = sample_lead();
        store.insert_lead(&lead).await.unwrap();

        let due = Utc::now() - chrono::Duration::seconds(1);
        let first = ScheduledAction::new(
            lead.id,
            ActionKind::FollowUp,
            due,
            serde_json::json!({"n": 1}),
        );
        let second = ScheduledAction::new(
            lead.id,
            ActionKind::FollowUp,
            due,
            serde_json::json!({"n": 2}),
        );
        store.insert_action(&first).await.unwrap();
        store.insert_action(&second).await.unwrap();

        let due_now = store.due_actions(Utc::now()).await.unwrap();
        assert_eq!(due_now.len(), 2);
        assert_eq!(due_now[0].id, first.id);
        assert_eq!(due_now[1].id, second.id);

        // Not-yet-due actions stay out of the batch
        let future = ScheduledAction::new(
            lead.id,
            ActionKind::FollowUp,
            Utc::now() + chrono::Duration::days(2),
            serde_json::json!({}),
        );
        store.insert_action(&future).await.unwrap();
        assert_eq!(store.due_actions(Utc::now()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cancel_actions_filters_by_kind() {
        let store = memory_store().await;
        let lead = sample_lead();
        store.insert_lead(&lead).await.unwrap();

        let followup = ScheduledAction::new(
            lead.id,
            ActionKind::FollowUp,
            Utc::now() + chrono::Duration::days(2),
            serde_json::json!({}),
        );
        let retry = ScheduledAction::new(
            lead.id,
            ActionKind::RetryEvent,
            Utc::now() + chrono::Duration::minutes(5),
            serde_json::json!({}),
        );
        store.insert_action(&followup).await.unwrap();
        store.insert_action(&retry).await.unwrap();

        let cancelled = store
            .cancel_actions_for(lead.id, Some(ActionKind::FollowUp))
            .await
            .unwrap();
        assert_eq!(cancelled, 1);
        assert_eq!(store.pending_action_count().await.unwrap(), 1);

        let cancelled = store.cancel_actions_for(lead.id, None).await.unwrap();
        assert_eq!(cancelled, 1);
        assert_eq!(store.pending_action_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn handoff_recorded_once() {
        let store = memory_store().await;
        let lead = sample_lead();
        store.insert_lead(&lead).await.unwrap();

        assert!(!store.handoff_exists(lead.id).await.unwrap());
        let handoff = HandoffEvent::new(lead.id, "contract_terms", "transcript");
        store.insert_handoff(&handoff).await.unwrap();
        assert!(store.handoff_exists(lead.id).await.unwrap());
    }

    #[tokio::test]
    async fn stage_counts_group_leads() {
        let store = memory_store().await;
        let a = sample_lead();
        let b = Lead::new("Ravi Kumar", 60).with_email("ravi@example.in");
        store.insert_lead(&a).await.unwrap();
        store.insert_lead(&b).await.unwrap();

        let counts = store.stage_counts().await.unwrap();
        assert_eq!(counts, vec![(Stage::Sourced, 2)]);
    }
}
