//! Error types for the pipeline.

use uuid::Uuid;

use crate::gateway::Channel;
use crate::lead::Stage;

/// Top-level error type for the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Decision error: {0}")]
    Decision(#[from] DecisionError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("Notifier error: {0}")]
    Notifier(#[from] NotifierError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Lead store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open store: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Lead {id} already exists")]
    Duplicate { id: Uuid },

    #[error("Version conflict on lead {id}: expected {expected}, found {found}")]
    VersionConflict { id: Uuid, expected: u64, found: u64 },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Decision Engine failures. The orchestrator treats every failure mode
/// (timeout, transport, malformed response) the same way: retry, then defer.
#[derive(Debug, thiserror::Error)]
pub enum DecisionError {
    #[error("Decision engine unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Channel gateway errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Gateway call on {channel} timed out")]
    Timeout { channel: Channel },

    #[error("Gateway call on {channel} failed: {reason}")]
    Network { channel: Channel, reason: String },

    #[error("No gateway configured for channel {channel}")]
    NotConfigured { channel: Channel },
}

impl GatewayError {
    /// Whether a retry with backoff can help.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Network { .. })
    }
}

/// Scheduler errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid action payload: {0}")]
    Payload(String),
}

/// Orchestrator errors.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Lead {id} not found")]
    LeadNotFound { id: Uuid },

    #[error("Lead {id} in stage {stage} cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        stage: Stage,
        target: Stage,
    },

    #[error("Lead {id} was concurrently modified")]
    Conflict { id: Uuid },

    #[error("Lead {id} has no address for any configured channel")]
    NoReachableChannel { id: Uuid },
}

/// Escalation notifier errors.
#[derive(Debug, thiserror::Error)]
pub enum NotifierError {
    #[error("Notification delivery failed: {0}")]
    Delivery(String),
}

/// Result type alias for the pipeline.
pub type Result<T> = std::result::Result<T, Error>;
