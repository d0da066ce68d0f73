//! Orchestrator — event processing, stage transitions, escalation.

pub mod engine;
pub mod escalation;
pub mod events;
pub mod locks;

pub use engine::{Orchestrator, spawn_event_loop};
pub use escalation::EscalationRules;
pub use events::PipelineEvent;
pub use locks::LeadLocks;
