//! Leadflow — outbound sales pipeline orchestrator.
//!
//! Leads flow from sourcing through outreach, conversation, quoting, and
//! closing to onboarding, driven by pipeline events and a pluggable decision
//! engine. Every state change is a version-checked commit against the lead
//! store; everything deferred (follow-ups, parked events) lives in a durable
//! scheduler queue.

pub mod config;
pub mod decision;
pub mod error;
pub mod gateway;
pub mod lead;
pub mod notifier;
pub mod orchestrator;
pub mod quotes;
pub mod scheduler;
pub mod server;
pub mod store;
