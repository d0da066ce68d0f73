//! Persistence layer — libSQL-backed storage for leads, interactions,
//! scheduled actions, and handoffs.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use traits::{LeadCommit, LeadStore};
