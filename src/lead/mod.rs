//! Lead domain types: the pipeline stage machine and the persisted records
//! that hang off a lead (interactions, scheduled actions, handoffs).

pub mod model;
pub mod stage;

pub use model::{
    ActionKind, Direction, HandoffEvent, Interaction, Lead, Outcome, ScheduledAction,
    render_transcript,
};
pub use stage::Stage;
