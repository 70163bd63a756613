//! Durable approval queue for outbound actions.

pub mod approval;
pub mod model;

pub use approval::ApprovalQueue;
pub use model::{Action, ActionStatus, Decision, MessageType, QueueEvent};
