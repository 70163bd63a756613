//! Leads and their conversation history.

pub mod model;

pub use model::{Direction, Lead, LeadProfile, LeadState, MessageRecord};
