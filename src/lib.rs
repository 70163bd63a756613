//! Outreach agent: safety-governed LinkedIn outreach with human approval.

pub mod api;
pub mod config;
pub mod drafting;
pub mod error;
pub mod guard;
pub mod integrations;
pub mod leads;
pub mod queue;
pub mod reconciler;
pub mod scheduler;
pub mod store;
