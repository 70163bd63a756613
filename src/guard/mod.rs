//! Rate/window guard and the action log types it evaluates.

pub mod model;
pub mod rules;

pub use model::{ActionKind, ActionLogEntry, Authorization, Denial};
pub use rules::{Guard, GuardConfig};
