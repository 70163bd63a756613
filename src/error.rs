//! Error types for the outreach agent.
//!
//! Guard denials are deliberately absent: they are ordinary return values
//! (see [`crate::guard::Authorization`]), not failures.

use std::time::Duration;

use uuid::Uuid;

use crate::leads::LeadState;
use crate::queue::model::ActionStatus;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Approval queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("External service error: {0}")]
    External(#[from] ExternalError),

    #[error("Drafting error: {0}")]
    Draft(#[from] DraftError),

    #[error("Lead error: {0}")]
    Lead(#[from] LeadError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Approval queue contract violations. These are caller bugs and are
/// surfaced immediately rather than retried.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("An open {kind} action already targets lead {lead_id}")]
    DuplicateAction { lead_id: Uuid, kind: String },

    #[error("The same content was already sent to lead {lead_id}")]
    DuplicateContent { lead_id: Uuid },

    #[error("Action {id} not found")]
    NotFound { id: Uuid },

    #[error("Action {id} was already decided (status {status})")]
    AlreadyDecided { id: Uuid, status: ActionStatus },

    #[error("Action {id} is {status}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        status: ActionStatus,
        target: ActionStatus,
    },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Lead state errors.
#[derive(Debug, thiserror::Error)]
pub enum LeadError {
    #[error("Lead {id} not found")]
    NotFound { id: Uuid },

    #[error("Lead {id} is {from}, cannot move to {to}")]
    InvalidTransition {
        id: Uuid,
        from: LeadState,
        to: LeadState,
    },
}

/// Collaborator failures: automation backend, CRM, generator, calendar.
#[derive(Debug, thiserror::Error)]
pub enum ExternalError {
    #[error("{service} call timed out after {timeout:?}")]
    Timeout { service: String, timeout: Duration },

    #[error("{service} rejected the request: {reason}")]
    Rejected { service: String, reason: String },

    #[error("{service} HTTP error: {reason}")]
    Http { service: String, reason: String },

    #[error("Invalid response from {service}: {reason}")]
    InvalidResponse { service: String, reason: String },
}

impl ExternalError {
    /// Whether the outcome of the call is unknown (the side effect may or
    /// may not have happened on the remote end).
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Http { .. })
    }

    pub(crate) fn http(service: &str, err: impl std::fmt::Display) -> Self {
        Self::Http {
            service: service.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Message drafting errors.
#[derive(Debug, thiserror::Error)]
pub enum DraftError {
    #[error("Generator failed after {attempts} attempts: {source}")]
    Generator {
        attempts: u32,
        #[source]
        source: ExternalError,
    },

    #[error("Generator returned no usable draft")]
    Empty,

    #[error("Generator only repeated messages already sent to this lead")]
    AlreadySent,
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
