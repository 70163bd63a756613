//! Guard data model: action kinds, log entries, authorization outcomes.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of outbound operation performed against the automation backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Direct message to a lead.
    Message,
    /// Connection request, optionally with a note.
    ConnectionRequest,
    /// Profile visit.
    ProfileView,
}

impl ActionKind {
    /// The kind whose daily cap this action draws from. Connection requests
    /// carry a message and share the message budget.
    pub fn cap_class(self) -> ActionKind {
        match self {
            Self::Message | Self::ConnectionRequest => Self::Message,
            Self::ProfileView => Self::ProfileView,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::ConnectionRequest => "connection_request",
            Self::ProfileView => "profile_view",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(Self::Message),
            "connection_request" => Ok(Self::ConnectionRequest),
            "profile_view" => Ok(Self::ProfileView),
            _ => Err(format!("Unknown action kind: {}", s)),
        }
    }
}

/// Immutable record of a successful dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionLogEntry {
    pub kind: ActionKind,
    pub timestamp: DateTime<Utc>,
}

impl ActionLogEntry {
    pub fn new(kind: ActionKind, timestamp: DateTime<Utc>) -> Self {
        Self { kind, timestamp }
    }
}

/// Why the guard refused an action. Denials are expected control flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Denial {
    /// Outside working hours or on a rest day.
    OutsideWindow,
    /// The daily cap for this kind's class is used up.
    DailyCapExceeded { kind: ActionKind, limit: u32 },
    /// Not enough time since the last dispatch.
    TooSoon { retry_after: Duration },
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutsideWindow => write!(f, "outside working window"),
            Self::DailyCapExceeded { kind, limit } => {
                write!(f, "daily {kind} cap of {limit} reached")
            }
            Self::TooSoon { retry_after } => {
                write!(f, "too soon, retry in {}s", retry_after.as_secs())
            }
        }
    }
}

/// Outcome of a guard check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    Allowed,
    Denied(Denial),
}

impl Authorization {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn denial(&self) -> Option<&Denial> {
        match self {
            Self::Allowed => None,
            Self::Denied(d) => Some(d),
        }
    }
}
