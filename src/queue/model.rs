//! Action data model: statuses, decisions, and queue broadcast events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::guard::ActionKind;

/// Lifecycle status of an outbound action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Waiting for a human decision.
    Pending,
    /// Approved; will be dispatched once the guard allows it.
    Approved,
    /// Operator rejected the action.
    Rejected,
    /// Delivered to the automation backend.
    Dispatched,
    /// Dispatch retries exhausted.
    Failed,
}

impl ActionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Dispatched => "dispatched",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Dispatched | Self::Failed)
    }

    /// Pending or approved: the action still holds the lead's slot.
    pub fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::Approved)
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "dispatched" => Ok(Self::Dispatched),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown action status: {}", s)),
        }
    }
}

/// What a drafted message is for. Drives generator prompts and draft rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    FirstOutreach,
    FollowUp,
    Reply,
    MeetingRequest,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FirstOutreach => "first_outreach",
            Self::FollowUp => "follow_up",
            Self::Reply => "reply",
            Self::MeetingRequest => "meeting_request",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first_outreach" => Ok(Self::FirstOutreach),
            "follow_up" => Ok(Self::FollowUp),
            "reply" => Ok(Self::Reply),
            "meeting_request" => Ok(Self::MeetingRequest),
            _ => Err(format!("Unknown message type: {}", s)),
        }
    }
}

/// Human decision on a pending action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn target_status(self) -> ActionStatus {
        match self {
            Self::Approve => ActionStatus::Approved,
            Self::Reject => ActionStatus::Rejected,
        }
    }

    /// Whether an action already in `status` reflects this decision, making a
    /// repeated call a no-op.
    pub(crate) fn already_applied(self, status: ActionStatus) -> bool {
        match self {
            Self::Approve => matches!(
                status,
                ActionStatus::Approved | ActionStatus::Dispatched | ActionStatus::Failed
            ),
            Self::Reject => status == ActionStatus::Rejected,
        }
    }
}

/// An outbound operation awaiting approval or already carried out.
///
/// `payload` is drafted once at enqueue time and never changes afterwards.
/// The action id doubles as the dedupe key handed to the automation backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: Uuid,
    pub kind: ActionKind,
    pub lead_id: Uuid,
    pub payload: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_type: Option<MessageType>,
    pub status: ActionStatus,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub dispatched_at: Option<DateTime<Utc>>,
    /// Set while a dispatcher holds the action.
    pub claimed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatch_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl Action {
    /// Create a new pending action.
    pub fn new(kind: ActionKind, lead_id: Uuid, payload: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            lead_id,
            payload: payload.into(),
            message_type: None,
            status: ActionStatus::Pending,
            created_at: Utc::now(),
            decided_at: None,
            dispatched_at: None,
            claimed_at: None,
            attempts: 0,
            last_error: None,
            dispatch_id: None,
            failure_reason: None,
        }
    }

    pub fn with_message_type(mut self, message_type: MessageType) -> Self {
        self.message_type = Some(message_type);
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn dedupe_key(&self) -> String {
        self.id.to_string()
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed_at.is_some()
    }
}

/// Events broadcast to approval UI clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    /// A new action awaits a decision (or was auto-approved).
    Enqueued { action: Action },
    /// An action was approved or rejected.
    Decided { id: Uuid, status: ActionStatus },
    /// An action reached the automation backend.
    Dispatched { id: Uuid, dispatch_id: String },
    /// Dispatch was abandoned; needs human attention.
    Failed { id: Uuid, reason: String },
    /// Open actions, sent on connect.
    Sync { actions: Vec<Action> },
    /// Keepalive ping.
    Ping,
}
