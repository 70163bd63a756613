//! Lead data model: profiles, conversation states, and message history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a lead stands in the outreach conversation.
///
/// States only ever move forward. `NotInterested` and `Won` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadState {
    /// Ingested, never contacted.
    New,
    /// At least one outbound action was dispatched.
    Contacted,
    /// The lead replied at least once.
    InConversation,
    /// A meeting was confirmed through the calendar.
    MeetingScheduled,
    /// Operator marked the lead as not interested.
    NotInterested,
    /// Operator marked the lead as won.
    Won,
}

impl LeadState {
    fn rank(self) -> u8 {
        match self {
            Self::New => 0,
            Self::Contacted => 1,
            Self::InConversation => 2,
            Self::MeetingScheduled => 3,
            Self::NotInterested | Self::Won => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::NotInterested | Self::Won)
    }

    /// Whether moving from `self` to `next` is a forward transition.
    pub fn can_advance_to(self, next: LeadState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Contacted => "contacted",
            Self::InConversation => "in_conversation",
            Self::MeetingScheduled => "meeting_scheduled",
            Self::NotInterested => "not_interested",
            Self::Won => "won",
        }
    }

    /// Status label as shown on the CRM board.
    pub fn crm_label(self) -> &'static str {
        match self {
            Self::New => "New",
            Self::Contacted => "Contacted",
            Self::InConversation => "In Conversation",
            Self::MeetingScheduled => "Meeting Scheduled",
            Self::NotInterested => "Not Interested",
            Self::Won => "Won",
        }
    }
}

impl std::fmt::Display for LeadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LeadState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "contacted" => Ok(Self::Contacted),
            "in_conversation" => Ok(Self::InConversation),
            "meeting_scheduled" => Ok(Self::MeetingScheduled),
            "not_interested" => Ok(Self::NotInterested),
            "won" => Ok(Self::Won),
            _ => Err(format!("Unknown lead state: {}", s)),
        }
    }
}

/// Scraped LinkedIn profile data. `profile_url` is the lead's identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadProfile {
    pub profile_url: String,
    pub name: String,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub headline: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

impl LeadProfile {
    pub fn new(profile_url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            profile_url: profile_url.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_company(mut self, company: impl Into<String>) -> Self {
        self.company = Some(company.into());
        self
    }

    pub fn with_position(mut self, position: impl Into<String>) -> Self {
        self.position = Some(position.into());
        self
    }

    pub fn with_headline(mut self, headline: impl Into<String>) -> Self {
        self.headline = Some(headline.into());
        self
    }

    /// First word of the display name, used in greetings.
    pub fn first_name(&self) -> &str {
        self.name.split_whitespace().next().unwrap_or("")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outbound,
    Inbound,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Outbound => "outbound",
            Self::Inbound => "inbound",
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "outbound" => Ok(Self::Outbound),
            "inbound" => Ok(Self::Inbound),
            _ => Err(format!("Unknown direction: {}", s)),
        }
    }
}

/// One message exchanged with a lead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub direction: Direction,
    pub content: String,
    /// Reply id for inbound messages, dispatch id for outbound ones.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub at: DateTime<Utc>,
}

/// A prospective contact tracked through an outreach conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub profile: LeadProfile,
    pub state: LeadState,
    pub last_action_at: Option<DateTime<Utc>>,
    /// When an `InConversation` lead is next owed a message.
    pub follow_up_due_at: Option<DateTime<Utc>>,
    pub crm_item_id: Option<String>,
    /// State last pushed to the CRM.
    pub crm_synced_state: Option<LeadState>,
    pub created_at: DateTime<Utc>,
    /// Insertion order, used as a stable tie-breaker.
    pub seq: i64,
    /// Oldest first.
    #[serde(default)]
    pub history: Vec<MessageRecord>,
}

impl Lead {
    /// Direction of the most recent message, if any.
    pub fn last_direction(&self) -> Option<Direction> {
        self.history.iter().max_by_key(|m| m.at).map(|m| m.direction)
    }

    pub fn needs_crm_sync(&self) -> bool {
        self.crm_synced_state != Some(self.state)
    }
}
