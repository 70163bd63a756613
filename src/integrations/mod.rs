//! External collaborators (automation backend, CRM, message generator,
//! calendar) and their HTTP adapters.
//!
//! The governance core only sees the traits below. Adapters carry no
//! scheduling or rate logic.

pub mod calendar;
pub mod monday;
pub mod openai;
pub mod phantombuster;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ExternalError;
use crate::leads::{Lead, LeadProfile, LeadState, MessageRecord};
use crate::queue::model::MessageType;

pub use calendar::BookingLedger;
pub use monday::{MondayConfig, MondayCrm};
pub use openai::{OpenAiConfig, OpenAiGenerator};
pub use phantombuster::{PhantomBusterBackend, PhantomBusterConfig};

/// A reply a lead sent us, as reported by the automation backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundReply {
    /// Backend-assigned id; used to drop duplicates.
    pub reply_id: String,
    pub profile_url: String,
    pub content: String,
    pub received_at: DateTime<Utc>,
}

/// A confirmed meeting with a lead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub lead_id: Uuid,
    pub scheduled_for: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Everything the generator gets to write one message.
#[derive(Debug, Clone)]
pub struct DraftRequest {
    pub profile: LeadProfile,
    /// Oldest first.
    pub history: Vec<MessageRecord>,
    pub message_type: MessageType,
}

/// Stream of inbound replies.
pub type ReplyStream = Pin<Box<dyn Stream<Item = Result<InboundReply, ExternalError>> + Send>>;

/// LinkedIn automation backend.
///
/// `dedupe_key` is recorded by the backend with each dispatch so that
/// [`AutomationBackend::lookup_dispatch`] can tell whether a send whose
/// outcome is unknown actually happened.
#[async_trait]
pub trait AutomationBackend: Send + Sync {
    /// Send a direct message. Returns the backend's dispatch id.
    async fn send_message(
        &self,
        profile_url: &str,
        content: &str,
        dedupe_key: &str,
    ) -> Result<String, ExternalError>;

    /// Send a connection request with an optional note.
    async fn send_connection(
        &self,
        profile_url: &str,
        note: &str,
        dedupe_key: &str,
    ) -> Result<String, ExternalError>;

    /// Visit a profile.
    async fn view_profile(&self, profile_url: &str) -> Result<String, ExternalError>;

    /// Scrape the public details of a profile.
    async fn scrape_profile(&self, profile_url: &str) -> Result<LeadProfile, ExternalError>;

    /// Dispatch id recorded under `dedupe_key`, if the backend has one.
    async fn lookup_dispatch(&self, dedupe_key: &str) -> Result<Option<String>, ExternalError>;

    /// Replies received after `since`.
    async fn fetch_replies(&self, since: DateTime<Utc>) -> Result<ReplyStream, ExternalError>;
}

/// A board item read back from the CRM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrmItem {
    pub item_id: String,
    pub profile_url: String,
}

/// CRM board the operator tracks leads on.
#[async_trait]
pub trait Crm: Send + Sync {
    /// Create or update the lead's item. Returns the CRM item id.
    async fn upsert_lead(&self, lead: &Lead) -> Result<String, ExternalError>;

    async fn update_status(&self, item_id: &str, state: LeadState) -> Result<(), ExternalError>;

    /// Add one message to the item's conversation log.
    async fn append_conversation_log(
        &self,
        item_id: &str,
        message: &MessageRecord,
    ) -> Result<(), ExternalError>;

    async fn update_last_message_date(
        &self,
        item_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), ExternalError>;

    /// Items whose status column currently shows `state`.
    async fn items_in_status(&self, state: LeadState) -> Result<Vec<CrmItem>, ExternalError>;
}

/// Drafts outreach messages.
#[async_trait]
pub trait MessageGenerator: Send + Sync {
    async fn draft(&self, request: &DraftRequest) -> Result<String, ExternalError>;
}

/// Meeting booking lookups.
#[async_trait]
pub trait CalendarService: Send + Sync {
    async fn confirm_booking(&self, lead_id: Uuid) -> Result<Option<Booking>, ExternalError>;
}

/// Run a collaborator call under a deadline.
pub async fn with_timeout<T, F>(service: &str, timeout: Duration, fut: F) -> Result<T, ExternalError>
where
    F: Future<Output = Result<T, ExternalError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ExternalError::Timeout {
            service: service.to_string(),
            timeout,
        }),
    }
}
