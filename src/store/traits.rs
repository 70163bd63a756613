//! Unified `Database` trait: single async interface for all persistence.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::guard::{ActionKind, ActionLogEntry};
use crate::integrations::Booking;
use crate::leads::{Lead, LeadProfile, LeadState, MessageRecord};
use crate::queue::model::{Action, ActionStatus};

/// Bookkeeping applied together with a successful dispatch.
#[derive(Debug, Clone)]
pub struct DispatchRecord {
    pub action_id: Uuid,
    pub dispatch_id: String,
    pub dispatched_at: DateTime<Utc>,
    /// Gap before an `InConversation` lead is due its next follow-up.
    pub follow_up_after: chrono::Duration,
}

/// Backend-agnostic database trait covering leads, actions, the action log,
/// scheduler leases and bookings.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Leads ───────────────────────────────────────────────────────

    /// Create a lead for `profile`, or refresh the profile fields of the
    /// existing one. State is never touched.
    async fn upsert_lead(&self, profile: &LeadProfile, now: DateTime<Utc>)
    -> Result<Lead, DatabaseError>;

    /// Get a lead (with history) by ID.
    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, DatabaseError>;

    /// Get a lead (with history) by its profile URL.
    async fn get_lead_by_profile(&self, profile_url: &str) -> Result<Option<Lead>, DatabaseError>;

    /// All leads in insertion order.
    async fn list_leads(&self) -> Result<Vec<Lead>, DatabaseError>;

    /// Leads currently in `state`, in insertion order.
    async fn leads_in_state(&self, state: LeadState) -> Result<Vec<Lead>, DatabaseError>;

    /// Leads the scheduler may draft for: `New`, or `InConversation` with a
    /// follow-up due at or before `now`, without an open action. Ordered by
    /// oldest last action (never contacted first), then insertion order.
    async fn eligible_leads(&self, now: DateTime<Utc>) -> Result<Vec<Lead>, DatabaseError>;

    /// Compare-and-set the lead state. Returns false if the lead was no
    /// longer in `expected`.
    async fn transition_lead(
        &self,
        id: Uuid,
        expected: LeadState,
        next: LeadState,
    ) -> Result<bool, DatabaseError>;

    async fn set_follow_up_due(
        &self,
        id: Uuid,
        due: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError>;

    /// Record an inbound message. Returns false if `external_id` was already
    /// recorded.
    async fn record_inbound(
        &self,
        lead_id: Uuid,
        external_id: &str,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Message history for a lead, oldest first.
    async fn lead_messages(&self, lead_id: Uuid) -> Result<Vec<MessageRecord>, DatabaseError>;

    /// Leads whose state differs from what the CRM last saw.
    async fn leads_needing_crm_sync(&self) -> Result<Vec<Lead>, DatabaseError>;

    async fn mark_crm_synced(
        &self,
        id: Uuid,
        crm_item_id: &str,
        state: LeadState,
    ) -> Result<(), DatabaseError>;

    /// Messages of leads that have a CRM item but are not on its
    /// conversation log yet, oldest first.
    async fn messages_needing_crm_log(&self) -> Result<Vec<MessageRecord>, DatabaseError>;

    async fn mark_message_crm_logged(&self, message_id: Uuid) -> Result<(), DatabaseError>;

    // ── Actions ─────────────────────────────────────────────────────

    /// Insert a new action. Fails with `Constraint` if an open action of the
    /// same kind already targets the lead.
    async fn insert_action(&self, action: &Action) -> Result<(), DatabaseError>;

    async fn get_action(&self, id: Uuid) -> Result<Option<Action>, DatabaseError>;

    /// Actions, optionally filtered by status, oldest first.
    async fn list_actions(
        &self,
        status: Option<ActionStatus>,
    ) -> Result<Vec<Action>, DatabaseError>;

    async fn has_open_action(&self, lead_id: Uuid, kind: ActionKind) -> Result<bool, DatabaseError>;

    /// Whether `payload` was already dispatched to the lead.
    async fn has_dispatched_content(
        &self,
        lead_id: Uuid,
        payload: &str,
    ) -> Result<bool, DatabaseError>;

    /// Open (pending or approved) actions of the given kinds.
    async fn count_open_actions(&self, kinds: &[ActionKind]) -> Result<u32, DatabaseError>;

    /// Compare-and-set `Pending → status`. Returns false if the action was
    /// not pending.
    async fn decide_action(
        &self,
        id: Uuid,
        status: ActionStatus,
        decided_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Atomically claim the oldest approved, unclaimed action.
    async fn claim_next_approved(&self, now: DateTime<Utc>)
    -> Result<Option<Action>, DatabaseError>;

    /// Drop the claim on an approved action. Returns false if it was not
    /// claimed or no longer approved.
    async fn release_claim(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Approved actions still carrying a claim.
    async fn claimed_actions(&self) -> Result<Vec<Action>, DatabaseError>;

    /// Record a failed dispatch attempt.
    async fn record_attempt(&self, id: Uuid, error: &str) -> Result<(), DatabaseError>;

    /// In one transaction: set the action Dispatched, append the action log
    /// entry and the outbound message, and update the lead. Returns false
    /// (and writes nothing) if the action was not approved.
    async fn complete_dispatch(&self, record: &DispatchRecord) -> Result<bool, DatabaseError>;

    /// Compare-and-set `Approved → Failed`.
    async fn fail_action(&self, id: Uuid, reason: &str) -> Result<bool, DatabaseError>;

    // ── Action log ──────────────────────────────────────────────────

    /// Log entries at or after `since`, oldest first.
    async fn action_log_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ActionLogEntry>, DatabaseError>;

    /// Delete log entries older than `before`. Returns the number deleted.
    async fn prune_action_log(&self, before: DateTime<Utc>) -> Result<usize, DatabaseError>;

    // ── Leases ──────────────────────────────────────────────────────

    /// Take the named lease if it is free or expired.
    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, DatabaseError>;

    async fn release_lease(&self, name: &str, holder: &str) -> Result<(), DatabaseError>;

    // ── Bookings ────────────────────────────────────────────────────

    async fn record_booking(&self, booking: &Booking) -> Result<(), DatabaseError>;

    /// Most recent booking for a lead.
    async fn booking_for(&self, lead_id: Uuid) -> Result<Option<Booking>, DatabaseError>;
}
