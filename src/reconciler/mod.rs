//! Reply/state reconciler: folds inbound replies, calendar bookings and
//! human outcomes into lead state, and mirrors lead state and messages to
//! the CRM. Outcomes an operator sets on the CRM board are read back.
//!
//! Runs independently of the scheduler. Every state change is a
//! compare-and-set on the lead, so a replayed event never moves a lead twice.

pub mod state;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, LeadError};
use crate::integrations::{AutomationBackend, CalendarService, Crm, InboundReply, with_timeout};
use crate::leads::{Lead, LeadProfile, LeadState};
use crate::store::Database;

/// What one reconciler run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub replies_recorded: usize,
    pub duplicate_replies: usize,
    /// Replies from profiles we have no lead for.
    pub unknown_senders: usize,
    /// Leads moved to `InConversation` by their first reply.
    pub conversations_started: usize,
    pub meetings_booked: usize,
    pub crm_synced: usize,
    /// Messages added to CRM conversation logs.
    pub crm_messages_logged: usize,
    /// Outcomes read back from the CRM board and applied.
    pub crm_outcomes_applied: usize,
    pub crm_failures: usize,
    /// Set when a collaborator failed; the rest of the run still happened.
    pub errors: Vec<String>,
}

/// Reply/state reconciler.
pub struct Reconciler {
    db: Arc<dyn Database>,
    backend: Arc<dyn AutomationBackend>,
    calendar: Arc<dyn CalendarService>,
    crm: Option<Arc<dyn Crm>>,
    timeout: Duration,
}

impl Reconciler {
    pub fn new(
        db: Arc<dyn Database>,
        backend: Arc<dyn AutomationBackend>,
        calendar: Arc<dyn CalendarService>,
        timeout: Duration,
    ) -> Self {
        Self {
            db,
            backend,
            calendar,
            crm: None,
            timeout,
        }
    }

    /// Mirror lead state to `crm` on every run.
    pub fn with_crm(mut self, crm: Arc<dyn Crm>) -> Self {
        self.crm = Some(crm);
        self
    }

    /// Create a lead for a scraped profile, or return the existing one.
    pub async fn ingest_lead(&self, profile: &LeadProfile) -> Result<Lead, Error> {
        let lead = self.db.upsert_lead(profile, Utc::now()).await?;
        debug!(lead_id = %lead.id, profile_url = %profile.profile_url, "Lead ingested");
        Ok(lead)
    }

    /// Scrape a profile through the automation backend and ingest it.
    pub async fn ingest_profile_url(&self, profile_url: &str) -> Result<Lead, Error> {
        let profile = with_timeout(
            "automation backend",
            self.timeout,
            self.backend.scrape_profile(profile_url),
        )
        .await?;
        self.ingest_lead(&profile).await
    }

    /// Pull replies received after `since` and apply them.
    pub async fn ingest_replies(
        &self,
        since: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> Result<(), Error> {
        let mut replies = match with_timeout(
            "automation backend",
            self.timeout,
            self.backend.fetch_replies(since),
        )
        .await
        {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Could not fetch replies");
                report.errors.push(e.to_string());
                return Ok(());
            }
        };

        loop {
            let next = match tokio::time::timeout(self.timeout, replies.next()).await {
                Ok(next) => next,
                Err(_) => {
                    warn!("Reply stream stalled; stopping for this run");
                    report.errors.push("reply stream timed out".into());
                    break;
                }
            };
            match next {
                None => break,
                Some(Ok(reply)) => self.apply_reply(&reply, report).await?,
                Some(Err(e)) => {
                    warn!(error = %e, "Reply stream failed");
                    report.errors.push(e.to_string());
                    break;
                }
            }
        }
        Ok(())
    }

    /// Record one reply. Replies already seen (same reply id) change nothing.
    pub async fn apply_reply(
        &self,
        reply: &InboundReply,
        report: &mut ReconcileReport,
    ) -> Result<(), Error> {
        let Some(lead) = self.db.get_lead_by_profile(&reply.profile_url).await? else {
            debug!(profile_url = %reply.profile_url, "Reply from unknown profile");
            report.unknown_senders += 1;
            return Ok(());
        };

        if !self
            .db
            .record_inbound(lead.id, &reply.reply_id, &reply.content, reply.received_at)
            .await?
        {
            report.duplicate_replies += 1;
            return Ok(());
        }
        report.replies_recorded += 1;

        let mut current = lead.state;
        if let Some(next) = state::on_reply(current) {
            if self.db.transition_lead(lead.id, current, next).await? {
                info!(lead_id = %lead.id, from = %current, "Lead replied, conversation started");
                report.conversations_started += 1;
                current = next;
            } else if let Some(fresh) = self.db.get_lead(lead.id).await? {
                current = fresh.state;
            }
        }

        if state::reply_owed(current) {
            self.db.set_follow_up_due(lead.id, Some(reply.received_at)).await?;
        }
        Ok(())
    }

    /// Ask the calendar about every lead in conversation.
    pub async fn check_bookings(&self, report: &mut ReconcileReport) -> Result<(), Error> {
        for lead in self.db.leads_in_state(LeadState::InConversation).await? {
            match self.confirm_booking(lead.id).await {
                Ok(true) => report.meetings_booked += 1,
                Ok(false) => {}
                Err(Error::External(e)) => {
                    warn!(lead_id = %lead.id, error = %e, "Booking check failed");
                    report.errors.push(e.to_string());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Move one lead to `MeetingScheduled` if the calendar has a booking for
    /// it. Returns whether the lead moved.
    pub async fn confirm_booking(&self, lead_id: Uuid) -> Result<bool, Error> {
        let Some(lead) = self.db.get_lead(lead_id).await? else {
            return Err(LeadError::NotFound { id: lead_id }.into());
        };
        let Some(next) = state::on_booking(lead.state) else {
            return Ok(false);
        };

        let booking = with_timeout(
            "calendar",
            self.timeout,
            self.calendar.confirm_booking(lead_id),
        )
        .await?;
        let Some(booking) = booking else {
            return Ok(false);
        };

        if !self.db.transition_lead(lead_id, lead.state, next).await? {
            return Ok(false);
        }
        self.db.set_follow_up_due(lead_id, None).await?;
        info!(lead_id = %lead_id, scheduled_for = %booking.scheduled_for, "Meeting scheduled");
        Ok(true)
    }

    /// Apply a human-signaled outcome (`NotInterested` or `Won`).
    /// Re-applying the lead's current outcome is a no-op.
    pub async fn record_outcome(&self, lead_id: Uuid, outcome: LeadState) -> Result<Lead, Error> {
        let lead = self
            .db
            .get_lead(lead_id)
            .await?
            .ok_or(LeadError::NotFound { id: lead_id })?;

        if lead.state == outcome && state::is_human_outcome(outcome) {
            return Ok(lead);
        }
        if !state::is_human_outcome(outcome) || !lead.state.can_advance_to(outcome) {
            return Err(LeadError::InvalidTransition {
                id: lead_id,
                from: lead.state,
                to: outcome,
            }
            .into());
        }

        if !self.db.transition_lead(lead_id, lead.state, outcome).await? {
            // Lost a race; report against whatever the lead is now.
            let now_state = self
                .db
                .get_lead(lead_id)
                .await?
                .map(|l| l.state)
                .unwrap_or(lead.state);
            if now_state == outcome {
                return self.reload(lead_id).await;
            }
            return Err(LeadError::InvalidTransition {
                id: lead_id,
                from: now_state,
                to: outcome,
            }
            .into());
        }

        self.db.set_follow_up_due(lead_id, None).await?;
        info!(lead_id = %lead_id, %outcome, "Lead outcome recorded");
        self.reload(lead_id).await
    }

    async fn reload(&self, lead_id: Uuid) -> Result<Lead, Error> {
        Ok(self
            .db
            .get_lead(lead_id)
            .await?
            .ok_or(LeadError::NotFound { id: lead_id })?)
    }

    /// Two-way CRM sync. Outcomes set on the board are applied first, so a
    /// push never overwrites them. Then leads whose state the CRM has not
    /// seen are pushed (new leads are created on the board) and unlogged
    /// messages are appended to their items. Failures are retried on the
    /// next run.
    pub async fn sync_crm(&self, report: &mut ReconcileReport) -> Result<(), Error> {
        let Some(crm) = &self.crm else {
            return Ok(());
        };

        self.apply_crm_outcomes(crm.as_ref(), report).await?;

        for lead in self.db.leads_needing_crm_sync().await? {
            let result = match &lead.crm_item_id {
                Some(item_id) => with_timeout(
                    "crm",
                    self.timeout,
                    crm.update_status(item_id, lead.state),
                )
                .await
                .map(|()| item_id.clone()),
                None => with_timeout("crm", self.timeout, crm.upsert_lead(&lead)).await,
            };

            match result {
                Ok(item_id) => {
                    self.db.mark_crm_synced(lead.id, &item_id, lead.state).await?;
                    report.crm_synced += 1;
                }
                Err(e) => {
                    warn!(lead_id = %lead.id, error = %e, "CRM sync failed");
                    report.crm_failures += 1;
                    report.errors.push(e.to_string());
                }
            }
        }

        self.log_crm_messages(crm.as_ref(), report).await
    }

    /// Read `NotInterested` and `Won` labels off the board and record them
    /// as outcomes.
    async fn apply_crm_outcomes(&self, crm: &dyn Crm, report: &mut ReconcileReport) -> Result<(), Error> {
        for outcome in [LeadState::NotInterested, LeadState::Won] {
            let items = match with_timeout("crm", self.timeout, crm.items_in_status(outcome)).await {
                Ok(items) => items,
                Err(e) => {
                    warn!(%outcome, error = %e, "CRM read-back failed");
                    report.crm_failures += 1;
                    report.errors.push(e.to_string());
                    continue;
                }
            };

            for item in items {
                let Some(lead) = self.db.get_lead_by_profile(&item.profile_url).await? else {
                    debug!(item_id = %item.item_id, "CRM item has no lead");
                    continue;
                };
                if lead.state == outcome {
                    continue;
                }
                match self.record_outcome(lead.id, outcome).await {
                    Ok(_) => report.crm_outcomes_applied += 1,
                    Err(Error::Lead(LeadError::InvalidTransition { from, .. })) => {
                        warn!(lead_id = %lead.id, %from, %outcome, "Ignoring CRM outcome");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Append unlogged messages to their leads' items, oldest first, and
    /// move each item's last message date. A lead whose append fails is
    /// skipped for the rest of the run so its log stays in order.
    async fn log_crm_messages(&self, crm: &dyn Crm, report: &mut ReconcileReport) -> Result<(), Error> {
        let mut items: HashMap<Uuid, Option<String>> = HashMap::new();
        let mut failed: HashSet<Uuid> = HashSet::new();
        let mut latest: HashMap<String, DateTime<Utc>> = HashMap::new();

        for message in self.db.messages_needing_crm_log().await? {
            if failed.contains(&message.lead_id) {
                continue;
            }
            if !items.contains_key(&message.lead_id) {
                let item_id = self
                    .db
                    .get_lead(message.lead_id)
                    .await?
                    .and_then(|l| l.crm_item_id);
                items.insert(message.lead_id, item_id);
            }
            let Some(Some(item_id)) = items.get(&message.lead_id) else {
                continue;
            };

            match with_timeout(
                "crm",
                self.timeout,
                crm.append_conversation_log(item_id, &message),
            )
            .await
            {
                Ok(()) => {
                    self.db.mark_message_crm_logged(message.id).await?;
                    report.crm_messages_logged += 1;
                    let at = latest.entry(item_id.clone()).or_insert(message.at);
                    *at = (*at).max(message.at);
                }
                Err(e) => {
                    warn!(lead_id = %message.lead_id, error = %e, "CRM log append failed");
                    report.crm_failures += 1;
                    report.errors.push(e.to_string());
                    failed.insert(message.lead_id);
                }
            }
        }

        for (item_id, at) in latest {
            if let Err(e) = with_timeout(
                "crm",
                self.timeout,
                crm.update_last_message_date(&item_id, at),
            )
            .await
            {
                warn!(item_id = %item_id, error = %e, "CRM last message date update failed");
                report.crm_failures += 1;
                report.errors.push(e.to_string());
            }
        }
        Ok(())
    }

    /// Replies since `since`, then bookings, then CRM sync.
    pub async fn run(&self, since: DateTime<Utc>) -> Result<ReconcileReport, Error> {
        let mut report = ReconcileReport::default();
        self.ingest_replies(since, &mut report).await?;
        self.check_bookings(&mut report).await?;
        self.sync_crm(&mut report).await?;

        info!(
            replies = report.replies_recorded,
            conversations = report.conversations_started,
            meetings = report.meetings_booked,
            crm_synced = report.crm_synced,
            crm_logged = report.crm_messages_logged,
            crm_outcomes = report.crm_outcomes_applied,
            "Reconcile run complete"
        );
        Ok(report)
    }
}
