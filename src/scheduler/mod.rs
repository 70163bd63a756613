//! Outreach scheduler: one lease-guarded tick plans new drafts and
//! dispatches approved actions.
//!
//! A tick is safe to invoke any number of times. Overlapping invocations
//! are turned away by the database lease, and every queue transition it
//! makes is a compare-and-set.

mod dispatch;

use std::future::Future;
use std::pin::pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::OutreachConfig;
use crate::drafting::Drafter;
use crate::error::{Error, QueueError};
use crate::guard::{ActionKind, ActionLogEntry, Authorization, Denial, Guard, GuardConfig};
use crate::integrations::AutomationBackend;
use crate::leads::{Direction, Lead, LeadState};
use crate::queue::model::{Action, Decision, MessageType};
use crate::queue::ApprovalQueue;
use crate::store::Database;

use dispatch::Outcome;

/// Lease name shared by every scheduler process on the same database.
pub const LEASE_NAME: &str = "outreach-scheduler";

/// History loaded for the guard. Covers the longest cap window (a local
/// day across a DST change) with margin.
const HISTORY_LOOKBACK_HOURS: i64 = 48;

/// Action log entries older than this are pruned at the end of a tick.
const ACTION_LOG_RETENTION_DAYS: i64 = 7;

/// Result of one tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickReport {
    /// Another tick holds the lease.
    Skipped,
    Completed(TickSummary),
}

impl TickReport {
    pub fn summary(&self) -> Option<&TickSummary> {
        match self {
            Self::Skipped => None,
            Self::Completed(s) => Some(s),
        }
    }
}

/// What a completed tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    /// Crashed claims found already delivered at the backend.
    pub recovered: usize,
    /// Crashed claims found undelivered and handed back to the queue.
    pub requeued: usize,
    pub enqueued: usize,
    pub draft_failures: usize,
    /// Why planning stopped before running out of leads, if it did.
    pub planning_stopped: Option<Denial>,
    pub dispatched: usize,
    pub failed: usize,
    /// Claims left in place because the backend could not say whether the
    /// send happened.
    pub unresolved: usize,
    /// Why dispatching stopped with approved actions left, if it did.
    pub dispatch_deferred: Option<Denial>,
}

/// Outreach scheduler.
pub struct Scheduler {
    db: Arc<dyn Database>,
    queue: Arc<ApprovalQueue>,
    guard: Guard,
    drafter: Drafter,
    backend: Arc<dyn AutomationBackend>,
    config: OutreachConfig,
}

impl Scheduler {
    pub fn new(
        db: Arc<dyn Database>,
        queue: Arc<ApprovalQueue>,
        drafter: Drafter,
        backend: Arc<dyn AutomationBackend>,
        config: OutreachConfig,
    ) -> Self {
        Self {
            db,
            queue,
            guard: Guard::new(GuardConfig::from(&config)),
            drafter,
            backend,
            config,
        }
    }

    pub fn guard(&self) -> &Guard {
        &self.guard
    }

    /// Run one tick as of `now`.
    ///
    /// Returns [`TickReport::Skipped`] without doing anything if another
    /// tick currently holds the lease.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, Error> {
        let holder = Uuid::new_v4().to_string();
        if !self
            .db
            .try_acquire_lease(LEASE_NAME, &holder, now, self.config.lease_ttl)
            .await?
        {
            debug!("Scheduler lease held elsewhere, skipping tick");
            return Ok(TickReport::Skipped);
        }

        let result = self.run(now).await;

        if let Err(e) = self.db.release_lease(LEASE_NAME, &holder).await {
            warn!(error = %e, "Failed to release scheduler lease; it will expire");
        }

        let summary = result?;
        info!(
            enqueued = summary.enqueued,
            dispatched = summary.dispatched,
            failed = summary.failed,
            recovered = summary.recovered,
            "Scheduler tick complete"
        );
        Ok(TickReport::Completed(summary))
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<TickSummary, Error> {
        let mut summary = TickSummary::default();

        self.recover_in_flight(now, &mut summary).await?;
        self.plan(now, &mut summary).await?;
        self.dispatch_approved(now, &mut summary).await?;

        let cutoff = now - chrono::Duration::days(ACTION_LOG_RETENTION_DAYS);
        let pruned = self.db.prune_action_log(cutoff).await?;
        if pruned > 0 {
            debug!(pruned, "Pruned action log");
        }

        Ok(summary)
    }

    async fn history(&self, now: DateTime<Utc>) -> Result<Vec<ActionLogEntry>, Error> {
        let since = now - chrono::Duration::hours(HISTORY_LOOKBACK_HOURS);
        Ok(self.db.action_log_since(since).await?)
    }

    // ── Planning ────────────────────────────────────────────────────

    /// Draft and enqueue actions for eligible leads, within the budget the
    /// daily cap leaves after dispatched and already-open actions.
    async fn plan(&self, now: DateTime<Utc>, summary: &mut TickSummary) -> Result<(), Error> {
        let history = self.history(now).await?;
        let open = self
            .db
            .count_open_actions(&[ActionKind::Message, ActionKind::ConnectionRequest])
            .await?;
        let budget = self
            .guard
            .remaining_budget(ActionKind::Message, now, &history)
            .saturating_sub(open) as usize;

        if budget == 0 {
            debug!(open, "No message budget left for planning");
            return Ok(());
        }

        let leads = self.db.eligible_leads(now).await?;
        debug!(eligible = leads.len(), budget, "Planning outreach");

        for lead in leads {
            if summary.enqueued >= budget {
                break;
            }

            match self.guard.authorize(ActionKind::Message, now, &history) {
                Authorization::Denied(d @ (Denial::OutsideWindow | Denial::DailyCapExceeded { .. })) => {
                    debug!(reason = %d, "Guard stopped planning");
                    summary.planning_stopped = Some(d);
                    break;
                }
                // Spacing only governs dispatch.
                Authorization::Denied(Denial::TooSoon { .. }) | Authorization::Allowed => {}
            }

            let message_type = message_type_for(&lead);
            let draft = match self.drafter.draft(&lead, message_type).await {
                Ok(d) => d,
                Err(e) => {
                    warn!(lead_id = %lead.id, error = %e, "Could not draft message");
                    summary.draft_failures += 1;
                    continue;
                }
            };

            let action = Action::new(ActionKind::Message, lead.id, draft.text)
                .with_message_type(message_type)
                .with_created_at(now);

            let id = match self.queue.enqueue(action).await {
                Ok(id) => id,
                Err(QueueError::DuplicateAction { .. }) => {
                    debug!(lead_id = %lead.id, "Lead already has an open action");
                    continue;
                }
                Err(QueueError::DuplicateContent { .. }) => {
                    warn!(lead_id = %lead.id, "Draft repeats a message already sent");
                    summary.draft_failures += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            summary.enqueued += 1;

            if !self.config.require_human_approval {
                self.queue.decide(id, Decision::Approve).await?;
            }
        }

        Ok(())
    }

    // ── Dispatch ────────────────────────────────────────────────────

    /// Dispatch approved actions while the guard allows. The first denial
    /// hands the action back to the queue and ends dispatching for this tick.
    ///
    /// An action is authorized and logged at the instant it was claimed, so
    /// the log never shows a dispatch the guard did not allow, however long
    /// the send itself takes.
    async fn dispatch_approved(
        &self,
        now: DateTime<Utc>,
        summary: &mut TickSummary,
    ) -> Result<(), Error> {
        let mut history = self.history(now).await?;
        let mut approved = pin!(self.queue.poll_approved(now));

        while let Some(action) = approved.next().await {
            let action = action?;
            let at = action.claimed_at.unwrap_or(now);

            if let Authorization::Denied(denial) = self.guard.authorize(action.kind, at, &history) {
                self.queue.release(action.id).await?;
                debug!(action_id = %action.id, reason = %denial, "Dispatch deferred");
                summary.dispatch_deferred = Some(denial);
                break;
            }

            match self.dispatch_one(&action).await? {
                Outcome::Sent(dispatch_id) => {
                    self.queue.mark_dispatched(action.id, &dispatch_id, at).await?;
                    history.push(ActionLogEntry::new(action.kind, at));
                    summary.dispatched += 1;
                }
                Outcome::Failed(reason) => {
                    self.queue.mark_failed(action.id, &reason).await?;
                    summary.failed += 1;
                }
                Outcome::Unknown => {
                    error!(action_id = %action.id, "Dispatch outcome unknown; leaving claim for recovery");
                    summary.unresolved += 1;
                    break;
                }
            }
        }

        Ok(())
    }
}

/// `New` leads get a first message. In-conversation leads get a reply if
/// they spoke last, otherwise a follow-up.
pub fn message_type_for(lead: &Lead) -> MessageType {
    match (lead.state, lead.last_direction()) {
        (LeadState::New, _) => MessageType::FirstOutreach,
        (LeadState::InConversation, Some(Direction::Inbound)) => MessageType::Reply,
        _ => MessageType::FollowUp,
    }
}

/// Run `job` at every upcoming time of `schedule` until the task is aborted.
pub fn spawn_cron_ticker<F, Fut>(
    name: &'static str,
    schedule: cron::Schedule,
    job: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                warn!(job = name, "Cron schedule has no upcoming runs; stopping");
                return;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;
            debug!(job = name, "Cron trigger");
            job().await;
        }
    })
}
