//! Sending one claimed action, and recovering claims a crash left behind.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::{Scheduler, TickSummary};
use crate::error::{Error, ExternalError};
use crate::guard::ActionKind;
use crate::integrations::with_timeout;
use crate::queue::model::Action;

const BACKEND: &str = "automation backend";

/// How a dispatch attempt ended.
#[derive(Debug)]
pub(super) enum Outcome {
    /// Delivered, with the backend's dispatch id.
    Sent(String),
    /// Gave up; the action should be marked failed.
    Failed(String),
    /// The backend could not confirm either way.
    Unknown,
}

impl Scheduler {
    /// Resolve claims left by a crash between send and `mark_dispatched`.
    /// Delivered actions are marked dispatched; the rest go back to the
    /// queue. Claims the backend cannot account for yet stay put.
    pub(super) async fn recover_in_flight(
        &self,
        now: DateTime<Utc>,
        summary: &mut TickSummary,
    ) -> Result<(), Error> {
        for action in self.queue.in_flight().await? {
            match self.lookup(&action).await {
                Ok(Some(dispatch_id)) => {
                    info!(action_id = %action.id, %dispatch_id, "Recovered delivered action");
                    // Logged when it was claimed, which is when the guard allowed it.
                    let at = action.claimed_at.unwrap_or(now);
                    self.queue.mark_dispatched(action.id, &dispatch_id, at).await?;
                    summary.recovered += 1;
                }
                Ok(None) => {
                    info!(action_id = %action.id, "In-flight action was never delivered; requeued");
                    self.queue.release(action.id).await?;
                    summary.requeued += 1;
                }
                Err(e) => {
                    warn!(action_id = %action.id, error = %e, "Could not reconcile in-flight action");
                    summary.unresolved += 1;
                }
            }
        }
        Ok(())
    }

    /// Send `action` with bounded retries.
    ///
    /// After an attempt whose outcome is unknown (timeout, transport error)
    /// the backend is asked whether the dedupe key was recorded before
    /// anything is resent.
    pub(super) async fn dispatch_one(&self, action: &Action) -> Result<Outcome, Error> {
        let Some(lead) = self.db.get_lead(action.lead_id).await? else {
            return Ok(Outcome::Failed(format!("lead {} not found", action.lead_id)));
        };

        let max_attempts = self.config.dispatch_max_attempts.max(1);
        let mut last_err: Option<ExternalError> = None;

        for attempt in 1..=max_attempts {
            if last_err.as_ref().is_some_and(ExternalError::is_ambiguous) {
                match self.lookup(action).await {
                    Ok(Some(dispatch_id)) => {
                        debug!(action_id = %action.id, "Earlier attempt had gone through");
                        return Ok(Outcome::Sent(dispatch_id));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(action_id = %action.id, error = %e, "Dedupe lookup failed");
                        return Ok(Outcome::Unknown);
                    }
                }
            }

            match self.send(action, &lead.profile.profile_url).await {
                Ok(dispatch_id) => return Ok(Outcome::Sent(dispatch_id)),
                Err(e) => {
                    warn!(
                        action_id = %action.id,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Dispatch attempt failed"
                    );
                    self.queue.record_attempt(action.id, &e.to_string()).await?;
                    last_err = Some(e);
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(backoff(self.config.dispatch_backoff, attempt)).await;
            }
        }

        let Some(err) = last_err else {
            return Ok(Outcome::Unknown);
        };

        if err.is_ambiguous() {
            match self.lookup(action).await {
                Ok(Some(dispatch_id)) => return Ok(Outcome::Sent(dispatch_id)),
                Ok(None) => {}
                Err(_) => return Ok(Outcome::Unknown),
            }
        }

        Ok(Outcome::Failed(format!(
            "gave up after {max_attempts} attempts: {err}"
        )))
    }

    async fn send(&self, action: &Action, profile_url: &str) -> Result<String, ExternalError> {
        let key = action.dedupe_key();
        let timeout = self.config.external_timeout;
        match action.kind {
            ActionKind::Message => {
                with_timeout(
                    BACKEND,
                    timeout,
                    self.backend.send_message(profile_url, &action.payload, &key),
                )
                .await
            }
            ActionKind::ConnectionRequest => {
                with_timeout(
                    BACKEND,
                    timeout,
                    self.backend.send_connection(profile_url, &action.payload, &key),
                )
                .await
            }
            ActionKind::ProfileView => {
                with_timeout(BACKEND, timeout, self.backend.view_profile(profile_url)).await
            }
        }
    }

    async fn lookup(&self, action: &Action) -> Result<Option<String>, ExternalError> {
        with_timeout(
            BACKEND,
            self.config.external_timeout,
            self.backend.lookup_dispatch(&action.dedupe_key()),
        )
        .await
    }
}

/// `base * 2^(attempt - 1)`, capped at five minutes.
fn backoff(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    base.saturating_mul(factor).min(Duration::from_secs(300))
}
