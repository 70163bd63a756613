//! Approval queue: durable action queue with broadcast to approval clients.
//!
//! Every transition is a single conditional write in the database, so the
//! queue itself holds no state beyond the broadcast channel and survives
//! restarts unchanged.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::Stream;
use futures::stream;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::model::{Action, ActionStatus, Decision, QueueEvent};
use crate::error::{DatabaseError, QueueError};
use crate::store::{Database, DispatchRecord};

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Database-backed approval queue.
pub struct ApprovalQueue {
    db: Arc<dyn Database>,
    tx: broadcast::Sender<QueueEvent>,
    follow_up_after: chrono::Duration,
}

impl ApprovalQueue {
    /// Create a new queue. `follow_up_after` is how long after an outbound
    /// message an in-conversation lead is next due.
    pub fn new(db: Arc<dyn Database>, follow_up_after: chrono::Duration) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Arc::new(Self {
            db,
            tx,
            follow_up_after,
        })
    }

    /// Subscribe to real-time queue events. Each WS client calls this.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }

    fn broadcast(&self, event: QueueEvent) {
        // Ok if no receivers are listening
        let _ = self.tx.send(event);
    }

    /// Persist a new pending action.
    ///
    /// Fails with `DuplicateAction` if an open action of the same kind
    /// already targets the lead, and with `DuplicateContent` if the same
    /// content was already dispatched to it.
    pub async fn enqueue(&self, action: Action) -> Result<Uuid, QueueError> {
        let (lead_id, kind) = (action.lead_id, action.kind);
        let duplicate = move || QueueError::DuplicateAction {
            lead_id,
            kind: kind.to_string(),
        };

        if self.db.has_open_action(action.lead_id, action.kind).await? {
            return Err(duplicate());
        }
        if !action.payload.is_empty()
            && self
                .db
                .has_dispatched_content(action.lead_id, &action.payload)
                .await?
        {
            return Err(QueueError::DuplicateContent { lead_id });
        }

        let mut action = action;
        action.status = ActionStatus::Pending;
        action.decided_at = None;
        action.claimed_at = None;

        match self.db.insert_action(&action).await {
            Ok(()) => {}
            Err(DatabaseError::Constraint(_)) => return Err(duplicate()),
            Err(e) => return Err(e.into()),
        }

        info!(
            action_id = %action.id,
            lead_id = %action.lead_id,
            kind = %action.kind,
            "Action enqueued for approval"
        );

        let id = action.id;
        self.broadcast(QueueEvent::Enqueued { action });
        Ok(id)
    }

    /// Apply a human decision to a pending action.
    ///
    /// Re-applying the decision an action already reflects is a no-op that
    /// returns the action; a conflicting decision fails with `AlreadyDecided`.
    pub async fn decide(&self, id: Uuid, decision: Decision) -> Result<Action, QueueError> {
        let target = decision.target_status();
        let changed = self.db.decide_action(id, target, Utc::now()).await?;

        let action = self
            .db
            .get_action(id)
            .await?
            .ok_or(QueueError::NotFound { id })?;

        if changed {
            info!(action_id = %id, status = %target, "Action decided");
            self.broadcast(QueueEvent::Decided { id, status: target });
            return Ok(action);
        }

        if decision.already_applied(action.status) {
            debug!(action_id = %id, status = %action.status, "Decision already applied");
            return Ok(action);
        }

        warn!(action_id = %id, status = %action.status, ?decision, "Conflicting decision");
        Err(QueueError::AlreadyDecided {
            id,
            status: action.status,
        })
    }

    /// Lazy stream of approved, not-yet-dispatched actions.
    ///
    /// Each item is claimed in the database as it is pulled, stamped with
    /// `now`, so an action is never handed to two consumers. Claimed actions that are neither
    /// dispatched nor released stay invisible to later polls; see
    /// [`ApprovalQueue::in_flight`].
    pub fn poll_approved(
        &self,
        now: DateTime<Utc>,
    ) -> impl Stream<Item = Result<Action, QueueError>> + Send + '_ {
        stream::unfold(false, move |done| async move {
            if done {
                return None;
            }
            match self.db.claim_next_approved(now).await {
                Ok(Some(action)) => {
                    debug!(action_id = %action.id, "Approved action claimed");
                    Some((Ok(action), false))
                }
                Ok(None) => None,
                Err(e) => Some((Err(e.into()), true)),
            }
        })
    }

    /// Drop the claim on an approved action so a later poll picks it up again.
    pub async fn release(&self, id: Uuid) -> Result<bool, QueueError> {
        let released = self.db.release_claim(id).await?;
        if released {
            debug!(action_id = %id, "Claim released");
        }
        Ok(released)
    }

    /// Claimed actions whose dispatch outcome is unknown (left by a crash).
    pub async fn in_flight(&self) -> Result<Vec<Action>, QueueError> {
        Ok(self.db.claimed_actions().await?)
    }

    /// Record a failed dispatch attempt on an action.
    pub async fn record_attempt(&self, id: Uuid, error: &str) -> Result<(), QueueError> {
        Ok(self.db.record_attempt(id, error).await?)
    }

    /// Mark an approved action as dispatched. Idempotent: calling it again
    /// for an already-dispatched action does nothing.
    pub async fn mark_dispatched(
        &self,
        id: Uuid,
        dispatch_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let record = DispatchRecord {
            action_id: id,
            dispatch_id: dispatch_id.to_string(),
            dispatched_at: at,
            follow_up_after: self.follow_up_after,
        };

        if self.db.complete_dispatch(&record).await? {
            info!(action_id = %id, dispatch_id, "Action dispatched");
            self.broadcast(QueueEvent::Dispatched {
                id,
                dispatch_id: dispatch_id.to_string(),
            });
            return Ok(());
        }

        match self.db.get_action(id).await? {
            None => Err(QueueError::NotFound { id }),
            Some(a) if a.status == ActionStatus::Dispatched => Ok(()),
            Some(a) => Err(QueueError::InvalidTransition {
                id,
                status: a.status,
                target: ActionStatus::Dispatched,
            }),
        }
    }

    /// Mark an approved action as permanently failed. Idempotent.
    pub async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<(), QueueError> {
        if self.db.fail_action(id, reason).await? {
            error!(action_id = %id, reason, "Action failed permanently");
            self.broadcast(QueueEvent::Failed {
                id,
                reason: reason.to_string(),
            });
            return Ok(());
        }

        match self.db.get_action(id).await? {
            None => Err(QueueError::NotFound { id }),
            Some(a) if a.status == ActionStatus::Failed => Ok(()),
            Some(a) => Err(QueueError::InvalidTransition {
                id,
                status: a.status,
                target: ActionStatus::Failed,
            }),
        }
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Action>, QueueError> {
        Ok(self.db.get_action(id).await?)
    }

    /// Actions, optionally filtered by status, oldest first.
    pub async fn list(&self, status: Option<ActionStatus>) -> Result<Vec<Action>, QueueError> {
        Ok(self.db.list_actions(status).await?)
    }

    /// Failed actions awaiting human review.
    pub async fn failed(&self) -> Result<Vec<Action>, QueueError> {
        self.list(Some(ActionStatus::Failed)).await
    }

    /// Pending and approved actions.
    pub async fn open(&self) -> Result<Vec<Action>, QueueError> {
        let mut actions = self.list(Some(ActionStatus::Pending)).await?;
        actions.extend(self.list(Some(ActionStatus::Approved)).await?);
        Ok(actions)
    }
}
