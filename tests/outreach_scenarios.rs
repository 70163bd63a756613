//! End-to-end scenarios for the scheduler, approval queue and reconciler
//! against a real libSQL database and fake collaborators.

mod common;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Notify;

use outreach_agent::error::{ExternalError, QueueError};
use outreach_agent::guard::{ActionKind, Denial};
use outreach_agent::integrations::{DraftRequest, MessageGenerator};
use outreach_agent::leads::LeadState;
use outreach_agent::config::OutreachConfig;
use outreach_agent::queue::model::{Action, ActionStatus, Decision, MessageType};
use outreach_agent::scheduler::{TickReport, TickSummary};

use common::{Env, FakeBackend, local, test_config};

fn completed(report: TickReport) -> TickSummary {
    match report {
        TickReport::Completed(s) => s,
        TickReport::Skipped => panic!("tick unexpectedly skipped"),
    }
}

async fn approve_all(env: &Env) {
    for action in env.queue.list(Some(ActionStatus::Pending)).await.unwrap() {
        env.queue.decide(action.id, Decision::Approve).await.unwrap();
    }
}

// ── Planning ────────────────────────────────────────────────────────────

#[tokio::test]
async fn fifteen_leads_with_limit_ten_enqueue_exactly_ten() {
    let env = Env::memory(test_config()).await;
    let leads = env.add_leads(15).await;

    let summary = completed(env.scheduler.tick(local(19, 10, 0)).await.unwrap());
    assert_eq!(summary.enqueued, 10);

    let pending = env.queue.list(Some(ActionStatus::Pending)).await.unwrap();
    assert_eq!(pending.len(), 10);
    assert!(pending.iter().all(|a| a.message_type == Some(MessageType::FirstOutreach)));

    // Oldest leads first; the last five are untouched.
    let targeted: HashSet<_> = pending.iter().map(|a| a.lead_id).collect();
    for lead in &leads[..10] {
        assert!(targeted.contains(&lead.id));
    }
    for lead in &leads[10..] {
        assert!(!targeted.contains(&lead.id));
        let lead = env.db.get_lead(lead.id).await.unwrap().unwrap();
        assert_eq!(lead.state, LeadState::New);
    }
}

#[tokio::test]
async fn invalid_draft_is_regenerated_before_enqueue() {
    struct DashThenClean(Mutex<u32>);

    #[async_trait]
    impl MessageGenerator for DashThenClean {
        async fn draft(&self, _request: &DraftRequest) -> Result<String, ExternalError> {
            let mut n = self.0.lock().unwrap();
            *n += 1;
            Ok(if *n == 1 {
                "Hi - your profile is amazing, let's meet".into()
            } else {
                "Hi, how is the new role treating you".into()
            })
        }
    }

    let env = Env::with_generator(Arc::new(DashThenClean(Mutex::new(0))), test_config()).await;
    env.add_leads(1).await;

    let summary = completed(env.scheduler.tick(local(19, 10, 0)).await.unwrap());
    assert_eq!(summary.enqueued, 1);

    let action = &env.queue.list(Some(ActionStatus::Pending)).await.unwrap()[0];
    assert_eq!(action.payload, "Hi, how is the new role treating you");
}

// ── Approval and dispatch ───────────────────────────────────────────────

#[tokio::test]
async fn decide_is_idempotent_and_conflicts_fail() {
    let env = Env::memory(test_config()).await;
    env.add_leads(1).await;
    env.scheduler.tick(local(19, 10, 0)).await.unwrap();

    let id = env.queue.list(Some(ActionStatus::Pending)).await.unwrap()[0].id;
    let first = env.queue.decide(id, Decision::Approve).await.unwrap();
    let second = env.queue.decide(id, Decision::Approve).await.unwrap();
    assert_eq!(first.status, ActionStatus::Approved);
    assert_eq!(second.status, ActionStatus::Approved);
    assert_eq!(first.decided_at, second.decided_at);

    let err = env.queue.decide(id, Decision::Reject).await.unwrap_err();
    assert!(matches!(err, QueueError::AlreadyDecided { status: ActionStatus::Approved, .. }));
}

#[tokio::test]
async fn guard_denial_at_dispatch_leaves_action_approved() {
    let env = Env::memory(test_config()).await;
    env.add_leads(1).await;

    env.scheduler.tick(local(19, 17, 50)).await.unwrap();
    approve_all(&env).await;

    // The operator approved after hours: nothing goes out, nothing is rejected.
    let evening = completed(env.scheduler.tick(local(19, 18, 30)).await.unwrap());
    assert_eq!(evening.dispatched, 0);
    assert_eq!(evening.dispatch_deferred, Some(Denial::OutsideWindow));

    let action = &env.queue.list(Some(ActionStatus::Approved)).await.unwrap()[0];
    assert!(!action.is_claimed());
    assert!(env.backend.sent().is_empty());

    // Next working morning it is dispatched.
    let morning = completed(env.scheduler.tick(local(20, 9, 5)).await.unwrap());
    assert_eq!(morning.dispatched, 1);
    let dispatched = env.queue.get(action.id).await.unwrap().unwrap();
    assert_eq!(dispatched.status, ActionStatus::Dispatched);
    assert_eq!(env.backend.sent().len(), 1);
    assert_eq!(env.backend.sent()[0].dedupe_key, action.id.to_string());
}

#[tokio::test]
async fn cap_filled_by_interleaved_dispatch_defers_approved_action() {
    let config = OutreachConfig {
        daily_message_limit: 2,
        ..test_config()
    };
    let env = Env::memory(config).await;
    let leads = env.add_leads(3).await;

    // Planning fills the budget of two.
    let planned = completed(env.scheduler.tick(local(19, 10, 0)).await.unwrap());
    assert_eq!(planned.enqueued, 2);
    approve_all(&env).await;

    let first = completed(env.scheduler.tick(local(19, 10, 1)).await.unwrap());
    assert_eq!(first.dispatched, 1);

    // An operator adds and approves one more while the second still waits.
    let extra = env
        .queue
        .enqueue(
            Action::new(ActionKind::Message, leads[2].id, "Hi Lead2, quick question about your team")
                .with_message_type(MessageType::FirstOutreach)
                .with_created_at(local(19, 10, 3)),
        )
        .await
        .unwrap();
    env.queue.decide(extra, Decision::Approve).await.unwrap();

    let second = completed(env.scheduler.tick(local(19, 10, 5)).await.unwrap());
    assert_eq!(second.dispatched, 1);

    // The interleaved dispatch used the last slot.
    let capped = completed(env.scheduler.tick(local(19, 10, 10)).await.unwrap());
    assert_eq!(capped.dispatched, 0);
    assert_eq!(
        capped.dispatch_deferred,
        Some(Denial::DailyCapExceeded { kind: ActionKind::Message, limit: 2 })
    );
    let action = env.queue.get(extra).await.unwrap().unwrap();
    assert_eq!(action.status, ActionStatus::Approved);
    assert!(!action.is_claimed());
    assert!(env.queue.list(Some(ActionStatus::Rejected)).await.unwrap().is_empty());

    // Once the first dispatch leaves the trailing 24h it goes out.
    let next_day = completed(env.scheduler.tick(local(20, 10, 2)).await.unwrap());
    assert_eq!(next_day.dispatched, 1);
    let action = env.queue.get(extra).await.unwrap().unwrap();
    assert_eq!(action.status, ActionStatus::Dispatched);
    assert_eq!(env.backend.sent().len(), 3);
}

#[tokio::test]
async fn overlapping_tick_is_skipped() {
    /// Blocks inside drafting until released, holding the first tick open.
    struct Gate {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl MessageGenerator for Gate {
        async fn draft(&self, _request: &DraftRequest) -> Result<String, ExternalError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok("Hi, quick hello from a fellow engineer".into())
        }
    }

    let gate = Arc::new(Gate {
        entered: Notify::new(),
        release: Notify::new(),
    });
    let env = Env::with_generator(Arc::clone(&gate) as Arc<dyn MessageGenerator>, test_config()).await;
    env.add_leads(1).await;
    let now = local(19, 10, 0);

    let scheduler = Arc::clone(&env.scheduler);
    let first = tokio::spawn(async move { scheduler.tick(now).await });

    gate.entered.notified().await;
    let second = env.scheduler.tick(now + chrono::Duration::seconds(5)).await.unwrap();
    assert_eq!(second, TickReport::Skipped);

    gate.release.notify_one();
    let first = completed(first.await.unwrap().unwrap());
    assert_eq!(first.enqueued, 1);

    // Lease released: the next tick runs.
    let third = env.scheduler.tick(now + chrono::Duration::minutes(1)).await.unwrap();
    assert!(matches!(third, TickReport::Completed(_)));
}

// ── Durability ──────────────────────────────────────────────────────────

#[tokio::test]
async fn approved_actions_are_polled_once_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("outreach.db");
    let backend = Arc::new(FakeBackend::default());

    let ids: HashSet<_> = {
        let env = Env::file(&path, Arc::clone(&backend), test_config()).await;
        env.add_leads(3).await;
        env.scheduler.tick(local(19, 10, 0)).await.unwrap();
        approve_all(&env).await;
        env.queue
            .list(Some(ActionStatus::Approved))
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect()
    };
    assert_eq!(ids.len(), 3);

    let env = Env::file(&path, backend, test_config()).await;
    let polled: Vec<_> = env
        .queue
        .poll_approved(local(19, 10, 5))
        .map(|a| a.unwrap().id)
        .collect()
        .await;
    assert_eq!(polled.len(), 3);
    assert_eq!(polled.iter().copied().collect::<HashSet<_>>(), ids);

    // Everything is claimed now; a second poll hands out nothing.
    assert_eq!(env.queue.poll_approved(local(19, 10, 6)).count().await, 0);
    assert_eq!(env.queue.in_flight().await.unwrap().len(), 3);
}

#[tokio::test]
async fn crash_after_send_is_reconciled_without_resend() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("outreach.db");
    let backend = Arc::new(FakeBackend::default());

    let (delivered_id, lost_id) = {
        let env = Env::file(&path, Arc::clone(&backend), test_config()).await;
        env.add_leads(2).await;
        env.scheduler.tick(local(19, 10, 0)).await.unwrap();
        approve_all(&env).await;

        // A dispatcher claims both, one send lands, then the process dies.
        let mut claims = Box::pin(env.queue.poll_approved(local(19, 10, 5)));
        let a = claims.next().await.unwrap().unwrap();
        let b = claims.next().await.unwrap().unwrap();
        backend.deliver_silently(&a.dedupe_key());
        (a.id, b.id)
    };

    let env = Env::file(&path, Arc::clone(&backend), test_config()).await;
    let summary = completed(env.scheduler.tick(local(19, 10, 30)).await.unwrap());
    assert_eq!(summary.recovered, 1);
    assert_eq!(summary.requeued, 1);

    let delivered = env.queue.get(delivered_id).await.unwrap().unwrap();
    assert_eq!(delivered.status, ActionStatus::Dispatched);
    assert_eq!(delivered.dispatch_id.as_deref(), Some(format!("run-{delivered_id}").as_str()));

    // The delivered one was never sent again; the requeued one went out once.
    assert_eq!(summary.dispatched, 1);
    assert_eq!(backend.sent().len(), 1);
    assert_eq!(backend.sent()[0].dedupe_key, lost_id.to_string());
    let lost = env.queue.get(lost_id).await.unwrap().unwrap();
    assert_eq!(lost.status, ActionStatus::Dispatched);

    let later = completed(env.scheduler.tick(local(19, 10, 40)).await.unwrap());
    assert_eq!(later.dispatched, 0);
    assert_eq!(backend.sent().len(), 1);
}

#[tokio::test]
async fn recovered_dispatch_is_logged_when_it_was_claimed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("outreach.db");
    let backend = Arc::new(FakeBackend::default());
    let claimed_at = local(19, 17, 59);

    let lead_id = {
        let env = Env::file(&path, Arc::clone(&backend), test_config()).await;
        let lead = env.add_leads(1).await.remove(0);
        env.scheduler.tick(local(19, 17, 50)).await.unwrap();
        approve_all(&env).await;

        let mut claims = Box::pin(env.queue.poll_approved(claimed_at));
        let action = claims.next().await.unwrap().unwrap();
        backend.deliver_silently(&action.dedupe_key());
        lead.id
    };

    // Recovered in the middle of the night.
    let env = Env::file(&path, Arc::clone(&backend), test_config()).await;
    let summary = completed(env.scheduler.tick(local(20, 3, 0)).await.unwrap());
    assert_eq!(summary.recovered, 1);

    let log = env.db.action_log_since(local(19, 0, 0)).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].timestamp, claimed_at);
    assert!(env.scheduler.guard().in_working_hours(log[0].timestamp));

    let action = &env.queue.list(Some(ActionStatus::Dispatched)).await.unwrap()[0];
    assert_eq!(action.dispatched_at, Some(claimed_at));
    let lead = env.db.get_lead(lead_id).await.unwrap().unwrap();
    assert_eq!(lead.state, LeadState::Contacted);
}

// ── Reconciliation ──────────────────────────────────────────────────────

#[tokio::test]
async fn reply_starts_conversation_once_and_queues_a_reply() {
    let config = OutreachConfig {
        require_human_approval: false,
        ..test_config()
    };
    let env = Env::memory(config).await;
    let lead = env.add_leads(1).await.remove(0);
    let t0 = local(19, 10, 0);

    let summary = completed(env.scheduler.tick(t0).await.unwrap());
    assert_eq!(summary.dispatched, 1);
    assert_eq!(
        env.db.get_lead(lead.id).await.unwrap().unwrap().state,
        LeadState::Contacted
    );

    let url = &lead.profile.profile_url;
    env.backend.push_reply("r1", url, local(19, 11, 0));
    let report = env.reconciler.run(t0).await.unwrap();
    assert_eq!(report.conversations_started, 1);

    env.backend.push_reply("r2", url, local(19, 11, 5));
    let report = env.reconciler.run(t0).await.unwrap();
    assert_eq!(report.replies_recorded, 1);
    assert_eq!(report.duplicate_replies, 1);
    assert_eq!(report.conversations_started, 0);

    let lead = env.db.get_lead(lead.id).await.unwrap().unwrap();
    assert_eq!(lead.state, LeadState::InConversation);
    assert_eq!(lead.history.len(), 3);

    // A reply is owed, so the next tick drafts one and sends it.
    let summary = completed(env.scheduler.tick(local(19, 11, 30)).await.unwrap());
    assert_eq!(summary.enqueued, 1);
    assert_eq!(summary.dispatched, 1);
    let sent = env.queue.list(Some(ActionStatus::Dispatched)).await.unwrap();
    assert_eq!(sent[1].message_type, Some(MessageType::Reply));
    assert_ne!(sent[1].payload, sent[0].payload);

    // After our reply the next follow-up is days away.
    let lead = env.db.get_lead(lead.id).await.unwrap().unwrap();
    assert!(lead.follow_up_due_at.unwrap() > local(22, 0, 0));
}

// ── Safety properties over a simulated week ─────────────────────────────

#[tokio::test]
async fn simulated_week_respects_caps_spacing_and_hours() {
    let config = OutreachConfig {
        require_human_approval: false,
        ..test_config()
    };
    let min_delay = chrono::Duration::seconds(config.min_delay_seconds as i64);
    let limit = config.daily_message_limit as usize;
    let env = Env::memory(config.clone()).await;
    env.add_leads(60).await;

    // Sunday 00:00 to Saturday 00:00, a tick every four minutes.
    let start = local(18, 0, 0);
    let end = local(24, 0, 0);
    let mut now = start;
    while now < end {
        env.scheduler.tick(now).await.unwrap();
        now += chrono::Duration::minutes(4);
    }

    let log = env.db.action_log_since(start).await.unwrap();
    assert!(!log.is_empty());
    assert!(log.iter().all(|e| e.kind == ActionKind::Message));

    let guard = env.scheduler.guard();
    for (i, entry) in log.iter().enumerate() {
        assert!(guard.in_working_hours(entry.timestamp), "{:?}", entry.timestamp);

        let window_start = entry.timestamp - chrono::Duration::hours(24);
        let in_window = log
            .iter()
            .filter(|e| e.timestamp > window_start && e.timestamp <= entry.timestamp)
            .count();
        assert!(in_window <= limit, "{in_window} messages in 24h ending {}", entry.timestamp);

        if i > 0 {
            assert!(entry.timestamp - log[i - 1].timestamp >= min_delay);
        }
    }

    // Ten a day over the five working days Sunday to Thursday.
    assert_eq!(log.len(), 5 * limit);
}
