//! Integration tests for the approval API.
//!
//! Each test spins up an Axum server on a random port and talks to it over
//! real HTTP (reqwest) and WebSocket (tokio-tungstenite) connections.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use outreach_agent::api::{self, AppState};
use outreach_agent::guard::ActionKind;
use outreach_agent::leads::{Lead, LeadState};
use outreach_agent::queue::model::{Action, ActionStatus, Decision, MessageType};

use common::{Env, local, test_config};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Start the API on a random port, return (base URL, env).
async fn start_server() -> (String, Arc<Env>) {
    let env = Arc::new(Env::memory(test_config()).await);
    let app = api::router(AppState {
        queue: Arc::clone(&env.queue),
        reconciler: Arc::clone(&env.reconciler),
        db: Arc::clone(&env.db),
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("127.0.0.1:{port}"), env)
}

async fn pending_action(env: &Env, lead: &Lead, text: &str) -> Uuid {
    env.queue
        .enqueue(
            Action::new(ActionKind::Message, lead.id, text)
                .with_message_type(MessageType::FirstOutreach),
        )
        .await
        .unwrap()
}

/// Parse a WS text frame into a serde_json::Value.
fn parse_ws_json(msg: &Message) -> Value {
    match msg {
        Message::Text(txt) => serde_json::from_str(txt).expect("invalid JSON from server"),
        other => panic!("expected Text frame, got {other:?}"),
    }
}

// ── WebSocket ───────────────────────────────────────────────────────────

#[tokio::test]
async fn ws_connect_receives_open_actions_on_sync() {
    timeout(TEST_TIMEOUT, async {
        let (addr, env) = start_server().await;
        let lead = env.add_leads(1).await.remove(0);
        let id = pending_action(&env, &lead, "Hi Lead0, how is the quarter going").await;

        let (mut ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        let json = parse_ws_json(&ws.next().await.unwrap().unwrap());

        assert_eq!(json["type"], "sync");
        let actions = json["actions"].as_array().unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0]["id"], id.to_string());
        assert_eq!(actions[0]["status"], "pending");
        assert_eq!(actions[0]["message_type"], "first_outreach");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_receives_enqueue_and_decision_events() {
    timeout(TEST_TIMEOUT, async {
        let (addr, env) = start_server().await;
        let lead = env.add_leads(1).await.remove(0);

        let (mut ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        let sync = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert!(sync["actions"].as_array().unwrap().is_empty());

        let id = pending_action(&env, &lead, "Hi Lead0, quick question").await;
        let json = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(json["type"], "enqueued");
        assert_eq!(json["action"]["id"], id.to_string());
        assert_eq!(json["action"]["payload"], "Hi Lead0, quick question");

        env.queue.decide(id, Decision::Reject).await.unwrap();
        let json = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(json["type"], "decided");
        assert_eq!(json["id"], id.to_string());
        assert_eq!(json["status"], "rejected");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_client_can_approve() {
    timeout(TEST_TIMEOUT, async {
        let (addr, env) = start_server().await;
        let lead = env.add_leads(1).await.remove(0);
        let id = pending_action(&env, &lead, "Hi Lead0, saw your post").await;

        let (mut ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        let _ = ws.next().await.unwrap().unwrap();

        let command = json!({ "type": "approve", "action_id": id });
        ws.send(Message::Text(command.to_string().into())).await.unwrap();

        let json = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(json["type"], "decided");
        assert_eq!(json["status"], "approved");

        let action = env.queue.get(id).await.unwrap().unwrap();
        assert_eq!(action.status, ActionStatus::Approved);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_failed_commands_get_error_frames() {
    timeout(TEST_TIMEOUT, async {
        let (addr, env) = start_server().await;
        let leads = env.add_leads(2).await;

        let (mut ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        let _ = ws.next().await.unwrap().unwrap();

        ws.send(Message::Text("not json".into())).await.unwrap();
        let json = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(json["type"], "error");
        assert!(json["action_id"].is_null());

        let unknown = Uuid::new_v4();
        ws.send(Message::Text(json!({ "type": "approve", "action_id": unknown }).to_string().into()))
            .await
            .unwrap();
        let json = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(json["type"], "error");
        assert_eq!(json["action_id"], unknown.to_string());

        // Rejecting an action someone already approved conflicts.
        let id = pending_action(&env, &leads[0], "Hi Lead0").await;
        assert_eq!(parse_ws_json(&ws.next().await.unwrap().unwrap())["type"], "enqueued");
        env.queue.decide(id, Decision::Approve).await.unwrap();
        assert_eq!(parse_ws_json(&ws.next().await.unwrap().unwrap())["type"], "decided");

        ws.send(Message::Text(json!({ "type": "reject", "action_id": id }).to_string().into()))
            .await
            .unwrap();
        let json = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(json["type"], "error");
        assert_eq!(json["action_id"], id.to_string());
        assert!(json["message"].as_str().unwrap().contains("approved"));
        assert_eq!(env.queue.get(id).await.unwrap().unwrap().status, ActionStatus::Approved);

        // The socket is still alive and delivers the next event.
        let next = pending_action(&env, &leads[1], "Hi Lead1").await;
        let json = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(json["type"], "enqueued");
        assert_eq!(json["action"]["id"], next.to_string());
    })
    .await
    .expect("test timed out");
}

// ── Actions ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn rest_approve_and_reject() {
    timeout(TEST_TIMEOUT, async {
        let (addr, env) = start_server().await;
        let leads = env.add_leads(2).await;
        let a = pending_action(&env, &leads[0], "first").await;
        let b = pending_action(&env, &leads[1], "second").await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("http://{addr}/api/actions/{a}/approve"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "approved");

        // Same decision again is fine.
        let resp = client
            .post(format!("http://{addr}/api/actions/{a}/approve"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        // The opposite decision conflicts.
        let resp = client
            .post(format!("http://{addr}/api/actions/{a}/reject"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 409);
        let body: Value = resp.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("approved"));

        let resp = client
            .post(format!("http://{addr}/api/actions/{b}/reject"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(env.queue.get(b).await.unwrap().unwrap().status, ActionStatus::Rejected);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn rest_unknown_and_malformed_ids() {
    timeout(TEST_TIMEOUT, async {
        let (addr, _env) = start_server().await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("http://{addr}/api/actions/{}/approve", Uuid::new_v4()))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);

        let resp = client
            .post(format!("http://{addr}/api/actions/not-a-uuid/approve"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "Invalid action ID");

        let resp = client
            .get(format!("http://{addr}/api/leads/{}", Uuid::new_v4()))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn rest_lists_actions_by_status() {
    timeout(TEST_TIMEOUT, async {
        let (addr, env) = start_server().await;
        let leads = env.add_leads(3).await;
        let a = pending_action(&env, &leads[0], "one").await;
        pending_action(&env, &leads[1], "two").await;
        pending_action(&env, &leads[2], "three").await;
        env.queue.decide(a, Decision::Approve).await.unwrap();

        let all: Vec<Value> = reqwest::get(format!("http://{addr}/api/actions"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(all.len(), 3);

        let pending: Vec<Value> = reqwest::get(format!("http://{addr}/api/actions?status=pending"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(pending.len(), 2);

        let approved: Vec<Value> = reqwest::get(format!("http://{addr}/api/actions?status=approved"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(approved.len(), 1);
        assert_eq!(approved[0]["id"], a.to_string());

        let resp = reqwest::get(format!("http://{addr}/api/actions?status=bogus"))
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    })
    .await
    .expect("test timed out");
}

// ── Leads ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn rest_ingests_leads_idempotently() {
    timeout(TEST_TIMEOUT, async {
        let (addr, _env) = start_server().await;
        let client = reqwest::Client::new();
        let profile = json!({
            "profile_url": "https://www.linkedin.com/in/dana",
            "name": "Dana Levi",
            "company": "Acme",
        });

        let resp = client
            .post(format!("http://{addr}/api/leads"))
            .json(&profile)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let first: Value = resp.json().await.unwrap();
        assert_eq!(first["state"], "new");

        let second: Value = client
            .post(format!("http://{addr}/api/leads"))
            .json(&profile)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(first["id"], second["id"]);

        let leads: Vec<Value> = reqwest::get(format!("http://{addr}/api/leads"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(leads.len(), 1);

        let resp = client
            .post(format!("http://{addr}/api/leads"))
            .json(&json!({ "profile_url": " ", "name": "Nobody" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn rest_scrapes_profile_into_lead() {
    timeout(TEST_TIMEOUT, async {
        let (addr, env) = start_server().await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("http://{addr}/api/leads/scrape"))
            .json(&json!({ "profile_url": "https://www.linkedin.com/in/noa" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["state"], "new");
        assert_eq!(body["profile"]["name"], "Scraped noa");
        assert_eq!(body["profile"]["company"], "Acme");

        let lead = env
            .db
            .get_lead_by_profile("https://www.linkedin.com/in/noa")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(body["id"], lead.id.to_string());

        let resp = client
            .post(format!("http://{addr}/api/leads/scrape"))
            .json(&json!({ "profile_url": "" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn rest_records_outcomes() {
    timeout(TEST_TIMEOUT, async {
        let (addr, env) = start_server().await;
        let lead = env.add_leads(1).await.remove(0);
        let client = reqwest::Client::new();
        let url = format!("http://{addr}/api/leads/{}/outcome", lead.id);

        // Only human outcomes are accepted.
        let resp = client
            .post(&url)
            .json(&json!({ "outcome": "in_conversation" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 409);

        let resp = client
            .post(&url)
            .json(&json!({ "outcome": "not_interested" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["state"], "not_interested");

        // Terminal: repeating is fine, changing is not.
        let resp = client
            .post(&url)
            .json(&json!({ "outcome": "not_interested" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let resp = client
            .post(&url)
            .json(&json!({ "outcome": "won" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 409);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn rest_booking_moves_conversation_to_meeting() {
    timeout(TEST_TIMEOUT, async {
        let (addr, env) = start_server().await;
        let leads = env.add_leads(2).await;
        let client = reqwest::Client::new();

        // Bring the first lead into conversation.
        env.db
            .transition_lead(leads[0].id, LeadState::New, LeadState::InConversation)
            .await
            .unwrap();

        let booking = json!({ "scheduled_for": local(21, 14, 0), "note": "intro call" });
        let resp = client
            .post(format!("http://{addr}/api/leads/{}/booking", leads[0].id))
            .json(&booking)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["meeting_scheduled"], true);
        let lead = env.db.get_lead(leads[0].id).await.unwrap().unwrap();
        assert_eq!(lead.state, LeadState::MeetingScheduled);
        assert!(lead.follow_up_due_at.is_none());

        // A booking for a lead that never replied is stored but does not
        // move it.
        let body: Value = client
            .post(format!("http://{addr}/api/leads/{}/booking", leads[1].id))
            .json(&booking)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["meeting_scheduled"], false);
        let lead = env.db.get_lead(leads[1].id).await.unwrap().unwrap();
        assert_eq!(lead.state, LeadState::New);

        let resp = client
            .post(format!("http://{addr}/api/leads/{}/booking", Uuid::new_v4()))
            .json(&booking)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn health_reports_ok() {
    timeout(TEST_TIMEOUT, async {
        let (addr, _env) = start_server().await;
        let body: Value = reqwest::get(format!("http://{addr}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "outreach-agent");
    })
    .await
    .expect("test timed out");
}
