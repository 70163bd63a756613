//! Shared fakes and setup for integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Asia::Jerusalem;

use outreach_agent::config::OutreachConfig;
use outreach_agent::drafting::{DraftRules, Drafter};
use outreach_agent::error::ExternalError;
use outreach_agent::integrations::{
    AutomationBackend, BookingLedger, DraftRequest, InboundReply, MessageGenerator, ReplyStream,
};
use outreach_agent::leads::{Lead, LeadProfile};
use outreach_agent::queue::ApprovalQueue;
use outreach_agent::queue::model::MessageType;
use outreach_agent::reconciler::Reconciler;
use outreach_agent::scheduler::Scheduler;
use outreach_agent::store::{Database, LibSqlBackend};

/// Jerusalem local time in October 2026. The 19th is a Monday; the 23rd
/// and 24th are the Fri/Sat rest days.
pub fn local(day: u32, h: u32, m: u32) -> DateTime<Utc> {
    Jerusalem
        .with_ymd_and_hms(2026, 10, day, h, m, 0)
        .unwrap()
        .with_timezone(&Utc)
}

/// One call the fake backend received.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub profile_url: String,
    pub content: String,
    pub dedupe_key: String,
}

/// In-memory automation backend. Remembers every delivery by dedupe key
/// so lookups behave like the real idempotency record.
#[derive(Default)]
pub struct FakeBackend {
    pub sent: Mutex<Vec<SentMessage>>,
    pub delivered: Mutex<HashMap<String, String>>,
    pub replies: Mutex<Vec<InboundReply>>,
}

impl FakeBackend {
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    /// Pretend a send for `dedupe_key` reached LinkedIn without the caller
    /// ever hearing back.
    pub fn deliver_silently(&self, dedupe_key: &str) {
        self.delivered
            .lock()
            .unwrap()
            .insert(dedupe_key.to_string(), format!("run-{dedupe_key}"));
    }

    pub fn push_reply(&self, reply_id: &str, profile_url: &str, at: DateTime<Utc>) {
        self.replies.lock().unwrap().push(InboundReply {
            reply_id: reply_id.into(),
            profile_url: profile_url.into(),
            content: format!("reply {reply_id}"),
            received_at: at,
        });
    }
}

#[async_trait]
impl AutomationBackend for FakeBackend {
    async fn send_message(
        &self,
        profile_url: &str,
        content: &str,
        dedupe_key: &str,
    ) -> Result<String, ExternalError> {
        self.sent.lock().unwrap().push(SentMessage {
            profile_url: profile_url.into(),
            content: content.into(),
            dedupe_key: dedupe_key.into(),
        });
        let dispatch_id = format!("run-{dedupe_key}");
        self.delivered
            .lock()
            .unwrap()
            .insert(dedupe_key.to_string(), dispatch_id.clone());
        Ok(dispatch_id)
    }

    async fn send_connection(
        &self,
        profile_url: &str,
        note: &str,
        dedupe_key: &str,
    ) -> Result<String, ExternalError> {
        self.send_message(profile_url, note, dedupe_key).await
    }

    async fn view_profile(&self, _profile_url: &str) -> Result<String, ExternalError> {
        Ok("view".into())
    }

    async fn scrape_profile(&self, profile_url: &str) -> Result<LeadProfile, ExternalError> {
        let handle = profile_url.rsplit('/').next().unwrap_or_default();
        Ok(LeadProfile::new(profile_url, format!("Scraped {handle}")).with_company("Acme"))
    }

    async fn lookup_dispatch(&self, dedupe_key: &str) -> Result<Option<String>, ExternalError> {
        Ok(self.delivered.lock().unwrap().get(dedupe_key).cloned())
    }

    async fn fetch_replies(&self, since: DateTime<Utc>) -> Result<ReplyStream, ExternalError> {
        let replies: Vec<_> = self
            .replies
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.received_at > since)
            .cloned()
            .map(Ok)
            .collect();
        Ok(Box::pin(futures::stream::iter(replies)))
    }
}

/// Generator that writes a short, rule-abiding message naming the lead,
/// worded differently for each message type.
pub struct FakeGenerator;

#[async_trait]
impl MessageGenerator for FakeGenerator {
    async fn draft(&self, request: &DraftRequest) -> Result<String, ExternalError> {
        let name = request.profile.first_name();
        Ok(match request.message_type {
            MessageType::FirstOutreach => {
                format!("Hi {name}, curious how things are going on your side")
            }
            MessageType::Reply => format!("Thanks {name}, good to hear from you"),
            MessageType::FollowUp => format!("Hi {name}, any news since we last spoke?"),
            MessageType::MeetingRequest => format!("{name}, would a short call next week work?"),
        })
    }
}

pub fn test_config() -> OutreachConfig {
    OutreachConfig {
        dispatch_backoff: Duration::from_millis(1),
        ..OutreachConfig::default()
    }
}

/// Everything a scenario needs, wired against one database.
pub struct Env {
    pub db: Arc<dyn Database>,
    pub queue: Arc<ApprovalQueue>,
    pub backend: Arc<FakeBackend>,
    pub scheduler: Arc<Scheduler>,
    pub reconciler: Arc<Reconciler>,
}

impl Env {
    pub async fn memory(config: OutreachConfig) -> Self {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        Self::wire(db, Arc::new(FakeBackend::default()), Arc::new(FakeGenerator), config)
    }

    pub async fn with_generator(generator: Arc<dyn MessageGenerator>, config: OutreachConfig) -> Self {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        Self::wire(db, Arc::new(FakeBackend::default()), generator, config)
    }

    pub async fn file(path: &Path, backend: Arc<FakeBackend>, config: OutreachConfig) -> Self {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(path).await.unwrap());
        Self::wire(db, backend, Arc::new(FakeGenerator), config)
    }

    fn wire(
        db: Arc<dyn Database>,
        backend: Arc<FakeBackend>,
        generator: Arc<dyn MessageGenerator>,
        config: OutreachConfig,
    ) -> Self {
        let queue = ApprovalQueue::new(
            Arc::clone(&db),
            chrono::Duration::days(i64::from(config.follow_up_after_days)),
        );
        let drafter = Drafter::new(
            generator,
            DraftRules::new().unwrap(),
            config.external_timeout,
            config.generation_attempts,
        );
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&db),
            Arc::clone(&queue),
            drafter,
            Arc::clone(&backend) as Arc<dyn AutomationBackend>,
            config.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&db),
            Arc::clone(&backend) as Arc<dyn AutomationBackend>,
            Arc::new(BookingLedger::new(Arc::clone(&db))),
            config.external_timeout,
        ));
        Self {
            db,
            queue,
            backend,
            scheduler,
            reconciler,
        }
    }

    pub async fn add_leads(&self, n: usize) -> Vec<Lead> {
        let mut leads = Vec::new();
        for i in 0..n {
            let profile = LeadProfile::new(
                format!("https://www.linkedin.com/in/lead-{i}"),
                format!("Lead{i} Cohen"),
            )
            .with_company(format!("Company {i}"));
            leads.push(self.reconciler.ingest_lead(&profile).await.unwrap());
        }
        leads
    }
}
