//! PhantomBuster automation backend.
//!
//! Each outbound operation launches a configured phantom (agent) with a JSON
//! argument and waits for the run to finish. The message and connection
//! phantoms echo the `dedupeKey` argument into their result rows, which is
//! what [`PhantomBusterBackend::lookup_dispatch`] searches.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{AutomationBackend, InboundReply, ReplyStream};
use crate::error::ExternalError;
use crate::leads::LeadProfile;

const SERVICE: &str = "phantombuster";

const DEFAULT_API_URL_V1: &str = "https://phantombuster.com/api/v1";
const DEFAULT_API_URL_V2: &str = "https://api.phantombuster.com/api/v2";

/// PhantomBuster connection settings.
#[derive(Debug, Clone)]
pub struct PhantomBusterConfig {
    pub api_key: SecretString,
    pub api_url_v1: String,
    pub api_url_v2: String,
    /// Phantom that sends LinkedIn messages.
    pub message_agent_id: String,
    /// Phantom that sends connection requests.
    pub connection_agent_id: Option<String>,
    /// Phantom that visits profiles.
    pub profile_agent_id: Option<String>,
    /// Phantom that scrapes the LinkedIn inbox.
    pub inbox_agent_id: Option<String>,
    /// Phantom that scrapes profile details.
    pub scraper_agent_id: Option<String>,
    /// Delay between run status polls.
    pub poll_interval: Duration,
}

impl PhantomBusterConfig {
    /// Build from environment variables. Returns `None` if
    /// `PHANTOMBUSTER_API_KEY` or `PHANTOMBUSTER_MESSAGE_AGENT_ID` is unset.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("PHANTOMBUSTER_API_KEY").ok()?;
        let message_agent_id = std::env::var("PHANTOMBUSTER_MESSAGE_AGENT_ID").ok()?;

        let poll_interval_secs: u64 = std::env::var("PHANTOMBUSTER_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        Some(Self {
            api_key: SecretString::from(api_key),
            api_url_v1: std::env::var("PHANTOMBUSTER_API_URL_V1")
                .unwrap_or_else(|_| DEFAULT_API_URL_V1.to_string()),
            api_url_v2: std::env::var("PHANTOMBUSTER_API_URL_V2")
                .unwrap_or_else(|_| DEFAULT_API_URL_V2.to_string()),
            message_agent_id,
            connection_agent_id: std::env::var("PHANTOMBUSTER_CONNECTION_AGENT_ID").ok(),
            profile_agent_id: std::env::var("PHANTOMBUSTER_PROFILE_AGENT_ID").ok(),
            inbox_agent_id: std::env::var("PHANTOMBUSTER_INBOX_AGENT_ID").ok(),
            scraper_agent_id: std::env::var("PHANTOMBUSTER_SCRAPER_AGENT_ID").ok(),
            poll_interval: Duration::from_secs(poll_interval_secs),
        })
    }
}

/// State of the most recent run of a phantom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunStatus {
    Running,
    Finished,
    Error,
}

#[derive(Debug, Clone)]
struct AgentOutput {
    container_id: String,
    status: RunStatus,
    results: Vec<Value>,
    error: Option<String>,
}

/// PhantomBuster-backed [`AutomationBackend`].
pub struct PhantomBusterBackend {
    config: PhantomBusterConfig,
    client: reqwest::Client,
}

impl PhantomBusterBackend {
    pub fn new(config: PhantomBusterConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Launch a phantom. Returns the container id of the new run.
    async fn launch(&self, agent_id: &str, argument: Value) -> Result<String, ExternalError> {
        let resp = self
            .client
            .post(format!("{}/agent/{agent_id}/launch", self.config.api_url_v1))
            .header("X-Phantombuster-Key-1", self.config.api_key.expose_secret())
            .json(&json!({ "argument": argument.to_string() }))
            .send()
            .await
            .map_err(|e| ExternalError::http(SERVICE, e))?;

        let body = read_json(resp).await?;
        if body.get("status").and_then(Value::as_str) == Some("error") {
            return Err(ExternalError::Rejected {
                service: SERVICE.into(),
                reason: body
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("launch failed")
                    .to_string(),
            });
        }

        let data = body.get("data").unwrap_or(&body);
        let container_id = data
            .get("containerId")
            .map(value_to_string)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ExternalError::InvalidResponse {
                service: SERVICE.into(),
                reason: "launch response has no containerId".into(),
            })?;

        debug!(agent_id, container_id = %container_id, "Phantom launched");
        Ok(container_id)
    }

    async fn fetch_output(&self, agent_id: &str) -> Result<AgentOutput, ExternalError> {
        let resp = self
            .client
            .get(format!("{}/agents/fetch-output", self.config.api_url_v2))
            .query(&[("id", agent_id)])
            .header("X-Phantombuster-Key-1", self.config.api_key.expose_secret())
            .send()
            .await
            .map_err(|e| ExternalError::http(SERVICE, e))?;

        Ok(parse_output(&read_json(resp).await?))
    }

    /// Launch a phantom and poll until the run it started is over. The
    /// caller bounds the total wait.
    ///
    /// `fetch-output` reports the agent's latest container, which can still
    /// be a previous run right after launch. Only a status for the launched
    /// container ends the wait.
    async fn run(&self, agent_id: &str, argument: Value) -> Result<AgentOutput, ExternalError> {
        let container_id = self.launch(agent_id, argument).await?;
        loop {
            let output = self.fetch_output(agent_id).await?;
            if output.container_id != container_id {
                debug!(
                    agent_id,
                    launched = %container_id,
                    reported = %output.container_id,
                    "Output is from another run"
                );
                tokio::time::sleep(self.config.poll_interval).await;
                continue;
            }
            match output.status {
                RunStatus::Running => tokio::time::sleep(self.config.poll_interval).await,
                RunStatus::Error => {
                    return Err(ExternalError::Rejected {
                        service: SERVICE.into(),
                        reason: output.error.unwrap_or_else(|| "phantom run failed".into()),
                    });
                }
                RunStatus::Finished => return Ok(output),
            }
        }
    }

    fn agent<'a>(&self, agent: &'a Option<String>, what: &str) -> Result<&'a str, ExternalError> {
        agent.as_deref().ok_or_else(|| ExternalError::Rejected {
            service: SERVICE.into(),
            reason: format!("no {what} phantom configured"),
        })
    }
}

async fn read_json(resp: reqwest::Response) -> Result<Value, ExternalError> {
    let status = resp.status();
    if status.is_client_error() {
        let text = resp.text().await.unwrap_or_default();
        return Err(ExternalError::Rejected {
            service: SERVICE.into(),
            reason: format!("{status}: {text}"),
        });
    }
    if !status.is_success() {
        return Err(ExternalError::http(SERVICE, status));
    }
    resp.json()
        .await
        .map_err(|e| ExternalError::InvalidResponse {
            service: SERVICE.into(),
            reason: e.to_string(),
        })
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// `resultObject` arrives either as a JSON array or as a string holding one.
fn parse_output(body: &Value) -> AgentOutput {
    let status = match body.get("status").and_then(Value::as_str) {
        Some("running") | Some("launching") => RunStatus::Running,
        Some("error") => RunStatus::Error,
        _ => RunStatus::Finished,
    };

    let results = match body.get("resultObject") {
        Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Array(items)) => items,
            Ok(single @ Value::Object(_)) => vec![single],
            _ => Vec::new(),
        },
        Some(Value::Array(items)) => items.clone(),
        Some(single @ Value::Object(_)) => vec![single.clone()],
        _ => Vec::new(),
    };

    AgentOutput {
        container_id: body.get("containerId").map(value_to_string).unwrap_or_default(),
        status,
        results,
        error: body
            .get("error")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
    }
}

/// Find the run that carried `dedupe_key`.
fn find_dispatch(output: &AgentOutput, dedupe_key: &str) -> Option<String> {
    output
        .results
        .iter()
        .find(|r| r.get("dedupeKey").and_then(Value::as_str) == Some(dedupe_key))
        .map(|r| {
            r.get("containerId")
                .map(value_to_string)
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| output.container_id.clone())
        })
}

/// Inbox scraper rows → replies newer than `since`.
fn parse_replies(output: &AgentOutput, since: DateTime<Utc>) -> Vec<InboundReply> {
    output
        .results
        .iter()
        .filter_map(|r| {
            let reply_id = r.get("messageId").map(value_to_string)?;
            let profile_url = r
                .get("profileUrl")
                .and_then(Value::as_str)?
                .to_string();
            let content = r.get("message").and_then(Value::as_str)?.to_string();
            let received_at = r
                .get("date")
                .and_then(Value::as_str)
                .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
                .map(|d| d.with_timezone(&Utc));

            let Some(received_at) = received_at else {
                warn!(reply_id = %reply_id, "Skipping inbox row without a valid date");
                return None;
            };
            Some(InboundReply {
                reply_id,
                profile_url,
                content,
                received_at,
            })
        })
        .filter(|r| r.received_at > since)
        .collect()
}

fn text_field(row: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| row.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Profile scraper row for `profile_url`. Falls back to the first row when
/// the scraper does not echo the url.
fn parse_profile(output: &AgentOutput, profile_url: &str) -> Option<LeadProfile> {
    let row = output
        .results
        .iter()
        .find(|r| r.get("profileUrl").and_then(Value::as_str) == Some(profile_url))
        .or_else(|| output.results.first())?;

    let name = text_field(row, &["fullName", "name"]).or_else(|| {
        let first = text_field(row, &["firstName"])?;
        Some(match text_field(row, &["lastName"]) {
            Some(last) => format!("{first} {last}"),
            None => first,
        })
    })?;

    Some(LeadProfile {
        profile_url: profile_url.to_string(),
        name,
        company: text_field(row, &["company", "companyName"]),
        position: text_field(row, &["jobTitle", "position"]),
        headline: text_field(row, &["headline"]),
        location: text_field(row, &["location"]),
        summary: text_field(row, &["summary", "description"]),
    })
}

#[async_trait]
impl AutomationBackend for PhantomBusterBackend {
    async fn send_message(
        &self,
        profile_url: &str,
        content: &str,
        dedupe_key: &str,
    ) -> Result<String, ExternalError> {
        self.run(
            &self.config.message_agent_id,
            json!({ "profileUrl": profile_url, "message": content, "dedupeKey": dedupe_key }),
        )
        .await
        .map(|output| output.container_id)
    }

    async fn send_connection(
        &self,
        profile_url: &str,
        note: &str,
        dedupe_key: &str,
    ) -> Result<String, ExternalError> {
        let agent = self.agent(&self.config.connection_agent_id, "connection")?;
        self.run(
            agent,
            json!({ "profileUrl": profile_url, "message": note, "dedupeKey": dedupe_key }),
        )
        .await
        .map(|output| output.container_id)
    }

    async fn view_profile(&self, profile_url: &str) -> Result<String, ExternalError> {
        let agent = self.agent(&self.config.profile_agent_id, "profile")?;
        self.run(agent, json!({ "profileUrl": profile_url }))
            .await
            .map(|output| output.container_id)
    }

    async fn scrape_profile(&self, profile_url: &str) -> Result<LeadProfile, ExternalError> {
        let agent = self.agent(&self.config.scraper_agent_id, "scraper")?;
        let output = self.run(agent, json!({ "profileUrl": profile_url })).await?;
        parse_profile(&output, profile_url).ok_or_else(|| ExternalError::InvalidResponse {
            service: SERVICE.into(),
            reason: format!("scraper returned no profile for {profile_url}"),
        })
    }

    async fn lookup_dispatch(&self, dedupe_key: &str) -> Result<Option<String>, ExternalError> {
        let agents = std::iter::once(self.config.message_agent_id.as_str())
            .chain(self.config.connection_agent_id.as_deref());

        for agent_id in agents {
            let output = self.fetch_output(agent_id).await?;
            if let Some(found) = find_dispatch(&output, dedupe_key) {
                return Ok(Some(found));
            }
            // A run still in flight may yet deliver the message.
            if output.status == RunStatus::Running {
                return Err(ExternalError::InvalidResponse {
                    service: SERVICE.into(),
                    reason: format!("phantom {agent_id} still running"),
                });
            }
        }
        Ok(None)
    }

    async fn fetch_replies(&self, since: DateTime<Utc>) -> Result<ReplyStream, ExternalError> {
        let Some(agent_id) = self.config.inbox_agent_id.as_deref() else {
            return Ok(Box::pin(stream::empty()));
        };
        let output = self.fetch_output(agent_id).await?;
        let replies = parse_replies(&output, since);
        debug!(count = replies.len(), "Fetched inbox replies");
        Ok(Box::pin(stream::iter(replies.into_iter().map(Ok))))
    }
}
