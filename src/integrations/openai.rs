//! OpenAI-compatible chat completions as a [`MessageGenerator`].

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;

use super::{DraftRequest, MessageGenerator};
use crate::error::ExternalError;
use crate::leads::{Direction, LeadProfile};
use crate::queue::model::MessageType;

const SERVICE: &str = "openai";

const DEFAULT_SYSTEM_PROMPT: &str = "You write short LinkedIn messages on behalf of a human \
operator reaching out to industry professionals. Sound like a real person, not a salesperson.\n\n\
Rules:\n\
- At most 30 words\n\
- No dashes; use commas or periods\n\
- No flattery\n\
- Never ask for a meeting in a first message\n\
- Output only the message text";

/// Generator settings.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: SecretString,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub system_prompt: String,
    /// Booking link offered in meeting requests.
    pub calendar_link: Option<String>,
}

impl OpenAiConfig {
    /// Build from environment variables. Returns `None` if `OPENAI_API_KEY`
    /// is unset.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").ok()?;
        Some(Self {
            api_key: SecretString::from(api_key),
            base_url: std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            model: std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o".into()),
            temperature: 0.7,
            max_tokens: 200,
            system_prompt: std::env::var("OUTREACH_SYSTEM_PROMPT")
                .unwrap_or_else(|_| DEFAULT_SYSTEM_PROMPT.into()),
            calendar_link: std::env::var("OUTREACH_CALENDAR_LINK").ok(),
        })
    }
}

/// Chat-completions generator.
pub struct OpenAiGenerator {
    config: OpenAiConfig,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiGenerator {
    pub fn new(config: OpenAiConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn user_prompt(&self, request: &DraftRequest) -> String {
        let profile = describe_profile(&request.profile);
        let first_name = request.profile.first_name();
        let history = request
            .history
            .iter()
            .map(|m| match m.direction {
                Direction::Outbound => format!("Me: {}", m.content),
                Direction::Inbound => format!("{first_name}: {}", m.content),
            })
            .collect::<Vec<_>>()
            .join("\n");
        let history = if history.is_empty() {
            "(no previous messages)".to_string()
        } else {
            history
        };

        match request.message_type {
            MessageType::FirstOutreach => format!(
                "Write a first message to this person.\n\n{profile}"
            ),
            MessageType::FollowUp => format!(
                "They have not answered my last message. Write a light follow-up.\n\n{profile}\n\nConversation so far:\n{history}"
            ),
            MessageType::Reply => {
                let last = request
                    .history
                    .iter()
                    .rev()
                    .find(|m| m.direction == Direction::Inbound)
                    .map(|m| m.content.as_str())
                    .unwrap_or_default();
                format!(
                    "Reply to their latest message: \"{last}\"\n\n{profile}\n\nConversation so far:\n{history}"
                )
            }
            MessageType::MeetingRequest => format!(
                "Suggest a short call.{link}\n\n{profile}\n\nConversation so far:\n{history}",
                link = self
                    .config
                    .calendar_link
                    .as_deref()
                    .map(|l| format!(" Offer this booking link: {l}"))
                    .unwrap_or_default()
            ),
        }
    }
}

fn describe_profile(profile: &LeadProfile) -> String {
    let unknown = "unknown";
    format!(
        "Name: {}\nPosition: {}\nCompany: {}\nHeadline: {}\nLocation: {}\nAbout: {}",
        profile.name,
        profile.position.as_deref().unwrap_or(unknown),
        profile.company.as_deref().unwrap_or(unknown),
        profile.headline.as_deref().unwrap_or(unknown),
        profile.location.as_deref().unwrap_or(unknown),
        profile.summary.as_deref().unwrap_or(unknown),
    )
}

#[async_trait]
impl MessageGenerator for OpenAiGenerator {
    async fn draft(&self, request: &DraftRequest) -> Result<String, ExternalError> {
        let body = json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": self.config.system_prompt },
                { "role": "user", "content": self.user_prompt(request) },
            ],
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
        });

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(self.config.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| ExternalError::http(SERVICE, e))?;

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

        let parsed: ChatResponse = resp.json().await.map_err(|e| ExternalError::InvalidResponse {
            service: SERVICE.into(),
            reason: e.to_string(),
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|s| s.trim().to_string())
            .ok_or_else(|| ExternalError::InvalidResponse {
                service: SERVICE.into(),
                reason: "no choices in response".into(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leads::MessageRecord;
    use chrono::Utc;
    use uuid::Uuid;

    fn generator() -> OpenAiGenerator {
        OpenAiGenerator::new(OpenAiConfig {
            api_key: SecretString::from("sk-test"),
            base_url: "http://localhost".into(),
            model: "gpt-4o".into(),
            temperature: 0.7,
            max_tokens: 200,
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            calendar_link: Some("https://cal.example/guy".into()),
        })
    }

    fn request(message_type: MessageType, history: Vec<MessageRecord>) -> DraftRequest {
        DraftRequest {
            profile: LeadProfile::new("https://linkedin.com/in/dana", "Dana Levi")
                .with_company("Acme")
                .with_position("VP Ops"),
            history,
            message_type,
        }
    }

    fn msg(direction: Direction, content: &str) -> MessageRecord {
        MessageRecord {
            id: Uuid::new_v4(),
            lead_id: Uuid::new_v4(),
            direction,
            content: content.into(),
            external_id: None,
            at: Utc::now(),
        }
    }

    #[test]
    fn first_outreach_prompt_has_profile_only() {
        let prompt = generator().user_prompt(&request(MessageType::FirstOutreach, vec![]));
        assert!(prompt.contains("Company: Acme"));
        assert!(prompt.contains("Headline: unknown"));
        assert!(!prompt.contains("Conversation so far"));
    }

    #[test]
    fn reply_prompt_quotes_latest_inbound() {
        let history = vec![
            msg(Direction::Outbound, "Hi Dana"),
            msg(Direction::Inbound, "Hi! what is this about?"),
        ];
        let prompt = generator().user_prompt(&request(MessageType::Reply, history));
        assert!(prompt.contains("\"Hi! what is this about?\""));
        assert!(prompt.contains("Me: Hi Dana"));
        assert!(prompt.contains("Dana: Hi! what is this about?"));
    }

    #[test]
    fn meeting_prompt_offers_link() {
        let prompt = generator().user_prompt(&request(MessageType::MeetingRequest, vec![]));
        assert!(prompt.contains("https://cal.example/guy"));
        assert!(prompt.contains("(no previous messages)"));
    }
}
