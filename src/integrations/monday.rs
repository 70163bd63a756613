//! Monday.com CRM over the GraphQL API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tracing::debug;

use super::{Crm, CrmItem};
use crate::error::ExternalError;
use crate::leads::{Direction, Lead, LeadState, MessageRecord};

const SERVICE: &str = "monday";
const DEFAULT_API_URL: &str = "https://api.monday.com/v2";

const CREATE_ITEM: &str = r#"
mutation ($board_id: ID!, $item_name: String!, $column_values: JSON!) {
    create_item (board_id: $board_id, item_name: $item_name, column_values: $column_values) {
        id
    }
}"#;

const CHANGE_COLUMNS: &str = r#"
mutation ($board_id: ID!, $item_id: ID!, $column_values: JSON!) {
    change_multiple_column_values (board_id: $board_id, item_id: $item_id, column_values: $column_values) {
        id
    }
}"#;

const ITEM_LOG: &str = r#"
query ($item_id: ID!) {
    items (ids: [$item_id]) {
        column_values (ids: ["long_text"]) {
            id
            text
        }
    }
}"#;

const BOARD_ITEMS: &str = r#"
query ($board_id: ID!) {
    boards (ids: [$board_id]) {
        items_page (limit: 500) {
            cursor
            items {
                id
                column_values (ids: ["status", "link"]) {
                    id
                    text
                    value
                }
            }
        }
    }
}"#;

const NEXT_ITEMS: &str = r#"
query ($cursor: String!) {
    next_items_page (limit: 500, cursor: $cursor) {
        cursor
        items {
            id
            column_values (ids: ["status", "link"]) {
                id
                text
                value
            }
        }
    }
}"#;

/// Monday.com board settings. Column ids match the board layout created by
/// the board setup script.
#[derive(Debug, Clone)]
pub struct MondayConfig {
    pub api_key: SecretString,
    pub board_id: String,
    pub api_url: String,
}

impl MondayConfig {
    /// Build from environment variables. Returns `None` if `MONDAY_API_KEY`
    /// is unset.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("MONDAY_API_KEY").ok()?;
        Some(Self {
            api_key: SecretString::from(api_key),
            board_id: std::env::var("MONDAY_BOARD_ID").unwrap_or_else(|_| "5088565278".into()),
            api_url: std::env::var("MONDAY_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.into()),
        })
    }
}

/// Monday.com-backed [`Crm`].
pub struct MondayCrm {
    config: MondayConfig,
    client: reqwest::Client,
}

impl MondayCrm {
    pub fn new(config: MondayConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    async fn execute(&self, query: &str, variables: Value) -> Result<Value, ExternalError> {
        let resp = self
            .client
            .post(&self.config.api_url)
            .header("Authorization", self.config.api_key.expose_secret())
            .json(&json!({ "query": query, "variables": variables }))
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

        let body: Value = resp.json().await.map_err(|e| ExternalError::InvalidResponse {
            service: SERVICE.into(),
            reason: e.to_string(),
        })?;

        if let Some(errors) = body.get("errors").filter(|e| !e.is_null()) {
            return Err(ExternalError::Rejected {
                service: SERVICE.into(),
                reason: errors.to_string(),
            });
        }
        Ok(body)
    }

    async fn change_columns(&self, item_id: &str, columns: Value) -> Result<(), ExternalError> {
        self.execute(
            CHANGE_COLUMNS,
            json!({
                "board_id": self.config.board_id,
                "item_id": item_id,
                "column_values": columns.to_string(),
            }),
        )
        .await?;
        Ok(())
    }
}

/// Column values for a lead's board item.
fn lead_columns(lead: &Lead) -> Value {
    json!({
        "text": lead.profile.company.clone().unwrap_or_default(),
        "text6": lead.profile.position.clone().unwrap_or_default(),
        "link": { "url": lead.profile.profile_url, "text": "LinkedIn" },
        "status": { "label": lead.state.crm_label() },
    })
}

fn status_columns(state: LeadState) -> Value {
    json!({ "status": { "label": state.crm_label() } })
}

/// One conversation log entry. Times are UTC.
fn log_entry(message: &MessageRecord) -> String {
    let who = match message.direction {
        Direction::Outbound => "Sent",
        Direction::Inbound => "Received",
    };
    format!("[{} {who}]\n{}", message.at.format("%Y-%m-%d %H:%M"), message.content)
}

fn append_log(current: &str, entry: &str) -> String {
    let current = current.trim();
    if current.is_empty() {
        entry.to_string()
    } else {
        format!("{current}\n\n{entry}")
    }
}

fn current_log(body: &Value) -> String {
    body.pointer("/data/items/0/column_values")
        .and_then(Value::as_array)
        .and_then(|cols| {
            cols.iter()
                .find(|c| c.get("id").and_then(Value::as_str) == Some("long_text"))
        })
        .and_then(|c| c.get("text"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// The link column's `value` is a JSON string holding `{"url": ..}`.
fn link_url(column: &Value) -> Option<String> {
    let raw = column.get("value").and_then(Value::as_str)?;
    let parsed: Value = serde_json::from_str(raw).ok()?;
    parsed
        .get("url")
        .and_then(Value::as_str)
        .filter(|u| !u.is_empty())
        .map(str::to_string)
}

/// Items on one page whose status label is `label`. Items without a
/// LinkedIn link are skipped.
fn items_with_label(page: &Value, label: &str) -> Vec<CrmItem> {
    let Some(items) = page.get("items").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let item_id = match item.get("id")? {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => return None,
            };
            let columns = item.get("column_values")?.as_array()?;
            let column = |id: &str| {
                columns
                    .iter()
                    .find(|c| c.get("id").and_then(Value::as_str) == Some(id))
            };
            let status = column("status")?.get("text").and_then(Value::as_str)?;
            if status != label {
                return None;
            }
            let profile_url = link_url(column("link")?)?;
            Some(CrmItem {
                item_id,
                profile_url,
            })
        })
        .collect()
}

fn page_cursor(page: &Value) -> Option<String> {
    page.get("cursor")
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
}

/// Pull `data.<field>.id` out of a mutation response.
fn item_id(body: &Value, field: &str) -> Result<String, ExternalError> {
    match body.pointer(&format!("/data/{field}/id")) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(ExternalError::InvalidResponse {
            service: SERVICE.into(),
            reason: format!("missing {field}.id"),
        }),
    }
}

#[async_trait]
impl Crm for MondayCrm {
    async fn upsert_lead(&self, lead: &Lead) -> Result<String, ExternalError> {
        let columns = lead_columns(lead).to_string();

        if let Some(existing) = &lead.crm_item_id {
            let body = self
                .execute(
                    CHANGE_COLUMNS,
                    json!({
                        "board_id": self.config.board_id,
                        "item_id": existing,
                        "column_values": columns,
                    }),
                )
                .await?;
            return item_id(&body, "change_multiple_column_values");
        }

        let body = self
            .execute(
                CREATE_ITEM,
                json!({
                    "board_id": self.config.board_id,
                    "item_name": lead.profile.name,
                    "column_values": columns,
                }),
            )
            .await?;
        let id = item_id(&body, "create_item")?;
        debug!(lead_id = %lead.id, item_id = %id, "CRM item created");
        Ok(id)
    }

    async fn update_status(&self, item_id: &str, state: LeadState) -> Result<(), ExternalError> {
        self.change_columns(item_id, status_columns(state)).await
    }

    async fn append_conversation_log(
        &self,
        item_id: &str,
        message: &MessageRecord,
    ) -> Result<(), ExternalError> {
        let body = self.execute(ITEM_LOG, json!({ "item_id": item_id })).await?;
        let log = append_log(&current_log(&body), &log_entry(message));
        self.change_columns(item_id, json!({ "long_text": { "text": log } }))
            .await
    }

    async fn update_last_message_date(
        &self,
        item_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), ExternalError> {
        self.change_columns(
            item_id,
            json!({ "date": { "date": at.format("%Y-%m-%d").to_string() } }),
        )
        .await
    }

    async fn items_in_status(&self, state: LeadState) -> Result<Vec<CrmItem>, ExternalError> {
        let label = state.crm_label();
        let body = self
            .execute(BOARD_ITEMS, json!({ "board_id": self.config.board_id }))
            .await?;
        let mut page = body
            .pointer("/data/boards/0/items_page")
            .cloned()
            .unwrap_or(Value::Null);

        let mut found = Vec::new();
        loop {
            found.extend(items_with_label(&page, label));
            let Some(cursor) = page_cursor(&page) else {
                break;
            };
            let body = self.execute(NEXT_ITEMS, json!({ "cursor": cursor })).await?;
            page = body
                .pointer("/data/next_items_page")
                .cloned()
                .unwrap_or(Value::Null);
        }
        debug!(%state, count = found.len(), "Read CRM items by status");
        Ok(found)
    }
}
