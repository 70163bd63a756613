//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. A single connection is
//! shared; writes are serialized through `write_lock` so that the
//! multi-statement dispatch transaction never interleaves with another
//! writer on the same connection.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::guard::{ActionKind, ActionLogEntry};
use crate::integrations::Booking;
use crate::leads::{Direction, Lead, LeadProfile, LeadState, MessageRecord};
use crate::queue::model::{Action, ActionStatus};
use crate::store::migrations;
use crate::store::traits::{Database, DispatchRecord};

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_leads(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Lead>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut leads = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            match row_to_lead(&row) {
                Ok(lead) => leads.push(lead),
                Err(e) => warn!("Skipping lead row: {e}"),
            }
        }

        for lead in &mut leads {
            lead.history = self.lead_messages(lead.id).await?;
        }
        Ok(leads)
    }

    async fn query_actions(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Action>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut actions = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            match row_to_action(&row) {
                Ok(action) => actions.push(action),
                Err(e) => warn!("Skipping action row: {e}"),
            }
        }
        Ok(actions)
    }

    async fn exists(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
        Ok(row.is_some())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format. Fixed width, so text comparison in SQL
/// orders the same as time.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(ts(dt)),
        None => libsql::Value::Null,
    }
}

/// Read a nullable text column.
fn opt_col(row: &libsql::Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid {s}: {e}")))
}

fn col_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Serialization(format!("row parse: {e}"))
}

const LEAD_COLUMNS: &str = "id, profile_url, name, company, position, headline, location, summary, state, last_action_at, follow_up_due_at, crm_item_id, crm_synced_state, created_at, seq";

const ACTION_COLUMNS: &str = "id, kind, lead_id, payload, message_type, status, created_at, decided_at, dispatched_at, claimed_at, attempts, last_error, dispatch_id, failure_reason";

const MESSAGE_COLUMNS: &str = "id, lead_id, direction, content, external_id, at";

fn row_to_lead(row: &libsql::Row) -> Result<Lead, DatabaseError> {
    let id: String = row.get(0).map_err(col_err)?;
    let state: String = row.get(8).map_err(col_err)?;
    let created: String = row.get(13).map_err(col_err)?;

    Ok(Lead {
        id: parse_uuid(&id)?,
        profile: LeadProfile {
            profile_url: row.get(1).map_err(col_err)?,
            name: row.get(2).map_err(col_err)?,
            company: opt_col(row, 3),
            position: opt_col(row, 4),
            headline: opt_col(row, 5),
            location: opt_col(row, 6),
            summary: opt_col(row, 7),
        },
        state: state.parse().map_err(DatabaseError::Serialization)?,
        last_action_at: parse_optional_datetime(&opt_col(row, 9)),
        follow_up_due_at: parse_optional_datetime(&opt_col(row, 10)),
        crm_item_id: opt_col(row, 11),
        crm_synced_state: opt_col(row, 12).and_then(|s| s.parse().ok()),
        created_at: parse_datetime(&created),
        seq: row.get(14).map_err(col_err)?,
        history: Vec::new(),
    })
}

fn row_to_action(row: &libsql::Row) -> Result<Action, DatabaseError> {
    let id: String = row.get(0).map_err(col_err)?;
    let kind: String = row.get(1).map_err(col_err)?;
    let lead_id: String = row.get(2).map_err(col_err)?;
    let status: String = row.get(5).map_err(col_err)?;
    let created: String = row.get(6).map_err(col_err)?;
    let attempts: i64 = row.get(10).map_err(col_err)?;

    Ok(Action {
        id: parse_uuid(&id)?,
        kind: kind.parse().map_err(DatabaseError::Serialization)?,
        lead_id: parse_uuid(&lead_id)?,
        payload: row.get(3).map_err(col_err)?,
        message_type: opt_col(row, 4).and_then(|s| s.parse().ok()),
        status: status.parse().map_err(DatabaseError::Serialization)?,
        created_at: parse_datetime(&created),
        decided_at: parse_optional_datetime(&opt_col(row, 7)),
        dispatched_at: parse_optional_datetime(&opt_col(row, 8)),
        claimed_at: parse_optional_datetime(&opt_col(row, 9)),
        attempts: u32::try_from(attempts).unwrap_or(0),
        last_error: opt_col(row, 11),
        dispatch_id: opt_col(row, 12),
        failure_reason: opt_col(row, 13),
    })
}

fn row_to_message(row: &libsql::Row) -> Result<MessageRecord, DatabaseError> {
    let id: String = row.get(0).map_err(col_err)?;
    let lead_id: String = row.get(1).map_err(col_err)?;
    let direction: String = row.get(2).map_err(col_err)?;
    let at: String = row.get(5).map_err(col_err)?;

    Ok(MessageRecord {
        id: parse_uuid(&id)?,
        lead_id: parse_uuid(&lead_id)?,
        direction: direction.parse().map_err(DatabaseError::Serialization)?,
        content: row.get(3).map_err(col_err)?,
        external_id: opt_col(row, 4),
        at: parse_datetime(&at),
    })
}

/// Unique-index violations become `Constraint` so callers can tell them
/// apart from infrastructure failures.
fn write_err(op: &str, e: libsql::Error) -> DatabaseError {
    let msg = e.to_string();
    if msg.contains("UNIQUE constraint failed") {
        DatabaseError::Constraint(format!("{op}: {msg}"))
    } else {
        DatabaseError::Query(format!("{op}: {msg}"))
    }
}

fn kind_list(kinds: &[ActionKind]) -> String {
    kinds
        .iter()
        .map(|k| format!("'{}'", k.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        migrations::run_migrations(self.conn()).await
    }

    // ── Leads ───────────────────────────────────────────────────────

    async fn upsert_lead(
        &self,
        profile: &LeadProfile,
        now: DateTime<Utc>,
    ) -> Result<Lead, DatabaseError> {
        {
            let _guard = self.write_lock.lock().await;
            self.conn()
                .execute(
                    "INSERT INTO leads (id, profile_url, name, company, position, headline, location, summary, state, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'new', ?9, ?9)
                     ON CONFLICT(profile_url) DO UPDATE SET
                        name = excluded.name,
                        company = COALESCE(excluded.company, leads.company),
                        position = COALESCE(excluded.position, leads.position),
                        headline = COALESCE(excluded.headline, leads.headline),
                        location = COALESCE(excluded.location, leads.location),
                        summary = COALESCE(excluded.summary, leads.summary),
                        updated_at = excluded.updated_at",
                    params![
                        Uuid::new_v4().to_string(),
                        profile.profile_url.as_str(),
                        profile.name.as_str(),
                        opt_text(profile.company.as_deref()),
                        opt_text(profile.position.as_deref()),
                        opt_text(profile.headline.as_deref()),
                        opt_text(profile.location.as_deref()),
                        opt_text(profile.summary.as_deref()),
                        ts(now),
                    ],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("upsert_lead: {e}")))?;
        }

        self.get_lead_by_profile(&profile.profile_url)
            .await?
            .ok_or_else(|| DatabaseError::Query("upsert_lead: lead missing after insert".into()))
    }

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, DatabaseError> {
        let leads = self
            .query_leads(
                "get_lead",
                &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = ?1"),
                params![id.to_string()],
            )
            .await?;
        Ok(leads.into_iter().next())
    }

    async fn get_lead_by_profile(&self, profile_url: &str) -> Result<Option<Lead>, DatabaseError> {
        let leads = self
            .query_leads(
                "get_lead_by_profile",
                &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE profile_url = ?1"),
                params![profile_url],
            )
            .await?;
        Ok(leads.into_iter().next())
    }

    async fn list_leads(&self) -> Result<Vec<Lead>, DatabaseError> {
        self.query_leads(
            "list_leads",
            &format!("SELECT {LEAD_COLUMNS} FROM leads ORDER BY seq ASC"),
            (),
        )
        .await
    }

    async fn leads_in_state(&self, state: LeadState) -> Result<Vec<Lead>, DatabaseError> {
        self.query_leads(
            "leads_in_state",
            &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE state = ?1 ORDER BY seq ASC"),
            params![state.as_str()],
        )
        .await
    }

    async fn eligible_leads(&self, now: DateTime<Utc>) -> Result<Vec<Lead>, DatabaseError> {
        self.query_leads(
            "eligible_leads",
            &format!(
                "SELECT {LEAD_COLUMNS} FROM leads
                 WHERE (state = 'new'
                        OR (state = 'in_conversation' AND follow_up_due_at IS NOT NULL AND follow_up_due_at <= ?1))
                   AND NOT EXISTS (
                        SELECT 1 FROM actions
                        WHERE actions.lead_id = leads.id AND actions.status IN ('pending', 'approved'))
                 ORDER BY last_action_at IS NOT NULL, last_action_at ASC, seq ASC"
            ),
            params![ts(now)],
        )
        .await
    }

    async fn transition_lead(
        &self,
        id: Uuid,
        expected: LeadState,
        next: LeadState,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let changed = self
            .conn()
            .execute(
                "UPDATE leads SET state = ?1, updated_at = ?2 WHERE id = ?3 AND state = ?4",
                params![next.as_str(), ts(Utc::now()), id.to_string(), expected.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("transition_lead: {e}")))?;

        if changed > 0 {
            debug!(lead_id = %id, from = %expected, to = %next, "Lead state advanced");
        }
        Ok(changed > 0)
    }

    async fn set_follow_up_due(
        &self,
        id: Uuid,
        due: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "UPDATE leads SET follow_up_due_at = ?1, updated_at = ?2 WHERE id = ?3",
                params![opt_ts(due), ts(Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_follow_up_due: {e}")))?;
        Ok(())
    }

    async fn record_inbound(
        &self,
        lead_id: Uuid,
        external_id: &str,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO lead_messages (id, lead_id, direction, content, external_id, at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    Uuid::new_v4().to_string(),
                    lead_id.to_string(),
                    Direction::Inbound.as_str(),
                    content,
                    external_id,
                    ts(at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_inbound: {e}")))?;
        Ok(inserted > 0)
    }

    async fn lead_messages(&self, lead_id: Uuid) -> Result<Vec<MessageRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM lead_messages WHERE lead_id = ?1 ORDER BY at ASC"
                ),
                params![lead_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("lead_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("lead_messages: {e}")))?
        {
            match row_to_message(&row) {
                Ok(m) => messages.push(m),
                Err(e) => warn!("Skipping message row: {e}"),
            }
        }
        Ok(messages)
    }

    async fn leads_needing_crm_sync(&self) -> Result<Vec<Lead>, DatabaseError> {
        self.query_leads(
            "leads_needing_crm_sync",
            &format!(
                "SELECT {LEAD_COLUMNS} FROM leads
                 WHERE crm_synced_state IS NULL OR crm_synced_state <> state
                 ORDER BY seq ASC"
            ),
            (),
        )
        .await
    }

    async fn mark_crm_synced(
        &self,
        id: Uuid,
        crm_item_id: &str,
        state: LeadState,
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "UPDATE leads SET crm_item_id = ?1, crm_synced_state = ?2 WHERE id = ?3",
                params![crm_item_id, state.as_str(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_crm_synced: {e}")))?;
        Ok(())
    }

    async fn messages_needing_crm_log(&self) -> Result<Vec<MessageRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT m.id, m.lead_id, m.direction, m.content, m.external_id, m.at
                 FROM lead_messages m JOIN leads l ON l.id = m.lead_id
                 WHERE m.crm_logged = 0 AND l.crm_item_id IS NOT NULL
                 ORDER BY m.at ASC",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("messages_needing_crm_log: {e}")))?;

        let mut messages = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("messages_needing_crm_log: {e}")))?
        {
            match row_to_message(&row) {
                Ok(m) => messages.push(m),
                Err(e) => warn!("Skipping message row: {e}"),
            }
        }
        Ok(messages)
    }

    async fn mark_message_crm_logged(&self, message_id: Uuid) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "UPDATE lead_messages SET crm_logged = 1 WHERE id = ?1",
                params![message_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_message_crm_logged: {e}")))?;
        Ok(())
    }

    // ── Actions ─────────────────────────────────────────────────────

    async fn insert_action(&self, action: &Action) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO actions ({ACTION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                params![
                    action.id.to_string(),
                    action.kind.as_str(),
                    action.lead_id.to_string(),
                    action.payload.as_str(),
                    opt_text(action.message_type.map(|m| m.as_str())),
                    action.status.as_str(),
                    ts(action.created_at),
                    opt_ts(action.decided_at),
                    opt_ts(action.dispatched_at),
                    opt_ts(action.claimed_at),
                    i64::from(action.attempts),
                    opt_text(action.last_error.as_deref()),
                    opt_text(action.dispatch_id.as_deref()),
                    opt_text(action.failure_reason.as_deref()),
                ],
            )
            .await
            .map_err(|e| write_err("insert_action", e))?;

        debug!(action_id = %action.id, kind = %action.kind, "Action inserted into DB");
        Ok(())
    }

    async fn get_action(&self, id: Uuid) -> Result<Option<Action>, DatabaseError> {
        let actions = self
            .query_actions(
                "get_action",
                &format!("SELECT {ACTION_COLUMNS} FROM actions WHERE id = ?1"),
                params![id.to_string()],
            )
            .await?;
        Ok(actions.into_iter().next())
    }

    async fn list_actions(
        &self,
        status: Option<ActionStatus>,
    ) -> Result<Vec<Action>, DatabaseError> {
        match status {
            Some(status) => {
                self.query_actions(
                    "list_actions",
                    &format!(
                        "SELECT {ACTION_COLUMNS} FROM actions WHERE status = ?1 ORDER BY created_at ASC"
                    ),
                    params![status.as_str()],
                )
                .await
            }
            None => {
                self.query_actions(
                    "list_actions",
                    &format!("SELECT {ACTION_COLUMNS} FROM actions ORDER BY created_at ASC"),
                    (),
                )
                .await
            }
        }
    }

    async fn has_open_action(&self, lead_id: Uuid, kind: ActionKind) -> Result<bool, DatabaseError> {
        self.exists(
            "has_open_action",
            "SELECT 1 FROM actions WHERE lead_id = ?1 AND kind = ?2 AND status IN ('pending', 'approved') LIMIT 1",
            params![lead_id.to_string(), kind.as_str()],
        )
        .await
    }

    async fn has_dispatched_content(
        &self,
        lead_id: Uuid,
        payload: &str,
    ) -> Result<bool, DatabaseError> {
        self.exists(
            "has_dispatched_content",
            "SELECT 1 FROM actions WHERE lead_id = ?1 AND payload = ?2 AND status = 'dispatched' LIMIT 1",
            params![lead_id.to_string(), payload],
        )
        .await
    }

    async fn count_open_actions(&self, kinds: &[ActionKind]) -> Result<u32, DatabaseError> {
        if kinds.is_empty() {
            return Ok(0);
        }
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT COUNT(*) FROM actions WHERE status IN ('pending', 'approved') AND kind IN ({})",
                    kind_list(kinds)
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_open_actions: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row.get(0).unwrap_or(0);
                Ok(u32::try_from(count).unwrap_or(u32::MAX))
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_open_actions: {e}"))),
        }
    }

    async fn decide_action(
        &self,
        id: Uuid,
        status: ActionStatus,
        decided_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let changed = self
            .conn()
            .execute(
                "UPDATE actions SET status = ?1, decided_at = ?2 WHERE id = ?3 AND status = 'pending'",
                params![status.as_str(), ts(decided_at), id.to_string()],
            )
            .await
            .map_err(|e| write_err("decide_action", e))?;
        Ok(changed > 0)
    }

    async fn claim_next_approved(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<Action>, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let actions = self
            .query_actions(
                "claim_next_approved",
                &format!(
                    "UPDATE actions SET claimed_at = ?1
                     WHERE id = (
                        SELECT id FROM actions
                        WHERE status = 'approved' AND claimed_at IS NULL
                        ORDER BY decided_at ASC, created_at ASC
                        LIMIT 1)
                       AND status = 'approved' AND claimed_at IS NULL
                     RETURNING {ACTION_COLUMNS}"
                ),
                params![ts(now)],
            )
            .await?;
        Ok(actions.into_iter().next())
    }

    async fn release_claim(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let changed = self
            .conn()
            .execute(
                "UPDATE actions SET claimed_at = NULL WHERE id = ?1 AND status = 'approved' AND claimed_at IS NOT NULL",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_claim: {e}")))?;
        Ok(changed > 0)
    }

    async fn claimed_actions(&self) -> Result<Vec<Action>, DatabaseError> {
        self.query_actions(
            "claimed_actions",
            &format!(
                "SELECT {ACTION_COLUMNS} FROM actions
                 WHERE status = 'approved' AND claimed_at IS NOT NULL
                 ORDER BY claimed_at ASC"
            ),
            (),
        )
        .await
    }

    async fn record_attempt(&self, id: Uuid, error: &str) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "UPDATE actions SET attempts = attempts + 1, last_error = ?1 WHERE id = ?2",
                params![error, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_attempt: {e}")))?;
        Ok(())
    }

    async fn complete_dispatch(&self, record: &DispatchRecord) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let id = record.action_id.to_string();
        let at = ts(record.dispatched_at);

        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_dispatch begin: {e}")))?;

        let mut rows = tx
            .query(
                "SELECT kind, lead_id, payload FROM actions WHERE id = ?1 AND status = 'approved'",
                params![id.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_dispatch: {e}")))?;
        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_dispatch: {e}")))?;
        let Some(row) = row else {
            drop(rows);
            tx.rollback()
                .await
                .map_err(|e| DatabaseError::Query(format!("complete_dispatch rollback: {e}")))?;
            return Ok(false);
        };
        let kind: ActionKind = row
            .get::<String>(0)
            .map_err(col_err)?
            .parse()
            .map_err(DatabaseError::Serialization)?;
        let lead_id: String = row.get(1).map_err(col_err)?;
        let payload: String = row.get(2).map_err(col_err)?;
        drop(rows);

        tx.execute(
            "UPDATE actions SET status = 'dispatched', dispatch_id = ?1, dispatched_at = ?2, claimed_at = NULL
             WHERE id = ?3 AND status = 'approved'",
            params![record.dispatch_id.as_str(), at.as_str(), id.as_str()],
        )
        .await
        .map_err(|e| write_err("complete_dispatch", e))?;

        tx.execute(
            "INSERT INTO action_log (action_id, kind, at) VALUES (?1, ?2, ?3)",
            params![id.as_str(), kind.as_str(), at.as_str()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("complete_dispatch log: {e}")))?;

        if kind.cap_class() == ActionKind::Message {
            if !payload.is_empty() {
                tx.execute(
                    "INSERT INTO lead_messages (id, lead_id, direction, content, external_id, at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        Uuid::new_v4().to_string(),
                        lead_id.as_str(),
                        Direction::Outbound.as_str(),
                        payload.as_str(),
                        record.dispatch_id.as_str(),
                        at.as_str(),
                    ],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("complete_dispatch message: {e}")))?;
            }

            let follow_up = ts(record.dispatched_at + record.follow_up_after);
            tx.execute(
                "UPDATE leads SET
                    last_action_at = ?1,
                    follow_up_due_at = CASE WHEN state = 'in_conversation' THEN ?2 ELSE follow_up_due_at END,
                    state = CASE WHEN state = 'new' THEN 'contacted' ELSE state END,
                    updated_at = ?1
                 WHERE id = ?3",
                params![at.as_str(), follow_up, lead_id.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_dispatch lead: {e}")))?;
        } else {
            tx.execute(
                "UPDATE leads SET last_action_at = ?1, updated_at = ?1 WHERE id = ?2",
                params![at.as_str(), lead_id.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_dispatch lead: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_dispatch commit: {e}")))?;

        debug!(action_id = %record.action_id, dispatch_id = %record.dispatch_id, "Dispatch recorded");
        Ok(true)
    }

    async fn fail_action(&self, id: Uuid, reason: &str) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let changed = self
            .conn()
            .execute(
                "UPDATE actions SET status = 'failed', failure_reason = ?1, claimed_at = NULL
                 WHERE id = ?2 AND status = 'approved'",
                params![reason, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail_action: {e}")))?;
        Ok(changed > 0)
    }

    // ── Action log ──────────────────────────────────────────────────

    async fn action_log_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ActionLogEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT kind, at FROM action_log WHERE at >= ?1 ORDER BY at ASC, id ASC",
                params![ts(since)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("action_log_since: {e}")))?;

        let mut entries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("action_log_since: {e}")))?
        {
            let kind: String = row.get(0).map_err(col_err)?;
            let at: String = row.get(1).map_err(col_err)?;
            match kind.parse::<ActionKind>() {
                Ok(kind) => entries.push(ActionLogEntry::new(kind, parse_datetime(&at))),
                Err(e) => warn!("Skipping action log row: {e}"),
            }
        }
        Ok(entries)
    }

    async fn prune_action_log(&self, before: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let deleted = self
            .conn()
            .execute("DELETE FROM action_log WHERE at < ?1", params![ts(before)])
            .await
            .map_err(|e| DatabaseError::Query(format!("prune_action_log: {e}")))?;
        Ok(deleted as usize)
    }

    // ── Leases ──────────────────────────────────────────────────────

    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, DatabaseError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| DatabaseError::Query(format!("try_acquire_lease ttl: {e}")))?;
        let _guard = self.write_lock.lock().await;
        let changed = self
            .conn()
            .execute(
                "INSERT INTO scheduler_leases (name, holder, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE SET holder = excluded.holder, expires_at = excluded.expires_at
                 WHERE scheduler_leases.expires_at <= ?4",
                params![name, holder, ts(now + ttl), ts(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("try_acquire_lease: {e}")))?;
        Ok(changed > 0)
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "DELETE FROM scheduler_leases WHERE name = ?1 AND holder = ?2",
                params![name, holder],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_lease: {e}")))?;
        Ok(())
    }

    // ── Bookings ────────────────────────────────────────────────────

    async fn record_booking(&self, booking: &Booking) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "INSERT INTO bookings (lead_id, scheduled_for, note, recorded_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    booking.lead_id.to_string(),
                    ts(booking.scheduled_for),
                    opt_text(booking.note.as_deref()),
                    ts(Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_booking: {e}")))?;
        Ok(())
    }

    async fn booking_for(&self, lead_id: Uuid) -> Result<Option<Booking>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT scheduled_for, note FROM bookings WHERE lead_id = ?1 ORDER BY id DESC LIMIT 1",
                params![lead_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("booking_for: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let scheduled_for: String = row.get(0).map_err(col_err)?;
                Ok(Some(Booking {
                    lead_id,
                    scheduled_for: parse_datetime(&scheduled_for),
                    note: opt_col(&row, 1),
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("booking_for: {e}"))),
        }
    }
}
