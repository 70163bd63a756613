//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS leads (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                profile_url TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                company TEXT,
                position TEXT,
                headline TEXT,
                location TEXT,
                summary TEXT,
                state TEXT NOT NULL DEFAULT 'new',
                last_action_at TEXT,
                follow_up_due_at TEXT,
                crm_item_id TEXT,
                crm_synced_state TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_leads_state ON leads(state);

            CREATE TABLE IF NOT EXISTS lead_messages (
                id TEXT PRIMARY KEY,
                lead_id TEXT NOT NULL REFERENCES leads(id),
                direction TEXT NOT NULL,
                content TEXT NOT NULL,
                external_id TEXT,
                at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_lead_messages_lead ON lead_messages(lead_id, at);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_lead_messages_inbound_external
                ON lead_messages(external_id) WHERE direction = 'inbound';

            CREATE TABLE IF NOT EXISTS actions (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                lead_id TEXT NOT NULL REFERENCES leads(id),
                payload TEXT NOT NULL,
                message_type TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                decided_at TEXT,
                dispatched_at TEXT,
                claimed_at TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                dispatch_id TEXT,
                failure_reason TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_actions_status ON actions(status);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_actions_open_per_lead
                ON actions(lead_id, kind) WHERE status IN ('pending', 'approved');
            CREATE UNIQUE INDEX IF NOT EXISTS idx_actions_dispatched_content
                ON actions(lead_id, payload) WHERE status = 'dispatched' AND payload <> '';

            CREATE TABLE IF NOT EXISTS action_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                action_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_action_log_at ON action_log(at);
        "#,
    },
    Migration {
        version: 2,
        name: "scheduler_leases",
        sql: r#"
            CREATE TABLE IF NOT EXISTS scheduler_leases (
                name TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );
        "#,
    },
    Migration {
        version: 3,
        name: "bookings",
        sql: r#"
            CREATE TABLE IF NOT EXISTS bookings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                lead_id TEXT NOT NULL REFERENCES leads(id),
                scheduled_for TEXT NOT NULL,
                note TEXT,
                recorded_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_bookings_lead ON bookings(lead_id);
        "#,
    },
    Migration {
        version: 4,
        name: "crm_message_log",
        sql: r#"
            ALTER TABLE lead_messages ADD COLUMN crm_logged INTEGER NOT NULL DEFAULT 0;
            CREATE INDEX IF NOT EXISTS idx_lead_messages_crm_pending
                ON lead_messages(crm_logged) WHERE crm_logged = 0;
        "#,
    },
];

/// Run all pending migrations. Safe to call multiple times.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
