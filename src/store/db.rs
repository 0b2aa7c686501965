use crate::coordinator::Platform;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Location of the shared state database inside a workspace.
pub fn state_db_path(workspace_dir: &Path) -> PathBuf {
    workspace_dir.join("state").join("duocast.db")
}

impl rusqlite::types::FromSql for Platform {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        Platform::try_from(text).map_err(|e| rusqlite::types::FromSqlError::Other(e.into()))
    }
}

impl rusqlite::types::ToSql for Platform {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

pub(crate) fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid RFC3339 timestamp in state DB: {raw}"))?;
    Ok(parsed.with_timezone(&Utc))
}

pub(crate) fn sql_conversion_error(err: anyhow::Error) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(err.into())
}

fn add_column_if_missing(conn: &Connection, table: &str, name: &str, sql_type: &str) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let col_name: String = row.get(1)?;
        if col_name == name {
            return Ok(());
        }
    }
    // Release the PRAGMA read before ALTER.
    drop(rows);
    drop(stmt);

    // Another process may add the column between the PRAGMA check and ALTER.
    match conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {name} {sql_type}"), []) {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(err, Some(ref msg)))
            if msg.contains("duplicate column name") =>
        {
            tracing::debug!("Column {table}.{name} already exists (concurrent migration): {err}");
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to add {table}.{name}")),
    }
}

pub(crate) fn with_connection<T>(
    db_path: &Path,
    f: impl FnOnce(&Connection) -> Result<T>,
) -> Result<T> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create state directory: {}", parent.display()))?;
    }

    let conn = Connection::open(db_path)
        .with_context(|| format!("Failed to open state DB: {}", db_path.display()))?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .context("Failed to set state DB busy timeout")?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS actor_snapshots (
            key         TEXT PRIMARY KEY,
            body        TEXT NOT NULL,
            timer_armed INTEGER NOT NULL DEFAULT 0,
            updated_at  TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_actor_snapshots_timer ON actor_snapshots(timer_armed);

         CREATE TABLE IF NOT EXISTS coordinator_timers (
            key      TEXT PRIMARY KEY,
            fire_at  TEXT NOT NULL,
            armed_at TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_coordinator_timers_fire_at ON coordinator_timers(fire_at);

         CREATE TABLE IF NOT EXISTS message_records (
            id          TEXT PRIMARY KEY,
            key         TEXT NOT NULL,
            destination TEXT NOT NULL,
            message_id  TEXT,
            link_id     TEXT,
            priority    TEXT NOT NULL,
            twitch      TEXT NOT NULL,
            kick        TEXT NOT NULL,
            closed      INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_message_records_key ON message_records(key);

         CREATE TABLE IF NOT EXISTS subscriptions (
            id               TEXT PRIMARY KEY,
            platform         TEXT NOT NULL,
            channel_name     TEXT NOT NULL,
            guild_id         TEXT NOT NULL,
            destination      TEXT NOT NULL,
            live_template    TEXT,
            offline_template TEXT
         );
         CREATE INDEX IF NOT EXISTS idx_subscriptions_channel
            ON subscriptions(platform, channel_name);

         CREATE TABLE IF NOT EXISTS links (
            id                     TEXT PRIMARY KEY,
            guild_id               TEXT NOT NULL,
            destination            TEXT NOT NULL,
            twitch_subscription_id TEXT NOT NULL,
            kick_subscription_id   TEXT NOT NULL,
            priority               TEXT NOT NULL,
            late_merge             INTEGER NOT NULL DEFAULT 0
         );
         CREATE INDEX IF NOT EXISTS idx_links_twitch ON links(twitch_subscription_id);
         CREATE INDEX IF NOT EXISTS idx_links_kick ON links(kick_subscription_id);",
    )
    .context("Failed to initialize state schema")?;

    add_column_if_missing(&conn, "message_records", "merged", "INTEGER NOT NULL DEFAULT 0")?;
    add_column_if_missing(&conn, "subscriptions", "disabled", "INTEGER NOT NULL DEFAULT 0")?;
    add_column_if_missing(&conn, "actor_snapshots", "version", "INTEGER NOT NULL DEFAULT 1")?;

    f(&conn)
}
