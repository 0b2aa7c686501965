use super::types::{CorrelationKey, Platform};
use crate::store::db::{parse_rfc3339, sql_conversion_error, with_connection};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const SNAPSHOT_VERSION: u32 = 2;

/// Small persisted state of one correlation actor.
///
/// Records are referenced by id only; the Message Record Store stays the
/// source of truth for their content. Every field defaults so snapshots
/// written by older versions still load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorSnapshot {
    pub version: u32,
    pub twitch_live: bool,
    pub kick_live: bool,
    /// Record still open for a correlated event from the other platform.
    pub pending_message_record_id: Option<String>,
    pub timer_armed: bool,
    pub last_updated: Option<DateTime<Utc>>,
    /// Record currently carrying Twitch's notification.
    pub twitch_record_id: Option<String>,
    /// Record currently carrying Kick's notification.
    pub kick_record_id: Option<String>,
    /// Fire-at of the armed timer, for re-arming after restart.
    pub wait_deadline: Option<DateTime<Utc>>,
}

impl Default for ActorSnapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            twitch_live: false,
            kick_live: false,
            pending_message_record_id: None,
            timer_armed: false,
            last_updated: None,
            twitch_record_id: None,
            kick_record_id: None,
            wait_deadline: None,
        }
    }
}

impl ActorSnapshot {
    pub fn is_live(&self, platform: Platform) -> bool {
        match platform {
            Platform::Twitch => self.twitch_live,
            Platform::Kick => self.kick_live,
        }
    }

    pub fn record_id(&self, platform: Platform) -> Option<&str> {
        match platform {
            Platform::Twitch => self.twitch_record_id.as_deref(),
            Platform::Kick => self.kick_record_id.as_deref(),
        }
    }

    /// Mark `platform` live on `record_id`, or clear it when `record_id` is `None`.
    pub fn set_side(&mut self, platform: Platform, record_id: Option<String>) {
        let live = record_id.is_some();
        match platform {
            Platform::Twitch => {
                self.twitch_live = live;
                self.twitch_record_id = record_id;
            }
            Platform::Kick => {
                self.kick_live = live;
                self.kick_record_id = record_id;
            }
        }
    }

    pub fn disarm(&mut self) {
        self.timer_armed = false;
        self.wait_deadline = None;
    }

    /// No live platform, no pending record, no timer.
    pub fn is_idle(&self) -> bool {
        !self.twitch_live
            && !self.kick_live
            && self.pending_message_record_id.is_none()
            && !self.timer_armed
    }

    pub fn reset(&mut self) {
        *self = Self {
            last_updated: self.last_updated,
            ..Self::default()
        };
    }
}

pub trait SnapshotStore: Send + Sync {
    fn load(&self, key: &CorrelationKey) -> Result<Option<ActorSnapshot>>;
    fn save(&self, key: &CorrelationKey, snapshot: &ActorSnapshot) -> Result<()>;
    /// Snapshots whose wait timer is armed.
    fn list_armed(&self) -> Result<Vec<(CorrelationKey, ActorSnapshot)>>;
    /// Snapshots last written before `cutoff`.
    fn list_updated_before(&self, cutoff: DateTime<Utc>)
        -> Result<Vec<(CorrelationKey, ActorSnapshot)>>;
}

pub struct SqliteSnapshotStore {
    db_path: PathBuf,
}

impl SqliteSnapshotStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    /// Every stored snapshot with its `updated_at` column.
    fn list_all(&self, armed_only: bool) -> Result<Vec<StoredSnapshot>> {
        let sql = if armed_only {
            "SELECT key, body, updated_at FROM actor_snapshots WHERE timer_armed = 1 ORDER BY key"
        } else {
            "SELECT key, body, updated_at FROM actor_snapshots ORDER BY key"
        };
        with_connection(&self.db_path, |conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map([], |row| {
                let key: String = row.get(0)?;
                let body: String = row.get(1)?;
                let updated_at: String = row.get(2)?;
                Ok(StoredSnapshot {
                    key: CorrelationKey::parse(&key).map_err(|e| sql_conversion_error(e.into()))?,
                    snapshot: decode_snapshot(&body).map_err(sql_conversion_error)?,
                    updated_at: parse_rfc3339(&updated_at).map_err(sql_conversion_error)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }
}

struct StoredSnapshot {
    key: CorrelationKey,
    snapshot: ActorSnapshot,
    updated_at: DateTime<Utc>,
}

fn decode_snapshot(body: &str) -> Result<ActorSnapshot> {
    serde_json::from_str(body).with_context(|| format!("Failed to parse actor snapshot: {body}"))
}

impl SnapshotStore for SqliteSnapshotStore {
    fn load(&self, key: &CorrelationKey) -> Result<Option<ActorSnapshot>> {
        let body: Option<String> = with_connection(&self.db_path, |conn| {
            conn.query_row(
                "SELECT body FROM actor_snapshots WHERE key = ?1",
                params![key.as_str()],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read actor snapshot")
        })?;
        body.as_deref().map(decode_snapshot).transpose()
    }

    fn save(&self, key: &CorrelationKey, snapshot: &ActorSnapshot) -> Result<()> {
        let body = serde_json::to_string(snapshot)?;
        let updated_at = snapshot.last_updated.unwrap_or_else(Utc::now).to_rfc3339();
        with_connection(&self.db_path, |conn| {
            conn.execute(
                "INSERT INTO actor_snapshots (key, body, timer_armed, updated_at, version)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(key) DO UPDATE SET
                    body = excluded.body,
                    timer_armed = excluded.timer_armed,
                    updated_at = excluded.updated_at,
                    version = excluded.version",
                params![
                    key.as_str(),
                    body,
                    i64::from(snapshot.timer_armed),
                    updated_at,
                    i64::from(snapshot.version),
                ],
            )
            .context("Failed to save actor snapshot")?;
            Ok(())
        })
    }

    fn list_armed(&self) -> Result<Vec<(CorrelationKey, ActorSnapshot)>> {
        Ok(self
            .list_all(true)?
            .into_iter()
            .map(|row| (row.key, row.snapshot))
            .collect())
    }

    fn list_updated_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(CorrelationKey, ActorSnapshot)>> {
        Ok(self
            .list_all(false)?
            .into_iter()
            .filter(|row| row.updated_at < cutoff)
            .map(|row| (row.key, row.snapshot))
            .collect())
    }
}
