use super::db::{parse_rfc3339, sql_conversion_error, with_connection};
use crate::coordinator::{
    CorrelationKey, MessageRecord, MessageRecordPatch, NewMessageRecord, PlatformSide,
};
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use std::path::PathBuf;
use uuid::Uuid;

/// Durable rows backing outbound notifications. The actor never deletes;
/// closed records are left for external housekeeping.
pub trait MessageRecordStore: Send + Sync {
    fn create(&self, draft: NewMessageRecord) -> Result<MessageRecord>;
    fn update(&self, id: &str, patch: MessageRecordPatch) -> Result<MessageRecord>;
    fn get(&self, id: &str) -> Result<Option<MessageRecord>>;
}

pub struct SqliteMessageRecordStore {
    db_path: PathBuf,
}

impl SqliteMessageRecordStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    /// Records for `key`, newest first.
    pub fn list_for_key(&self, key: &CorrelationKey) -> Result<Vec<MessageRecord>> {
        with_connection(&self.db_path, |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, key, destination, message_id, link_id, priority, twitch, kick,
                        merged, closed, created_at, updated_at
                 FROM message_records WHERE key = ?1
                 ORDER BY created_at DESC, rowid DESC",
            )?;
            let rows = stmt.query_map(params![key.as_str()], map_record_row)?;
            let mut records = Vec::new();
            for row in rows {
                records.push(row?);
            }
            Ok(records)
        })
    }
}

impl MessageRecordStore for SqliteMessageRecordStore {
    fn create(&self, draft: NewMessageRecord) -> Result<MessageRecord> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();

        with_connection(&self.db_path, |conn| {
            conn.execute(
                "INSERT INTO message_records (
                    id, key, destination, message_id, link_id, priority, twitch, kick,
                    merged, closed, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6, ?7, 0, 0, ?8, ?8)",
                params![
                    id,
                    draft.key.as_str(),
                    draft.destination,
                    draft.link_id,
                    draft.priority,
                    serde_json::to_string(&draft.twitch)?,
                    serde_json::to_string(&draft.kick)?,
                    now.to_rfc3339(),
                ],
            )
            .context("Failed to insert message record")?;
            Ok(())
        })?;

        self.get(&id)?
            .with_context(|| format!("Message record '{id}' vanished after insert"))
    }

    fn update(&self, id: &str, patch: MessageRecordPatch) -> Result<MessageRecord> {
        let mut record = self
            .get(id)?
            .with_context(|| format!("Message record '{id}' not found"))?;

        if let Some(message_id) = patch.message_id {
            record.message_id = Some(message_id);
        }
        if let Some(twitch) = patch.twitch {
            record.twitch = twitch;
        }
        if let Some(kick) = patch.kick {
            record.kick = kick;
        }
        if let Some(merged) = patch.merged {
            record.merged = merged;
        }
        if let Some(closed) = patch.closed {
            record.closed = closed;
        }
        record.updated_at = Utc::now();

        with_connection(&self.db_path, |conn| {
            conn.execute(
                "UPDATE message_records
                 SET message_id = ?1, twitch = ?2, kick = ?3, merged = ?4, closed = ?5,
                     updated_at = ?6
                 WHERE id = ?7",
                params![
                    record.message_id,
                    serde_json::to_string(&record.twitch)?,
                    serde_json::to_string(&record.kick)?,
                    i64::from(record.merged),
                    i64::from(record.closed),
                    record.updated_at.to_rfc3339(),
                    record.id,
                ],
            )
            .context("Failed to update message record")?;
            Ok(())
        })?;

        Ok(record)
    }

    fn get(&self, id: &str) -> Result<Option<MessageRecord>> {
        with_connection(&self.db_path, |conn| {
            conn.query_row(
                "SELECT id, key, destination, message_id, link_id, priority, twitch, kick,
                        merged, closed, created_at, updated_at
                 FROM message_records WHERE id = ?1",
                params![id],
                map_record_row,
            )
            .optional()
            .context("Failed to read message record")
        })
    }
}

fn decode_side(raw: &str) -> Result<PlatformSide> {
    serde_json::from_str(raw).with_context(|| format!("Failed to parse platform side JSON: {raw}"))
}

fn map_record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    let key_raw: String = row.get(1)?;
    let twitch_raw: String = row.get(6)?;
    let kick_raw: String = row.get(7)?;
    let created_raw: String = row.get(10)?;
    let updated_raw: String = row.get(11)?;

    Ok(MessageRecord {
        id: row.get(0)?,
        key: CorrelationKey::parse(&key_raw).map_err(|e| sql_conversion_error(e.into()))?,
        destination: row.get(2)?,
        message_id: row.get(3)?,
        link_id: row.get(4)?,
        priority: row.get(5)?,
        twitch: decode_side(&twitch_raw).map_err(sql_conversion_error)?,
        kick: decode_side(&kick_raw).map_err(sql_conversion_error)?,
        merged: row.get::<_, i64>(8)? != 0,
        closed: row.get::<_, i64>(9)? != 0,
        created_at: parse_rfc3339(&created_raw).map_err(sql_conversion_error)?,
        updated_at: parse_rfc3339(&updated_raw).map_err(sql_conversion_error)?,
    })
}
