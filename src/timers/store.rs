use super::TimerService;
use crate::coordinator::CorrelationKey;
use crate::store::db::{parse_rfc3339, sql_conversion_error, with_connection};
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension};
use std::path::PathBuf;

/// Timer rows are compared as text, so every timestamp uses one fixed format.
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Durable single-shot timers keyed by correlation key.
pub struct SqliteTimerService {
    db_path: PathBuf,
}

impl SqliteTimerService {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    /// Every armed timer, soonest first.
    pub fn list(&self) -> Result<Vec<(CorrelationKey, DateTime<Utc>)>> {
        with_connection(&self.db_path, |conn| {
            let mut stmt =
                conn.prepare("SELECT key, fire_at FROM coordinator_timers ORDER BY fire_at ASC")?;
            let rows = stmt.query_map([], |row| {
                let key: String = row.get(0)?;
                let fire_at: String = row.get(1)?;
                Ok((
                    CorrelationKey::parse(&key).map_err(|e| sql_conversion_error(e.into()))?,
                    parse_rfc3339(&fire_at).map_err(sql_conversion_error)?,
                ))
            })?;
            let mut timers = Vec::new();
            for row in rows {
                timers.push(row?);
            }
            Ok(timers)
        })
    }
}

impl TimerService for SqliteTimerService {
    fn arm_at(&self, key: &CorrelationKey, fire_at: DateTime<Utc>) -> Result<DateTime<Utc>> {
        with_connection(&self.db_path, |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO coordinator_timers (key, fire_at, armed_at)
                 VALUES (?1, ?2, ?3)",
                params![key.as_str(), format_ts(fire_at), format_ts(Utc::now())],
            )
            .context("Failed to arm timer")?;

            let stored: String = conn
                .query_row(
                    "SELECT fire_at FROM coordinator_timers WHERE key = ?1",
                    params![key.as_str()],
                    |row| row.get(0),
                )
                .context("Failed to read armed timer")?;
            parse_rfc3339(&stored)
        })
    }

    fn cancel(&self, key: &CorrelationKey) -> Result<()> {
        with_connection(&self.db_path, |conn| {
            conn.execute(
                "DELETE FROM coordinator_timers WHERE key = ?1",
                params![key.as_str()],
            )
            .context("Failed to cancel timer")?;
            Ok(())
        })
    }

    fn deadline(&self, key: &CorrelationKey) -> Result<Option<DateTime<Utc>>> {
        let raw: Option<String> = with_connection(&self.db_path, |conn| {
            conn.query_row(
                "SELECT fire_at FROM coordinator_timers WHERE key = ?1",
                params![key.as_str()],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read timer")
        })?;
        raw.as_deref().map(parse_rfc3339).transpose()
    }

    fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<CorrelationKey>> {
        let lim = i64::try_from(limit.max(1)).context("Timer batch limit overflows i64")?;
        with_connection(&self.db_path, |conn| {
            let mut stmt = conn.prepare(
                "SELECT key FROM coordinator_timers
                 WHERE fire_at <= ?1
                 ORDER BY fire_at ASC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![format_ts(now), lim], |row| {
                let key: String = row.get(0)?;
                CorrelationKey::parse(&key).map_err(|e| sql_conversion_error(e.into()))
            })?;
            let mut keys = Vec::new();
            for row in rows {
                keys.push(row?);
            }
            Ok(keys)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::db::state_db_path;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;
    use tempfile::TempDir;

    fn key(name: &str) -> CorrelationKey {
        CorrelationKey::new(name, "chan").unwrap()
    }

    #[test]
    fn arm_is_idempotent_and_keeps_first_deadline() {
        let tmp = TempDir::new().unwrap();
        let timers = SqliteTimerService::new(state_db_path(tmp.path()));

        let first = timers.arm(&key("a"), Duration::from_secs(10)).unwrap();
        let second = timers.arm(&key("a"), Duration::from_secs(60)).unwrap();
        assert_eq!(first, second);
        assert_eq!(timers.list().unwrap().len(), 1);
    }

    #[test]
    fn cancel_is_safe_when_not_armed() {
        let tmp = TempDir::new().unwrap();
        let timers = SqliteTimerService::new(state_db_path(tmp.path()));

        timers.cancel(&key("a")).unwrap();
        timers.arm(&key("a"), Duration::from_secs(10)).unwrap();
        timers.cancel(&key("a")).unwrap();
        timers.cancel(&key("a")).unwrap();
        assert!(timers.deadline(&key("a")).unwrap().is_none());
    }

    #[test]
    fn due_returns_only_expired_timers_in_deadline_order() {
        let tmp = TempDir::new().unwrap();
        let timers = SqliteTimerService::new(state_db_path(tmp.path()));
        let now = Utc::now();

        timers
            .arm_at(&key("late"), now - ChronoDuration::seconds(1))
            .unwrap();
        timers
            .arm_at(&key("early"), now - ChronoDuration::seconds(30))
            .unwrap();
        timers
            .arm_at(&key("future"), now + ChronoDuration::seconds(30))
            .unwrap();

        let due = timers.due(now, 10).unwrap();
        assert_eq!(due, vec![key("early"), key("late")]);
        assert_eq!(timers.due(now, 1).unwrap(), vec![key("early")]);
    }

    #[test]
    fn armed_timers_survive_reopening_the_database() {
        let tmp = TempDir::new().unwrap();
        let path = state_db_path(tmp.path());
        let deadline = SqliteTimerService::new(&path)
            .arm(&key("a"), Duration::from_secs(12))
            .unwrap();

        let reopened = SqliteTimerService::new(&path);
        assert_eq!(reopened.deadline(&key("a")).unwrap(), Some(deadline));
    }
}
