use super::db::with_connection;
use crate::coordinator::{Link, Platform, Subscription};
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;

/// Read side of the per-guild subscription configuration, plus the single
/// write the coordinator needs: disabling destinations that rejected us.
pub trait SubscriptionStore: Send + Sync {
    /// Enabled subscriptions following `channel_name` on `platform`.
    fn subscriptions_for(&self, platform: Platform, channel_name: &str)
        -> Result<Vec<Subscription>>;

    /// Link containing `subscription_id`, if any.
    fn link_for(&self, subscription_id: &str) -> Result<Option<Link>>;

    fn link(&self, link_id: &str) -> Result<Option<Link>>;

    /// Disable every subscription posting into `destination`. Returns the
    /// number of subscriptions affected.
    fn mark_destination_failed(&self, destination: &str, reason: &str) -> Result<usize>;
}

pub struct SqliteSubscriptionStore {
    db_path: PathBuf,
}

impl SqliteSubscriptionStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    pub fn upsert_subscription(&self, subscription: &Subscription) -> Result<()> {
        with_connection(&self.db_path, |conn| {
            conn.execute(
                "INSERT INTO subscriptions (
                    id, platform, channel_name, guild_id, destination, live_template,
                    offline_template, disabled
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    platform = excluded.platform,
                    channel_name = excluded.channel_name,
                    guild_id = excluded.guild_id,
                    destination = excluded.destination,
                    live_template = excluded.live_template,
                    offline_template = excluded.offline_template,
                    disabled = excluded.disabled",
                params![
                    subscription.id,
                    subscription.platform,
                    subscription.channel_name,
                    subscription.guild_id,
                    subscription.destination,
                    subscription.live_template,
                    subscription.offline_template,
                    i64::from(subscription.disabled),
                ],
            )
            .context("Failed to upsert subscription")?;
            Ok(())
        })
    }

    /// Store `link` together with both of its subscriptions.
    pub fn upsert_link(&self, link: &Link) -> Result<()> {
        if link.twitch.platform != Platform::Twitch || link.kick.platform != Platform::Kick {
            anyhow::bail!("Link '{}' must pair one Twitch and one Kick subscription", link.id);
        }
        self.upsert_subscription(&link.twitch)?;
        self.upsert_subscription(&link.kick)?;

        with_connection(&self.db_path, |conn| {
            conn.execute(
                "INSERT INTO links (
                    id, guild_id, destination, twitch_subscription_id, kick_subscription_id,
                    priority, late_merge
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    guild_id = excluded.guild_id,
                    destination = excluded.destination,
                    twitch_subscription_id = excluded.twitch_subscription_id,
                    kick_subscription_id = excluded.kick_subscription_id,
                    priority = excluded.priority,
                    late_merge = excluded.late_merge",
                params![
                    link.id,
                    link.guild_id,
                    link.destination,
                    link.twitch.id,
                    link.kick.id,
                    link.priority,
                    i64::from(link.late_merge),
                ],
            )
            .context("Failed to upsert link")?;
            Ok(())
        })
    }
}

impl SubscriptionStore for SqliteSubscriptionStore {
    fn subscriptions_for(
        &self,
        platform: Platform,
        channel_name: &str,
    ) -> Result<Vec<Subscription>> {
        with_connection(&self.db_path, |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, platform, channel_name, guild_id, destination, live_template,
                        offline_template, disabled
                 FROM subscriptions
                 WHERE platform = ?1 AND lower(channel_name) = lower(?2) AND disabled = 0
                 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![platform, channel_name.trim()], map_subscription_row)?;
            let mut subscriptions = Vec::new();
            for row in rows {
                subscriptions.push(row?);
            }
            Ok(subscriptions)
        })
    }

    fn link_for(&self, subscription_id: &str) -> Result<Option<Link>> {
        with_connection(&self.db_path, |conn| {
            let link_id: Option<String> = conn
                .query_row(
                    "SELECT id FROM links
                     WHERE twitch_subscription_id = ?1 OR kick_subscription_id = ?1
                     LIMIT 1",
                    params![subscription_id],
                    |row| row.get(0),
                )
                .optional()?;
            match link_id {
                Some(id) => load_link(conn, &id),
                None => Ok(None),
            }
        })
    }

    fn link(&self, link_id: &str) -> Result<Option<Link>> {
        with_connection(&self.db_path, |conn| load_link(conn, link_id))
    }

    fn mark_destination_failed(&self, destination: &str, reason: &str) -> Result<usize> {
        let changed = with_connection(&self.db_path, |conn| {
            conn.execute(
                "UPDATE subscriptions SET disabled = 1 WHERE destination = ?1 AND disabled = 0",
                params![destination],
            )
            .context("Failed to disable subscriptions for destination")
        })?;
        tracing::warn!(
            destination,
            reason,
            disabled = changed,
            "Destination rejected delivery; subscriptions disabled"
        );
        Ok(changed)
    }
}

fn load_link(conn: &Connection, link_id: &str) -> Result<Option<Link>> {
    let row = conn
        .query_row(
            "SELECT id, guild_id, destination, twitch_subscription_id, kick_subscription_id,
                    priority, late_merge
             FROM links WHERE id = ?1",
            params![link_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Platform>(5)?,
                    row.get::<_, i64>(6)? != 0,
                ))
            },
        )
        .optional()
        .context("Failed to read link")?;

    let Some((id, guild_id, destination, twitch_id, kick_id, priority, late_merge)) = row else {
        return Ok(None);
    };

    let twitch = load_subscription(conn, &twitch_id)?
        .with_context(|| format!("Link '{id}' references missing subscription '{twitch_id}'"))?;
    let kick = load_subscription(conn, &kick_id)?
        .with_context(|| format!("Link '{id}' references missing subscription '{kick_id}'"))?;

    Ok(Some(Link {
        id,
        guild_id,
        destination,
        twitch,
        kick,
        priority,
        late_merge,
    }))
}

fn load_subscription(conn: &Connection, id: &str) -> Result<Option<Subscription>> {
    conn.query_row(
        "SELECT id, platform, channel_name, guild_id, destination, live_template,
                offline_template, disabled
         FROM subscriptions WHERE id = ?1",
        params![id],
        map_subscription_row,
    )
    .optional()
    .context("Failed to read subscription")
}

fn map_subscription_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Subscription> {
    Ok(Subscription {
        id: row.get(0)?,
        platform: row.get(1)?,
        channel_name: row.get(2)?,
        guild_id: row.get(3)?,
        destination: row.get(4)?,
        live_template: row.get(5)?,
        offline_template: row.get(6)?,
        disabled: row.get::<_, i64>(7)? != 0,
    })
}
