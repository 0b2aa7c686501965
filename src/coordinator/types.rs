use super::CoordinatorError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Upstream streaming platform. Twitch is the "A" side of a link, Kick the "B" side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Twitch,
    Kick,
}

impl Platform {
    pub const ALL: [Platform; 2] = [Platform::Twitch, Platform::Kick];

    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Twitch => "twitch",
            Platform::Kick => "kick",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Platform::Twitch => "Twitch",
            Platform::Kick => "Kick",
        }
    }

    pub fn other(self) -> Platform {
        match self {
            Platform::Twitch => Platform::Kick,
            Platform::Kick => Platform::Twitch,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for Platform {
    type Error = CoordinatorError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.trim().to_ascii_lowercase().as_str() {
            "twitch" => Ok(Platform::Twitch),
            "kick" => Ok(Platform::Kick),
            other => Err(CoordinatorError::UnknownPlatform(other.to_string())),
        }
    }
}

/// Address of one correlation actor: a lowercased streamer name scoped to a
/// destination channel, rendered as `name@destination`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CorrelationKey(String);

impl CorrelationKey {
    pub fn new(channel_name: &str, destination: &str) -> Result<Self, CoordinatorError> {
        let name = channel_name.trim().to_lowercase();
        let destination = destination.trim();
        if name.is_empty() || name.contains('@') {
            return Err(CoordinatorError::InvalidKey(channel_name.to_string()));
        }
        if destination.is_empty() || destination.contains('@') {
            return Err(CoordinatorError::InvalidKey(format!(
                "{channel_name}@{destination}"
            )));
        }
        Ok(Self(format!("{name}@{destination}")))
    }

    /// Parse the `name@destination` form produced by [`CorrelationKey::as_str`].
    pub fn parse(raw: &str) -> Result<Self, CoordinatorError> {
        let (name, destination) = raw
            .split_once('@')
            .ok_or_else(|| CoordinatorError::InvalidKey(raw.to_string()))?;
        Self::new(name, destination)
    }

    /// Key for an event arriving on `subscription`. Linked subscriptions share
    /// the key derived from the link's Twitch channel so both platforms land
    /// on the same actor even when the channel names differ.
    pub fn for_subscription(
        subscription: &Subscription,
        link: Option<&Link>,
    ) -> Result<Self, CoordinatorError> {
        match link {
            Some(link) => Self::new(&link.twitch.channel_name, &link.destination),
            None => Self::new(&subscription.channel_name, &subscription.destination),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn channel_name(&self) -> &str {
        self.0.split_once('@').map_or(self.0.as_str(), |(name, _)| name)
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CorrelationKey {
    type Error = CoordinatorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CorrelationKey> for String {
    fn from(key: CorrelationKey) -> Self {
        key.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Live,
    Offline,
}

/// Metadata snapshot reported by the upstream platform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPayload {
    pub status: StreamStatus,
    #[serde(default)]
    pub metadata: StreamMetadata,
}

impl StreamPayload {
    pub fn live(metadata: StreamMetadata) -> Self {
        Self {
            status: StreamStatus::Live,
            metadata,
        }
    }

    pub fn offline(metadata: StreamMetadata) -> Self {
        Self {
            status: StreamStatus::Offline,
            metadata,
        }
    }
}

/// One guild's follow of one platform channel, posting into `destination`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub platform: Platform,
    pub channel_name: String,
    pub guild_id: String,
    pub destination: String,
    #[serde(default)]
    pub live_template: Option<String>,
    #[serde(default)]
    pub offline_template: Option<String>,
    #[serde(default)]
    pub disabled: bool,
}

/// Pairing of a Twitch and a Kick subscription that post to the same destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub id: String,
    pub guild_id: String,
    pub destination: String,
    pub twitch: Subscription,
    pub kick: Subscription,
    /// Side whose text and category win when both are live.
    pub priority: Platform,
    /// Keep the record open for merging after the wait window elapses.
    #[serde(default)]
    pub late_merge: bool,
}

impl Link {
    pub fn contains(&self, subscription_id: &str) -> bool {
        self.twitch.id == subscription_id || self.kick.id == subscription_id
    }
}

/// A live/offline event for one subscription, as forwarded by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub platform: Platform,
    pub payload: StreamPayload,
    pub subscription: Subscription,
}

/// Per-platform half of a [`MessageRecord`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformSide {
    #[serde(default)]
    pub live: bool,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Option<StreamMetadata>,
    #[serde(default)]
    pub subscription: Option<Subscription>,
}

impl PlatformSide {
    /// True once this side has contributed to the record at all.
    pub fn participated(&self) -> bool {
        self.started_at.is_some()
    }
}

/// Durable state of one outbound notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub key: CorrelationKey,
    pub destination: String,
    pub message_id: Option<String>,
    pub link_id: Option<String>,
    pub priority: Platform,
    pub twitch: PlatformSide,
    pub kick: PlatformSide,
    pub merged: bool,
    pub closed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn side(&self, platform: Platform) -> &PlatformSide {
        match platform {
            Platform::Twitch => &self.twitch,
            Platform::Kick => &self.kick,
        }
    }

    pub fn side_mut(&mut self, platform: Platform) -> &mut PlatformSide {
        match platform {
            Platform::Twitch => &mut self.twitch,
            Platform::Kick => &mut self.kick,
        }
    }

    /// Live platforms, priority side first.
    pub fn live_platforms(&self) -> Vec<Platform> {
        self.ordered_platforms()
            .into_iter()
            .filter(|p| self.side(*p).live)
            .collect()
    }

    /// Platforms that have ever been live on this record, priority side first.
    pub fn participants(&self) -> Vec<Platform> {
        self.ordered_platforms()
            .into_iter()
            .filter(|p| self.side(*p).participated())
            .collect()
    }

    pub fn any_live(&self) -> bool {
        self.twitch.live || self.kick.live
    }

    fn ordered_platforms(&self) -> [Platform; 2] {
        [self.priority, self.priority.other()]
    }
}

/// Fields for a new [`MessageRecord`]; the store assigns the id and timestamps.
#[derive(Debug, Clone)]
pub struct NewMessageRecord {
    pub key: CorrelationKey,
    pub destination: String,
    pub link_id: Option<String>,
    pub priority: Platform,
    pub twitch: PlatformSide,
    pub kick: PlatformSide,
}

/// Partial update; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct MessageRecordPatch {
    pub message_id: Option<String>,
    pub twitch: Option<PlatformSide>,
    pub kick: Option<PlatformSide>,
    pub merged: Option<bool>,
    pub closed: Option<bool>,
}

impl MessageRecordPatch {
    /// Patch carrying both sides and the merged flag of `record`.
    pub fn sides_of(record: &MessageRecord) -> Self {
        Self {
            twitch: Some(record.twitch.clone()),
            kick: Some(record.kick.clone()),
            merged: Some(record.merged),
            ..Self::default()
        }
    }
}

/// Result of one actor invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// A record was opened and the wait timer armed.
    AwaitingCorrelation { record: String },
    /// A new destination message was sent.
    Sent { record: String, merged: bool },
    /// The existing destination message was edited.
    Updated { record: String, merged: bool },
    /// Duplicate live event; only the stored metadata changed.
    MetadataRefreshed { record: String },
    /// Every side went offline and the record was closed.
    Closed { record: String, updates: usize },
    /// Composition or transport failed; the record keeps its previous message state.
    DeliveryFailed { record: String, error: String },
    NoOp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_key_lowercases_and_scopes_to_destination() {
        let key = CorrelationKey::new("  SomeStreamer ", "12345").unwrap();
        assert_eq!(key.as_str(), "somestreamer@12345");
        assert_eq!(key.channel_name(), "somestreamer");
    }

    #[test]
    fn correlation_key_rejects_empty_parts() {
        assert!(CorrelationKey::new("", "1").is_err());
        assert!(CorrelationKey::new("name", " ").is_err());
        assert!(CorrelationKey::parse("no-separator").is_err());
    }

    #[test]
    fn correlation_key_parse_roundtrips_display() {
        let key = CorrelationKey::new("Foo", "99").unwrap();
        assert_eq!(CorrelationKey::parse(&key.to_string()).unwrap(), key);
    }

    #[test]
    fn linked_subscriptions_share_a_key() {
        let twitch = Subscription {
            id: "s1".into(),
            platform: Platform::Twitch,
            channel_name: "Foo".into(),
            guild_id: "g".into(),
            destination: "c".into(),
            live_template: None,
            offline_template: None,
            disabled: false,
        };
        let kick = Subscription {
            id: "s2".into(),
            platform: Platform::Kick,
            channel_name: "foo_tv".into(),
            ..twitch.clone()
        };
        let link = Link {
            id: "l".into(),
            guild_id: "g".into(),
            destination: "c".into(),
            twitch: twitch.clone(),
            kick: kick.clone(),
            priority: Platform::Twitch,
            late_merge: false,
        };
        let a = CorrelationKey::for_subscription(&twitch, Some(&link)).unwrap();
        let b = CorrelationKey::for_subscription(&kick, Some(&link)).unwrap();
        assert_eq!(a, b);
        assert_ne!(CorrelationKey::for_subscription(&kick, None).unwrap(), a);
    }

    #[test]
    fn platform_parses_case_insensitively() {
        assert_eq!(Platform::try_from("TWITCH").unwrap(), Platform::Twitch);
        assert_eq!(Platform::try_from("kick").unwrap(), Platform::Kick);
        assert!(Platform::try_from("youtube").is_err());
        assert_eq!(Platform::Kick.other(), Platform::Twitch);
    }
}
