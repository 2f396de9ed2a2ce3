//! Presence configuration parsed from environment variables.

use crate::error::ConfigError;

pub const DEFAULT_TOPIC_PREFIX: &str = "presence:";
pub const DEFAULT_SNAPSHOT_CAPACITY: usize = 64;
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// How raw per-session presence entries collapse into a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupPolicy {
    /// One entry per `user_id`, latest `last_active` wins.
    ByUser,
    /// One entry per tracked session; a user with two tabs appears twice.
    BySession,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceConfig {
    /// Prepended to every logical topic name when opening a transport channel.
    pub topic_prefix: String,
    pub dedup: DedupPolicy,
    /// Per-topic snapshot broadcast buffer.
    pub snapshot_capacity: usize,
    /// Per-channel event buffer used by [`crate::transport::local::LocalBroker`].
    pub event_capacity: usize,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            dedup: DedupPolicy::ByUser,
            snapshot_capacity: DEFAULT_SNAPSHOT_CAPACITY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl PresenceConfig {
    /// Build typed presence config from environment variables.
    ///
    /// Optional:
    /// - `PRESENCE_TOPIC_PREFIX`: default `presence:`
    /// - `PRESENCE_DEDUP`: `user` (default) or `session`
    /// - `PRESENCE_SNAPSHOT_CAPACITY`: default 64
    /// - `PRESENCE_EVENT_CAPACITY`: default 256
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for an unknown dedup policy.
    pub fn from_env() -> Result<Self, ConfigError> {
        let topic_prefix = std::env::var("PRESENCE_TOPIC_PREFIX").unwrap_or_else(|_| DEFAULT_TOPIC_PREFIX.to_string());
        let dedup = parse_dedup(std::env::var("PRESENCE_DEDUP").ok().as_deref())?;

        Ok(Self {
            topic_prefix,
            dedup,
            snapshot_capacity: env_parse("PRESENCE_SNAPSHOT_CAPACITY", DEFAULT_SNAPSHOT_CAPACITY).max(1),
            event_capacity: env_parse("PRESENCE_EVENT_CAPACITY", DEFAULT_EVENT_CAPACITY).max(1),
        })
    }

    /// Transport topic for a logical topic name.
    #[must_use]
    pub fn transport_topic(&self, topic: &str) -> String {
        format!("{}{topic}", self.topic_prefix)
    }
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn parse_dedup(raw: Option<&str>) -> Result<DedupPolicy, ConfigError> {
    match raw.unwrap_or("user") {
        "user" => Ok(DedupPolicy::ByUser),
        "session" => Ok(DedupPolicy::BySession),
        other => Err(ConfigError::Parse(format!(
            "unknown PRESENCE_DEDUP '{other}' (expected 'user' or 'session')"
        ))),
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
