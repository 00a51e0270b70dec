//! Segment, polling and relay configuration

use crate::poll::{Budget, Poller};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Layout parameters fixed at segment creation
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SegmentConfig {
    /// Entries per queue
    pub capacity: usize,
    /// Largest payload a slot can hold, in bytes
    pub max_payload: usize,
    /// How long a lock owner may hold the lock before waiters take it over
    pub stale_lock_timeout_ms: u64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            capacity: defaults::capacity(),
            max_payload: defaults::max_payload(),
            stale_lock_timeout_ms: defaults::stale_lock_timeout_ms(),
        }
    }
}

impl SegmentConfig {
    pub fn stale_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_lock_timeout_ms)
    }
}

/// Poll cadence and budget
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PollConfig {
    pub interval_ms: u64,
    pub attempts: u32,
    /// Wall-clock budget; replaces `attempts` when set
    pub deadline_ms: Option<u64>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: defaults::poll_interval_ms(),
            attempts: defaults::poll_attempts(),
            deadline_ms: None,
        }
    }
}

impl PollConfig {
    pub fn poller(&self) -> Poller {
        let budget = match self.deadline_ms {
            Some(ms) => Budget::Deadline(Duration::from_millis(ms)),
            None => Budget::Attempts(self.attempts),
        };
        Poller::new(Duration::from_millis(self.interval_ms), budget)
    }
}

/// Host configuration loaded from TOML
#[derive(Deserialize, Debug)]
pub struct RelayConfig {
    pub segment: String,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    #[serde(default)]
    pub queue: SegmentConfig,
    #[serde(default)]
    pub poll: PollConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),
}

mod defaults {
    pub fn capacity() -> usize {
        100
    }

    pub fn max_payload() -> usize {
        4096
    }

    pub fn stale_lock_timeout_ms() -> u64 {
        2_000
    }

    pub fn poll_interval_ms() -> u64 {
        100
    }

    pub fn poll_attempts() -> u32 {
        100
    }

    pub fn log_level() -> String {
        "info".into()
    }
}

impl RelayConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = RelayConfig::from_toml(
            r#"
            segment = "calc"

            [queue]
            capacity = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.segment, "calc");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.queue.capacity, 8);
        assert_eq!(config.queue.max_payload, 4096);
        assert_eq!(config.poll, PollConfig::default());
    }

    #[test]
    fn test_deadline_replaces_attempts() {
        let config = RelayConfig::from_toml(
            r#"
            segment = "calc"
            [poll]
            interval_ms = 10
            deadline_ms = 500
            "#,
        )
        .unwrap();

        let poller = config.poll.poller();
        assert_eq!(poller.interval(), Duration::from_millis(10));
        assert_eq!(poller.budget(), Budget::Deadline(Duration::from_millis(500)));
    }

    #[test]
    fn test_missing_segment_is_parse_error() {
        assert!(matches!(
            RelayConfig::from_toml("log_level = \"debug\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            RelayConfig::load("/nonexistent/venomq.toml"),
            Err(ConfigError::Read { .. })
        ));
    }
}
