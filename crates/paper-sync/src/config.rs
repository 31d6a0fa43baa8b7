//! Relay and client configuration.
//!
//! Durations are read as milliseconds when deserialized, so a config file
//! holds `{"flush_timeout": 5000}` rather than a structured duration.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

/// What a client does with unconfirmed local steps when the relay no longer
/// knows its session and it has to start again from a fresh snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResyncPolicy {
    /// Drop the steps and report how many were lost
    Discard,
    /// Re-apply the steps on top of the snapshot as a new local transaction
    ///
    /// Steps keep the positions they had before the resync. Edits made on
    /// the fresh snapshot before a held replay can shift the text under
    /// them, so a late replay may land in the wrong place or be dropped.
    Replay,
    /// Keep the steps aside until the caller decides
    #[default]
    Hold,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Number of steps each room keeps for resuming clients
    pub history_limit: usize,
    /// Capacity of the store-wide relay event channel
    pub event_capacity: usize,
    #[serde(with = "millis")]
    pub persistence_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            history_limit: 1000,
            event_capacity: 1000,
            persistence_interval: Duration::from_secs(10),
        }
    }
}

impl RelayConfig {
    pub fn set_history_limit(&mut self, limit: usize) {
        self.history_limit = limit;
    }

    pub fn set_persistence_interval(&mut self, interval: Duration) {
        self.persistence_interval = interval;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How long a submitted batch may go unanswered before the connection is
    /// considered broken
    #[serde(with = "millis")]
    pub flush_timeout: Duration,
    /// First delay between reconnect attempts, doubled after each failure
    #[serde(with = "millis")]
    pub reconnect_delay: Duration,
    #[serde(with = "millis")]
    pub max_reconnect_delay: Duration,
    pub resync_policy: ResyncPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            flush_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            resync_policy: ResyncPolicy::Hold,
        }
    }
}

impl ClientConfig {
    pub fn set_flush_timeout(&mut self, timeout: Duration) {
        self.flush_timeout = timeout;
    }

    pub fn set_resync_policy(&mut self, policy: ResyncPolicy) {
        self.resync_policy = policy;
    }

    /// Delay before reconnect attempt number `attempt` (starting at 0)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.reconnect_delay
            .saturating_mul(factor)
            .min(self.max_reconnect_delay)
    }
}

mod millis {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ClientConfig =
            serde_json::from_value(json!({"flush_timeout": 2500, "resync_policy": "replay"}))
                .unwrap();
        assert_eq!(config.flush_timeout, Duration::from_millis(2500));
        assert_eq!(config.resync_policy, ResyncPolicy::Replay);
        assert_eq!(config.reconnect_delay, Duration::from_secs(1));

        let relay: RelayConfig = serde_json::from_value(json!({"history_limit": 10})).unwrap();
        assert_eq!(relay.history_limit, 10);
        assert_eq!(relay.persistence_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let config = ClientConfig::default();
        assert_eq!(config.backoff(0), Duration::from_secs(1));
        assert_eq!(config.backoff(3), Duration::from_secs(8));
        assert_eq!(config.backoff(10), Duration::from_secs(30));
        assert_eq!(config.backoff(u32::MAX), Duration::from_secs(30));
    }
}
