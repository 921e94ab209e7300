//! Configuration for the bus and the event log.
//!
//! Every setting has a default; `from_env()` overrides individual values from
//! `CONDUIT_*` environment variables. Unparsable values are ignored with a warning.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::message_bus::ChannelOptions;

/// Message bus configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    /// Options for channels created implicitly (first publish / subscribe).
    pub default_channel_options: ChannelOptions,
    /// Bound on the dead letter queue. `None` keeps every entry.
    pub dead_letter_capacity: Option<usize>,
    /// Timeout used by `request_default`.
    pub request_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            default_channel_options: ChannelOptions::default(),
            dead_letter_capacity: None,
            request_timeout: Duration::from_millis(5_000),
        }
    }
}

impl BusConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        let opts = &mut config.default_channel_options;
        if let Some(v) = env_parse::<u32>("CONDUIT_MAX_RETRIES") {
            opts.max_retries = v;
        }
        if let Some(v) = env_parse::<u64>("CONDUIT_RETRY_DELAY_MS") {
            opts.retry_delay_ms = v;
        }
        if let Some(v) = env_parse::<u64>("CONDUIT_MESSAGE_TTL_MS") {
            opts.ttl_ms = Some(v);
        }
        if let Some(v) = env_parse::<usize>("CONDUIT_DLQ_CAPACITY") {
            config.dead_letter_capacity = Some(v);
        }
        if let Some(v) = env_parse::<u64>("CONDUIT_REQUEST_TIMEOUT_MS") {
            config.request_timeout = Duration::from_millis(v);
        }
        config
    }

    pub fn with_default_channel_options(mut self, options: ChannelOptions) -> Self {
        self.default_channel_options = options;
        self
    }

    pub fn with_dead_letter_capacity(mut self, capacity: usize) -> Self {
        self.dead_letter_capacity = Some(capacity);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Event log configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLogConfig {
    pub events_prefix: String,
    pub snapshots_prefix: String,
    /// Snapshot cadence for `replay_and_snapshot`: store a snapshot once this many
    /// events were folded on top of the previous one. `None` disables it.
    pub snapshot_every: Option<u64>,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            events_prefix: "events/".to_string(),
            snapshots_prefix: "snapshots/".to_string(),
            snapshot_every: None,
        }
    }
}

impl EventLogConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_parse::<u64>("CONDUIT_SNAPSHOT_EVERY") {
            config.snapshot_every = (v > 0).then_some(v);
        }
        config
    }

    pub fn with_snapshot_every(mut self, every: u64) -> Self {
        self.snapshot_every = (every > 0).then_some(every);
        self
    }

    pub fn with_prefixes(mut self, events: impl Into<String>, snapshots: impl Into<String>) -> Self {
        self.events_prefix = events.into();
        self.snapshots_prefix = snapshots.into();
        self
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(variable = name, value = %raw, "ignoring unparsable configuration value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let bus = BusConfig::default();
        assert_eq!(bus.default_channel_options.max_retries, 3);
        assert_eq!(bus.default_channel_options.retry_delay_ms, 1_000);
        assert!(!bus.default_channel_options.persistent);
        assert_eq!(bus.dead_letter_capacity, None);

        let log = EventLogConfig::default().with_snapshot_every(0);
        assert_eq!(log.snapshot_every, None);
        assert_eq!(log.events_prefix, "events/");
    }

    #[test]
    fn builders_override_defaults() {
        let bus = BusConfig::default()
            .with_dead_letter_capacity(10)
            .with_request_timeout(Duration::from_millis(50));
        assert_eq!(bus.dead_letter_capacity, Some(10));
        assert_eq!(bus.request_timeout, Duration::from_millis(50));
    }
}
