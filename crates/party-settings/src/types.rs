//! Client settings types.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a settings
//! file only needs the fields it overrides.

use serde::{Deserialize, Serialize};

/// Default delay between failed full-state fetches.
pub const DEFAULT_RESYNC_RETRY_DELAY_MS: u64 = 200;
/// Default capacity of every event broadcast channel.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1024;
/// Smallest accepted event channel capacity.
pub const MIN_EVENT_CHANNEL_CAPACITY: usize = 16;

/// Root settings for the party client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// Settings schema version.
    pub version: String,
    /// State synchronization behaviour.
    pub sync: SyncSettings,
    /// Event delivery.
    pub events: EventSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            sync: SyncSettings::default(),
            events: EventSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl ClientSettings {
    /// Clamp out-of-range values, logging what was corrected.
    pub fn validate(&mut self) {
        if self.sync.resync_retry_delay_ms == 0 {
            tracing::warn!("resync_retry_delay_ms must be positive, using 1");
            self.sync.resync_retry_delay_ms = 1;
        }
        if self.events.channel_capacity < MIN_EVENT_CHANNEL_CAPACITY {
            tracing::warn!(
                capacity = self.events.channel_capacity,
                min = MIN_EVENT_CHANNEL_CAPACITY,
                "event channel capacity too small, clamping"
            );
            self.events.channel_capacity = MIN_EVENT_CHANNEL_CAPACITY;
        }
    }
}

/// State synchronization settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSettings {
    /// Fixed delay before retrying a failed full-state fetch.
    pub resync_retry_delay_ms: u64,
    /// Cap on stale-settings retries of a readiness update. `None` retries
    /// until the update goes through or the session ends.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readiness_max_retries: Option<u32>,
    /// Retry a settings update once after a resync when the server reports
    /// the local settings version as outdated.
    pub settings_update_retry: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            resync_retry_delay_ms: DEFAULT_RESYNC_RETRY_DELAY_MS,
            readiness_max_retries: None,
            settings_update_retry: true,
        }
    }
}

/// Event delivery settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventSettings {
    /// Broadcast capacity; slower subscribers lag past this many events.
    pub channel_capacity: usize,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level (`trace` .. `error`), overridden by `RUST_LOG`.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            json: false,
        }
    }
}
