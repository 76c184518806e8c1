//! Client configuration.
//!
//! Defaults reproduce the production tuning: a 30 second presence heartbeat,
//! a 2 second typing debounce, a 3 second typing display timeout and a five
//! minute delete-for-everyone window. Hosts can deserialize the struct from
//! JSON; missing fields fall back to these defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default presence heartbeat period in seconds.
pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;

/// Default idle time after the last keystroke before `stop_typing` is sent.
pub const DEFAULT_TYPING_IDLE_MS: u64 = 2_000;

/// Default time a remote typing indicator stays visible without renewal.
pub const DEFAULT_TYPING_DISPLAY_MS: u64 = 3_000;

/// Default delete-for-everyone window in seconds (5 minutes).
pub const DEFAULT_DELETE_WINDOW_SECS: i64 = 5 * 60;

/// Default blob bucket for attachments.
pub const DEFAULT_MEDIA_BUCKET: &str = "chat-media";

/// Default `Cache-Control` max-age for uploaded attachments.
pub const DEFAULT_MEDIA_CACHE_SECS: u32 = 3600;

/// Default capacity of internal signal channels.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Configuration for a [`crate::ChatClient`] and its components
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Presence heartbeat period (seconds)
    pub heartbeat_interval_secs: u64,
    /// Debounce before broadcasting `stop_typing` (milliseconds)
    pub typing_idle_timeout_ms: u64,
    /// Auto-clear for a received typing indicator (milliseconds)
    pub typing_display_timeout_ms: u64,
    /// Delete-for-everyone window measured from creation (seconds)
    pub delete_window_secs: i64,
    /// Blob bucket holding attachments
    pub media_bucket: String,
    /// Cache max-age attached to uploads (seconds)
    pub media_cache_control_secs: u32,
    /// Capacity of the broadcast channels used for component signals
    pub event_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_SECS,
            typing_idle_timeout_ms: DEFAULT_TYPING_IDLE_MS,
            typing_display_timeout_ms: DEFAULT_TYPING_DISPLAY_MS,
            delete_window_secs: DEFAULT_DELETE_WINDOW_SECS,
            media_bucket: DEFAULT_MEDIA_BUCKET.to_string(),
            media_cache_control_secs: DEFAULT_MEDIA_CACHE_SECS,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl ClientConfig {
    /// Parse from JSON, filling unspecified fields with defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would disable a timer or break a component.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_secs == 0 {
            return Err(Error::InvalidConfig("heartbeat interval must be positive".into()));
        }
        if self.typing_idle_timeout_ms == 0 || self.typing_display_timeout_ms == 0 {
            return Err(Error::InvalidConfig("typing timeouts must be positive".into()));
        }
        if self.delete_window_secs <= 0 {
            return Err(Error::InvalidConfig("delete window must be positive".into()));
        }
        if self.media_bucket.trim().is_empty() {
            return Err(Error::InvalidConfig("media bucket cannot be empty".into()));
        }
        if self.event_buffer == 0 {
            return Err(Error::InvalidConfig("event buffer must be positive".into()));
        }
        Ok(())
    }

    /// Presence heartbeat period.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Local typing debounce.
    pub fn typing_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.typing_idle_timeout_ms)
    }

    /// Remote typing auto-clear.
    pub fn typing_display_timeout(&self) -> Duration {
        Duration::from_millis(self.typing_display_timeout_ms)
    }

    /// Delete-for-everyone window.
    pub fn delete_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.delete_window_secs)
    }
}
