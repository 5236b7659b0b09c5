//! Resource limits for frames, calls and event channels.

use std::time::Duration;

use serde::Deserialize;

/// Default maximum encoded frame size (16 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Default capacity of the local event broadcast channel.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Default timeout for a remote module call.
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;

/// Resource limits for connections and the local event channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Maximum encoded frame size in bytes. Larger frames close the connection.
    pub max_frame_bytes: usize,

    /// Broadcast capacity of the local event emitter. Slow subscribers that
    /// fall further behind than this skip events (logged as lag).
    pub event_channel_capacity: usize,

    /// Timeout for a single remote module call.
    pub call_timeout_ms: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
        }
    }
}

impl ResourceLimits {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}
