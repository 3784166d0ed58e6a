pub mod memory;
pub mod redis;

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub use self::memory::MemoryCounterStore;
pub use self::redis::RedisCounterStore;

/// Result of a counter operation: the authoritative count, the instant the
/// window resets, and whether this request was admitted.
#[derive(Debug, Clone, Copy)]
pub struct CounterSnapshot {
    pub count: u32,
    pub reset_time_ms: u64,
    pub allowed: bool,
}

/// Fixed-window counter record, shared by the distributed fixed path (as a
/// JSON payload) and the in-memory fallback.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CounterEntry {
    pub count: u32,
    pub reset_time: u64,
    pub created_at: u64,
}

impl CounterEntry {
    /// Fresh record for the fixed window containing `now`.
    pub fn fresh(now_ms: u64, window_ms: u64) -> Self {
        Self {
            count: 0,
            reset_time: aligned_window_end(now_ms, window_ms),
            created_at: now_ms,
        }
    }

    pub fn expired(&self, now_ms: u64) -> bool {
        now_ms >= self.reset_time
    }
}

/// End of the window aligned on multiples of the window length.
pub fn aligned_window_end(now_ms: u64, window_ms: u64) -> u64 {
    (now_ms / window_ms) * window_ms + window_ms
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
