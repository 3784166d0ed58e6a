use super::{now_millis, CounterEntry, CounterSnapshot};
use crate::limiter::rule::Rule;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

/// Process-local counter store used while the distributed store is
/// unreachable.
///
/// Always runs fixed-window semantics, even for sliding rules — keeping a
/// per-client timestamp set in memory under failure pressure is exactly the
/// kind of unbounded growth the fallback must avoid. This is a documented
/// deviation from the primary store.
pub struct MemoryCounterStore {
    entries: DashMap<String, CounterEntry>,
    sweep_interval: Duration,
}

impl MemoryCounterStore {
    pub fn new(sweep_interval: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            sweep_interval,
        }
    }

    /// Fixed-window check-and-increment. Denials never increment.
    pub fn check_and_increment(&self, key: &str, rule: &Rule) -> CounterSnapshot {
        let now = now_millis();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| CounterEntry::fresh(now, rule.window_ms));

        if entry.expired(now) {
            *entry = CounterEntry::fresh(now, rule.window_ms);
        }

        if entry.count >= rule.max_requests {
            return CounterSnapshot {
                count: entry.count,
                reset_time_ms: entry.reset_time,
                allowed: false,
            };
        }

        entry.count += 1;
        CounterSnapshot {
            count: entry.count,
            reset_time_ms: entry.reset_time,
            allowed: true,
        }
    }

    /// Non-mutating observation.
    pub fn current(&self, key: &str, rule: &Rule) -> CounterSnapshot {
        let now = now_millis();
        match self.entries.get(key) {
            Some(entry) if !entry.expired(now) => CounterSnapshot {
                count: entry.count,
                reset_time_ms: entry.reset_time,
                allowed: entry.count < rule.max_requests,
            },
            _ => CounterSnapshot {
                count: 0,
                reset_time_ms: super::aligned_window_end(now, rule.window_ms),
                allowed: true,
            },
        }
    }

    /// Compensating decrement of one admission in the current window.
    pub fn revert(&self, key: &str) {
        let now = now_millis();
        if let Some(mut entry) = self.entries.get_mut(key) {
            if !entry.expired(now) {
                entry.count = entry.count.saturating_sub(1);
            }
        }
    }

    pub fn reset(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove entries whose window has already reset.
    pub fn sweep(&self) {
        let now = now_millis();
        self.entries.retain(|_, entry| !entry.expired(now));
    }

    /// Spawn a background tokio task that periodically sweeps expired
    /// entries. Call this once after constructing the store.
    pub fn start_sweeper(self: &Arc<Self>) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(store.sweep_interval);
            loop {
                interval.tick().await;
                store.sweep();
                metrics::gauge!("gateway_local_cache_entries").set(store.len() as f64);
            }
        });
    }
}
