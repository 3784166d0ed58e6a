use crate::limiter::rule::Rule;
use crate::limiter::store::now_millis;
use dashmap::DashMap;
use std::time::Duration;

/// Sweep trigger: when the map grows past this many clients, entries idle
/// for longer than `SWEEP_IDLE_MS` are dropped.
const SWEEP_THRESHOLD: usize = 1000;
const SWEEP_IDLE_MS: u64 = 60_000;

/// Per-client inter-arrival smoothing.
///
/// Spaces requests from one client at least `min_interval` apart by sleeping
/// before admission — latency is introduced deliberately so short bursts are
/// flattened instead of denied. The delay is capped so a cold client can
/// never be held longer than `max_delay`.
pub struct LocalThrottle {
    last_seen: DashMap<String, u64>,
    min_interval_ms: u64,
    max_delay_ms: u64,
}

impl LocalThrottle {
    pub fn new(min_interval_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            last_seen: DashMap::new(),
            min_interval_ms,
            max_delay_ms,
        }
    }

    /// Derive the pacing interval from a burst rule: one request per
    /// `window / max_requests`.
    pub fn from_rule(rule: &Rule, max_delay_ms: u64) -> Self {
        let min_interval_ms = (rule.window_ms / u64::from(rule.max_requests.max(1))).max(1);
        Self::new(min_interval_ms, max_delay_ms)
    }

    /// Sleep long enough to keep this client at the configured pace, then
    /// record the arrival.
    pub async fn acquire(&self, identifier: &str) {
        let delay = self.delay_for(identifier, now_millis());
        if delay > 0 {
            metrics::histogram!("gateway_throttle_delay_seconds")
                .record(delay as f64 / 1000.0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.last_seen.insert(identifier.to_string(), now_millis());

        if self.last_seen.len() > SWEEP_THRESHOLD {
            self.sweep(now_millis());
        }
    }

    /// Pure delay computation, separated for testability.
    fn delay_for(&self, identifier: &str, now_ms: u64) -> u64 {
        let Some(last) = self.last_seen.get(identifier).map(|e| *e) else {
            return 0;
        };
        let elapsed = now_ms.saturating_sub(last);
        self.min_interval_ms
            .saturating_sub(elapsed)
            .min(self.max_delay_ms)
    }

    /// Remove the throttle record for an identifier (administrative reset).
    pub fn forget(&self, identifier: &str) {
        self.last_seen.remove(identifier);
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }

    fn sweep(&self, now_ms: u64) {
        self.last_seen
            .retain(|_, last| now_ms.saturating_sub(*last) < SWEEP_IDLE_MS);
    }
}
