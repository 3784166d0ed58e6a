use crate::config::BreakerConfig;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Circuit breaker state machine: Closed → Open → HalfOpen → Closed/Open.
///
/// Guards check-and-increment calls against the distributed store. While the
/// breaker is open every admission decision comes from the fallback path —
/// the store is not touched until the recovery timeout elapses and a single
/// probe call is allowed through.
///
/// Observational and administrative store calls bypass the breaker entirely.
pub struct CircuitBreaker {
    /// 0 = Closed, 1 = Open, 2 = HalfOpen.
    state: AtomicU8,
    /// Consecutive failure count (in Closed state).
    consecutive_failures: AtomicU32,
    /// Consecutive successes in HalfOpen state.
    half_open_successes: AtomicU32,
    opened_at: Mutex<Option<Instant>>,
    config: BreakerConfig,
}

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Result of checking the breaker before a store call.
pub enum BreakerCheck {
    /// Breaker is closed — call the store normally.
    Allowed,
    /// Breaker is half-open — this call is the recovery probe.
    Probe,
    /// Breaker is open — skip the store, use the fallback.
    Rejected,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            consecutive_failures: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            opened_at: Mutex::new(None),
            config,
        }
    }

    /// Check whether the next store call may proceed.
    pub fn check(&self) -> BreakerCheck {
        let state = self.state.load(Ordering::Acquire);
        match state {
            STATE_CLOSED => BreakerCheck::Allowed,
            STATE_OPEN => {
                let opened_at = self.opened_at.lock().unwrap();
                if let Some(at) = *opened_at {
                    if at.elapsed() >= Duration::from_secs(self.config.recovery_timeout_secs) {
                        drop(opened_at);
                        // CAS to HalfOpen — only one caller wins the probe.
                        if self
                            .state
                            .compare_exchange(
                                STATE_OPEN,
                                STATE_HALF_OPEN,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            self.half_open_successes.store(0, Ordering::Relaxed);
                            return BreakerCheck::Probe;
                        }
                    }
                }
                BreakerCheck::Rejected
            }
            STATE_HALF_OPEN => BreakerCheck::Probe,
            _ => BreakerCheck::Allowed,
        }
    }

    pub fn record_success(&self) {
        let state = self.state.load(Ordering::Acquire);
        match state {
            STATE_CLOSED => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
            }
            STATE_HALF_OPEN => {
                let count = self.half_open_successes.fetch_add(1, Ordering::Relaxed) + 1;
                if count >= self.config.success_threshold {
                    self.state.store(STATE_CLOSED, Ordering::Release);
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    tracing::info!(
                        "circuit_breaker: closed (store recovered after {} successes)",
                        count
                    );
                }
            }
            _ => {}
        }
    }

    pub fn record_failure(&self) {
        let state = self.state.load(Ordering::Acquire);
        match state {
            STATE_CLOSED => {
                let count = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if count >= self.config.failure_threshold {
                    self.state.store(STATE_OPEN, Ordering::Release);
                    *self.opened_at.lock().unwrap() = Some(Instant::now());
                    tracing::warn!(
                        "circuit_breaker: opened (after {} consecutive store failures)",
                        count
                    );
                }
            }
            STATE_HALF_OPEN => {
                // Probe failed — back to Open.
                self.state.store(STATE_OPEN, Ordering::Release);
                *self.opened_at.lock().unwrap() = Some(Instant::now());
                self.half_open_successes.store(0, Ordering::Relaxed);
                tracing::warn!("circuit_breaker: re-opened (probe failed in half-open)");
            }
            _ => {}
        }
    }

    /// Human-readable state for the stats endpoint.
    pub fn state_name(&self) -> &'static str {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => "open",
            STATE_HALF_OPEN => "half_open",
            _ => "closed",
        }
    }
}
