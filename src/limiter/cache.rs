use crate::config::{BreakerConfig, LimiterConfig};
use crate::error::GatewayError;
use crate::limiter::breaker::{BreakerCheck, CircuitBreaker};
use crate::limiter::decision::Decision;
use crate::limiter::rule::Rule;
use crate::limiter::store::{now_millis, MemoryCounterStore, RedisCounterStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Dual-tier counter cache: circuit breaker → distributed store → in-memory
/// fallback.
///
/// `check` never fails: when the distributed store is unusable the decision
/// comes from the local fallback, or — when the fallback is disabled — the
/// request is admitted with a full quota (fail-open, availability over
/// strictness; an explicit configuration choice).
pub struct CounterCache {
    redis: Option<RedisCounterStore>,
    memory: Arc<MemoryCounterStore>,
    breaker: CircuitBreaker,
    fallback_enabled: bool,
}

impl CounterCache {
    pub fn new(
        redis: Option<RedisCounterStore>,
        breaker_config: BreakerConfig,
        limiter: &LimiterConfig,
    ) -> Self {
        let memory = Arc::new(MemoryCounterStore::new(Duration::from_millis(
            limiter.local_cache_ttl_ms.max(1),
        )));
        Self {
            redis,
            memory,
            breaker: CircuitBreaker::new(breaker_config),
            fallback_enabled: limiter.enable_in_memory_fallback,
        }
    }

    /// Process-local cache without a distributed store. The fallback serves
    /// every decision — used in tests and store-less deployments.
    pub fn in_memory(limiter: &LimiterConfig) -> Self {
        let mut limiter = limiter.clone();
        limiter.enable_in_memory_fallback = true;
        Self::new(None, limiter.breaker.clone(), &limiter)
    }

    /// Handle to the fallback store, for starting its sweeper.
    pub fn memory_store(&self) -> Arc<MemoryCounterStore> {
        self.memory.clone()
    }

    /// Atomic check-and-increment, guarded by the circuit breaker.
    pub async fn check(&self, key: &str, rule: &Arc<Rule>) -> Decision {
        let now = now_millis();

        let Some(ref redis) = self.redis else {
            return self.fallback_decision(key, rule, now);
        };

        match self.breaker.check() {
            BreakerCheck::Rejected => self.fallback_decision(key, rule, now),
            BreakerCheck::Allowed | BreakerCheck::Probe => {
                match redis.check_and_increment(key, rule).await {
                    Ok(snap) => {
                        self.breaker.record_success();
                        Decision::from_counter(
                            rule.clone(),
                            snap.count,
                            snap.reset_time_ms,
                            snap.allowed,
                            now,
                        )
                    }
                    Err(e) => {
                        warn!("cache: store check failed, key={}, error={}", key, e);
                        metrics::counter!("gateway_store_errors_total", "op" => "check")
                            .increment(1);
                        self.breaker.record_failure();
                        self.fallback_decision(key, rule, now)
                    }
                }
            }
        }
    }

    /// Non-mutating observation. Bypasses the breaker — a failed read is
    /// logged and answered from the fallback tier.
    pub async fn current(&self, key: &str, rule: &Arc<Rule>) -> Decision {
        let now = now_millis();

        if let Some(ref redis) = self.redis {
            match redis.current(key, rule).await {
                Ok(snap) => {
                    return Decision::from_counter(
                        rule.clone(),
                        snap.count,
                        snap.reset_time_ms,
                        snap.allowed,
                        now,
                    );
                }
                Err(e) => {
                    warn!("cache: store read failed, key={}, error={}", key, e);
                }
            }
        }

        if self.fallback_enabled {
            let snap = self.memory.current(key, rule);
            Decision::from_counter(rule.clone(), snap.count, snap.reset_time_ms, snap.allowed, now)
        } else {
            Decision::fail_open(rule.clone(), now)
        }
    }

    /// Compensating decrement of one admission. Errors propagate so the
    /// maintenance queue can retry.
    pub async fn revert(&self, key: &str, rule: &Arc<Rule>) -> Result<(), GatewayError> {
        if let Some(ref redis) = self.redis {
            match redis.revert(key, rule).await {
                Ok(()) => {
                    metrics::counter!("gateway_rate_limit_reverts_total").increment(1);
                    return Ok(());
                }
                Err(e) if self.fallback_enabled => {
                    warn!("cache: store revert failed, using fallback, key={}, error={}", key, e);
                }
                Err(e) => return Err(e),
            }
        }
        self.memory.revert(key);
        metrics::counter!("gateway_rate_limit_reverts_total").increment(1);
        Ok(())
    }

    /// Administrative purge of a key in both tiers. Store failures propagate
    /// to the caller (surfaced as a 500 by the admin endpoint).
    pub async fn reset(&self, key: &str) -> Result<(), GatewayError> {
        self.memory.reset(key);
        if let Some(ref redis) = self.redis {
            redis.reset(key).await?;
        }
        Ok(())
    }

    /// Delete exhausted distributed keys matching `pattern`.
    pub async fn cleanup(&self, pattern: &str, rules: &[Arc<Rule>]) -> Result<u64, GatewayError> {
        match self.redis {
            Some(ref redis) => redis.cleanup(pattern, rules).await,
            None => Ok(0),
        }
    }

    /// Live distributed key count for the stats endpoint.
    pub async fn active_key_count(&self, pattern: &str) -> Result<u64, GatewayError> {
        match self.redis {
            Some(ref redis) => redis.active_key_count(pattern).await,
            None => Ok(0),
        }
    }

    pub fn local_cache_len(&self) -> usize {
        self.memory.len()
    }

    pub fn breaker_state(&self) -> &'static str {
        self.breaker.state_name()
    }

    fn fallback_decision(&self, key: &str, rule: &Arc<Rule>, now: u64) -> Decision {
        if self.fallback_enabled {
            let snap = self.memory.check_and_increment(key, rule);
            Decision::from_counter(rule.clone(), snap.count, snap.reset_time_ms, snap.allowed, now)
        } else {
            metrics::counter!("gateway_rate_limit_fail_open_total").increment(1);
            Decision::fail_open(rule.clone(), now)
        }
    }
}
