use crate::config::GatewayConfig;
use crate::limiter::cache::CounterCache;
use crate::limiter::evaluator::RuleSet;
use crate::limiter::store::RedisCounterStore;
use crate::limiter::throttle::LocalThrottle;
use crate::maintenance::queue::{JobQueue, RetentionPolicy, RetryPolicy};
use crate::maintenance::worker::MaintenanceWorker;
use crate::metrics::Metrics;
use anyhow::Result;
use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Shared gateway state, cheaply cloneable.
///
/// The store client is a process-scoped handle owned here and passed into
/// the cache at construction — no hidden globals. Reads of the config go
/// through `ArcSwap::load` and stay lock-free.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<ArcSwap<GatewayConfig>>,
    pub rules: Arc<RuleSet>,
    pub throttle: Option<Arc<LocalThrottle>>,
    pub operations_queue: Arc<JobQueue>,
    pub cleanup_queue: Arc<JobQueue>,
    pub worker: Arc<MaintenanceWorker>,
    pub metrics: Metrics,
    pub started_at: Instant,
}

impl GatewayState {
    pub async fn new(config: GatewayConfig) -> Result<Self> {
        let metrics = Metrics::install();

        // The distributed store is optional at startup: when the initial
        // connection fails the gateway still serves traffic from the
        // fallback tier (or fails open), and operators see it in the logs.
        let redis = match RedisCounterStore::connect(&config.redis).await {
            Ok(store) => {
                info!(
                    "store: connected, host={}, port={}",
                    config.redis.host, config.redis.port
                );
                Some(store)
            }
            Err(e) => {
                warn!(
                    "store: unavailable at startup, continuing without it, error={}",
                    e
                );
                None
            }
        };

        let cache = Arc::new(CounterCache::new(
            redis,
            config.limiter.breaker.clone(),
            &config.limiter,
        ));
        cache.memory_store().start_sweeper();

        let rules = Arc::new(RuleSet::new(&config.limiter, cache.clone()));

        // The throttle paces clients at the cadence of the tightest window.
        let throttle = if config.limiter.enable_local_throttle {
            rules
                .rules()
                .iter()
                .min_by_key(|r| r.window_ms)
                .map(|burst_rule| {
                    Arc::new(LocalThrottle::from_rule(
                        burst_rule,
                        config.limiter.max_throttle_delay_ms,
                    ))
                })
        } else {
            None
        };

        let rule_list = rules.rules().to_vec();
        let operations_queue = Arc::new(JobQueue::start(
            "operations",
            cache.clone(),
            rule_list.clone(),
            RetryPolicy::operations(),
            RetentionPolicy::operations(),
        ));
        let cleanup_queue = Arc::new(JobQueue::start(
            "cleanup",
            cache.clone(),
            rule_list,
            RetryPolicy::periodic(),
            RetentionPolicy::periodic(),
        ));

        let worker = Arc::new(MaintenanceWorker::new(
            operations_queue.clone(),
            cleanup_queue.clone(),
            cache,
            config.maintenance.clone(),
        ));

        Ok(Self {
            config: Arc::new(ArcSwap::new(Arc::new(config))),
            rules,
            throttle,
            operations_queue,
            cleanup_queue,
            worker,
            metrics,
            started_at: Instant::now(),
        })
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }
}
