use crate::config::MaintenanceConfig;
use crate::limiter::cache::CounterCache;
use crate::maintenance::queue::{JobQueue, OperationJob};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::info;

/// Key pattern covering every counter the gateway owns.
pub const KEY_PATTERN: &str = "rl:*";

/// Owns the maintenance lifecycle: the recurring cleanup schedule, the
/// health probe, and the graceful drain of both queues at shutdown.
pub struct MaintenanceWorker {
    operations: Arc<JobQueue>,
    periodic: Arc<JobQueue>,
    cache: Arc<CounterCache>,
    config: MaintenanceConfig,
}

impl MaintenanceWorker {
    pub fn new(
        operations: Arc<JobQueue>,
        periodic: Arc<JobQueue>,
        cache: Arc<CounterCache>,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            operations,
            periodic,
            cache,
            config,
        }
    }

    /// Spawn the recurring cleanup and health probe loops. Loops exit when
    /// `shutdown` is notified.
    pub fn start(&self, shutdown: &Arc<Notify>) {
        self.start_periodic_cleanup(shutdown);
        self.start_health_probe(shutdown);
    }

    fn start_periodic_cleanup(&self, shutdown: &Arc<Notify>) {
        let queue = self.periodic.clone();
        let interval = Duration::from_secs(self.config.cleanup_interval_secs);
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            loop {
                if sleep_or_shutdown(interval, &shutdown).await {
                    return;
                }
                if let Err(e) = queue.enqueue(
                    OperationJob::Cleanup {
                        pattern: KEY_PATTERN.to_string(),
                    },
                    Duration::ZERO,
                ) {
                    tracing::warn!("maintenance: periodic cleanup enqueue failed: {}", e);
                }
            }
        });
    }

    fn start_health_probe(&self, shutdown: &Arc<Notify>) {
        let operations = self.operations.clone();
        let periodic = self.periodic.clone();
        let cache = self.cache.clone();
        let interval = Duration::from_secs(self.config.health_probe_interval_secs);
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            loop {
                if sleep_or_shutdown(interval, &shutdown).await {
                    return;
                }

                let ops = operations.snapshot();
                let per = periodic.snapshot();

                metrics::gauge!("gateway_queue_depth", "queue" => operations.name())
                    .set(ops.waiting as f64);
                metrics::gauge!("gateway_queue_depth", "queue" => periodic.name())
                    .set(per.waiting as f64);
                metrics::gauge!("gateway_local_cache_entries")
                    .set(cache.local_cache_len() as f64);

                info!(
                    ops_waiting = ops.waiting,
                    ops_active = ops.active,
                    ops_completed = ops.completed,
                    ops_failed = ops.failed,
                    cleanup_waiting = per.waiting,
                    cleanup_completed = per.completed,
                    cleanup_failed = per.failed,
                    local_cache_entries = cache.local_cache_len(),
                    breaker = cache.breaker_state(),
                    "maintenance: health probe"
                );
            }
        });
    }

    /// Graceful shutdown: stop intake on both queues, then wait for active
    /// jobs to finish within the configured drain budget.
    pub async fn shutdown(&self) {
        self.operations.pause();
        self.periodic.pause();

        let timeout = Duration::from_secs(self.config.drain_timeout_secs);
        let (ops_done, periodic_done) =
            tokio::join!(self.operations.drain(timeout), self.periodic.drain(timeout));

        info!(
            ops_drained = ops_done,
            periodic_drained = periodic_done,
            "maintenance: queues drained"
        );
    }
}

/// Sleep for `duration`, but return `true` immediately if shutdown is
/// signalled. Returns `false` if the full duration elapsed normally.
pub async fn sleep_or_shutdown(duration: Duration, shutdown: &Notify) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.notified() => true,
    }
}
