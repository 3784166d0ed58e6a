use crate::error::GatewayError;
use crate::limiter::cache::CounterCache;
use crate::limiter::rule::Rule;
use crate::limiter::store::now_millis;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Work item processed off the request path.
#[derive(Clone)]
pub enum OperationJob {
    /// Compensating decrement of one admission.
    Revert { key: String, rule: Arc<Rule> },
    /// Administrative purge of a key.
    Reset { key: String },
    /// Delete exhausted keys matching a pattern.
    Cleanup { pattern: String },
}

impl OperationJob {
    pub fn kind(&self) -> &'static str {
        match self {
            OperationJob::Revert { .. } => "revert",
            OperationJob::Reset { .. } => "reset",
            OperationJob::Cleanup { .. } => "cleanup",
        }
    }

    fn target(&self) -> &str {
        match self {
            OperationJob::Revert { key, .. } => key,
            OperationJob::Reset { key } => key,
            OperationJob::Cleanup { pattern } => pattern,
        }
    }
}

/// Retry behaviour for one queue.
#[derive(Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// First retry delay; doubles on every further attempt.
    pub backoff_base: Duration,
}

impl RetryPolicy {
    /// Request-path operations queue: up to 3 attempts, backoff from 2s.
    pub fn operations() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
        }
    }

    /// Recurring cleanup queue: up to 2 attempts.
    pub fn periodic() -> Self {
        Self {
            max_attempts: 2,
            backoff_base: Duration::from_secs(2),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// How many finished job records each queue retains for inspection.
#[derive(Clone, Copy)]
pub struct RetentionPolicy {
    pub completed: usize,
    pub failed: usize,
}

impl RetentionPolicy {
    pub fn operations() -> Self {
        Self {
            completed: 10,
            failed: 5,
        }
    }

    pub fn periodic() -> Self {
        Self {
            completed: 3,
            failed: 2,
        }
    }
}

/// Record of a finished job, kept in the bounded retention logs.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub kind: &'static str,
    pub target: String,
    pub attempts: u32,
    pub finished_at_ms: u64,
}

/// Point-in-time queue counters for the stats endpoints.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct QueueSnapshot {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Default)]
struct QueueState {
    waiting: AtomicU64,
    active: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    completed_log: Mutex<VecDeque<JobRecord>>,
    failed_log: Mutex<VecDeque<JobRecord>>,
}

/// An asynchronous job queue with bounded retries and bounded retention.
///
/// Backed by an unbounded channel and a single worker task per queue —
/// maintenance work is low-volume and must never apply backpressure to the
/// request path. `pause` stops intake; `drain` waits for in-flight work.
pub struct JobQueue {
    name: &'static str,
    tx: mpsc::UnboundedSender<OperationJob>,
    state: Arc<QueueState>,
    paused: Arc<AtomicBool>,
}

impl JobQueue {
    /// Spawn the worker and return the queue handle. The worker exits when
    /// the handle (and every delayed-enqueue task) has been dropped.
    pub fn start(
        name: &'static str,
        cache: Arc<CounterCache>,
        rules: Vec<Arc<Rule>>,
        retry: RetryPolicy,
        retention: RetentionPolicy,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<OperationJob>();
        let state = Arc::new(QueueState::default());

        {
            let state = state.clone();
            tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    state.waiting.fetch_sub(1, Ordering::Relaxed);
                    state.active.fetch_add(1, Ordering::Relaxed);

                    let attempts = run_with_retries(&cache, &rules, &job, retry, name).await;
                    let record = JobRecord {
                        kind: job.kind(),
                        target: job.target().to_string(),
                        attempts: attempts.unwrap_or(retry.max_attempts),
                        finished_at_ms: now_millis(),
                    };

                    match attempts {
                        Some(_) => {
                            state.completed.fetch_add(1, Ordering::Relaxed);
                            push_bounded(&state.completed_log, record, retention.completed);
                        }
                        None => {
                            state.failed.fetch_add(1, Ordering::Relaxed);
                            push_bounded(&state.failed_log, record, retention.failed);
                        }
                    }

                    state.active.fetch_sub(1, Ordering::Relaxed);
                }
                debug!("queue: {} worker stopped", name);
            });
        }

        Self {
            name,
            tx,
            state,
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Enqueue a job, optionally delayed. Fails only when the queue is
    /// paused or its worker has gone away — callers log and move on.
    pub fn enqueue(&self, job: OperationJob, delay: Duration) -> Result<(), GatewayError> {
        if self.paused.load(Ordering::Acquire) {
            return Err(GatewayError::QueueClosed);
        }

        self.state.waiting.fetch_add(1, Ordering::Relaxed);
        metrics::gauge!("gateway_queue_depth", "queue" => self.name)
            .set(self.state.waiting.load(Ordering::Relaxed) as f64);

        if delay.is_zero() {
            return self.send_now(job);
        }

        let tx = self.tx.clone();
        let state = self.state.clone();
        let paused = self.paused.clone();
        let name = self.name;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if paused.load(Ordering::Acquire) || tx.send(job).is_err() {
                state.waiting.fetch_sub(1, Ordering::Relaxed);
                debug!("queue: {} dropped delayed job at shutdown", name);
            }
        });
        Ok(())
    }

    fn send_now(&self, job: OperationJob) -> Result<(), GatewayError> {
        self.tx.send(job).map_err(|_| {
            self.state.waiting.fetch_sub(1, Ordering::Relaxed);
            GatewayError::QueueClosed
        })
    }

    /// Stop accepting new jobs.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    /// Wait until waiting and active both reach zero, up to `timeout`.
    /// Returns `false` when work was still pending at the deadline.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let snap = self.snapshot();
            if snap.waiting == 0 && snap.active == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "queue: {} drain timed out, waiting={}, active={}",
                    self.name, snap.waiting, snap.active
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            waiting: self.state.waiting.load(Ordering::Relaxed),
            active: self.state.active.load(Ordering::Relaxed),
            completed: self.state.completed.load(Ordering::Relaxed),
            failed: self.state.failed.load(Ordering::Relaxed),
        }
    }

    pub fn recent_completed(&self) -> Vec<JobRecord> {
        self.state.completed_log.lock().unwrap().iter().cloned().collect()
    }

    pub fn recent_failed(&self) -> Vec<JobRecord> {
        self.state.failed_log.lock().unwrap().iter().cloned().collect()
    }
}

/// Run a job with retries; `Some(attempts)` on success, `None` when every
/// attempt failed.
async fn run_with_retries(
    cache: &CounterCache,
    rules: &[Arc<Rule>],
    job: &OperationJob,
    retry: RetryPolicy,
    queue_name: &str,
) -> Option<u32> {
    for attempt in 1..=retry.max_attempts.max(1) {
        match run_job(cache, rules, job).await {
            Ok(()) => return Some(attempt),
            Err(e) => {
                warn!(
                    "queue: {} job failed, kind={}, attempt={}/{}, error={}",
                    queue_name,
                    job.kind(),
                    attempt,
                    retry.max_attempts,
                    e
                );
                if attempt < retry.max_attempts {
                    tokio::time::sleep(retry.backoff(attempt)).await;
                }
            }
        }
    }
    metrics::counter!("gateway_queue_jobs_failed_total", "queue" => queue_name.to_string())
        .increment(1);
    None
}

async fn run_job(
    cache: &CounterCache,
    rules: &[Arc<Rule>],
    job: &OperationJob,
) -> Result<(), GatewayError> {
    match job {
        OperationJob::Revert { key, rule } => cache.revert(key, rule).await,
        OperationJob::Reset { key } => cache.reset(key).await,
        OperationJob::Cleanup { pattern } => {
            let deleted = cache.cleanup(pattern, rules).await?;
            if deleted > 0 {
                debug!("queue: cleanup removed {} keys, pattern={}", deleted, pattern);
            }
            Ok(())
        }
    }
}

fn push_bounded(log: &Mutex<VecDeque<JobRecord>>, record: JobRecord, cap: usize) {
    let mut log = log.lock().unwrap();
    log.push_back(record);
    while log.len() > cap {
        log.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LimiterConfig, RuleConfig};

    fn rule(id: &str, window_ms: u64, max_requests: u32) -> Arc<Rule> {
        Arc::new(Rule::compile(&RuleConfig {
            id: id.to_string(),
            window_ms,
            max_requests,
            algorithm: "fixed".to_string(),
            status_code: 429,
            message: None,
            key_by: "ip".to_string(),
            apply_paths: vec![],
            skip_paths: vec![],
        }))
    }

    fn in_memory_cache() -> Arc<CounterCache> {
        let cfg = LimiterConfig {
            enable_in_memory_fallback: true,
            ..LimiterConfig::default()
        };
        Arc::new(CounterCache::in_memory(&cfg))
    }

    async fn wait_drained(queue: &JobQueue) {
        assert!(queue.drain(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_revert_job_decrements_counter() {
        let cache = in_memory_cache();
        let rule = rule("r", 60_000, 10);
        let key = rule.counter_key("client");

        cache.check(&key, &rule).await;
        cache.check(&key, &rule).await;

        let queue = JobQueue::start(
            "operations",
            cache.clone(),
            vec![rule.clone()],
            RetryPolicy::operations(),
            RetentionPolicy::operations(),
        );
        queue
            .enqueue(
                OperationJob::Revert {
                    key: key.clone(),
                    rule: rule.clone(),
                },
                Duration::ZERO,
            )
            .unwrap();
        wait_drained(&queue).await;

        assert_eq!(cache.current(&key, &rule).await.total_requests, 1);
        assert_eq!(queue.snapshot().completed, 1);
    }

    #[tokio::test]
    async fn test_reset_job_purges_key() {
        let cache = in_memory_cache();
        let rule = rule("r", 60_000, 1);
        let key = rule.counter_key("client");

        cache.check(&key, &rule).await;
        assert!(!cache.check(&key, &rule).await.allowed);

        let queue = JobQueue::start(
            "operations",
            cache.clone(),
            vec![rule.clone()],
            RetryPolicy::operations(),
            RetentionPolicy::operations(),
        );
        queue
            .enqueue(OperationJob::Reset { key: key.clone() }, Duration::ZERO)
            .unwrap();
        wait_drained(&queue).await;

        assert!(cache.check(&key, &rule).await.allowed);
    }

    #[tokio::test]
    async fn test_paused_queue_rejects_enqueue() {
        let cache = in_memory_cache();
        let queue = JobQueue::start(
            "operations",
            cache,
            vec![],
            RetryPolicy::operations(),
            RetentionPolicy::operations(),
        );

        queue.pause();
        let err = queue.enqueue(
            OperationJob::Reset {
                key: "k".to_string(),
            },
            Duration::ZERO,
        );
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_completed_retention_is_bounded() {
        let cache = in_memory_cache();
        let queue = JobQueue::start(
            "operations",
            cache,
            vec![],
            RetryPolicy::operations(),
            RetentionPolicy::operations(),
        );

        for i in 0..25 {
            queue
                .enqueue(
                    OperationJob::Reset {
                        key: format!("k{}", i),
                    },
                    Duration::ZERO,
                )
                .unwrap();
        }
        wait_drained(&queue).await;

        let snap = queue.snapshot();
        assert_eq!(snap.completed, 25);
        assert!(queue.recent_completed().len() <= 10);
        // Most recent records survive.
        assert_eq!(queue.recent_completed().last().unwrap().target, "k24");
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_enqueue_waits() {
        let cache = in_memory_cache();
        let rule = rule("r", 60_000, 10);
        let key = rule.counter_key("client");
        cache.check(&key, &rule).await;

        let queue = JobQueue::start(
            "operations",
            cache.clone(),
            vec![rule.clone()],
            RetryPolicy::operations(),
            RetentionPolicy::operations(),
        );
        queue
            .enqueue(
                OperationJob::Revert {
                    key: key.clone(),
                    rule: rule.clone(),
                },
                Duration::from_secs(60),
            )
            .unwrap();

        assert_eq!(queue.snapshot().waiting, 1);
        // Virtual time: jump past the delay.
        tokio::time::sleep(Duration::from_secs(61)).await;
        wait_drained(&queue).await;
        assert_eq!(cache.current(&key, &rule).await.total_requests, 0);
    }

    #[test]
    fn test_backoff_doubles() {
        let retry = RetryPolicy::operations();
        assert_eq!(retry.backoff(1), Duration::from_secs(2));
        assert_eq!(retry.backoff(2), Duration::from_secs(4));
        assert_eq!(retry.backoff(3), Duration::from_secs(8));
    }

    #[test]
    fn test_retention_policies() {
        let ops = RetentionPolicy::operations();
        assert_eq!(ops.completed, 10);
        assert_eq!(ops.failed, 5);

        let periodic = RetentionPolicy::periodic();
        assert_eq!(periodic.completed, 3);
        assert_eq!(periodic.failed, 2);
    }

    #[test]
    fn test_job_kinds() {
        let rule = rule("r", 1000, 1);
        assert_eq!(
            OperationJob::Revert {
                key: "k".to_string(),
                rule
            }
            .kind(),
            "revert"
        );
        assert_eq!(OperationJob::Reset { key: "k".to_string() }.kind(), "reset");
        assert_eq!(
            OperationJob::Cleanup {
                pattern: "rl:*".to_string()
            }
            .kind(),
            "cleanup"
        );
    }
}
