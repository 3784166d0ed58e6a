use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`, `histogram!`) can be used anywhere in the codebase. The
/// `PrometheusHandle` is retained solely for rendering the `/metrics`
/// endpoint. A second install (e.g. under the test harness) leaves the
/// existing recorder in place and renders empty output.
#[derive(Clone)]
pub struct Metrics {
    handle: Option<PrometheusHandle>,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Call once at startup before any macro use.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder();

        let handle = match handle {
            Ok(h) => Some(h),
            Err(e) => {
                tracing::warn!("metrics: recorder already installed: {}", e);
                None
            }
        };

        // --- Describe all metrics (adds HELP / TYPE lines) ---

        // request path
        describe_counter!(
            "gateway_http_requests_total",
            Unit::Count,
            "Total HTTP requests processed"
        );
        describe_histogram!(
            "gateway_http_request_duration_seconds",
            Unit::Seconds,
            "Total request duration from client perspective"
        );

        // rate limiting
        describe_counter!(
            "gateway_rate_limit_allowed_total",
            Unit::Count,
            "Total requests allowed by the rate limiter"
        );
        describe_counter!(
            "gateway_rate_limit_rejected_total",
            Unit::Count,
            "Total requests rejected by the rate limiter"
        );
        describe_counter!(
            "gateway_rate_limit_reverts_total",
            Unit::Count,
            "Total compensating reverts applied to counters"
        );
        describe_counter!(
            "gateway_rate_limit_fail_open_total",
            Unit::Count,
            "Requests admitted because the limiter could not decide"
        );
        describe_histogram!(
            "gateway_throttle_delay_seconds",
            Unit::Seconds,
            "Delay injected by the local throttle"
        );

        // store & fallback
        describe_counter!(
            "gateway_store_errors_total",
            Unit::Count,
            "Distributed store operation failures"
        );
        describe_gauge!(
            "gateway_local_cache_entries",
            Unit::Count,
            "Entries currently held by the in-memory fallback store"
        );

        // maintenance
        describe_gauge!(
            "gateway_queue_depth",
            Unit::Count,
            "Jobs waiting per maintenance queue"
        );
        describe_counter!(
            "gateway_queue_jobs_failed_total",
            Unit::Count,
            "Maintenance jobs that exhausted their retries"
        );

        Self { handle }
    }

    /// Render the Prometheus exposition for the `/metrics` endpoint.
    pub fn render(&self) -> String {
        self.handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}
