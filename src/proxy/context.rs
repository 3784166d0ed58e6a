use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Per-request context that flows through identification, rule evaluation,
/// and the downstream handler. Carries request metadata and accumulates
/// state across the phases.
pub struct RequestContext {
    pub method: String,
    pub path: String,
    /// The extracted client identifier (typically an IP literal).
    pub identifier: String,
    /// Coarse endpoint label for metrics — bounded cardinality, never the raw path.
    pub endpoint: &'static str,
    pub start: Instant,
}

impl RequestContext {
    pub fn new(method: String, path: String, identifier: String) -> Self {
        let endpoint = endpoint_label(&path);
        Self {
            method,
            path,
            identifier,
            endpoint,
            start: Instant::now(),
        }
    }

    /// Record final metrics for a completed response. Every exit path of
    /// the handler runs through this exactly once.
    pub fn finalize_metrics(&self, resp_status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(resp_status);

        metrics::counter!(
            "gateway_http_requests_total",
            "endpoint" => self.endpoint,
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
        )
        .increment(1);

        metrics::histogram!(
            "gateway_http_request_duration_seconds",
            "endpoint" => self.endpoint,
        )
        .record(self.start.elapsed().as_secs_f64());
    }
}

/// Map a request path to a bounded metrics label.
fn endpoint_label(path: &str) -> &'static str {
    if path.starts_with("/api") {
        "api"
    } else if path.starts_with("/auth") {
        "auth"
    } else if path.starts_with("/admin") {
        "admin"
    } else if path == "/health" || path == "/healthz" {
        "health"
    } else {
        "other"
    }
}
