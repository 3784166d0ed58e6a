use super::GatewayState;
use crate::maintenance::worker::KEY_PATTERN;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};
use serde::Deserialize;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

fn json_response(status: u16, body: String) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(body))
        .unwrap()
}

pub async fn handle_admin(
    req: Request<Incoming>,
    state: GatewayState,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match (method.as_str(), path.as_str()) {
        ("GET", "/health") | ("GET", "/healthz") => {
            Ok(json_response(200, r#"{"status":"ok"}"#.to_string()))
        }

        ("GET", "/ready") | ("GET", "/readyz") => {
            let body = serde_json::json!({
                "status": "ready",
                "rules": state.rules.rules().len(),
                "breaker": state.rules.cache().breaker_state(),
            });
            Ok(json_response(200, body.to_string()))
        }

        ("GET", "/metrics") => {
            let body = state.metrics.render();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full_body(body))
                .unwrap())
        }

        ("GET", "/stats") => Ok(handle_stats(&state).await),

        ("GET", "/queues") => Ok(handle_queues(&state)),

        ("POST", "/admin/reset-rate-limit") => Ok(handle_reset(req, &state).await),

        _ => Ok(json_response(404, r#"{"error":"not found"}"#.to_string())),
    }
}

async fn handle_stats(state: &GatewayState) -> Response<BoxBody> {
    let cache = state.rules.cache();
    // A store hiccup must not take the stats endpoint down with it.
    let active_keys = match cache.active_key_count(KEY_PATTERN).await {
        Ok(n) => serde_json::json!(n),
        Err(e) => {
            tracing::warn!("admin: active key count failed: {}", e);
            serde_json::Value::Null
        }
    };

    let cfg = state.config.load();
    let body = serde_json::json!({
        "environment": cfg.server.environment,
        "uptime": humantime::format_duration(std::time::Duration::from_secs(
            state.uptime().as_secs()
        ))
        .to_string(),
        "uptimeSeconds": state.uptime().as_secs(),
        "breaker": cache.breaker_state(),
        "localCacheSize": cache.local_cache_len(),
        "activeRateLimitKeys": active_keys,
        "queues": {
            "operations": state.operations_queue.snapshot(),
            "cleanup": state.cleanup_queue.snapshot(),
        },
    });
    json_response(200, body.to_string())
}

fn handle_queues(state: &GatewayState) -> Response<BoxBody> {
    let recent = |records: Vec<crate::maintenance::queue::JobRecord>| -> Vec<serde_json::Value> {
        records
            .into_iter()
            .map(|r| {
                serde_json::json!({
                    "kind": r.kind,
                    "target": r.target,
                    "attempts": r.attempts,
                    "finishedAt": r.finished_at_ms,
                })
            })
            .collect()
    };

    let body = serde_json::json!({
        "operations": {
            "counts": state.operations_queue.snapshot(),
            "recentCompleted": recent(state.operations_queue.recent_completed()),
            "recentFailed": recent(state.operations_queue.recent_failed()),
        },
        "cleanup": {
            "counts": state.cleanup_queue.snapshot(),
            "recentCompleted": recent(state.cleanup_queue.recent_completed()),
            "recentFailed": recent(state.cleanup_queue.recent_failed()),
        },
    });
    json_response(200, body.to_string())
}

#[derive(Deserialize)]
struct ResetRequest {
    identifier: String,
    #[serde(rename = "ruleId")]
    rule_id: Option<String>,
}

/// `POST /admin/reset-rate-limit` — purge a client's counters.
///
/// Body: `{"identifier": "...", "ruleId": "..."}`; all rules when `ruleId`
/// is omitted. Malformed input is a 400, a store failure a 500. The
/// client's throttle record is removed alongside the counters.
pub async fn handle_reset(req: Request<Incoming>, state: &GatewayState) -> Response<BoxBody> {
    let bytes = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return json_response(
                400,
                format!(r#"{{"error":"failed to read request body: {}"}}"#, e),
            );
        }
    };

    let reset: ResetRequest = match serde_json::from_slice(&bytes) {
        Ok(r) => r,
        Err(e) => {
            return json_response(
                400,
                serde_json::json!({
                    "error": format!("invalid reset request: {}", e),
                })
                .to_string(),
            );
        }
    };

    if reset.identifier.is_empty() {
        return json_response(400, r#"{"error":"identifier must be a non-empty string"}"#.to_string());
    }

    let targets: Vec<_> = match reset.rule_id {
        Some(ref id) => match state.rules.find(id) {
            Some(rule) => vec![rule.clone()],
            None => {
                return json_response(
                    400,
                    serde_json::json!({"error": format!("unknown rule id: {}", id)}).to_string(),
                );
            }
        },
        None => state.rules.rules().to_vec(),
    };

    let cache = state.rules.cache();
    let mut reset_count = 0usize;
    for rule in &targets {
        let key = rule.counter_key(&reset.identifier);
        if let Err(e) = cache.reset(&key).await {
            tracing::error!(
                "admin: reset failed, rule={}, identifier={}, error={}",
                rule.id,
                reset.identifier,
                e
            );
            return json_response(
                500,
                serde_json::json!({"error": format!("store reset failed: {}", e)}).to_string(),
            );
        }
        reset_count += 1;
    }

    if let Some(ref throttle) = state.throttle {
        throttle.forget(&reset.identifier);
    }

    tracing::info!(
        "admin: rate limit reset, identifier={}, rules={}",
        reset.identifier,
        reset_count
    );
    json_response(
        200,
        serde_json::json!({"status": "ok", "rulesReset": reset_count}).to_string(),
    )
}
