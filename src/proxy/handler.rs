use crate::limiter::decision::Decision;
use crate::limiter::identifier::extract_identifier;
use crate::limiter::store::now_millis;
use crate::maintenance::queue::OperationJob;
use crate::proxy::context::{full_body, BoxBody, RequestContext};
use crate::proxy::{endpoints, headers};
use crate::server::{admin, GatewayState};
use http::header::ORIGIN;
use http::{HeaderValue, StatusCode};
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, warn};

/// Handle an incoming HTTP request through a phased lifecycle:
///
/// 1. IDENTIFY    — derive the sanitized client identifier
/// 2. THROTTLE    — optional per-client inter-arrival smoothing
/// 3. EVALUATE    — check every rule concurrently against the counter cache
/// 4. COMPOSE     — first denial wins, else the tightest admitting rule
/// 5. RESPOND     — denial body or downstream dispatch, advisory headers
/// 6. COMPLETE    — post-response hook (conditional revert), metrics, log
///
/// Every pre-decision failure path fails open: the limiter must never turn
/// its own trouble into a client-visible server error.
pub async fn handle_request(
    req: Request<Incoming>,
    state: GatewayState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let identifier = match state.rules.key_generator() {
        Some(generate) => generate(req.headers(), peer_addr),
        None => extract_identifier(req.headers(), peer_addr),
    };
    let origin = req.headers().get(ORIGIN).cloned();
    let ctx = RequestContext::new(
        req.method().as_str().to_string(),
        req.uri().path().to_string(),
        identifier,
    );

    // Administrative reset lives on the request listener as well so that an
    // operator can unblock a client without reaching the admin port.
    if ctx.method == "POST" && ctx.path == "/admin/reset-rate-limit" {
        let resp = admin::handle_reset(req, &state).await;
        ctx.finalize_metrics(resp.status().as_u16());
        return Ok(resp);
    }

    if let Some(ref throttle) = state.throttle {
        throttle.acquire(&ctx.identifier).await;
    }

    let eval = state.rules.evaluate(&ctx).await;

    if let Some(winning) = eval.winning() {
        if !winning.decision.allowed {
            let denied_key = winning.key.clone();
            let decision = winning.decision.clone();
            schedule_denial_cleanup(&state, &denied_key);

            metrics::counter!(
                "gateway_rate_limit_rejected_total",
                "rule" => decision.rule.id.clone(),
            )
            .increment(1);
            debug!(
                "limiter: rejected, rule={}, identifier={}, retry_after={:?}",
                decision.rule.id, ctx.identifier, decision.retry_after_secs
            );

            let resp = build_denial_response(&state, &decision, origin.as_ref());
            ctx.finalize_metrics(resp.status().as_u16());
            access_log(&ctx, resp.status().as_u16(), Some(&decision.rule.id));
            return Ok(resp);
        }

        metrics::counter!(
            "gateway_rate_limit_allowed_total",
            "rule" => winning.decision.rule.id.clone(),
        )
        .increment(1);
    }

    // Snapshot the governing decision for headers before the hook consumes
    // the evaluation.
    let winning_decision = eval.winning().map(|e| e.decision.clone());
    let hook = eval.completion_hook();

    let mut resp = endpoints::dispatch(&ctx);

    if let Some(ref decision) = winning_decision {
        let cfg = state.config.load();
        headers::apply_decision_headers(
            resp.headers_mut(),
            decision,
            cfg.limiter.legacy_headers,
            cfg.limiter.standard_headers,
        );
    }
    headers::apply_hardening_headers(resp.headers_mut());
    apply_cors_origin(&state, resp.headers_mut(), origin.as_ref());

    let status = resp.status().as_u16();
    hook.on_response(status, &state.operations_queue);

    ctx.finalize_metrics(status);
    access_log(&ctx, status, winning_decision.as_ref().map(|d| d.rule.id.as_str()));

    Ok(resp)
}

/// Build the denial response: advisory + hardening headers, the rule's
/// status code, and the JSON body (custom producer first, built-in shape on
/// error or when none is installed).
fn build_denial_response(
    state: &GatewayState,
    decision: &Decision,
    origin: Option<&HeaderValue>,
) -> Response<BoxBody> {
    let status =
        StatusCode::from_u16(decision.rule.status_code).unwrap_or(StatusCode::TOO_MANY_REQUESTS);

    let body = match state.rules.on_limit_reached() {
        Some(f) => match f(decision) {
            Ok(v) => v,
            Err(e) => {
                warn!("limiter: denial body callback failed, error={}", e);
                default_denial_body(decision)
            }
        },
        None => default_denial_body(decision),
    };

    let mut resp = Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(body.to_string()))
        .unwrap();

    let cfg = state.config.load();
    headers::apply_decision_headers(
        resp.headers_mut(),
        decision,
        cfg.limiter.legacy_headers,
        cfg.limiter.standard_headers,
    );
    headers::apply_hardening_headers(resp.headers_mut());
    apply_cors_origin(state, resp.headers_mut(), origin);

    resp
}

fn default_denial_body(decision: &Decision) -> serde_json::Value {
    serde_json::json!({
        "error": "Rate limit exceeded",
        "message": decision
            .rule
            .message
            .clone()
            .unwrap_or_else(|| "Too many requests, please try again later".to_string()),
        "ruleId": decision.rule.id,
        "limit": decision.rule.max_requests,
        "remaining": decision.remaining_requests,
        "resetTime": decision.reset_time_ms,
        "retryAfter": decision.retry_after_secs,
        "timestamp": now_millis(),
    })
}

/// Denials leave a counter at capacity that nobody will touch again until
/// the window expires; schedule its purge to land just after expiry.
fn schedule_denial_cleanup(state: &GatewayState, key: &str) {
    let delay = Duration::from_secs(state.config.load().maintenance.denial_cleanup_delay_secs);
    if let Err(e) = state.operations_queue.enqueue(
        OperationJob::Cleanup {
            pattern: key.to_string(),
        },
        delay,
    ) {
        warn!("limiter: denial cleanup enqueue failed, error={}", e);
    }
}

fn apply_cors_origin(
    state: &GatewayState,
    headers: &mut http::HeaderMap,
    origin: Option<&HeaderValue>,
) {
    let Some(origin) = origin else { return };
    let Ok(origin_str) = origin.to_str() else { return };

    let cfg = state.config.load();
    let allowed = cfg
        .server
        .allowed_origins
        .iter()
        .any(|o| o == origin_str || o == "*");
    if allowed {
        headers.insert(
            http::header::ACCESS_CONTROL_ALLOW_ORIGIN,
            origin.clone(),
        );
    }
}

/// Structured access log — one line per request at info level.
fn access_log(ctx: &RequestContext, status: u16, rule: Option<&str>) {
    tracing::info!(
        identifier = %ctx.identifier,
        method = %ctx.method,
        path = %ctx.path,
        status = status,
        rule = rule.unwrap_or(""),
        latency_ms = %ctx.start.elapsed().as_millis(),
        "access"
    );
}
