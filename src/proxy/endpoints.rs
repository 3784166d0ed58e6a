use crate::proxy::context::{full_body, BoxBody, RequestContext};
use http::StatusCode;
use hyper::Response;

/// Built-in demonstration endpoints served behind the limiter.
///
/// Deliberately minimal — the gateway's value is the decision engine in
/// front of these, and the composer itself is transport-agnostic.
pub fn dispatch(ctx: &RequestContext) -> Response<BoxBody> {
    match (ctx.method.as_str(), ctx.path.as_str()) {
        ("GET", "/health") | ("GET", "/healthz") => json(StatusCode::OK, r#"{"status":"ok"}"#),

        ("GET", "/api/data") => json(
            StatusCode::OK,
            r#"{"data":[{"id":1,"name":"alpha"},{"id":2,"name":"beta"},{"id":3,"name":"gamma"}]}"#,
        ),

        ("POST", "/auth/login") => json(StatusCode::OK, r#"{"status":"ok","token":"demo"}"#),

        _ => json(StatusCode::NOT_FOUND, r#"{"error":"not found"}"#),
    }
}

fn json(status: StatusCode, body: &'static str) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(body))
        .unwrap()
}
