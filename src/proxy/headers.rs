use crate::limiter::decision::Decision;
use http::{HeaderMap, HeaderName, HeaderValue};

// Legacy header set.
const X_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const X_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
const X_RETRY_AFTER: HeaderName = HeaderName::from_static("x-ratelimit-retryafter");
const X_WARNING: HeaderName = HeaderName::from_static("x-ratelimit-warning");

// RFC draft header set.
const STD_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
const STD_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");
const STD_RESET: HeaderName = HeaderName::from_static("ratelimit-reset");
const STD_POLICY: HeaderName = HeaderName::from_static("ratelimit-policy");
const RETRY_AFTER: HeaderName = HeaderName::from_static("retry-after");

/// Advisory rate-limit headers derived from the governing decision.
/// Emitted on every response for which any rule was evaluated, denials
/// included.
pub fn apply_decision_headers(
    headers: &mut HeaderMap,
    decision: &Decision,
    legacy: bool,
    standard: bool,
) {
    let limit = decision.rule.max_requests;
    let remaining = decision.remaining_requests;
    let reset_unix_secs = decision.reset_time_ms.div_ceil(1000);

    let mut buf = itoa::Buffer::new();

    if legacy {
        insert_num(headers, X_LIMIT, &mut buf, u64::from(limit));
        insert_num(headers, X_REMAINING, &mut buf, u64::from(remaining));
        insert_num(headers, X_RESET, &mut buf, reset_unix_secs);
        if let Some(retry) = decision.retry_after_secs {
            insert_num(headers, X_RETRY_AFTER, &mut buf, retry);
        }
    }

    if standard {
        insert_num(headers, STD_LIMIT, &mut buf, u64::from(limit));
        insert_num(headers, STD_REMAINING, &mut buf, u64::from(remaining));
        insert_num(headers, STD_RESET, &mut buf, reset_unix_secs);
        let policy = format!("{};w={}", limit, decision.rule.window_secs());
        if let Ok(v) = HeaderValue::from_str(&policy) {
            headers.insert(STD_POLICY, v);
        }
        if let Some(retry) = decision.retry_after_secs {
            insert_num(headers, RETRY_AFTER, &mut buf, retry);
        }
    }

    if let Some(warning) = warning_for(remaining, limit) {
        headers.insert(X_WARNING, HeaderValue::from_static(warning));
    }
}

/// Graduated advisory: warn in the last fifth of the budget, escalate at
/// zero remaining (including the final admitted request).
fn warning_for(remaining: u32, limit: u32) -> Option<&'static str> {
    if remaining == 0 {
        Some("Rate limit nearly exceeded")
    } else if u64::from(remaining) * 5 <= u64::from(limit) {
        Some("Approaching rate limit")
    } else {
        None
    }
}

/// Defensive hardening headers, applied once per response.
pub fn apply_hardening_headers(headers: &mut HeaderMap) {
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        HeaderName::from_static("x-xss-protection"),
        HeaderValue::from_static("1; mode=block"),
    );
    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
}

fn insert_num(headers: &mut HeaderMap, name: HeaderName, buf: &mut itoa::Buffer, value: u64) {
    if let Ok(v) = HeaderValue::from_str(buf.format(value)) {
        headers.insert(name, v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuleConfig;
    use crate::limiter::rule::Rule;
    use std::sync::Arc;

    fn rule(window_ms: u64, max_requests: u32) -> Arc<Rule> {
        Arc::new(Rule::compile(&RuleConfig {
            id: "api".to_string(),
            window_ms,
            max_requests,
            algorithm: "sliding".to_string(),
            status_code: 429,
            message: None,
            key_by: "ip".to_string(),
            apply_paths: vec![],
            skip_paths: vec![],
        }))
    }

    fn header(headers: &HeaderMap, name: &str) -> Option<String> {
        headers
            .get(name)
            .map(|v| v.to_str().unwrap().to_string())
    }

    #[test]
    fn test_both_header_sets_on_admission() {
        let d = Decision::from_counter(rule(60_000, 100), 1, 1_060_000, true, 1_000_000);
        let mut headers = HeaderMap::new();
        apply_decision_headers(&mut headers, &d, true, true);

        assert_eq!(header(&headers, "x-ratelimit-limit").as_deref(), Some("100"));
        assert_eq!(header(&headers, "x-ratelimit-remaining").as_deref(), Some("99"));
        assert_eq!(header(&headers, "x-ratelimit-reset").as_deref(), Some("1060"));
        assert_eq!(header(&headers, "ratelimit-limit").as_deref(), Some("100"));
        assert_eq!(header(&headers, "ratelimit-remaining").as_deref(), Some("99"));
        assert_eq!(header(&headers, "ratelimit-policy").as_deref(), Some("100;w=60"));
        assert!(header(&headers, "retry-after").is_none());
        assert!(header(&headers, "x-ratelimit-retryafter").is_none());
    }

    #[test]
    fn test_denial_carries_retry_after() {
        let d = Decision::from_counter(rule(60_000, 100), 100, 1_060_000, false, 1_000_000);
        let mut headers = HeaderMap::new();
        apply_decision_headers(&mut headers, &d, true, true);

        assert_eq!(header(&headers, "retry-after").as_deref(), Some("60"));
        assert_eq!(header(&headers, "x-ratelimit-retryafter").as_deref(), Some("60"));
        assert_eq!(header(&headers, "x-ratelimit-remaining").as_deref(), Some("0"));
    }

    #[test]
    fn test_header_set_toggles() {
        let d = Decision::from_counter(rule(60_000, 100), 1, 1_060_000, true, 1_000_000);

        let mut headers = HeaderMap::new();
        apply_decision_headers(&mut headers, &d, true, false);
        assert!(header(&headers, "x-ratelimit-limit").is_some());
        assert!(header(&headers, "ratelimit-limit").is_none());

        let mut headers = HeaderMap::new();
        apply_decision_headers(&mut headers, &d, false, true);
        assert!(header(&headers, "x-ratelimit-limit").is_none());
        assert!(header(&headers, "ratelimit-limit").is_some());
    }

    #[test]
    fn test_retry_after_follows_standard_toggle() {
        let d = Decision::from_counter(rule(60_000, 100), 100, 1_060_000, false, 1_000_000);

        // Legacy only: the legacy retry header appears, the standard one
        // stays off.
        let mut headers = HeaderMap::new();
        apply_decision_headers(&mut headers, &d, true, false);
        assert!(header(&headers, "x-ratelimit-retryafter").is_some());
        assert!(header(&headers, "retry-after").is_none());

        // Standard only: the opposite.
        let mut headers = HeaderMap::new();
        apply_decision_headers(&mut headers, &d, false, true);
        assert!(header(&headers, "x-ratelimit-retryafter").is_none());
        assert_eq!(header(&headers, "retry-after").as_deref(), Some("60"));
    }

    #[test]
    fn test_warning_thresholds() {
        // limit 10: remaining 3 is 30% — no warning; remaining 2 is 20% — warn.
        assert_eq!(warning_for(3, 10), None);
        assert_eq!(warning_for(2, 10), Some("Approaching rate limit"));
        assert_eq!(warning_for(1, 10), Some("Approaching rate limit"));
        assert_eq!(warning_for(0, 10), Some("Rate limit nearly exceeded"));

        // limit 5: remaining 1 is exactly 20%.
        assert_eq!(warning_for(1, 5), Some("Approaching rate limit"));
        assert_eq!(warning_for(2, 5), None);
    }

    #[test]
    fn test_warning_header_emitted() {
        let d = Decision::from_counter(rule(60_000, 10), 10, 1_060_000, true, 1_000_000);
        let mut headers = HeaderMap::new();
        apply_decision_headers(&mut headers, &d, true, true);
        assert_eq!(
            header(&headers, "x-ratelimit-warning").as_deref(),
            Some("Rate limit nearly exceeded")
        );
    }

    #[test]
    fn test_hardening_headers() {
        let mut headers = HeaderMap::new();
        apply_hardening_headers(&mut headers);
        assert_eq!(header(&headers, "x-content-type-options").as_deref(), Some("nosniff"));
        assert_eq!(header(&headers, "x-frame-options").as_deref(), Some("DENY"));
        assert_eq!(header(&headers, "x-xss-protection").as_deref(), Some("1; mode=block"));
        assert_eq!(
            header(&headers, "referrer-policy").as_deref(),
            Some("strict-origin-when-cross-origin")
        );
    }
}
