use crate::limiter::rule::Rule;
use std::sync::Arc;

/// Outcome of evaluating one rule against one request.
#[derive(Clone)]
pub struct Decision {
    pub allowed: bool,
    /// Requests counted in the current window, including this one if admitted.
    pub total_requests: u32,
    pub remaining_requests: u32,
    /// Wall-clock instant (ms since epoch) when the window resets.
    pub reset_time_ms: u64,
    /// Seconds until retry is worthwhile — present iff denied.
    pub retry_after_secs: Option<u64>,
    pub rule: Arc<Rule>,
}

impl Decision {
    /// Build a decision from a raw counter observation.
    pub fn from_counter(rule: Arc<Rule>, count: u32, reset_time_ms: u64, allowed: bool, now_ms: u64) -> Self {
        let remaining = rule.max_requests.saturating_sub(count);
        let retry_after_secs = if allowed {
            None
        } else {
            Some(reset_time_ms.saturating_sub(now_ms).div_ceil(1000).max(1))
        };
        Self {
            allowed,
            total_requests: count,
            remaining_requests: remaining,
            reset_time_ms,
            retry_after_secs,
            rule,
        }
    }

    /// Fail-open decision: the limiter could not decide, so the request is
    /// admitted with a full quota advertised.
    pub fn fail_open(rule: Arc<Rule>, now_ms: u64) -> Self {
        let reset = now_ms + rule.window_ms;
        Self {
            allowed: true,
            total_requests: 0,
            remaining_requests: rule.max_requests,
            reset_time_ms: reset,
            retry_after_secs: None,
            rule,
        }
    }
}

impl std::fmt::Debug for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decision")
            .field("rule", &self.rule.id)
            .field("allowed", &self.allowed)
            .field("total", &self.total_requests)
            .field("remaining", &self.remaining_requests)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuleConfig;

    fn rule(id: &str, window_ms: u64, max_requests: u32) -> Arc<Rule> {
        Arc::new(Rule::compile(&RuleConfig {
            id: id.to_string(),
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

    #[test]
    fn test_from_counter_allowed() {
        let d = Decision::from_counter(rule("api", 60_000, 100), 3, 1_060_000, true, 1_000_000);
        assert!(d.allowed);
        assert_eq!(d.total_requests, 3);
        assert_eq!(d.remaining_requests, 97);
        assert!(d.retry_after_secs.is_none());
    }

    #[test]
    fn test_from_counter_denied_retry_after() {
        let d = Decision::from_counter(rule("api", 60_000, 100), 100, 1_060_000, false, 1_000_000);
        assert!(!d.allowed);
        assert_eq!(d.remaining_requests, 0);
        // 60s left in the window
        assert_eq!(d.retry_after_secs, Some(60));
    }

    #[test]
    fn test_retry_after_rounds_up_and_is_positive() {
        let d = Decision::from_counter(rule("burst", 1000, 10), 10, 1_000_500, false, 1_000_000);
        assert_eq!(d.retry_after_secs, Some(1));

        // Window already past: still at least one second.
        let d = Decision::from_counter(rule("burst", 1000, 10), 10, 999_000, false, 1_000_000);
        assert_eq!(d.retry_after_secs, Some(1));
    }

    #[test]
    fn test_remaining_never_underflows() {
        let d = Decision::from_counter(rule("api", 60_000, 10), 15, 1_060_000, false, 1_000_000);
        assert_eq!(d.remaining_requests, 0);
    }

    #[test]
    fn test_fail_open() {
        let d = Decision::fail_open(rule("api", 60_000, 100), 1_000_000);
        assert!(d.allowed);
        assert_eq!(d.remaining_requests, 100);
        assert_eq!(d.reset_time_ms, 1_060_000);
    }

}
