use crate::config::LimiterConfig;
use crate::error::GatewayError;
use crate::limiter::cache::CounterCache;
use crate::limiter::decision::Decision;
use crate::limiter::rule::Rule;
use crate::maintenance::queue::{JobQueue, OperationJob};
use crate::proxy::context::RequestContext;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// Callback producing a custom denial body. A returned error falls back to
/// the built-in body; the status code is preserved either way.
pub type DenialBodyFn =
    Arc<dyn Fn(&Decision) -> Result<serde_json::Value, GatewayError> + Send + Sync>;

/// Global identifier override: replaces the built-in header-precedence
/// extractor for every rule that does not derive its own key.
pub type KeyGeneratorFn =
    Arc<dyn Fn(&http::HeaderMap, std::net::SocketAddr) -> String + Send + Sync>;

/// The compiled rule set plus the evaluation machinery.
///
/// Rules are compiled once at startup. Per request, every applicable rule is
/// checked concurrently against the counter cache and the results are
/// composed into a single governing decision.
pub struct RuleSet {
    rules: Vec<Arc<Rule>>,
    cache: Arc<CounterCache>,
    skip_successful_requests: bool,
    skip_failed_requests: bool,
    on_limit_reached: Option<DenialBodyFn>,
    key_generator: Option<KeyGeneratorFn>,
}

impl RuleSet {
    pub fn new(cfg: &LimiterConfig, cache: Arc<CounterCache>) -> Self {
        let rules = cfg.rules.iter().map(|r| Arc::new(Rule::compile(r))).collect();
        Self {
            rules,
            cache,
            skip_successful_requests: cfg.skip_successful_requests,
            skip_failed_requests: cfg.skip_failed_requests,
            on_limit_reached: None,
            key_generator: None,
        }
    }

    /// Install a custom denial-body producer.
    pub fn with_denial_body(mut self, f: DenialBodyFn) -> Self {
        self.on_limit_reached = Some(f);
        self
    }

    /// Install a global identifier override.
    pub fn with_key_generator(mut self, f: KeyGeneratorFn) -> Self {
        self.key_generator = Some(f);
        self
    }

    pub fn key_generator(&self) -> Option<&KeyGeneratorFn> {
        self.key_generator.as_ref()
    }

    pub fn rules(&self) -> &[Arc<Rule>] {
        &self.rules
    }

    pub fn find(&self, id: &str) -> Option<&Arc<Rule>> {
        self.rules.iter().find(|r| r.id == id)
    }

    pub fn cache(&self) -> &Arc<CounterCache> {
        &self.cache
    }

    pub fn on_limit_reached(&self) -> Option<&DenialBodyFn> {
        self.on_limit_reached.as_ref()
    }

    /// Evaluate every rule against the request.
    ///
    /// A rule is inert for this request when its scope skips it or when a
    /// scope hook errors — an erroring rule is logged with its id and
    /// excluded, never fatal. The remaining rules are checked concurrently.
    pub async fn evaluate(&self, ctx: &RequestContext) -> Evaluation {
        let mut participating: Vec<(String, Arc<Rule>)> = Vec::with_capacity(self.rules.len());

        for rule in &self.rules {
            match rule.scope().skip(ctx) {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    error!("evaluator: skip hook failed, rule={}, error={}", rule.id, e);
                    continue;
                }
            }

            let identifier = match rule.scope().key(ctx) {
                Ok(Some(custom)) => custom,
                Ok(None) => ctx.identifier.clone(),
                Err(e) => {
                    error!("evaluator: key hook failed, rule={}, error={}", rule.id, e);
                    continue;
                }
            };

            participating.push((rule.counter_key(&identifier), rule.clone()));
        }

        let decisions = join_all(
            participating
                .iter()
                .map(|(key, rule)| self.cache.check(key, rule)),
        )
        .await;

        let evaluated = participating
            .into_iter()
            .zip(decisions)
            .map(|((key, _), decision)| EvaluatedRule { key, decision })
            .collect();

        Evaluation {
            evaluated,
            skip_successful_requests: self.skip_successful_requests,
            skip_failed_requests: self.skip_failed_requests,
        }
    }
}

/// One rule's contribution: the counter key it was checked under and the
/// resulting decision.
pub struct EvaluatedRule {
    pub key: String,
    pub decision: Decision,
}

/// The composed result of one request's rule evaluation.
pub struct Evaluation {
    /// Results of every non-inert rule, in configured order.
    pub evaluated: Vec<EvaluatedRule>,
    skip_successful_requests: bool,
    skip_failed_requests: bool,
}

impl Evaluation {
    /// The result that governs the response: the first denial in rule order,
    /// otherwise the tightest admitting rule.
    pub fn winning(&self) -> Option<&EvaluatedRule> {
        if let Some(denied) = self.evaluated.iter().find(|e| !e.decision.allowed) {
            return Some(denied);
        }
        self.evaluated
            .iter()
            .min_by_key(|e| e.decision.rule.max_requests)
    }

    /// Detach the post-response continuation. The transport layer invokes it
    /// once the final status is known.
    pub fn completion_hook(self) -> CompletionHook {
        let admitted = self
            .evaluated
            .into_iter()
            .filter(|e| e.decision.allowed)
            .map(|e| (e.key, e.decision.rule))
            .collect();
        CompletionHook {
            admitted,
            skip_successful_requests: self.skip_successful_requests,
            skip_failed_requests: self.skip_failed_requests,
        }
    }
}

/// Tagged continuation invoked after the response has been emitted.
///
/// Reverts are eventual: they are enqueued strictly after the response, so a
/// concurrent in-window request may still observe the pre-revert count. The
/// accepted worst case is one extra admission inside the window.
pub struct CompletionHook {
    admitted: Vec<(String, Arc<Rule>)>,
    skip_successful_requests: bool,
    skip_failed_requests: bool,
}

impl CompletionHook {
    pub fn should_revert(&self, status: u16) -> bool {
        (self.skip_successful_requests && (200..300).contains(&status))
            || (self.skip_failed_requests && status >= 400)
    }

    /// Enqueue one revert per admitted rule when the final status says this
    /// request should not count. Enqueue failures are logged — the request
    /// path is never blocked on maintenance work.
    pub fn on_response(self, status: u16, queue: &JobQueue) {
        if !self.should_revert(status) {
            return;
        }
        for (key, rule) in self.admitted {
            if let Err(e) = queue.enqueue(OperationJob::Revert { key, rule }, Duration::ZERO) {
                warn!("evaluator: revert enqueue failed, error={}", e);
            }
        }
    }

    pub fn admitted_len(&self) -> usize {
        self.admitted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuleConfig;
    use crate::limiter::rule::RuleScope;

    fn rule_config(id: &str, window_ms: u64, max_requests: u32) -> RuleConfig {
        RuleConfig {
            id: id.to_string(),
            window_ms,
            max_requests,
            algorithm: "sliding".to_string(),
            status_code: 429,
            message: None,
            key_by: "ip".to_string(),
            apply_paths: vec![],
            skip_paths: vec![],
        }
    }

    fn limiter_with(rules: Vec<RuleConfig>) -> LimiterConfig {
        LimiterConfig {
            rules,
            enable_in_memory_fallback: true,
            ..LimiterConfig::default()
        }
    }

    fn rule_set(cfg: &LimiterConfig) -> RuleSet {
        RuleSet::new(cfg, Arc::new(CounterCache::in_memory(cfg)))
    }

    fn ctx(path: &str) -> RequestContext {
        RequestContext::new("GET".to_string(), path.to_string(), "203.0.113.5".to_string())
    }

    #[tokio::test]
    async fn test_tightest_rule_wins_when_all_admit() {
        let cfg = limiter_with(vec![
            rule_config("wide", 60_000, 100),
            rule_config("narrow", 1000, 10),
        ]);
        let rules = rule_set(&cfg);

        let eval = rules.evaluate(&ctx("/api/data")).await;
        let winning = eval.winning().unwrap();
        assert!(winning.decision.allowed);
        assert_eq!(winning.decision.rule.id, "narrow");
    }

    #[tokio::test]
    async fn test_first_denier_wins() {
        let cfg = limiter_with(vec![
            rule_config("first", 60_000, 1),
            rule_config("second", 60_000, 1),
        ]);
        let rules = rule_set(&cfg);

        // Exhaust both rules, then check which denial is reported.
        rules.evaluate(&ctx("/api/data")).await;
        let eval = rules.evaluate(&ctx("/api/data")).await;
        let winning = eval.winning().unwrap();
        assert!(!winning.decision.allowed);
        assert_eq!(winning.decision.rule.id, "first");
    }

    #[tokio::test]
    async fn test_denial_beats_tighter_admit() {
        let cfg = limiter_with(vec![
            rule_config("tight", 1000, 5),
            rule_config("loose", 60_000, 2),
        ]);
        let rules = rule_set(&cfg);

        rules.evaluate(&ctx("/api")).await;
        rules.evaluate(&ctx("/api")).await;
        let eval = rules.evaluate(&ctx("/api")).await;

        // "tight" still admits, but the exhausted "loose" rule denies and a
        // denial always governs.
        let winning = eval.winning().unwrap();
        assert!(!winning.decision.allowed);
        assert_eq!(winning.decision.rule.id, "loose");
    }

    #[tokio::test]
    async fn test_narrow_rule_binds_burst() {
        // Two rules, burst of 20: at most 10 admitted because the narrow
        // rule binds.
        let cfg = limiter_with(vec![
            rule_config("a", 60_000, 100),
            rule_config("b", 1000, 10),
        ]);
        let rules = rule_set(&cfg);

        let mut admitted = 0;
        for _ in 0..20 {
            let eval = rules.evaluate(&ctx("/api/data")).await;
            if eval.winning().unwrap().decision.allowed {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }

    #[tokio::test]
    async fn test_skipped_rule_is_inert() {
        let mut skip_rule = rule_config("health-exempt", 60_000, 1);
        skip_rule.skip_paths = vec!["/health".to_string()];
        let cfg = limiter_with(vec![skip_rule]);
        let rules = rule_set(&cfg);

        // /health never consumes quota and yields no decisions at all.
        for _ in 0..5 {
            let eval = rules.evaluate(&ctx("/health")).await;
            assert!(eval.evaluated.is_empty());
            assert!(eval.winning().is_none());
        }

        // The rule still binds for other paths.
        assert!(rules.evaluate(&ctx("/api")).await.winning().unwrap().decision.allowed);
        assert!(!rules.evaluate(&ctx("/api")).await.winning().unwrap().decision.allowed);
    }

    #[tokio::test]
    async fn test_erroring_scope_makes_rule_inert() {
        struct Failing;
        impl RuleScope for Failing {
            fn skip(&self, _ctx: &RequestContext) -> Result<bool, GatewayError> {
                Err(GatewayError::Internal("boom".to_string()))
            }
        }

        let cfg = limiter_with(vec![rule_config("ok", 60_000, 10)]);
        let cache = Arc::new(CounterCache::in_memory(&cfg));
        let mut rules = RuleSet::new(&cfg, cache);
        rules.rules.push(Arc::new(
            Rule::compile(&rule_config("broken", 60_000, 1)).with_scope(Arc::new(Failing)),
        ));

        let eval = rules.evaluate(&ctx("/api")).await;
        // Only the healthy rule participates.
        assert_eq!(eval.evaluated.len(), 1);
        assert_eq!(eval.evaluated[0].decision.rule.id, "ok");
    }

    #[tokio::test]
    async fn test_admitted_rules_tracked_for_revert() {
        let cfg = limiter_with(vec![
            rule_config("a", 60_000, 10),
            rule_config("b", 60_000, 10),
        ]);
        let rules = rule_set(&cfg);

        let eval = rules.evaluate(&ctx("/api")).await;
        let hook = eval.completion_hook();
        assert_eq!(hook.admitted_len(), 2);
    }

    #[tokio::test]
    async fn test_denied_rule_not_tracked_for_revert() {
        let cfg = limiter_with(vec![rule_config("a", 60_000, 1)]);
        let rules = rule_set(&cfg);

        rules.evaluate(&ctx("/api")).await;
        let eval = rules.evaluate(&ctx("/api")).await;
        assert!(!eval.winning().unwrap().decision.allowed);
        assert_eq!(eval.completion_hook().admitted_len(), 0);
    }

    #[tokio::test]
    async fn test_custom_denial_body_producer() {
        let cfg = limiter_with(vec![rule_config("api", 60_000, 1)]);
        let cache = Arc::new(CounterCache::in_memory(&cfg));
        let rules = RuleSet::new(&cfg, cache).with_denial_body(Arc::new(|d| {
            Ok(serde_json::json!({"code": "limited", "rule": d.rule.id}))
        }));

        rules.evaluate(&ctx("/api")).await;
        let eval = rules.evaluate(&ctx("/api")).await;
        let denied = &eval.winning().unwrap().decision;
        assert!(!denied.allowed);

        let body = rules.on_limit_reached().unwrap()(denied).unwrap();
        assert_eq!(body["code"], "limited");
        assert_eq!(body["rule"], "api");
    }

    #[test]
    fn test_key_generator_override() {
        let cfg = limiter_with(vec![rule_config("api", 60_000, 10)]);
        let cache = Arc::new(CounterCache::in_memory(&cfg));
        let rules = RuleSet::new(&cfg, cache).with_key_generator(Arc::new(|headers, peer| {
            headers
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .unwrap_or_else(|| peer.ip().to_string())
        }));

        let generate = rules.key_generator().unwrap();
        let mut headers = http::HeaderMap::new();
        headers.insert("x-api-key", http::HeaderValue::from_static("tenant-1"));
        let peer = "10.0.0.1:80".parse().unwrap();
        assert_eq!(generate(&headers, peer), "tenant-1");
        assert_eq!(generate(&http::HeaderMap::new(), peer), "10.0.0.1");
    }

    #[test]
    fn test_should_revert_matrix() {
        let hook = |s: bool, f: bool| CompletionHook {
            admitted: vec![],
            skip_successful_requests: s,
            skip_failed_requests: f,
        };

        assert!(hook(true, false).should_revert(200));
        assert!(hook(true, false).should_revert(299));
        assert!(!hook(true, false).should_revert(301));
        assert!(!hook(true, false).should_revert(404));

        assert!(hook(false, true).should_revert(404));
        assert!(hook(false, true).should_revert(500));
        assert!(!hook(false, true).should_revert(200));

        assert!(!hook(false, false).should_revert(200));
        assert!(!hook(false, false).should_revert(500));
    }
}
