use crate::config::RuleConfig;
use crate::error::GatewayError;
use crate::limiter::identifier::sanitize_key_component;
use crate::proxy::context::RequestContext;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Counter algorithm selected per rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Sliding,
    Fixed,
}

/// Per-rule request hooks.
///
/// Static rules use the default (inert) implementations. Custom scopes can
/// derive a rule-specific identifier or exempt requests entirely; a returned
/// error makes the rule inert for that request (logged, never fatal).
pub trait RuleScope: Send + Sync {
    /// Rule-specific identifier override. `None` means use the globally
    /// extracted identifier.
    fn key(&self, ctx: &RequestContext) -> Result<Option<String>, GatewayError> {
        let _ = ctx;
        Ok(None)
    }

    /// When `true` the rule does not participate in the decision for this
    /// request.
    fn skip(&self, ctx: &RequestContext) -> Result<bool, GatewayError> {
        let _ = ctx;
        Ok(false)
    }
}

/// Scope compiled from the declarative rule config: path-prefix applicability
/// plus the configured key strategy.
struct StaticScope {
    key_by_path: bool,
    apply_paths: Vec<String>,
    skip_paths: Vec<String>,
}

impl RuleScope for StaticScope {
    fn key(&self, ctx: &RequestContext) -> Result<Option<String>, GatewayError> {
        if self.key_by_path {
            Ok(Some(format!("{}|{}", ctx.identifier, ctx.path)))
        } else {
            Ok(None)
        }
    }

    fn skip(&self, ctx: &RequestContext) -> Result<bool, GatewayError> {
        if !self.apply_paths.is_empty()
            && !self.apply_paths.iter().any(|p| ctx.path.starts_with(p))
        {
            return Ok(true);
        }
        Ok(self.skip_paths.iter().any(|p| ctx.path.starts_with(p)))
    }
}

/// Immutable, compiled rate-limiting policy.
///
/// Built once from config at startup — never per request.
pub struct Rule {
    pub id: String,
    pub window_ms: u64,
    pub max_requests: u32,
    pub algorithm: Algorithm,
    pub status_code: u16,
    pub message: Option<String>,
    /// Digest of `(id, window, max_requests)` baked into every counter key,
    /// so changing a rule's limits can never reuse state from a prior
    /// configuration.
    hash: String,
    scope: Arc<dyn RuleScope>,
}

impl Rule {
    pub fn compile(cfg: &RuleConfig) -> Self {
        let algorithm = match cfg.algorithm.as_str() {
            "fixed" => Algorithm::Fixed,
            _ => Algorithm::Sliding,
        };

        let scope = Arc::new(StaticScope {
            key_by_path: cfg.key_by == "ip_path",
            apply_paths: cfg.apply_paths.clone(),
            skip_paths: cfg.skip_paths.clone(),
        });

        Self {
            id: cfg.id.clone(),
            window_ms: cfg.window_ms,
            max_requests: cfg.max_requests,
            algorithm,
            status_code: cfg.status_code,
            message: cfg.message.clone(),
            hash: compute_hash(&cfg.id, cfg.window_ms, cfg.max_requests),
            scope,
        }
    }

    /// Replace the scope with a custom implementation.
    pub fn with_scope(mut self, scope: Arc<dyn RuleScope>) -> Self {
        self.scope = scope;
        self
    }

    pub fn scope(&self) -> &dyn RuleScope {
        &*self.scope
    }

    /// Counter key: `rl:{rule_id}:{rule_hash}:{sanitized_identifier}`.
    pub fn counter_key(&self, identifier: &str) -> String {
        format!(
            "rl:{}:{}:{}",
            self.id,
            self.hash,
            sanitize_key_component(identifier)
        )
    }

    /// Window length rounded up to whole seconds, used for store TTLs.
    pub fn window_secs(&self) -> u64 {
        self.window_ms.div_ceil(1000)
    }
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("id", &self.id)
            .field("window_ms", &self.window_ms)
            .field("max_requests", &self.max_requests)
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

/// First 8 hex chars of SHA-256 over the limit-defining fields.
fn compute_hash(id: &str, window_ms: u64, max_requests: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hasher.update(b":");
    hasher.update(window_ms.to_le_bytes());
    hasher.update(b":");
    hasher.update(max_requests.to_le_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(8);
    for byte in &digest[..4] {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn ctx(path: &str) -> RequestContext {
        RequestContext::new("GET".to_string(), path.to_string(), "203.0.113.5".to_string())
    }

    #[test]
    fn test_hash_is_deterministic() {
        let a = compute_hash("api", 60_000, 300);
        let b = compute_hash("api", 60_000, 300);
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
    }

    #[test]
    fn test_hash_changes_with_limits() {
        let base = compute_hash("api", 60_000, 300);
        assert_ne!(base, compute_hash("api", 60_000, 301));
        assert_ne!(base, compute_hash("api", 30_000, 300));
        assert_ne!(base, compute_hash("api2", 60_000, 300));
    }

    #[test]
    fn test_counter_key_format() {
        let rule = Rule::compile(&rule_config("api", 60_000, 300));
        let key = rule.counter_key("203.0.113.5");
        assert!(key.starts_with("rl:api:"));
        assert!(key.ends_with(":203.0.113.5"));
        assert_eq!(key.split(':').count(), 4);
    }

    #[test]
    fn test_counter_key_sanitizes_identifier() {
        let rule = Rule::compile(&rule_config("api", 60_000, 300));
        let key = rule.counter_key("::1");
        assert!(key.ends_with(":__1"));
    }

    #[test]
    fn test_changed_limits_change_keys() {
        let before = Rule::compile(&rule_config("api", 60_000, 300));
        let after = Rule::compile(&rule_config("api", 60_000, 500));
        assert_ne!(
            before.counter_key("203.0.113.5"),
            after.counter_key("203.0.113.5")
        );
    }

    #[test]
    fn test_window_secs_rounds_up() {
        let rule = Rule::compile(&rule_config("burst", 1500, 10));
        assert_eq!(rule.window_secs(), 2);
        let rule = Rule::compile(&rule_config("burst", 1000, 10));
        assert_eq!(rule.window_secs(), 1);
    }

    #[test]
    fn test_static_scope_skip_paths() {
        let mut cfg = rule_config("api", 60_000, 300);
        cfg.skip_paths = vec!["/health".to_string()];
        let rule = Rule::compile(&cfg);

        assert!(rule.scope().skip(&ctx("/health")).unwrap());
        assert!(!rule.scope().skip(&ctx("/api/data")).unwrap());
    }

    #[test]
    fn test_static_scope_apply_paths() {
        let mut cfg = rule_config("auth", 300_000, 5);
        cfg.apply_paths = vec!["/auth".to_string()];
        let rule = Rule::compile(&cfg);

        assert!(!rule.scope().skip(&ctx("/auth/login")).unwrap());
        assert!(rule.scope().skip(&ctx("/api/data")).unwrap());
    }

    #[test]
    fn test_ip_path_key_strategy() {
        let mut cfg = rule_config("api", 60_000, 300);
        cfg.key_by = "ip_path".to_string();
        let rule = Rule::compile(&cfg);

        let key = rule.scope().key(&ctx("/api/data")).unwrap();
        assert_eq!(key.as_deref(), Some("203.0.113.5|/api/data"));
    }

    #[test]
    fn test_default_scope_is_inert() {
        struct Inert;
        impl RuleScope for Inert {}

        let scope = Inert;
        assert_eq!(scope.key(&ctx("/x")).unwrap(), None);
        assert!(!scope.skip(&ctx("/x")).unwrap());
    }
}
