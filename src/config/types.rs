use serde::{Deserialize, Deserializer, Serialize};

/// Deserialize a `T` that implements `Default` — treats JSON `null` the same as
/// a missing field (returns `T::default()`).  Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub limiter: LimiterConfig,

    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    /// Environment tag emitted in logs and the stats endpoint.
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Origins allowed to receive `Access-Control-Allow-Origin`. Empty = none.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            environment: default_environment(),
            allowed_origins: Vec::new(),
        }
    }
}

fn default_port() -> u16 {
    3000
}

fn default_environment() -> String {
    "development".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    #[serde(default)]
    pub password: Option<String>,

    /// Upper bound on per-command retries inside the store client.
    #[serde(default = "default_max_retries")]
    pub max_retries_per_request: u32,

    /// Per-call timeout for store commands on the request path.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            password: None,
            max_retries_per_request: default_max_retries(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl RedisConfig {
    /// Connection URL in the form `redis://[:password@]host:port`.
    pub fn url(&self) -> String {
        match self.password {
            Some(ref pw) if !pw.is_empty() => {
                format!("redis://:{}@{}:{}", pw, self.host, self.port)
            }
            _ => format!("redis://{}:{}", self.host, self.port),
        }
    }
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_max_retries() -> u32 {
    3
}

fn default_command_timeout_ms() -> u64 {
    1000
}

/// Rate limiter behaviour: rules plus the cross-cutting toggles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    #[serde(default = "default_rules", deserialize_with = "deserialize_null_default")]
    pub rules: Vec<RuleConfig>,

    /// Emit the RFC draft `RateLimit-*` header set.
    #[serde(default = "default_true")]
    pub standard_headers: bool,

    /// Emit the legacy `X-RateLimit-*` header set.
    #[serde(default = "default_true")]
    pub legacy_headers: bool,

    /// Revert admissions whose response completed with 2xx.
    #[serde(default)]
    pub skip_successful_requests: bool,

    /// Revert admissions whose response completed with >= 400.
    #[serde(default)]
    pub skip_failed_requests: bool,

    #[serde(default)]
    pub enable_local_throttle: bool,

    #[serde(default = "default_max_throttle_delay_ms")]
    pub max_throttle_delay_ms: u64,

    /// Serve decisions from the process-local store while the distributed
    /// store is unreachable. When `false` the gateway fails open instead.
    #[serde(default)]
    pub enable_in_memory_fallback: bool,

    /// TTL for local fallback entries; also the fallback sweeper interval.
    #[serde(default = "default_local_cache_ttl_ms")]
    pub local_cache_ttl_ms: u64,

    #[serde(default)]
    pub breaker: BreakerConfig,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            rules: default_rules(),
            standard_headers: true,
            legacy_headers: true,
            skip_successful_requests: false,
            skip_failed_requests: false,
            enable_local_throttle: false,
            max_throttle_delay_ms: default_max_throttle_delay_ms(),
            enable_in_memory_fallback: false,
            local_cache_ttl_ms: default_local_cache_ttl_ms(),
            breaker: BreakerConfig::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_throttle_delay_ms() -> u64 {
    1000
}

fn default_local_cache_ttl_ms() -> u64 {
    60_000
}

/// Built-in policy set: a global per-client API quota, a one-second burst
/// rule, and a strict lockout rule for the auth endpoints.
fn default_rules() -> Vec<RuleConfig> {
    vec![
        RuleConfig {
            id: "api".to_string(),
            window_ms: 60_000,
            max_requests: 300,
            ..RuleConfig::template()
        },
        RuleConfig {
            id: "burst".to_string(),
            window_ms: 1_000,
            max_requests: 50,
            ..RuleConfig::template()
        },
        RuleConfig {
            id: "auth".to_string(),
            window_ms: 300_000,
            max_requests: 5,
            status_code: 423,
            message: Some("Too many authentication attempts".to_string()),
            apply_paths: vec!["/auth".to_string()],
            ..RuleConfig::template()
        },
    ]
}

/// A single rate-limiting policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub id: String,

    /// Window length in milliseconds.
    pub window_ms: u64,

    pub max_requests: u32,

    /// "sliding" (default) or "fixed".
    #[serde(default = "default_algorithm")]
    pub algorithm: String,

    #[serde(default = "default_rejected_code")]
    pub status_code: u16,

    /// Denial body message. Falls back to a generic message when unset.
    #[serde(default)]
    pub message: Option<String>,

    /// "ip" (default) or "ip_path" — include the request path in the key.
    #[serde(default = "default_key_by")]
    pub key_by: String,

    /// Path prefixes the rule applies to. Empty = every path.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub apply_paths: Vec<String>,

    /// Path prefixes exempt from this rule (checked after `apply_paths`).
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub skip_paths: Vec<String>,
}

impl RuleConfig {
    /// Baseline used by `default_rules` — not a `Default` impl because a rule
    /// without an id or window is never valid.
    fn template() -> Self {
        Self {
            id: String::new(),
            window_ms: 0,
            max_requests: 0,
            algorithm: default_algorithm(),
            status_code: default_rejected_code(),
            message: None,
            key_by: default_key_by(),
            apply_paths: Vec::new(),
            skip_paths: vec!["/health".to_string(), "/admin".to_string()],
        }
    }
}

fn default_algorithm() -> String {
    "sliding".to_string()
}

fn default_rejected_code() -> u16 {
    429
}

fn default_key_by() -> String {
    "ip".to_string()
}

/// State machine: Closed → Open → HalfOpen → Closed/Open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_cb_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_cb_recovery_timeout")]
    pub recovery_timeout_secs: u64,

    #[serde(default = "default_cb_success_threshold")]
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_cb_failure_threshold(),
            recovery_timeout_secs: default_cb_recovery_timeout(),
            success_threshold: default_cb_success_threshold(),
        }
    }
}

fn default_cb_failure_threshold() -> u32 {
    5
}

fn default_cb_recovery_timeout() -> u64 {
    30
}

fn default_cb_success_threshold() -> u32 {
    1
}

/// Background maintenance pipeline knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Interval of the recurring full cleanup pass over `rl:*`.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Delay applied to cleanup jobs enqueued on denial, roughly one window
    /// later so the purge coincides with expiry.
    #[serde(default = "default_denial_cleanup_delay")]
    pub denial_cleanup_delay_secs: u64,

    /// How long shutdown waits for active queue jobs to finish.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    /// Interval of the health probe that logs queue depth statistics.
    #[serde(default = "default_probe_interval")]
    pub health_probe_interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: default_cleanup_interval(),
            denial_cleanup_delay_secs: default_denial_cleanup_delay(),
            drain_timeout_secs: default_drain_timeout(),
            health_probe_interval_secs: default_probe_interval(),
        }
    }
}

fn default_cleanup_interval() -> u64 {
    600
}

fn default_denial_cleanup_delay() -> u64 {
    60
}

fn default_drain_timeout() -> u64 {
    30
}

fn default_probe_interval() -> u64 {
    30
}
