pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use anyhow::Result;
use std::path::Path;

impl GatewayConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides for infrastructure settings. When the file does not
    /// exist, built-in defaults are used — allowing the gateway to start with
    /// zero configuration for local development.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: GatewayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!(
                "config file not found at {}, using defaults",
                path.display()
            );
            GatewayConfig::default()
        };

        // Environment variable overrides for infrastructure settings.
        config.apply_env_overrides();

        config.validate()?;
        tracing::info!(
            "loaded gateway configuration, rules={}",
            config.limiter.rules.len()
        );
        Ok(config)
    }

    /// Apply environment variable overrides for connection/infra settings.
    /// Rule definitions are managed exclusively via the config file.
    fn apply_env_overrides(&mut self) {
        // Redis
        if let Ok(v) = std::env::var("AEGIS_REDIS_HOST") {
            self.redis.host = v;
        }
        if let Ok(v) = std::env::var("AEGIS_REDIS_PORT") {
            if let Ok(n) = v.parse::<u16>() {
                self.redis.port = n;
            }
        }
        if let Ok(v) = std::env::var("AEGIS_REDIS_PASSWORD") {
            self.redis.password = Some(v);
        }

        // Server
        if let Ok(v) = std::env::var("AEGIS_PORT") {
            if let Ok(n) = v.parse::<u16>() {
                self.server.port = n;
            }
        }
        if let Ok(v) = std::env::var("AEGIS_ENV") {
            self.server.environment = v;
        }
        if let Ok(v) = std::env::var("AEGIS_ALLOWED_ORIGINS") {
            self.server.allowed_origins = v.split(',').map(|s| s.trim().to_string()).collect();
        }

        // Limiter
        if let Ok(v) = std::env::var("AEGIS_LOCAL_CACHE_TTL_MS") {
            if let Ok(n) = v.parse::<u64>() {
                self.limiter.local_cache_ttl_ms = n;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.redis.host.is_empty() {
            anyhow::bail!("redis host cannot be empty");
        }

        let mut seen = std::collections::HashSet::new();
        for rule in &self.limiter.rules {
            if rule.id.is_empty() {
                anyhow::bail!("rule id cannot be empty");
            }
            if !seen.insert(rule.id.as_str()) {
                anyhow::bail!("duplicate rule id: {}", rule.id);
            }
            if rule.window_ms == 0 {
                anyhow::bail!("rule {}: window_ms must be positive", rule.id);
            }
            if rule.max_requests == 0 {
                anyhow::bail!("rule {}: max_requests must be positive", rule.id);
            }
            if rule.algorithm != "sliding" && rule.algorithm != "fixed" {
                anyhow::bail!(
                    "rule {}: unknown algorithm '{}', use 'sliding' or 'fixed'",
                    rule.id,
                    rule.algorithm
                );
            }
            if http::StatusCode::from_u16(rule.status_code).is_err() {
                anyhow::bail!("rule {}: invalid status code {}", rule.id, rule.status_code);
            }
            if rule.key_by != "ip" && rule.key_by != "ip_path" {
                anyhow::bail!(
                    "rule {}: unknown key_by '{}', use 'ip' or 'ip_path'",
                    rule.id,
                    rule.key_by
                );
            }
        }

        if self.limiter.max_throttle_delay_ms == 0 && self.limiter.enable_local_throttle {
            anyhow::bail!("max_throttle_delay_ms must be positive when throttling is enabled");
        }

        Ok(())
    }
}
