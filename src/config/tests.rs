use super::GatewayConfig;
use super::types::*;

#[test]
fn test_load_json_config() {
    let json = r#"{
        "server": { "port": 8080, "environment": "test" },
        "redis": { "host": "10.0.0.5", "port": 6380 },
        "limiter": {
            "rules": [
                {"id": "api", "window_ms": 60000, "max_requests": 300},
                {"id": "burst", "window_ms": 1000, "max_requests": 50}
            ],
            "skip_successful_requests": true
        }
    }"#;
    let tmp = std::env::temp_dir().join("aegis_test_config.json");
    std::fs::write(&tmp, json).unwrap();
    let cfg = GatewayConfig::load(&tmp).unwrap();
    assert_eq!(cfg.server.port, 8080);
    assert_eq!(cfg.redis.host, "10.0.0.5");
    assert_eq!(cfg.redis.port, 6380);
    assert_eq!(cfg.limiter.rules.len(), 2);
    assert!(cfg.limiter.skip_successful_requests);
    std::fs::remove_file(&tmp).ok();
}

#[test]
fn test_load_toml_config() {
    let toml = r#"
        [server]
        port = 9090

        [[limiter.rules]]
        id = "burst"
        window_ms = 1000
        max_requests = 10
    "#;
    let tmp = std::env::temp_dir().join("aegis_test_config.toml");
    std::fs::write(&tmp, toml).unwrap();
    let cfg = GatewayConfig::load(&tmp).unwrap();
    assert_eq!(cfg.server.port, 9090);
    assert_eq!(cfg.limiter.rules.len(), 1);
    assert_eq!(cfg.limiter.rules[0].max_requests, 10);
    std::fs::remove_file(&tmp).ok();
}

#[test]
fn test_load_missing_file_uses_defaults() {
    let cfg = GatewayConfig::load(std::path::Path::new("/nonexistent/aegis.toml")).unwrap();
    assert_eq!(cfg.server.port, 3000);
    assert_eq!(cfg.limiter.rules.len(), 3);
}

#[test]
fn test_validate_duplicate_rule_id_fails() {
    let mut cfg = GatewayConfig::default();
    let dup = cfg.limiter.rules[0].clone();
    cfg.limiter.rules.push(dup);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_zero_window_fails() {
    let mut cfg = GatewayConfig::default();
    cfg.limiter.rules[0].window_ms = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_zero_limit_fails() {
    let mut cfg = GatewayConfig::default();
    cfg.limiter.rules[0].max_requests = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_unknown_algorithm_fails() {
    let mut cfg = GatewayConfig::default();
    cfg.limiter.rules[0].algorithm = "token_bucket".to_string();
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_invalid_status_code_fails() {
    let mut cfg = GatewayConfig::default();
    cfg.limiter.rules[0].status_code = 99;
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_unknown_key_by_fails() {
    let mut cfg = GatewayConfig::default();
    cfg.limiter.rules[0].key_by = "user".to_string();
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_default_config_passes() {
    let cfg = GatewayConfig::default();
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_rule_config_roundtrip() {
    let rule = RuleConfig {
        id: "auth".to_string(),
        window_ms: 300_000,
        max_requests: 5,
        algorithm: "sliding".to_string(),
        status_code: 423,
        message: Some("locked out".to_string()),
        key_by: "ip".to_string(),
        apply_paths: vec!["/auth".to_string()],
        skip_paths: vec![],
    };
    let serialized = serde_json::to_string(&rule).unwrap();
    let back: RuleConfig = serde_json::from_str(&serialized).unwrap();
    assert_eq!(back.id, "auth");
    assert_eq!(back.status_code, 423);
    assert_eq!(back.message.as_deref(), Some("locked out"));
}
