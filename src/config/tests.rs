use super::types::*;
use super::GatewayConfig;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

fn route(id: &str, path: &str, uri: &str, filters: Vec<FilterConfig>) -> RouteConfig {
    RouteConfig {
        id: id.to_string(),
        path: path.to_string(),
        uri: uri.to_string(),
        strip_prefix: 0,
        max_body_bytes: None,
        fallback: None,
        filters,
    }
}

fn config_with(routes: Vec<RouteConfig>) -> GatewayConfig {
    GatewayConfig {
        routes,
        ..Default::default()
    }
}

fn breaker() -> FilterConfig {
    FilterConfig::CircuitBreaker(CircuitBreakerFilterConfig::default())
}

fn retry() -> FilterConfig {
    FilterConfig::Retry(RetryFilterConfig::default())
}

#[test]
fn test_load_toml_config() {
    let cfg = GatewayConfig::load(Path::new("config.toml")).unwrap();
    assert_eq!(cfg.routes.len(), 6);
    assert_eq!(cfg.discovery.kind, DiscoveryKind::Consul);
    assert_eq!(cfg.rate_limit.max_requests, 50);

    let products = cfg.routes.iter().find(|r| r.id == "product-service").unwrap();
    assert_eq!(products.uri, "lb://product-service");
    assert_eq!(products.filters.len(), 3);
    assert_eq!(
        products.fallback.as_ref().unwrap().path.as_deref(),
        Some("/api/fallback/products")
    );

    let debug = cfg.routes.iter().find(|r| r.id == "debug-route").unwrap();
    assert_eq!(debug.uri, "http://localhost:9000");
    assert!(debug.filters.is_empty());
}

#[test]
fn test_load_json_config() {
    let json = r#"{
        "server": { "listen": "127.0.0.1:18080" },
        "discovery": {
            "type": "static",
            "services": [{ "name": "cart-service", "addresses": ["127.0.0.1:8082"] }]
        },
        "routes": [{
            "id": "cart",
            "path": "/api/cart/**",
            "uri": "lb://cart-service",
            "filters": [{ "type": "retry", "max_attempts": 2 }]
        }]
    }"#;
    let tmp = std::env::temp_dir().join("bastion_test_config.json");
    std::fs::write(&tmp, json).unwrap();
    let cfg = GatewayConfig::load(&tmp).unwrap();
    assert_eq!(cfg.routes.len(), 1);
    assert_eq!(cfg.discovery.services.len(), 1);
    assert_eq!(cfg.discovery.services[0].addresses, vec!["127.0.0.1:8082"]);
    std::fs::remove_file(&tmp).ok();
}

#[test]
fn test_missing_file_uses_defaults() {
    let cfg = GatewayConfig::load(Path::new("/nonexistent/bastion.toml")).unwrap();
    assert!(cfg.routes.is_empty());
    assert_eq!(cfg.upstream.timeout, Duration::from_secs(10));
    assert_eq!(cfg.fallback.path, "/fallback");
}

#[test]
fn test_unsupported_extension_fails() {
    let tmp = std::env::temp_dir().join("bastion_test_config.yaml");
    std::fs::write(&tmp, "routes: []").unwrap();
    assert!(GatewayConfig::load(&tmp).is_err());
    std::fs::remove_file(&tmp).ok();
}

#[test]
fn test_overrides_apply_infra_settings() {
    let vars: HashMap<&str, &str> = HashMap::from([
        ("BASTION_LISTEN", "127.0.0.1:7000"),
        ("BASTION_DISCOVERY_TYPE", "consul"),
        ("BASTION_CONSUL_ADDRESS", "http://consul:8500"),
        ("BASTION_CONSUL_POLL_INTERVAL", "3s"),
        ("BASTION_RATE_LIMIT_ENABLED", "false"),
    ]);
    let mut cfg = GatewayConfig::default();
    cfg.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));

    assert_eq!(cfg.server.listen, "127.0.0.1:7000");
    assert_eq!(cfg.discovery.kind, DiscoveryKind::Consul);
    assert_eq!(cfg.discovery.consul.address, "http://consul:8500");
    assert_eq!(cfg.discovery.consul.poll_interval, Duration::from_secs(3));
    assert!(!cfg.rate_limit.enabled);
    assert_eq!(cfg.server.admin_listen, "0.0.0.0:9091");
}

#[test]
fn test_validate_valid_config() {
    let cfg = config_with(vec![
        route("products", "/api/products/**", "lb://product-service", vec![breaker(), retry()]),
        route("debug", "/api/debug/**", "http://localhost:9000", vec![]),
    ]);
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_validate_duplicate_route_id_fails() {
    let cfg = config_with(vec![
        route("dup", "/a/**", "lb://a", vec![]),
        route("dup", "/b/**", "lb://b", vec![]),
    ]);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_path_without_slash_fails() {
    let cfg = config_with(vec![route("r", "api/**", "lb://a", vec![])]);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_unknown_scheme_fails() {
    let cfg = config_with(vec![route("r", "/a/**", "ftp://host:21", vec![])]);
    assert!(cfg.validate().is_err());

    let cfg = config_with(vec![route("r", "/a/**", "lb://", vec![])]);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_direct_route_with_resilience_fails() {
    let cfg = config_with(vec![route("debug", "/api/debug/**", "http://localhost:9000", vec![breaker()])]);
    assert!(cfg.validate().is_err());

    let cfg = config_with(vec![route("debug", "/api/debug/**", "http://localhost:9000", vec![retry()])]);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_zero_attempts_fails() {
    let filter = FilterConfig::Retry(RetryFilterConfig {
        max_attempts: 0,
        ..Default::default()
    });
    let cfg = config_with(vec![route("r", "/a/**", "lb://a", vec![filter])]);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_breaker_threshold_out_of_range_fails() {
    let filter = FilterConfig::CircuitBreaker(CircuitBreakerFilterConfig {
        failure_rate_threshold: Some(150.0),
        ..Default::default()
    });
    let cfg = config_with(vec![route("r", "/a/**", "lb://a", vec![filter])]);
    assert!(cfg.validate().is_err());

    let mut cfg = config_with(vec![]);
    cfg.circuit_breaker.sliding_window_size = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_two_breakers_fail() {
    let cfg = config_with(vec![route("r", "/a/**", "lb://a", vec![breaker(), breaker()])]);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_fallback_path_collision_fails() {
    let mut r = route("r", "/a/**", "lb://a", vec![]);
    r.fallback = Some(RouteFallbackConfig {
        path: Some("/fallback".into()),
        message: None,
    });
    let cfg = config_with(vec![r]);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_route_fallback_parses_message_and_path() {
    let r: RouteConfig = toml::from_str(
        r#"
        id = "r"
        path = "/a/**"
        uri = "lb://a"
        fallback = { message = "down" }
        "#,
    )
    .unwrap();
    let fb = r.fallback.unwrap();
    assert_eq!(fb.message.as_deref(), Some("down"));
    assert!(fb.path.is_none());
}

#[test]
fn test_validate_static_address_fails() {
    let mut cfg = config_with(vec![]);
    cfg.discovery.services.push(StaticServiceConfig {
        name: "cart-service".into(),
        addresses: vec!["localhost".into()],
    });
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_invalid_header_name_fails() {
    let filter = FilterConfig::RequestHeader(HeaderFilterConfig {
        name: "bad header".into(),
        value: "v".into(),
        action: HeaderAction::Set,
    });
    let cfg = config_with(vec![route("r", "/a/**", "lb://a", vec![filter])]);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_zero_body_limit_fails() {
    let mut r = route("r", "/a/**", "lb://a", vec![]);
    r.max_body_bytes = Some(0);
    assert!(config_with(vec![r]).validate().is_err());

    let mut cfg = config_with(vec![]);
    cfg.upstream.max_body_bytes = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn test_body_limit_defaults() {
    let cfg = GatewayConfig::default();
    assert_eq!(cfg.upstream.max_body_bytes, 10 * 1024 * 1024);
    let r: RouteConfig = toml::from_str(
        r#"
        id = "r"
        path = "/a/**"
        uri = "lb://a"
        max_body_bytes = 1024
        "#,
    )
    .unwrap();
    assert_eq!(r.max_body_bytes, Some(1024));
}
