use super::GatewayConfig;

#[test]
fn test_load_toml_config() {
    let toml = r#"
        [[listeners]]
        id = "web"
        protocol = "http"
        listen = "0.0.0.0:8080"

        [[routes]]
        id = "api"
        path_prefix = "/api"
        backends = [{ url = "http://127.0.0.1:9001" }, { url = "http://127.0.0.1:9002", weight = 3 }]

        [routes.retry]
        max_retries = 2

        [routes.retry.budget]
        ratio = 0.2
    "#;
    let tmp = std::env::temp_dir().join("janus_test_config.toml");
    std::fs::write(&tmp, toml).unwrap();
    let cfg = GatewayConfig::load(&tmp).unwrap();
    std::fs::remove_file(&tmp).ok();

    assert_eq!(cfg.listeners.len(), 1);
    assert_eq!(cfg.routes.len(), 1);
    let route = &cfg.routes[0];
    assert_eq!(route.backends[0].weight, 1);
    assert_eq!(route.backends[1].weight, 3);
    let retry = route.retry.as_ref().unwrap();
    assert_eq!(retry.max_retries, 2);
    assert_eq!(retry.initial_backoff_ms, 100);
    assert_eq!(retry.retryable_statuses, vec![502, 503, 504]);
    let budget = retry.budget.as_ref().unwrap();
    assert_eq!(budget.window, 10);
}

#[test]
fn test_load_json_config() {
    let json = r#"{
        "listeners": [{"id": "edge", "protocol": "tcp", "listen": "0.0.0.0:9443", "sni_routing": true}],
        "tcp_routes": [{
            "id": "mesh",
            "listener": "edge",
            "match": {"sni": ["*.internal.example.com"], "source_cidr": ["10.0.0.0/8"]},
            "backends": [{"addr": "10.1.0.1:9443"}]
        }]
    }"#;
    let tmp = std::env::temp_dir().join("janus_test_config.json");
    std::fs::write(&tmp, json).unwrap();
    let cfg = GatewayConfig::load(&tmp).unwrap();
    std::fs::remove_file(&tmp).ok();

    assert_eq!(cfg.listeners.len(), 1);
    assert!(cfg.listeners[0].sni_routing);
    assert_eq!(cfg.tcp_routes[0].matcher.sni.len(), 1);
    assert_eq!(cfg.tcp_routes[0].pool.max_idle, 10);
}

fn base_route(id: &str) -> super::RouteConfig {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "backends": [{"url": "http://127.0.0.1:9001"}]
    }))
    .unwrap()
}

#[test]
fn test_validate_unknown_algorithm_fails() {
    let mut route = base_route("r1");
    route.balancer.algorithm = "fastest_first".into();
    let cfg = GatewayConfig {
        routes: vec![route],
        ..Default::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_zero_weight_fails() {
    let mut route = base_route("r1");
    route.backends[0].weight = 0;
    let cfg = GatewayConfig {
        routes: vec![route],
        ..Default::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_duplicate_group_fails() {
    let route: super::RouteConfig = serde_json::from_value(serde_json::json!({
        "id": "r1",
        "groups": [
            {"name": "stable", "weight": 90, "backends": [{"url": "http://a:1"}]},
            {"name": "stable", "weight": 10, "backends": [{"url": "http://b:1"}]}
        ]
    }))
    .unwrap();
    let cfg = GatewayConfig {
        routes: vec![route],
        ..Default::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_canary_group_must_exist() {
    let route: super::RouteConfig = serde_json::from_value(serde_json::json!({
        "id": "r1",
        "groups": [{"name": "stable", "weight": 100, "backends": [{"url": "http://a:1"}]}],
        "canary": {
            "enabled": true,
            "canary_group": "canary",
            "steps": [{"weight": 10}]
        }
    }))
    .unwrap();
    let cfg = GatewayConfig {
        routes: vec![route],
        ..Default::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_bad_cidr_fails() {
    let cfg: GatewayConfig = serde_json::from_value(serde_json::json!({
        "listeners": [{"id": "edge", "protocol": "tcp", "listen": "0.0.0.0:9443"}],
        "tcp_routes": [{
            "id": "mesh",
            "listener": "edge",
            "match": {"source_cidr": ["10.0.0.0/40"]},
            "backends": [{"addr": "10.1.0.1:9443"}]
        }]
    }))
    .unwrap();
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_consistent_hash_key() {
    let mut route = base_route("r1");
    route.balancer.algorithm = "consistent_hash".into();
    route.balancer.consistent_hash = Some(super::ConsistentHashConfig {
        key: "header:".into(),
        replicas: 150,
    });
    let cfg = GatewayConfig {
        routes: vec![route.clone()],
        ..Default::default()
    };
    assert!(cfg.validate().is_err());

    route.balancer.consistent_hash = Some(super::ConsistentHashConfig {
        key: "header:x-user-id".into(),
        replicas: 150,
    });
    let cfg = GatewayConfig {
        routes: vec![route],
        ..Default::default()
    };
    assert!(cfg.validate().is_ok());
}
