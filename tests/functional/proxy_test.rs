//! End-to-end proxy tests against mock backends

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use campus_gateway::Strategy;
use std::time::Duration;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::{config_with_services, gateway_with, send};

async fn backend(name: &str, health_status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(health_status))
        .mount(&server)
        .await;
    Mock::given(path_regex("^/users"))
        .respond_with(ResponseTemplate::new(200).set_body_string(name))
        .mount(&server)
        .await;
    server
}

async fn proxied_requests(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path().starts_with("/users"))
        .count()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_round_robin_spreads_traffic() {
    let a = backend("a", 200).await;
    let b = backend("b", 200).await;

    let test = gateway_with(config_with_services(&[("users", &a.uri(), "/users")]));
    test.gateway
        .register_instance("users", &b.uri(), None, Some("users-2".into()), None)
        .unwrap();

    for i in 0..100 {
        let (status, headers, _) = send(&test.router, get(&format!("/users/{}", i))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["x-gateway"], "campus-gateway");
    }

    let on_a = proxied_requests(&a).await;
    let on_b = proxied_requests(&b).await;
    assert_eq!(on_a + on_b, 100);
    assert!((40..=60).contains(&on_a), "a received {}", on_a);
    assert!((40..=60).contains(&on_b), "b received {}", on_b);

    let stats = test.gateway.load_balancer().stats();
    assert_eq!(stats.services["users"].total_connections, 0);
}

#[tokio::test]
async fn test_failing_health_check_drains_instance() {
    let a = backend("a", 200).await;
    let b = backend("b", 500).await;

    let mut config = config_with_services(&[("users", &a.uri(), "/users")]);
    config.load_balancer.check_interval = Duration::from_millis(100);
    config.load_balancer.check_timeout = Duration::from_millis(500);
    let test = gateway_with(config);
    test.gateway
        .register_instance("users", &b.uri(), None, Some("users-2".into()), None)
        .unwrap();
    test.gateway.start();

    let mut drained = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let instances = test.gateway.load_balancer().instances("users");
        if instances.iter().any(|i| i.id == "users-2" && !i.healthy) {
            drained = true;
            break;
        }
    }
    assert!(drained, "failing instance was never marked unhealthy");

    let before_b = proxied_requests(&b).await;
    for i in 0..20 {
        let (status, _, body) = send(&test.router, get(&format!("/users/{}", i))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"a");
    }
    assert_eq!(proxied_requests(&b).await, before_b);

    let (_, _, body) = send(&test.router, get("/health")).await;
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["services"]["users"]["healthy_instances"], 1);

    test.gateway.shutdown().await;
}

#[tokio::test]
async fn test_all_unhealthy_is_503() {
    let a = backend("a", 200).await;
    let test = gateway_with(config_with_services(&[("users", &a.uri(), "/users")]));
    test.gateway
        .load_balancer()
        .update_health("users", "users-1", false, Duration::ZERO);

    let (status, _, body) = send(&test.router, get("/users/1")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"]["code"], "SERVICE_UNAVAILABLE");
    assert_eq!(proxied_requests(&a).await, 0);
}

#[tokio::test]
async fn test_unreachable_backend_is_502() {
    let test = gateway_with(config_with_services(&[("users", "http://127.0.0.1:9", "/users")]));

    let (status, _, body) = send(&test.router, get("/users/1")).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"]["message"], "Failed to proxy request");
    assert_eq!(test.gateway.load_balancer().instances("users")[0].connections, 0);
}

#[tokio::test]
async fn test_least_connections_strategy_via_config() {
    let a = backend("a", 200).await;
    let mut config = config_with_services(&[("users", &a.uri(), "/users")]);
    config.load_balancer.strategy = Strategy::LeastConnections;
    let test = gateway_with(config);

    assert_eq!(test.gateway.load_balancer().strategy(), Strategy::LeastConnections);
    let (status, _, body) = send(&test.router, get("/users")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"a");
}
