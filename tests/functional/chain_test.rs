//! The full middleware chain as assembled by the gateway router

use axum::{
    body::Body,
    http::{header::AUTHORIZATION, Method, Request, StatusCode},
    routing::get,
    Router,
};
use campus_gateway::api::with_middleware;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::{config_with_services, gateway_with, send};

async fn explode() -> &'static str {
    panic!("handler exploded")
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_handler_panic_becomes_500() {
    let test = gateway_with(config_with_services(&[]));
    let router = with_middleware(
        Router::new().route("/explode", get(explode)),
        test.gateway.clone(),
    );

    let (status, headers, body) = send(&router, get_request("/explode")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(headers["content-type"], "application/json");

    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"]["message"], "Internal server error");
    assert_eq!(body["error"]["type"], "server_error");

    // the gateway keeps serving after the panic
    let (status, _, _) = send(&test.router, get_request("/health")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_rate_limited_response_has_security_headers() {
    let mut config = config_with_services(&[]);
    config.rate_limit = 1;
    let test = gateway_with(config);

    let (first, _, _) = send(&test.router, get_request("/gateway/services")).await;
    assert_eq!(first, StatusCode::OK);

    let (status, headers, body) = send(&test.router, get_request("/gateway/services")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(headers["x-frame-options"], "DENY");
    assert_eq!(headers["x-content-type-options"], "nosniff");
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(body["error"].is_object());
}

#[tokio::test]
async fn test_unauthorized_response_has_security_headers() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&backend)
        .await;

    let mut config = config_with_services(&[("students", &backend.uri(), "/api/v1/students")]);
    config.auth.protected_prefixes = vec!["/api/v1/students".to_string()];
    let test = gateway_with(config);

    let (status, headers, _) = send(&test.router, get_request("/api/v1/students/7")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(headers["x-frame-options"], "DENY");
    assert!(headers.contains_key("strict-transport-security"));

    let authorized = Request::builder()
        .uri("/api/v1/students/7")
        .header(AUTHORIZATION, "Bearer anything")
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&test.router, authorized).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_preflight_on_protected_prefix_skips_auth() {
    let mut config = config_with_services(&[("students", "http://127.0.0.1:9", "/api/v1/students")]);
    config.auth.protected_prefixes = vec!["/api/v1/students".to_string()];
    let test = gateway_with(config);

    let preflight = Request::builder()
        .method(Method::OPTIONS)
        .uri("/api/v1/students/7")
        .header("origin", "http://localhost:3000")
        .body(Body::empty())
        .unwrap();
    let (status, headers, _) = send(&test.router, preflight).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(headers.contains_key("access-control-allow-methods"));
    assert_eq!(headers["x-frame-options"], "DENY");
}
