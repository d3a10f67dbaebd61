//! Functional tests for bearer token authentication

use axum::{
    body::Body,
    http::{header::AUTHORIZATION, Request, StatusCode},
    Router,
};
use campus_gateway::middleware::auth::{AuthLayer, StaticTokens};
use tower::ServiceExt;

fn create_test_app(tokens: Vec<String>) -> Router {
    Router::new()
        .route("/api/v1/students", axum::routing::get(|| async { "students" }))
        .route("/api/v1/auth/login", axum::routing::post(|| async { "token" }))
        .route("/health", axum::routing::get(|| async { "healthy" }))
        .layer(AuthLayer::new(
            vec!["/api/v1/students".to_string()],
            StaticTokens::new(tokens),
        ))
}

async fn status_of(app: Router, request: Request<Body>) -> StatusCode {
    app.oneshot(request).await.unwrap().status()
}

#[tokio::test]
async fn test_auth_with_valid_bearer_token() {
    let app = create_test_app(vec!["valid-key-1".to_string(), "valid-key-2".to_string()]);

    let status = status_of(
        app,
        Request::builder()
            .uri("/api/v1/students")
            .header(AUTHORIZATION, "Bearer valid-key-2")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_auth_with_invalid_key() {
    let app = create_test_app(vec!["valid-key-1".to_string()]);

    let status = status_of(
        app,
        Request::builder()
            .uri("/api/v1/students")
            .header(AUTHORIZATION, "Bearer invalid-key")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_auth_without_header() {
    let app = create_test_app(vec![]);

    let status = status_of(
        app,
        Request::builder()
            .uri("/api/v1/students")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_auth_rejects_non_bearer_scheme() {
    let app = create_test_app(vec![]);

    let status = status_of(
        app,
        Request::builder()
            .uri("/api/v1/students")
            .header(AUTHORIZATION, "Basic dXNlcjpwYXNz")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_auth_rejects_empty_token() {
    let app = create_test_app(vec![]);

    let status = status_of(
        app,
        Request::builder()
            .uri("/api/v1/students")
            .header(AUTHORIZATION, "Bearer ")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_auth_empty_token_set_accepts_any_bearer() {
    let app = create_test_app(vec![]);

    let status = status_of(
        app,
        Request::builder()
            .uri("/api/v1/students")
            .header(AUTHORIZATION, "Bearer anything")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_public_routes_bypass_auth() {
    let app = create_test_app(vec!["valid-key".to_string()]);

    let status = status_of(
        app.clone(),
        Request::builder()
            .method("POST")
            .uri("/api/v1/auth/login")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let status = status_of(
        app,
        Request::builder().uri("/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_custom_validator() {
    let app = Router::new()
        .route("/private", axum::routing::get(|| async { "OK" }))
        .layer(AuthLayer::new(
            vec!["/private".to_string()],
            |token: &str| token.starts_with("campus-"),
        ));

    let status = status_of(
        app.clone(),
        Request::builder()
            .uri("/private")
            .header(AUTHORIZATION, "Bearer campus-123")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let status = status_of(
        app,
        Request::builder()
            .uri("/private")
            .header(AUTHORIZATION, "Bearer other")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
