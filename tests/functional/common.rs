//! Shared helpers for functional tests

use axum::{
    body::Body,
    http::{HeaderMap, Request, StatusCode},
    Router,
};
use campus_gateway::{ConfigStore, Gateway, GatewayConfig, ServiceDeclaration};
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

pub struct TestGateway {
    pub gateway: Arc<Gateway>,
    pub router: Router,
    _dir: TempDir,
}

/// Gateway over `config`, persisted into a temporary directory
pub fn gateway_with(config: GatewayConfig) -> TestGateway {
    let dir = TempDir::new().unwrap();
    let store = ConfigStore::with_config(dir.path().join("gateway.yaml"), config).unwrap();
    let gateway = Gateway::new(Arc::new(store)).unwrap();
    let router = gateway.router();
    TestGateway {
        gateway,
        router,
        _dir: dir,
    }
}

/// Configuration with one service per `(name, url, prefix)`
pub fn config_with_services(services: &[(&str, &str, &str)]) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.rate_limit = 0;
    for (name, url, prefix) in services {
        config
            .services
            .insert(name.to_string(), ServiceDeclaration::new(*url, *prefix));
    }
    config
}

pub async fn send(router: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec();
    (status, headers, body)
}

pub async fn get_json(router: &Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let (status, _, body) = send(router, request).await;
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}
