//! Router construction

use axum::{
    body::Body,
    http::{header, StatusCode},
    middleware,
    response::Response,
    routing::{delete, get, post},
    Router,
};
use std::any::Any;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{error, Level};

use super::handlers;
use crate::gateway::Gateway;
use crate::middleware::{cors, security_headers, AuthLayer, CorsPolicy, RateLimitLayer};

/// Build the gateway router: management routes, the proxy fallback and the
/// middleware stack.
pub fn create_router(gateway: Arc<Gateway>) -> Router {
    let routes = Router::new()
        .route("/health", get(handlers::health))
        .route("/gateway/stats", get(handlers::stats))
        .route("/gateway/services", get(handlers::list_services))
        .route("/gateway/routes", get(handlers::list_routes))
        .route(
            "/gateway/services/:name/register",
            post(handlers::register_service),
        )
        .route(
            "/gateway/services/:name/unregister",
            delete(handlers::unregister_service),
        )
        .fallback(handlers::proxy);

    with_middleware(routes, gateway)
}

/// Wrap `routes` in the gateway middleware stack.
///
/// Requests pass, outermost first: panic recovery, security headers, CORS,
/// access logging, rate limiting and authentication.
pub fn with_middleware(routes: Router<Arc<Gateway>>, gateway: Arc<Gateway>) -> Router {
    let config = gateway.config();
    let cors_policy = Arc::new(CorsPolicy::from_config(&config.cors));

    routes
        .layer(
            ServiceBuilder::new()
                .layer(CatchPanicLayer::custom(handle_panic))
                .layer(middleware::from_fn(security_headers))
                .layer(middleware::from_fn_with_state(cors_policy, cors))
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                        .on_response(DefaultOnResponse::new().level(Level::INFO)),
                )
                .layer(RateLimitLayer::from_config(config.rate_limit))
                .layer(AuthLayer::from_config(&config.auth))
                .into_inner(),
        )
        .with_state(gateway)
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response<Body> {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    error!(panic = %detail, "Request handler panicked");

    let body = serde_json::json!({
        "error": {
            "message": "Internal server error",
            "type": "server_error",
            "code": null,
        }
    });

    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}
