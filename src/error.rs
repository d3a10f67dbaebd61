//! Common error types for the gateway

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Gateway-wide error type
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No instances registered for service: {0}")]
    NoInstances(String),

    #[error("No healthy instances for service: {0}")]
    NoHealthyInstances(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Invalid service URL: {0}")]
    InvalidServiceUrl(String),

    #[error("Proxy transport error: {0}")]
    ProxyTransport(String),

    #[error("Health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Authentication failed: {0}")]
    AuthRejected(String),

    #[error("Invalid request: {0}")]
    ManagementRequestInvalid(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Route not found: {0}")]
    RouteNotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<config::ConfigError> for GatewayError {
    fn from(err: config::ConfigError) -> Self {
        GatewayError::ConfigInvalid(err.to_string())
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        GatewayError::ConfigInvalid(err.to_string())
    }
}

impl From<toml::ser::Error> for GatewayError {
    fn from(err: toml::ser::Error) -> Self {
        GatewayError::ConfigInvalid(err.to_string())
    }
}

/// Error response body
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub message: String,
    pub r#type: String,
    pub code: Option<String>,
}

impl GatewayError {
    /// HTTP status this error maps to when it reaches a client
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::ConfigInvalid(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Json(_) => StatusCode::BAD_REQUEST,
            GatewayError::NoInstances(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::NoHealthyInstances(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::ServiceNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::InstanceNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::InvalidServiceUrl(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::ProxyTransport(_) => StatusCode::BAD_GATEWAY,
            GatewayError::HealthCheckFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::AuthRejected(_) => StatusCode::UNAUTHORIZED,
            GatewayError::ManagementRequestInvalid(_) => StatusCode::BAD_REQUEST,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message shown to clients. Internal causes are collapsed so transport
    /// and filesystem details never reach the response body.
    fn public_message(&self) -> String {
        match self {
            GatewayError::NoInstances(service) | GatewayError::NoHealthyInstances(service) => {
                format!("Service {} is currently unavailable", service)
            }
            GatewayError::InvalidServiceUrl(_) => "Invalid service URL".to_string(),
            GatewayError::ProxyTransport(_) => "Failed to proxy request".to_string(),
            GatewayError::Io(_) | GatewayError::ConfigInvalid(_) | GatewayError::Internal(_) => {
                "Internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let (error_type, code) = match &self {
            GatewayError::ConfigInvalid(_) => ("server_error", None),
            GatewayError::Io(_) => ("server_error", None),
            GatewayError::Json(_) => ("invalid_request_error", Some("invalid_json")),
            GatewayError::NoInstances(_) => ("service_unavailable", Some("SERVICE_UNAVAILABLE")),
            GatewayError::NoHealthyInstances(_) => ("service_unavailable", Some("SERVICE_UNAVAILABLE")),
            GatewayError::ServiceNotFound(_) => ("not_found_error", Some("service_not_found")),
            GatewayError::InstanceNotFound(_) => ("not_found_error", Some("instance_not_found")),
            GatewayError::InvalidServiceUrl(_) => ("server_error", Some("invalid_service_url")),
            GatewayError::ProxyTransport(_) => ("bad_gateway", Some("BAD_GATEWAY")),
            GatewayError::HealthCheckFailed(_) => ("service_unavailable", None),
            GatewayError::RateLimitExceeded => ("rate_limit_error", Some("rate_limit_exceeded")),
            GatewayError::AuthRejected(_) => ("authentication_error", Some("unauthorized")),
            GatewayError::ManagementRequestInvalid(_) => ("invalid_request_error", None),
            GatewayError::BadRequest(_) => ("invalid_request_error", Some("bad_request")),
            GatewayError::RouteNotFound(_) => ("not_found_error", Some("route_not_found")),
            GatewayError::Internal(_) => ("server_error", None),
        };

        let body = Json(ErrorResponse {
            error: ErrorDetail {
                message: self.public_message(),
                r#type: error_type.to_string(),
                code: code.map(|c| c.to_string()),
            },
        });

        (status, body).into_response()
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, GatewayError>;
