//! Bearer token authentication for protected route prefixes

use axum::{
    body::Body,
    http::{header::AUTHORIZATION, Request},
    response::{IntoResponse, Response},
};
use futures::future::BoxFuture;
use std::{
    collections::HashSet,
    sync::Arc,
    task::{Context, Poll},
};
use tower::{Layer, Service};
use tracing::warn;

use crate::config::AuthConfig;
use crate::error::GatewayError;
use crate::gateway::routes::prefix_matches;

/// Decides whether a bearer token is acceptable
pub trait TokenValidator: Send + Sync + 'static {
    fn validate(&self, token: &str) -> bool;
}

impl<F> TokenValidator for F
where
    F: Fn(&str) -> bool + Send + Sync + 'static,
{
    fn validate(&self, token: &str) -> bool {
        self(token)
    }
}

/// Accepts tokens from a fixed set. An empty set accepts any token.
pub struct StaticTokens {
    tokens: HashSet<String>,
}

impl StaticTokens {
    pub fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }
}

impl TokenValidator for StaticTokens {
    fn validate(&self, token: &str) -> bool {
        self.tokens.is_empty() || self.tokens.contains(token)
    }
}

/// Authentication layer
#[derive(Clone)]
pub struct AuthLayer {
    protected_prefixes: Arc<Vec<String>>,
    validator: Arc<dyn TokenValidator>,
}

impl AuthLayer {
    pub fn new<V: TokenValidator>(protected_prefixes: Vec<String>, validator: V) -> Self {
        Self {
            protected_prefixes: Arc::new(protected_prefixes),
            validator: Arc::new(validator),
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(
            config.protected_prefixes.clone(),
            StaticTokens::new(config.tokens.iter().cloned()),
        )
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthMiddleware {
            inner,
            protected_prefixes: self.protected_prefixes.clone(),
            validator: self.validator.clone(),
        }
    }
}

/// Authentication middleware service
#[derive(Clone)]
pub struct AuthMiddleware<S> {
    inner: S,
    protected_prefixes: Arc<Vec<String>>,
    validator: Arc<dyn TokenValidator>,
}

impl<S> Service<Request<Body>> for AuthMiddleware<S>
where
    S: Service<Request<Body>, Response = Response> + Send + Clone + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let path = request.uri().path();
        let protected = self
            .protected_prefixes
            .iter()
            .any(|prefix| prefix_matches(prefix, path));

        if !protected {
            let future = self.inner.call(request);
            return Box::pin(async move { future.await });
        }

        let rejection = match bearer_token(&request) {
            Err(reason) => Some(reason),
            Ok(token) if !self.validator.validate(token) => Some("Invalid token"),
            Ok(_) => None,
        };

        match rejection {
            None => {
                let future = self.inner.call(request);
                Box::pin(async move { future.await })
            }
            Some(reason) => {
                warn!(path = %path, reason, "Rejected unauthenticated request");
                Box::pin(async move {
                    Ok(GatewayError::AuthRejected(reason.to_string()).into_response())
                })
            }
        }
    }
}

fn bearer_token(request: &Request<Body>) -> Result<&str, &'static str> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .ok_or("Authorization header required")?
        .to_str()
        .map_err(|_| "Invalid authorization header")?;

    let token = header
        .strip_prefix("Bearer ")
        .ok_or("Invalid authorization format")?
        .trim();

    if token.is_empty() {
        return Err("Token required");
    }
    Ok(token)
}
