//! Rate limiting middleware using the Governor crate

use axum::{
    body::Body,
    http::Request,
    response::{IntoResponse, Response},
};
use futures::future::BoxFuture;
use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::{
    num::NonZeroU32,
    sync::Arc,
    task::{Context, Poll},
};
use tower::{Layer, Service};
use tracing::warn;

use crate::error::GatewayError;

type SharedRateLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>>;

/// Global rate limiting layer. One bucket is shared by every client.
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Option<SharedRateLimiter>,
}

impl RateLimitLayer {
    /// Allow `requests_per_second` with an equal burst. Zero disables limiting.
    pub fn new(requests_per_second: u32) -> Self {
        let limiter = NonZeroU32::new(requests_per_second).map(|rate| {
            let quota = Quota::per_second(rate).allow_burst(rate);
            Arc::new(RateLimiter::direct(quota))
        });

        Self { limiter }
    }

    /// Build from the configured rate, clamping out-of-range values
    pub fn from_config(rate_limit: i64) -> Self {
        Self::new(u32::try_from(rate_limit.max(0)).unwrap_or(u32::MAX))
    }

    pub fn is_enabled(&self) -> bool {
        self.limiter.is_some()
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitMiddleware {
            inner,
            limiter: self.limiter.clone(),
        }
    }
}

/// Rate limiting middleware service
#[derive(Clone)]
pub struct RateLimitMiddleware<S> {
    inner: S,
    limiter: Option<SharedRateLimiter>,
}

impl<S> Service<Request<Body>> for RateLimitMiddleware<S>
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
        // Liveness probes are never throttled
        let path = request.uri().path();
        let limited = match &self.limiter {
            Some(limiter) if path != "/health" => limiter.check().is_err(),
            _ => false,
        };

        if limited {
            warn!(path = %path, "Rate limit exceeded");
            return Box::pin(async move { Ok(GatewayError::RateLimitExceeded.into_response()) });
        }

        let future = self.inner.call(request);
        Box::pin(async move { future.await })
    }
}
