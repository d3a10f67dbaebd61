//! Reverse proxy: forwards a request to an instance chosen by the load balancer

use axum::{
    body::Body,
    extract::{ConnectInfo, Request},
    http::{header, HeaderMap, HeaderName, HeaderValue, Uri},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures::StreamExt;
use reqwest::{redirect, Client, Url};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::gateway::load_balancer::LoadBalancer;

/// Value of the `X-Gateway` response header
pub const GATEWAY_NAME: &str = "campus-gateway";
/// Value of the `X-Gateway-Version` header
pub const GATEWAY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Largest request body buffered for forwarding
const MAX_REQUEST_BODY: usize = 32 * 1024 * 1024;

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
pub const X_REQUEST_ID: &str = "x-request-id";
pub const X_GATEWAY: &str = "x-gateway";
pub const X_GATEWAY_SERVICE: &str = "x-gateway-service";
pub const X_GATEWAY_VERSION: &str = "x-gateway-version";
pub const X_RESPONSE_TIME: &str = "x-response-time";

/// Forwards requests to service instances
pub struct ReverseProxyRouter {
    client: Client,
    load_balancer: Arc<LoadBalancer>,
    timeout: Duration,
}

impl ReverseProxyRouter {
    /// Create a proxy whose upstream requests give up after `timeout`
    pub fn new(load_balancer: Arc<LoadBalancer>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(100)
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| GatewayError::Internal(format!("Failed to create proxy client: {}", e)))?;

        Ok(Self {
            client,
            load_balancer,
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Proxy `request` to an instance of `service_name`.
    ///
    /// Always produces a response: 503 when no healthy instance exists,
    /// 502 when the upstream exchange fails, otherwise the upstream answer.
    pub async fn proxy_request(&self, request: Request, service_name: &str) -> Response {
        match self.forward(request, service_name).await {
            Ok(response) => response,
            Err(e) => {
                warn!(service = %service_name, error = %e, "Proxy request failed");
                e.into_response()
            }
        }
    }

    async fn forward(&self, request: Request, service_name: &str) -> Result<Response> {
        let guard = self.load_balancer.acquire(service_name)?;
        let instance = guard.instance().clone();
        let start = Instant::now();

        let target = target_url(&instance.url, request.uri())?;
        let request_id = Uuid::new_v4().to_string();

        let (parts, body) = request.into_parts();
        let client_addr = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());
        let headers = upstream_headers(&parts.headers, &parts.uri, client_addr, service_name, &request_id);

        let body = axum::body::to_bytes(body, MAX_REQUEST_BODY)
            .await
            .map_err(|e| GatewayError::BadRequest(format!("failed to read request body: {}", e)))?;

        debug!(
            service = %service_name,
            instance = %instance.id,
            method = %parts.method,
            target = %target,
            request_id = %request_id,
            "Forwarding request"
        );

        let upstream = self
            .client
            .request(parts.method.clone(), target)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                GatewayError::ProxyTransport(format!("{} ({}): {}", instance.id, instance.url, e))
            })?;

        let status = upstream.status();
        let mut response_headers = HeaderMap::new();
        for (name, value) in upstream.headers() {
            if !is_hop_by_hop(name.as_str()) {
                response_headers.append(name.clone(), value.clone());
            }
        }
        stamp_response_headers(&mut response_headers, &request_id);

        debug!(
            service = %service_name,
            instance = %instance.id,
            status = status.as_u16(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Upstream responded"
        );

        // The guard rides along with the body so the connection count only
        // drops once the client has the whole response or went away.
        let stream = upstream.bytes_stream().map(move |chunk| {
            let _held = &guard;
            chunk
        });

        let mut response = Response::new(Body::from_stream(stream));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}

/// Join the incoming path and query onto the instance base URL
pub fn target_url(base: &str, uri: &Uri) -> Result<Url> {
    let mut url = Url::parse(base).map_err(|e| GatewayError::InvalidServiceUrl(format!("{}: {}", base, e)))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(GatewayError::InvalidServiceUrl(base.to_string()));
    }

    let path = format!("{}{}", url.path().trim_end_matches('/'), uri.path());
    url.set_path(&path);
    url.set_query(uri.query());
    Ok(url)
}

fn upstream_headers(
    incoming: &HeaderMap,
    uri: &Uri,
    client_addr: Option<String>,
    service_name: &str,
    request_id: &str,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in incoming {
        if !is_hop_by_hop(name.as_str()) && *name != header::HOST && *name != header::CONTENT_LENGTH {
            headers.append(name.clone(), value.clone());
        }
    }

    if let Some(addr) = client_addr {
        let forwarded_for = match incoming.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(existing) if !existing.is_empty() => format!("{}, {}", existing, addr),
            _ => addr,
        };
        insert(&mut headers, X_FORWARDED_FOR, &forwarded_for);
    }

    let original_host = incoming
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|a| a.to_string()));
    if let Some(host) = original_host {
        insert(&mut headers, X_FORWARDED_HOST, &host);
    }

    insert(&mut headers, X_FORWARDED_PROTO, uri.scheme_str().unwrap_or("http"));
    insert(&mut headers, X_REQUEST_ID, request_id);
    insert(&mut headers, X_GATEWAY_SERVICE, service_name);
    insert(&mut headers, X_GATEWAY_VERSION, GATEWAY_VERSION);
    headers
}

fn stamp_response_headers(headers: &mut HeaderMap, request_id: &str) {
    insert(headers, X_GATEWAY, GATEWAY_NAME);
    insert(headers, X_GATEWAY_VERSION, GATEWAY_VERSION);
    insert(headers, X_RESPONSE_TIME, &Utc::now().to_rfc3339());
    insert(headers, X_REQUEST_ID, request_id);
}

fn insert(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

/// Check if a header is a hop-by-hop header that should not be forwarded
fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
