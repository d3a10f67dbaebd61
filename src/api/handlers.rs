//! Management, health and proxy handlers

use axum::{
    extract::{rejection::JsonRejection, Path, Query, Request, State},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::config::format_duration;
use crate::error::{GatewayError, Result};
use crate::gateway::instance::ServiceInstance;
use crate::gateway::proxy::GATEWAY_VERSION;
use crate::gateway::Gateway;

/// Management routes served by the gateway itself, as `(method, path)`
pub const MANAGEMENT_ROUTES: &[(&str, &str)] = &[
    ("GET", "/health"),
    ("GET", "/gateway/stats"),
    ("GET", "/gateway/services"),
    ("GET", "/gateway/routes"),
    ("POST", "/gateway/services/:name/register"),
    ("DELETE", "/gateway/services/:name/unregister"),
];

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: i64,
    pub uptime: String,
    pub version: String,
    pub services: BTreeMap<String, ServiceHealth>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub healthy: bool,
    pub last_check: i64,
    pub url: String,
    pub instances: usize,
    pub healthy_instances: usize,
}

/// Gateway liveness plus a per-service health summary
pub async fn health(State(gateway): State<Arc<Gateway>>) -> Json<HealthResponse> {
    let services = gateway
        .registry()
        .all_services()
        .into_iter()
        .map(|(name, instances)| (name, summarize(&instances)))
        .collect();

    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now().timestamp(),
        uptime: format_duration(std::time::Duration::from_secs(gateway.uptime().as_secs())),
        version: GATEWAY_VERSION.to_string(),
        services,
    })
}

fn summarize(instances: &[ServiceInstance]) -> ServiceHealth {
    let healthy_instances = instances.iter().filter(|i| i.healthy).count();
    let last_check = instances
        .iter()
        .map(|i| i.last_check.timestamp())
        .max()
        .unwrap_or(0);

    ServiceHealth {
        healthy: healthy_instances > 0,
        last_check,
        url: instances.first().map(|i| i.url.clone()).unwrap_or_default(),
        instances: instances.len(),
        healthy_instances,
    }
}

/// Gateway, configuration and load balancer statistics
pub async fn stats(State(gateway): State<Arc<Gateway>>) -> Json<Value> {
    let config = gateway.config();
    let lb_stats = gateway.load_balancer().stats();

    Json(json!({
        "gateway": {
            "version": GATEWAY_VERSION,
            "uptime_seconds": gateway.uptime().as_secs(),
            "start_time": gateway.started_at().to_rfc3339(),
        },
        "config": {
            "port": config.port,
            "timeout": format_duration(config.timeout),
            "rate_limit": config.rate_limit,
            "services": config.services.len(),
        },
        "load_balancer": {
            "strategy": lb_stats.strategy,
            "health_check": config.load_balancer.health_check,
            "check_interval": format_duration(config.load_balancer.check_interval),
        },
        "registry": gateway.registry().summary(),
        "services": lb_stats.services,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceListing {
    pub name: String,
    pub id: String,
    pub healthy: bool,
    pub url: String,
    pub weight: u32,
    pub failure_count: u32,
}

/// Every tracked instance, healthy or not
pub async fn list_services(State(gateway): State<Arc<Gateway>>) -> Json<Value> {
    let services: Vec<ServiceListing> = gateway
        .registry()
        .all_services()
        .into_values()
        .flatten()
        .map(|i| ServiceListing {
            name: i.service_name,
            id: i.id,
            healthy: i.healthy,
            url: i.url,
            weight: i.weight,
            failure_count: i.failure_count,
        })
        .collect();

    Json(json!({
        "total": services.len(),
        "services": services,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RouteListing {
    pub method: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

/// Management routes followed by one entry per proxied prefix
pub async fn list_routes(State(gateway): State<Arc<Gateway>>) -> Json<Value> {
    let mut routes: Vec<RouteListing> = MANAGEMENT_ROUTES
        .iter()
        .map(|&(method, path)| RouteListing {
            method: method.to_string(),
            path: path.to_string(),
            service: None,
        })
        .collect();

    routes.extend(gateway.route_table().routes().iter().map(|r| RouteListing {
        method: "ANY".to_string(),
        path: format!("{}/*path", r.prefix.trim_end_matches('/')),
        service: Some(r.service.clone()),
    }));

    Json(json!({
        "total": routes.len(),
        "routes": routes,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub url: String,
    pub weight: Option<i64>,
    pub id: Option<String>,
    pub health_check_path: Option<String>,
}

/// Add or update an instance of `name`
pub async fn register_service(
    State(gateway): State<Arc<Gateway>>,
    Path(name): Path<String>,
    payload: std::result::Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<Json<Value>> {
    let Json(body) =
        payload.map_err(|e| GatewayError::ManagementRequestInvalid(e.body_text()))?;

    let instance = gateway.register_instance(
        &name,
        &body.url,
        body.weight,
        body.id,
        body.health_check_path,
    )?;

    info!(service = %name, instance = %instance.id, url = %instance.url, "Instance registered via API");

    Ok(Json(json!({
        "message": "Service registered successfully",
        "service": name,
        "instance": instance,
    })))
}

#[derive(Debug, Deserialize)]
pub struct UnregisterQuery {
    pub id: Option<String>,
}

/// Remove one instance (`?id=`) or every instance of `name`
pub async fn unregister_service(
    State(gateway): State<Arc<Gateway>>,
    Path(name): Path<String>,
    Query(query): Query<UnregisterQuery>,
) -> Json<Value> {
    let registry = gateway.registry();
    let removed: Vec<String> = match query.id.filter(|id| !id.is_empty()) {
        Some(id) => registry
            .unregister_from(&name, &id)
            .map(|i| vec![i.id])
            .unwrap_or_default(),
        None => registry
            .unregister_service(&name)
            .map(|all| all.into_iter().map(|i| i.id).collect())
            .unwrap_or_default(),
    };

    info!(service = %name, removed = removed.len(), "Instances unregistered via API");

    Json(json!({
        "message": "Service unregistered successfully",
        "service": name,
        "removed": removed.len(),
        "instances": removed,
    }))
}

/// Anything that is not a management route is proxied by path prefix
pub async fn proxy(State(gateway): State<Arc<Gateway>>, request: Request) -> Response {
    let path = request.uri().path().to_string();
    match gateway.resolve_route(&path) {
        Some(service) => gateway.proxy().proxy_request(request, &service).await,
        None => GatewayError::RouteNotFound(path).into_response(),
    }
}
