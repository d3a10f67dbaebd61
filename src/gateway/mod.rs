//! Gateway module - load balancing, discovery, health checking and proxying

pub mod health_check;
pub mod instance;
pub mod load_balancer;
pub mod proxy;
pub mod registry;
pub mod routes;

use arc_swap::ArcSwap;
use axum::Router;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{ConfigStore, GatewayConfig};
use crate::error::{GatewayError, Result};
use instance::ServiceInstance;
use load_balancer::LoadBalancer;
use proxy::ReverseProxyRouter;
use registry::ServiceRegistry;
use routes::RouteTable;

/// Wires configuration, registry, load balancer and proxy together and
/// owns the background tasks.
pub struct Gateway {
    config: Arc<ConfigStore>,
    /// Configuration the listener and middleware were built from
    boot_config: Arc<GatewayConfig>,
    load_balancer: Arc<LoadBalancer>,
    registry: Arc<ServiceRegistry>,
    proxy: ReverseProxyRouter,
    routes: ArcSwap<RouteTable>,
    started_at: DateTime<Utc>,
    started: Instant,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    health_loop: Mutex<Option<HealthLoop>>,
}

/// The running health supervisor and the interval it was started with
struct HealthLoop {
    interval: Duration,
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl Gateway {
    /// Build the gateway and register every declared service
    pub fn new(config: Arc<ConfigStore>) -> Result<Arc<Self>> {
        let current = config.get();
        let shutdown = CancellationToken::new();

        let load_balancer = Arc::new(LoadBalancer::new(current.load_balancer.strategy));
        let registry = Arc::new(ServiceRegistry::new(
            Arc::clone(&load_balancer),
            current.load_balancer.check_timeout,
            shutdown.child_token(),
        )?);
        let proxy = ReverseProxyRouter::new(Arc::clone(&load_balancer), current.timeout)?;

        let gateway = Arc::new(Self {
            config,
            boot_config: Arc::clone(&current),
            load_balancer,
            registry,
            proxy,
            routes: ArcSwap::from_pointee(RouteTable::from_config(&current)),
            started_at: Utc::now(),
            started: Instant::now(),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            health_loop: Mutex::new(None),
        });

        gateway.seed_services(&current);

        info!(
            strategy = %current.load_balancer.strategy,
            services = current.services.len(),
            "Gateway initialized"
        );

        Ok(gateway)
    }

    /// Start health checking, config polling and the config watcher
    pub fn start(self: &Arc<Self>) {
        let current = self.config.get();
        self.sync_health_loop(&current);

        let mut tasks = self.tasks.lock();
        tasks.push(
            self.config
                .spawn_reload_task(current.reload_interval, self.shutdown.child_token()),
        );

        let gateway = Arc::downgrade(self);
        self.config.add_watcher(move |config: &GatewayConfig| {
            match gateway.upgrade() {
                Some(gateway) => gateway.apply_config(config),
                None => Ok(()),
            }
        });
    }

    pub fn config(&self) -> Arc<GatewayConfig> {
        self.config.get()
    }

    pub fn config_store(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn load_balancer(&self) -> &Arc<LoadBalancer> {
        &self.load_balancer
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn proxy(&self) -> &ReverseProxyRouter {
        &self.proxy
    }

    pub fn route_table(&self) -> Arc<RouteTable> {
        self.routes.load_full()
    }

    /// Service that owns `path`, if any
    pub fn resolve_route(&self, path: &str) -> Option<String> {
        self.routes.load().resolve(path).map(|r| r.service.clone())
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Register an instance on behalf of the management API.
    /// Unset weight means 1; unset id gets a generated one.
    pub fn register_instance(
        &self,
        service_name: &str,
        url: &str,
        weight: Option<i64>,
        id: Option<String>,
        health_check_path: Option<String>,
    ) -> Result<ServiceInstance> {
        validate_instance_url(url)?;

        let weight = match weight {
            None => 1,
            Some(w) if w < 0 => {
                return Err(GatewayError::ManagementRequestInvalid(
                    "weight cannot be negative".to_string(),
                ))
            }
            Some(w) => u32::try_from(w).unwrap_or(u32::MAX),
        };

        let id = id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("{}-{}", service_name, Uuid::new_v4()));

        let mut instance = ServiceInstance::new(id, service_name, url).with_weight(weight);
        if let Some(path) = health_check_path {
            instance = instance.with_health_check_path(path);
        }

        self.registry.register(instance)
    }

    fn seed_services(&self, config: &GatewayConfig) {
        for (name, decl) in &config.services {
            let instance = ServiceInstance::new(format!("{}-1", name), name.as_str(), decl.url.as_str())
                .with_weight(u32::try_from(decl.weight).unwrap_or(u32::MAX))
                .with_health_check_path(decl.health_check_path.as_str());

            if let Err(e) = self.registry.register(instance) {
                error!(service = %name, error = %e, "Failed to register declared service");
            }
        }
    }

    /// Start, stop or restart the health supervisor so it matches the
    /// `health_check` and `check_interval` settings of `config`
    fn sync_health_loop(&self, config: &GatewayConfig) {
        if self.shutdown.is_cancelled() {
            return;
        }

        let settings = &config.load_balancer;
        let mut health_loop = self.health_loop.lock();
        let wanted = settings.health_check.then_some(settings.check_interval);
        if health_loop.as_ref().map(|l| l.interval) == wanted {
            return;
        }

        if let Some(previous) = health_loop.take() {
            previous.stop.cancel();
            self.tasks.lock().push(previous.handle);
        }

        if let Some(interval) = wanted {
            let stop = self.registry.shutdown_token().child_token();
            let handle = self.registry.spawn_health_checks_until(interval, stop.clone());
            *health_loop = Some(HealthLoop {
                interval,
                stop,
                handle,
            });
        } else {
            info!("Health checking disabled");
        }
    }

    /// Whether the health supervisor is running, and at which interval
    pub fn health_check_interval(&self) -> Option<Duration> {
        self.health_loop.lock().as_ref().map(|l| l.interval)
    }

    fn apply_config(&self, config: &GatewayConfig) -> Result<()> {
        if self.load_balancer.strategy() != config.load_balancer.strategy {
            self.load_balancer.set_strategy(config.load_balancer.strategy);
        }
        self.sync_health_loop(config);

        self.routes.store(Arc::new(RouteTable::from_config(config)));
        self.seed_services(config);

        info!(services = config.services.len(), "Applied configuration change");

        let boot = &self.boot_config;
        if boot.host != config.host
            || boot.port != config.port
            || boot.rate_limit != config.rate_limit
            || boot.auth != config.auth
            || boot.cors != config.cors
            || boot.load_balancer.check_timeout != config.load_balancer.check_timeout
        {
            warn!(
                host = %config.host,
                port = config.port,
                rate_limit = config.rate_limit,
                check_timeout_ms = config.load_balancer.check_timeout.as_millis() as u64,
                "Listener address, rate limit, probe timeout and middleware changes take effect after a restart"
            );
        }
        Ok(())
    }

    /// HTTP router: management API, proxy fallback and middleware stack
    pub fn router(self: &Arc<Self>) -> Router {
        crate::api::routes::create_router(Arc::clone(self))
    }

    /// Serve on `listener` until SIGINT/SIGTERM or [`Gateway::shutdown`].
    /// In-flight requests get `shutdown_timeout` to finish.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let app = self.router();
        let token = self.shutdown.clone();

        let signal_token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_signal() => signal_token.cancel(),
                _ = signal_token.cancelled() => {}
            }
        });

        let graceful_token = token.clone();
        let server = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { graceful_token.cancelled().await });

        let mut server = tokio::spawn(async move { server.await });

        tokio::select! {
            result = &mut server => {
                self.shutdown().await;
                return match result {
                    Ok(served) => served.map_err(GatewayError::from),
                    Err(e) => Err(GatewayError::Internal(format!("server task failed: {}", e))),
                };
            }
            _ = token.cancelled() => {}
        }

        info!("Shutdown signal received, draining connections");
        self.shutdown().await;

        let drain = self.config.get().shutdown_timeout;
        match tokio::time::timeout(drain, &mut server).await {
            Ok(Ok(served)) => served.map_err(GatewayError::from)?,
            Ok(Err(e)) => return Err(GatewayError::Internal(format!("server task failed: {}", e))),
            Err(_) => {
                warn!(timeout_ms = drain.as_millis() as u64, "Graceful shutdown timed out, closing remaining connections");
                server.abort();
            }
        }

        info!("Gateway stopped");
        Ok(())
    }

    /// Stop background work and close watch subscriptions. Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.registry.close();

        if let Some(health_loop) = self.health_loop.lock().take() {
            self.tasks.lock().push(health_loop.handle);
        }
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!(error = %e, "Background task failed");
                }
            }
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

fn validate_instance_url(url: &str) -> Result<()> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| GatewayError::ManagementRequestInvalid(format!("invalid url {}: {}", url, e)))?;

    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(GatewayError::ManagementRequestInvalid(format!(
            "url must be an absolute http(s) URL: {}",
            url
        )));
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
