//! Service registry: instance lifecycle, discovery and change subscriptions

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};
use crate::gateway::health_check::{HealthProber, ProbeOutcome};
use crate::gateway::instance::ServiceInstance;
use crate::gateway::load_balancer::LoadBalancer;

/// Inbox size of a watch subscription. Snapshots that do not fit are dropped.
pub const WATCH_BUFFER: usize = 10;

/// Receiving end of a [`ServiceRegistry::watch`] subscription
pub type Subscription = mpsc::Receiver<Vec<ServiceInstance>>;

struct Watcher {
    id: u64,
    tx: mpsc::Sender<Vec<ServiceInstance>>,
}

/// Registry of service instances.
///
/// Owns the instance records, mirrors membership and health into the
/// [`LoadBalancer`], and fans out instance-set snapshots to watchers.
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Vec<ServiceInstance>>>,
    watchers: DashMap<String, Vec<Watcher>>,
    next_watcher_id: AtomicU64,
    load_balancer: Arc<LoadBalancer>,
    prober: HealthProber,
    shutdown: CancellationToken,
}

impl ServiceRegistry {
    /// Create a registry whose probes time out after `check_timeout`.
    /// Cancelling `shutdown` stops the health loop and closes subscriptions.
    pub fn new(
        load_balancer: Arc<LoadBalancer>,
        check_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        Ok(Self {
            services: RwLock::new(HashMap::new()),
            watchers: DashMap::new(),
            next_watcher_id: AtomicU64::new(0),
            load_balancer,
            prober: HealthProber::new(check_timeout)?,
            shutdown,
        })
    }

    pub fn load_balancer(&self) -> &Arc<LoadBalancer> {
        &self.load_balancer
    }

    pub(crate) fn prober(&self) -> &HealthProber {
        &self.prober
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Register an instance, or update it in place when its id is already
    /// known in the service bucket.
    ///
    /// A re-registration keeps the health history when the URL is the same
    /// and starts over optimistically when the URL changed. Watchers are only
    /// notified when url, weight or health-check path actually changed.
    pub fn register(&self, mut instance: ServiceInstance) -> Result<ServiceInstance> {
        if instance.service_name.trim().is_empty() {
            return Err(GatewayError::ManagementRequestInvalid(
                "service name cannot be empty".to_string(),
            ));
        }
        if instance.id.trim().is_empty() {
            return Err(GatewayError::ManagementRequestInvalid(
                "instance id cannot be empty".to_string(),
            ));
        }
        if instance.url.trim().is_empty() {
            return Err(GatewayError::ManagementRequestInvalid(
                "instance URL cannot be empty".to_string(),
            ));
        }

        let service_name = instance.service_name.clone();
        let mut services = self.services.write();
        let bucket = services.entry(service_name.clone()).or_default();

        let changed = match bucket.iter_mut().find(|i| i.id == instance.id) {
            Some(existing) => {
                let changed = !existing.same_endpoint(&instance);
                if existing.url == instance.url {
                    instance.register_time = existing.register_time;
                    instance.healthy = existing.healthy;
                    instance.failure_count = existing.failure_count;
                    instance.last_check = existing.last_check;
                    instance.response_time = existing.response_time;
                } else {
                    instance.healthy = true;
                    instance.failure_count = 0;
                    instance.register_time = Utc::now();
                    instance.last_check = instance.register_time;
                }
                instance.connections = 0;
                *existing = instance.clone();
                changed
            }
            None => {
                let now = Utc::now();
                instance.register_time = now;
                instance.last_check = now;
                instance.healthy = true;
                instance.failure_count = 0;
                instance.connections = 0;
                bucket.push(instance.clone());
                info!(
                    service = %service_name,
                    instance = %instance.id,
                    url = %instance.url,
                    "Service instance registered"
                );
                true
            }
        };

        self.load_balancer
            .register_service(&service_name, instance.clone());

        if changed {
            let snapshot = bucket.clone();
            self.notify(&service_name, snapshot);
        }

        Ok(instance)
    }

    /// Remove an instance by id from whichever bucket holds it
    pub fn unregister(&self, instance_id: &str) -> Result<ServiceInstance> {
        let service_name = {
            let services = self.services.read();
            let mut names: Vec<&String> = services
                .iter()
                .filter(|(_, bucket)| bucket.iter().any(|i| i.id == instance_id))
                .map(|(name, _)| name)
                .collect();
            names.sort();
            names.first().map(|n| n.to_string())
        };

        match service_name {
            Some(name) => self.unregister_from(&name, instance_id),
            None => Err(GatewayError::InstanceNotFound(instance_id.to_string())),
        }
    }

    /// Remove one instance from a named service
    pub fn unregister_from(&self, service_name: &str, instance_id: &str) -> Result<ServiceInstance> {
        let mut services = self.services.write();
        let bucket = services
            .get_mut(service_name)
            .ok_or_else(|| GatewayError::ServiceNotFound(service_name.to_string()))?;

        let position = bucket
            .iter()
            .position(|i| i.id == instance_id)
            .ok_or_else(|| GatewayError::InstanceNotFound(instance_id.to_string()))?;

        let removed = bucket.remove(position);
        let snapshot = bucket.clone();
        if bucket.is_empty() {
            services.remove(service_name);
        }

        self.load_balancer.unregister_service(service_name, instance_id);
        self.notify(service_name, snapshot);

        info!(
            service = %service_name,
            instance = %instance_id,
            "Service instance unregistered"
        );
        Ok(removed)
    }

    /// Remove every instance of a service
    pub fn unregister_service(&self, service_name: &str) -> Result<Vec<ServiceInstance>> {
        let mut services = self.services.write();
        let removed = services
            .remove(service_name)
            .ok_or_else(|| GatewayError::ServiceNotFound(service_name.to_string()))?;

        for instance in &removed {
            self.load_balancer
                .unregister_service(service_name, &instance.id);
        }
        self.notify(service_name, Vec::new());

        info!(
            service = %service_name,
            instances = removed.len(),
            "Service unregistered"
        );
        Ok(removed)
    }

    /// Currently healthy instances of a service
    pub fn discover(&self, service_name: &str) -> Result<Vec<ServiceInstance>> {
        let services = self.services.read();
        let bucket = services
            .get(service_name)
            .ok_or_else(|| GatewayError::ServiceNotFound(service_name.to_string()))?;

        let healthy: Vec<ServiceInstance> = bucket.iter().filter(|i| i.healthy).cloned().collect();
        if healthy.is_empty() {
            return Err(GatewayError::NoHealthyInstances(service_name.to_string()));
        }
        Ok(healthy)
    }

    /// Every tracked instance, healthy or not, grouped by service
    pub fn all_services(&self) -> BTreeMap<String, Vec<ServiceInstance>> {
        self.services
            .read()
            .iter()
            .map(|(name, bucket)| (name.clone(), bucket.clone()))
            .collect()
    }

    /// Snapshot of a single instance
    pub fn instance(&self, service_name: &str, instance_id: &str) -> Option<ServiceInstance> {
        self.services
            .read()
            .get(service_name)
            .and_then(|b| b.iter().find(|i| i.id == instance_id).cloned())
    }

    pub fn summary(&self) -> RegistrySummary {
        let services = self.services.read();
        let total_instances: usize = services.values().map(Vec::len).sum();
        let healthy_instances = services
            .values()
            .flat_map(|b| b.iter())
            .filter(|i| i.healthy)
            .count();

        RegistrySummary {
            total_services: services.len(),
            total_instances,
            healthy_instances,
            unhealthy_instances: total_instances - healthy_instances,
        }
    }

    /// Subscribe to instance-set snapshots of one service.
    ///
    /// The current snapshot is delivered immediately. Later snapshots arrive
    /// on membership or health changes; a full inbox drops them. The channel
    /// closes when `cancel` fires or the registry shuts down, and dropping the
    /// receiver ends the subscription too.
    pub fn watch(self: &Arc<Self>, service_name: &str, cancel: CancellationToken) -> Subscription {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let receiver_gone = tx.clone();
        let id = self.next_watcher_id.fetch_add(1, Ordering::Relaxed);

        {
            // Holding the read lock orders this subscription against writers
            let services = self.services.read();
            let current = services.get(service_name).cloned().unwrap_or_default();
            let _ = tx.try_send(current);
            self.watchers
                .entry(service_name.to_string())
                .or_default()
                .push(Watcher { id, tx });
        }

        debug!(service = %service_name, watcher = id, "Watcher subscribed");

        let registry: Weak<Self> = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let service_name = service_name.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = shutdown.cancelled() => {}
                _ = receiver_gone.closed() => {}
            }
            drop(receiver_gone);
            if let Some(registry) = registry.upgrade() {
                registry.remove_watcher(&service_name, id);
            }
        });

        rx
    }

    /// Number of live subscriptions for a service
    pub fn watcher_count(&self, service_name: &str) -> usize {
        self.watchers
            .get(service_name)
            .map(|w| w.len())
            .unwrap_or(0)
    }

    fn remove_watcher(&self, service_name: &str, id: u64) {
        let now_empty = match self.watchers.get_mut(service_name) {
            Some(mut list) => {
                list.retain(|w| w.id != id);
                list.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.watchers.remove_if(service_name, |_, list| list.is_empty());
        }
        debug!(service = %service_name, watcher = id, "Watcher removed");
    }

    fn notify(&self, service_name: &str, snapshot: Vec<ServiceInstance>) {
        let Some(mut list) = self.watchers.get_mut(service_name) else {
            return;
        };

        list.retain(|watcher| match watcher.tx.try_send(snapshot.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(
                    service = %service_name,
                    watcher = watcher.id,
                    "Watcher inbox full, snapshot dropped"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Fold one probe result into the record `probed` was taken from.
    /// Returns `Some(true)` when the health flag flipped, `None` when the
    /// instance is gone or now points at a different health URL.
    pub(crate) fn record_probe(
        &self,
        probed: &ServiceInstance,
        outcome: &ProbeOutcome,
    ) -> Option<bool> {
        let service_name = probed.service_name.as_str();
        let instance_id = probed.id.as_str();

        let mut services = self.services.write();
        let bucket = services.get_mut(service_name)?;
        let instance = bucket.iter_mut().find(|i| i.id == instance_id)?;
        if instance.health_url() != probed.health_url() {
            debug!(
                service = %service_name,
                instance = %instance_id,
                probed = %probed.health_url(),
                "Discarding probe of a replaced endpoint"
            );
            return None;
        }

        let was_healthy = instance.healthy;
        instance.last_check = Utc::now();
        instance.response_time = outcome.response_time;

        match &outcome.error {
            None => {
                instance.healthy = true;
                instance.failure_count = 0;
            }
            Some(_) => {
                instance.healthy = false;
                instance.failure_count += 1;
            }
        }

        let healthy = instance.healthy;
        let failure_count = instance.failure_count;

        self.load_balancer
            .update_health(service_name, instance_id, healthy, outcome.response_time);

        let transitioned = was_healthy != healthy;
        if transitioned {
            if healthy {
                info!(
                    service = %service_name,
                    instance = %instance_id,
                    "Instance marked healthy"
                );
            } else {
                warn!(
                    service = %service_name,
                    instance = %instance_id,
                    failures = failure_count,
                    error = outcome.error.as_deref().unwrap_or_default(),
                    "Instance marked unhealthy"
                );
            }
            let snapshot = bucket.clone();
            self.notify(service_name, snapshot);
        }

        Some(transitioned)
    }

    /// Stop background work and close every subscription
    pub fn close(&self) {
        self.shutdown.cancel();
        self.watchers.clear();
        info!("Service registry closed");
    }
}

/// Registry-wide instance counts
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySummary {
    pub total_services: usize,
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub unhealthy_instances: usize,
}
