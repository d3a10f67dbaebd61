//! Load balancer implementation with multiple strategies

use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::{GatewayError, Result};
use crate::gateway::instance::ServiceInstance;

/// Load balancing strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Strategy {
    /// Per-service cursor over healthy instances
    #[default]
    #[serde(rename = "round_robin", alias = "round-robin")]
    RoundRobin,
    /// Uniform random pick
    #[serde(rename = "random")]
    Random,
    /// Cumulative-weight random pick
    #[serde(rename = "weighted")]
    Weighted,
    /// Fewest in-flight connections, first one wins ties
    #[serde(rename = "least_conn", alias = "least-connections", alias = "least_connections")]
    LeastConnections,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::Random => "random",
            Strategy::Weighted => "weighted",
            Strategy::LeastConnections => "least_conn",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "round_robin" | "round-robin" => Ok(Strategy::RoundRobin),
            "random" => Ok(Strategy::Random),
            "weighted" => Ok(Strategy::Weighted),
            "least_conn" | "least-connections" | "least_connections" => {
                Ok(Strategy::LeastConnections)
            }
            other => Err(GatewayError::ConfigInvalid(format!(
                "unknown load balancing strategy: {}",
                other
            ))),
        }
    }
}

/// Instances registered under one service name
#[derive(Default)]
struct Bucket {
    instances: Vec<ServiceInstance>,
    cursor: usize,
    /// Registration generation per instance id. A re-added id gets a new one.
    leases: HashMap<String, u64>,
}

/// Load balancer for distributing requests across service instances
pub struct LoadBalancer {
    strategy: RwLock<Strategy>,
    buckets: RwLock<HashMap<String, Bucket>>,
    next_lease: AtomicU64,
}

impl LoadBalancer {
    /// Create a new load balancer
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy: RwLock::new(strategy),
            buckets: RwLock::new(HashMap::new()),
            next_lease: AtomicU64::new(1),
        }
    }

    /// Set the load balancing strategy
    pub fn set_strategy(&self, strategy: Strategy) {
        *self.strategy.write() = strategy;
    }

    /// Get the current load balancing strategy
    pub fn strategy(&self) -> Strategy {
        *self.strategy.read()
    }

    /// Add an instance to a service bucket. An existing id is updated in
    /// place and keeps its connection count.
    pub fn register_service(&self, service_name: &str, mut instance: ServiceInstance) {
        instance.service_name = service_name.to_string();

        let mut buckets = self.buckets.write();
        let bucket = buckets.entry(service_name.to_string()).or_default();

        match bucket.instances.iter_mut().find(|i| i.id == instance.id) {
            Some(existing) => {
                instance.connections = existing.connections;
                *existing = instance;
            }
            None => {
                let lease = self.next_lease.fetch_add(1, Ordering::Relaxed);
                bucket.leases.insert(instance.id.clone(), lease);
                bucket.instances.push(instance);
            }
        }
    }

    /// Remove an instance. Returns whether anything was removed.
    pub fn unregister_service(&self, service_name: &str, instance_id: &str) -> bool {
        let mut buckets = self.buckets.write();
        let Some(bucket) = buckets.get_mut(service_name) else {
            return false;
        };

        let before = bucket.instances.len();
        bucket.instances.retain(|i| i.id != instance_id);
        bucket.leases.remove(instance_id);
        let removed = bucket.instances.len() != before;

        if bucket.instances.is_empty() {
            buckets.remove(service_name);
        }
        removed
    }

    /// Pick a healthy instance and count a new connection on it
    pub fn select(&self, service_name: &str) -> Result<ServiceInstance> {
        self.select_leased(service_name).map(|(instance, _)| instance)
    }

    fn select_leased(&self, service_name: &str) -> Result<(ServiceInstance, u64)> {
        let strategy = self.strategy();

        let mut buckets = self.buckets.write();
        let bucket = match buckets.get_mut(service_name) {
            Some(bucket) if !bucket.instances.is_empty() => bucket,
            _ => return Err(GatewayError::NoInstances(service_name.to_string())),
        };

        let healthy: Vec<usize> = bucket
            .instances
            .iter()
            .enumerate()
            .filter(|(_, i)| i.healthy)
            .map(|(idx, _)| idx)
            .collect();

        if healthy.is_empty() {
            return Err(GatewayError::NoHealthyInstances(service_name.to_string()));
        }

        let chosen = match strategy {
            Strategy::RoundRobin => {
                let idx = healthy[bucket.cursor % healthy.len()];
                bucket.cursor = bucket.cursor.wrapping_add(1);
                idx
            }
            Strategy::Random => select_random(&healthy),
            Strategy::Weighted => select_weighted(&bucket.instances, &healthy),
            Strategy::LeastConnections => select_least_connections(&bucket.instances, &healthy),
        };

        let instance = &mut bucket.instances[chosen];
        instance.connections += 1;
        let lease = bucket.leases.get(&instance.id).copied().unwrap_or_default();

        debug!(
            service = %service_name,
            instance = %instance.id,
            strategy = %strategy,
            connections = instance.connections,
            "Selected instance for request"
        );

        Ok((instance.clone(), lease))
    }

    /// Select an instance and hold its connection until the guard drops
    pub fn acquire(self: &Arc<Self>, service_name: &str) -> Result<ConnectionGuard> {
        let (instance, lease) = self.select_leased(service_name)?;
        Ok(ConnectionGuard {
            load_balancer: Arc::clone(self),
            instance,
            lease,
        })
    }

    /// Give back a connection taken by [`select`](Self::select)
    pub fn release(&self, instance: &ServiceInstance) {
        let mut buckets = self.buckets.write();
        if let Some(current) = buckets
            .get_mut(&instance.service_name)
            .and_then(|b| b.instances.iter_mut().find(|i| i.id == instance.id))
        {
            current.connections = current.connections.saturating_sub(1);
        }
    }

    /// Release only if the instance was not removed and re-added meanwhile
    fn release_lease(&self, instance: &ServiceInstance, lease: u64) {
        let mut buckets = self.buckets.write();
        let Some(bucket) = buckets.get_mut(&instance.service_name) else {
            return;
        };
        if bucket.leases.get(&instance.id) != Some(&lease) {
            return;
        }
        if let Some(current) = bucket.instances.iter_mut().find(|i| i.id == instance.id) {
            current.connections = current.connections.saturating_sub(1);
        }
    }

    /// Record a probe outcome. Returns false when the instance is unknown.
    pub fn update_health(
        &self,
        service_name: &str,
        instance_id: &str,
        healthy: bool,
        response_time: Duration,
    ) -> bool {
        let mut buckets = self.buckets.write();
        let Some(instance) = buckets
            .get_mut(service_name)
            .and_then(|b| b.instances.iter_mut().find(|i| i.id == instance_id))
        else {
            return false;
        };

        instance.healthy = healthy;
        instance.last_check = chrono::Utc::now();
        instance.response_time = response_time;
        true
    }

    /// Snapshot of every instance in a bucket
    pub fn instances(&self, service_name: &str) -> Vec<ServiceInstance> {
        self.buckets
            .read()
            .get(service_name)
            .map(|b| b.instances.clone())
            .unwrap_or_default()
    }

    /// Names of all services with at least one instance
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.buckets.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Per-service instance and connection counts
    pub fn stats(&self) -> LoadBalancerStats {
        let buckets = self.buckets.read();
        let services = buckets
            .iter()
            .map(|(name, bucket)| {
                let instances: Vec<InstanceStats> = bucket
                    .instances
                    .iter()
                    .map(|i| InstanceStats {
                        id: i.id.clone(),
                        url: i.url.clone(),
                        healthy: i.healthy,
                        weight: i.weight,
                        connections: i.connections,
                        response_time_ms: i.response_time.as_millis() as u64,
                    })
                    .collect();

                let stats = ServiceStats {
                    total_instances: instances.len(),
                    healthy_instances: instances.iter().filter(|i| i.healthy).count(),
                    total_connections: instances.iter().map(|i| i.connections).sum(),
                    instances,
                };
                (name.clone(), stats)
            })
            .collect();

        LoadBalancerStats {
            strategy: self.strategy(),
            services,
        }
    }
}

fn select_random(healthy: &[usize]) -> usize {
    healthy[rand::thread_rng().gen_range(0..healthy.len())]
}

/// Cumulative-weight draw; a zero total degrades to a uniform pick
fn select_weighted(instances: &[ServiceInstance], healthy: &[usize]) -> usize {
    let total: u64 = healthy.iter().map(|&i| instances[i].weight as u64).sum();
    if total == 0 {
        return select_random(healthy);
    }

    let draw = rand::thread_rng().gen_range(0..total);
    let mut cumulative = 0u64;
    for &idx in healthy {
        cumulative += instances[idx].weight as u64;
        if draw < cumulative {
            return idx;
        }
    }

    healthy[healthy.len() - 1]
}

fn select_least_connections(instances: &[ServiceInstance], healthy: &[usize]) -> usize {
    // min_by_key keeps the first of equal minimums
    healthy
        .iter()
        .copied()
        .min_by_key(|&idx| instances[idx].connections)
        .unwrap_or(healthy[0])
}

/// Holds one counted connection on an instance; releases it on drop
pub struct ConnectionGuard {
    load_balancer: Arc<LoadBalancer>,
    instance: ServiceInstance,
    lease: u64,
}

impl ConnectionGuard {
    pub fn instance(&self) -> &ServiceInstance {
        &self.instance
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.load_balancer.release_lease(&self.instance, self.lease);
    }
}

/// Load balancer statistics
#[derive(Debug, Clone, Serialize)]
pub struct LoadBalancerStats {
    pub strategy: Strategy,
    pub services: BTreeMap<String, ServiceStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub total_connections: usize,
    pub instances: Vec<InstanceStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceStats {
    pub id: String,
    pub url: String,
    pub healthy: bool,
    pub weight: u32,
    pub connections: usize,
    pub response_time_ms: u64,
}
