//! Active health probing of registered instances

use futures::future::join_all;
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{GatewayError, Result};
use crate::gateway::instance::ServiceInstance;
use crate::gateway::registry::ServiceRegistry;

/// Result of probing one instance
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub response_time: Duration,
    /// `None` when the probe succeeded
    pub error: Option<String>,
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        self.error.is_none()
    }
}

/// Issues `GET {url}{health_check_path}` and requires a 200 answer
pub struct HealthProber {
    client: Client,
    timeout: Duration,
}

impl HealthProber {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Internal(format!("Failed to create health check client: {}", e)))?;

        Ok(Self { client, timeout })
    }

    pub async fn probe(&self, instance: &ServiceInstance) -> ProbeOutcome {
        let url = instance.health_url();
        let start = Instant::now();

        let result = tokio::time::timeout(self.timeout, self.client.get(&url).send()).await;
        let response_time = start.elapsed();

        let error = match result {
            Ok(Ok(response)) if response.status() == StatusCode::OK => None,
            Ok(Ok(response)) => Some(format!("unexpected status {}", response.status().as_u16())),
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("timed out after {:?}", self.timeout)),
        };

        debug!(
            service = %instance.service_name,
            instance = %instance.id,
            url = %url,
            healthy = error.is_none(),
            response_time_ms = response_time.as_millis() as u64,
            "Health check completed"
        );

        ProbeOutcome {
            response_time,
            error,
        }
    }
}

impl ServiceRegistry {
    /// Probe a single instance without touching its record
    pub async fn health_check(&self, instance: &ServiceInstance) -> Result<Duration> {
        let outcome = self.prober().probe(instance).await;
        match outcome.error {
            None => Ok(outcome.response_time),
            Some(error) => Err(GatewayError::HealthCheckFailed(format!(
                "{} ({}): {}",
                instance.id,
                instance.health_url(),
                error
            ))),
        }
    }

    /// Probe every tracked instance concurrently and fold the results in.
    /// Completes once all probes finished.
    pub async fn check_all(self: &Arc<Self>) {
        let handles = self.spawn_probes();
        join_all(handles).await;
    }

    fn spawn_probes(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        self.all_services()
            .into_values()
            .flatten()
            .map(|instance| {
                let registry = Arc::clone(self);
                tokio::spawn(async move {
                    let outcome = registry.prober().probe(&instance).await;
                    registry.record_probe(&instance, &outcome);
                })
            })
            .collect()
    }

    /// Start the periodic health loop. Each tick launches one probe per
    /// instance without waiting for the previous round. Stops on registry
    /// shutdown.
    pub fn spawn_health_checks(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        self.spawn_health_checks_until(interval, self.shutdown_token().child_token())
    }

    /// Like [`spawn_health_checks`](Self::spawn_health_checks), also stopping
    /// when `stop` is cancelled.
    pub fn spawn_health_checks_until(
        self: &Arc<Self>,
        interval: Duration,
        stop: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let shutdown = stop;

        info!(interval_ms = interval.as_millis() as u64, "Started health check background task");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.spawn_probes();
                    }
                }
            }

            info!("Stopped health check background task");
        })
    }
}
