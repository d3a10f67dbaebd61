//! Backend service instance record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::settings::default_health_check_path;

/// One reachable backend address implementing a named service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Unique within its service bucket
    pub id: String,
    pub service_name: String,
    /// Base URL of the backend
    pub url: String,
    /// Only consulted by the weighted strategy
    pub weight: u32,
    pub healthy: bool,
    /// In-flight proxied requests
    pub connections: usize,
    pub last_check: DateTime<Utc>,
    /// Duration of the most recent probe
    #[serde(rename = "response_time_ms", with = "millis")]
    pub response_time: Duration,
    pub register_time: DateTime<Utc>,
    /// Consecutive probe failures since the last success
    pub failure_count: u32,
    pub health_check_path: String,
}

impl ServiceInstance {
    /// Create a new instance. Instances start healthy until a probe says otherwise.
    pub fn new(
        id: impl Into<String>,
        service_name: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            service_name: service_name.into(),
            url: url.into(),
            weight: 1,
            healthy: true,
            connections: 0,
            last_check: now,
            response_time: Duration::ZERO,
            register_time: now,
            failure_count: 0,
            health_check_path: default_health_check_path(),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_health_check_path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        if !path.is_empty() {
            self.health_check_path = path;
        }
        self
    }

    /// URL probed by the health checker
    pub fn health_url(&self) -> String {
        let base = self.url.trim_end_matches('/');
        if self.health_check_path.starts_with('/') {
            format!("{}{}", base, self.health_check_path)
        } else {
            format!("{}/{}", base, self.health_check_path)
        }
    }

    /// Whether two records describe the same endpoint configuration
    pub(crate) fn same_endpoint(&self, other: &ServiceInstance) -> bool {
        self.url == other.url
            && self.weight == other.weight
            && self.health_check_path == other.health_check_path
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
