//! Gateway settings, validation and defaults

use crate::error::{GatewayError, Result};
use crate::gateway::load_balancer::Strategy;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: i64,
    /// Upstream request timeout
    #[serde(default = "default_timeout", with = "duration")]
    pub timeout: Duration,
    /// Global requests per second; 0 disables limiting
    #[serde(default = "default_rate_limit")]
    pub rate_limit: i64,
    #[serde(default = "default_shutdown_timeout", with = "duration")]
    pub shutdown_timeout: Duration,
    #[serde(default = "default_reload_interval", with = "duration")]
    pub reload_interval: Duration,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceDeclaration>,
    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> i64 {
    8080
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_rate_limit() -> i64 {
    1000
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_reload_interval() -> Duration {
    Duration::from_secs(5)
}

/// Declarative seed for one backend service
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServiceDeclaration {
    pub url: String,
    #[serde(default, alias = "prefix")]
    pub path_prefix: String,
    #[serde(default = "default_weight")]
    pub weight: i64,
    #[serde(default = "default_health_check_path")]
    pub health_check_path: String,
}

fn default_weight() -> i64 {
    1
}

pub(crate) fn default_health_check_path() -> String {
    "/health".to_string()
}

impl ServiceDeclaration {
    pub fn new(url: impl Into<String>, path_prefix: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            path_prefix: path_prefix.into(),
            weight: default_weight(),
            health_check_path: default_health_check_path(),
        }
    }
}

/// Load balancer and health check configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LoadBalancerConfig {
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default = "default_true")]
    pub health_check: bool,
    #[serde(default = "default_check_interval", with = "duration")]
    pub check_interval: Duration,
    #[serde(default = "default_check_timeout", with = "duration")]
    pub check_timeout: Duration,
}

fn default_true() -> bool {
    true
}

fn default_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_check_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            health_check: true,
            check_interval: default_check_interval(),
            check_timeout: default_check_timeout(),
        }
    }
}

/// Bearer-token protection for route prefixes
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub protected_prefixes: Vec<String>,
    /// Accepted tokens. Empty means any well-formed bearer token passes.
    #[serde(default)]
    pub tokens: Vec<String>,
}

/// CORS configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CorsConfig {
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

fn default_allowed_origins() -> Vec<String> {
    vec![
        "http://localhost:3000".to_string(),
        "http://localhost:8080".to_string(),
        "http://127.0.0.1:3000".to_string(),
        "http://127.0.0.1:8080".to_string(),
    ]
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: default_allowed_origins(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// On-disk format of a configuration file, chosen by extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
    Toml,
}

impl ConfigFormat {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let ext = path
            .as_ref()
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        match ext.as_deref() {
            Some("yaml") | Some("yml") => Ok(Self::Yaml),
            Some("json") => Ok(Self::Json),
            Some("toml") => Ok(Self::Toml),
            other => Err(GatewayError::ConfigInvalid(format!(
                "unsupported config file format: {}",
                other.unwrap_or("<none>")
            ))),
        }
    }

    fn file_format(self) -> FileFormat {
        match self {
            Self::Yaml => FileFormat::Yaml,
            Self::Json => FileFormat::Json,
            Self::Toml => FileFormat::Toml,
        }
    }
}

impl GatewayConfig {
    /// Load, validate and default a configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let format = ConfigFormat::from_path(&path)?;
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content, format)
    }

    /// Parse configuration text, then apply environment overrides
    /// (prefixed with `GATEWAY__`), validate and fill defaults.
    pub fn parse(content: &str, format: ConfigFormat) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from_str(content, format.file_format()))
            .add_source(
                Environment::with_prefix("GATEWAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut settings: GatewayConfig = config.try_deserialize()?;
        settings.validate()?;
        settings.apply_defaults();
        Ok(settings)
    }

    /// Render the configuration in the given on-disk format
    pub fn render(&self, format: ConfigFormat) -> Result<String> {
        let text = match format {
            ConfigFormat::Yaml => serde_yaml::to_string(self)?,
            ConfigFormat::Json => serde_json::to_string_pretty(self)?,
            ConfigFormat::Toml => toml::to_string_pretty(self)?,
        };
        Ok(text)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !(1..=65535).contains(&self.port) {
            return Err(GatewayError::ConfigInvalid(format!(
                "invalid port: {}",
                self.port
            )));
        }

        if self.timeout.is_zero() {
            return Err(GatewayError::ConfigInvalid(
                "timeout must be positive".to_string(),
            ));
        }

        if self.rate_limit < 0 {
            return Err(GatewayError::ConfigInvalid(
                "rate limit cannot be negative".to_string(),
            ));
        }

        for (name, service) in &self.services {
            if name.trim().is_empty() {
                return Err(GatewayError::ConfigInvalid(
                    "service name cannot be empty".to_string(),
                ));
            }
            if service.url.trim().is_empty() {
                return Err(GatewayError::ConfigInvalid(format!(
                    "service {}: URL cannot be empty",
                    name
                )));
            }
            if service.weight < 0 {
                return Err(GatewayError::ConfigInvalid(format!(
                    "service {}: weight cannot be negative",
                    name
                )));
            }
            if !service.path_prefix.is_empty() && !service.path_prefix.starts_with('/') {
                return Err(GatewayError::ConfigInvalid(format!(
                    "service {}: path prefix must start with '/'",
                    name
                )));
            }
        }

        for prefix in &self.auth.protected_prefixes {
            if !prefix.starts_with('/') {
                return Err(GatewayError::ConfigInvalid(format!(
                    "protected prefix must start with '/': {}",
                    prefix
                )));
            }
        }

        Ok(())
    }

    /// Fill zero-valued fields that have a documented default
    pub fn apply_defaults(&mut self) {
        if self.host.is_empty() {
            self.host = default_host();
        }
        if self.load_balancer.check_interval.is_zero() {
            self.load_balancer.check_interval = default_check_interval();
        }
        if self.load_balancer.check_timeout.is_zero() {
            self.load_balancer.check_timeout = default_check_timeout();
        }
        if self.shutdown_timeout.is_zero() {
            self.shutdown_timeout = default_shutdown_timeout();
        }
        if self.reload_interval.is_zero() {
            self.reload_interval = default_reload_interval();
        }
        for service in self.services.values_mut() {
            if service.health_check_path.is_empty() {
                service.health_check_path = default_health_check_path();
            }
            if service.path_prefix.len() > 1 && service.path_prefix.ends_with('/') {
                service.path_prefix = service.path_prefix.trim_end_matches('/').to_string();
            }
        }
    }

    /// Address the listener binds to
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Configuration used when no file exists at the configured path
    pub fn builtin() -> Self {
        let mut services = BTreeMap::new();
        services.insert(
            "student-api".to_string(),
            ServiceDeclaration::new("http://localhost:8080", "/api/v1"),
        );

        Self {
            port: 8090,
            timeout: Duration::from_secs(15),
            rate_limit: 100,
            services,
            auth: AuthConfig {
                protected_prefixes: vec![
                    "/api/v1/students".to_string(),
                    "/api/v1/teachers".to_string(),
                    "/api/v1/grades".to_string(),
                ],
                tokens: vec![],
            },
            ..Self::default()
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout: default_timeout(),
            rate_limit: default_rate_limit(),
            shutdown_timeout: default_shutdown_timeout(),
            reload_interval: default_reload_interval(),
            services: BTreeMap::new(),
            load_balancer: LoadBalancerConfig::default(),
            auth: AuthConfig::default(),
            cors: CorsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Parse a duration such as `"500ms"`, `"10s"`, `"2m"` or `"1h"`.
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim().parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.trim().parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600))
    } else {
        s.parse().ok().map(Duration::from_secs)
    }
}

/// Inverse of [`parse_duration`], using the largest exact unit
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis % 1000 != 0 {
        return format!("{}ms", millis);
    }
    let secs = d.as_secs();
    if secs != 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs != 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

/// Serde codec for human-readable durations
pub mod duration {
    use super::{format_duration, parse_duration};
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        deserializer.deserialize_any(DurationVisitor)
    }

    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a duration like \"30s\" or a number of seconds")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
            parse_duration(v).ok_or_else(|| E::invalid_value(de::Unexpected::Str(v), &self))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
            u64::try_from(v)
                .map(Duration::from_secs)
                .map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Duration, E> {
            if v.is_finite() && v >= 0.0 {
                Ok(Duration::from_secs_f64(v))
            } else {
                Err(E::invalid_value(de::Unexpected::Float(v), &self))
            }
        }
    }
}
