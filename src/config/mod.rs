//! Configuration module

pub mod settings;
pub mod store;

pub use settings::{
    format_duration, parse_duration, AuthConfig, ConfigFormat, CorsConfig, GatewayConfig,
    LoadBalancerConfig, LoggingConfig, ServiceDeclaration,
};
pub use store::{ConfigStore, ConfigWatcher};
