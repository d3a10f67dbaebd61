//! Campus API Gateway
//!
//! A reverse-proxy gateway in front of the campus backend services: service
//! registry with active health checks, pluggable load balancing, hot-reloaded
//! configuration and a small management API.

pub mod api;
pub mod config;
pub mod error;
pub mod gateway;
pub mod middleware;

pub use config::{ConfigStore, GatewayConfig, ServiceDeclaration};
pub use error::{GatewayError, Result};
pub use gateway::{
    instance::ServiceInstance,
    load_balancer::{LoadBalancer, Strategy},
    proxy::ReverseProxyRouter,
    registry::ServiceRegistry,
    Gateway,
};
