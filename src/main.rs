//! Main entry point for the Campus API Gateway

use campus_gateway::{config::LoggingConfig, ConfigStore, Gateway};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_CONFIG_PATH: &str = "config/gateway.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("GATEWAY_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let store = Arc::new(ConfigStore::load(&config_path)?);
    let config = store.get();

    init_logging(&config.logging);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Campus API Gateway");
    if !store.loaded_from_file() {
        warn!(path = %config_path, "Config file not found, running with built-in configuration");
    }
    info!(
        path = %config_path,
        host = %config.host,
        port = config.port,
        services = config.services.len(),
        strategy = %config.load_balancer.strategy,
        "Loaded configuration"
    );

    let gateway = Gateway::new(Arc::clone(&store))?;
    gateway.start();

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on {}", addr);

    gateway.serve(listener).await?;

    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(filter);
    if config.format.eq_ignore_ascii_case("json") {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}
