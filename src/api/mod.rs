//! HTTP API: management endpoints and the proxy entry point

pub mod handlers;
pub mod routes;

pub use routes::{create_router, with_middleware};
