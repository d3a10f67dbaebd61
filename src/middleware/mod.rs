//! HTTP middleware

pub mod auth;
pub mod cors;
pub mod rate_limit;
pub mod security;

pub use auth::{AuthLayer, StaticTokens, TokenValidator};
pub use cors::{cors, CorsPolicy};
pub use rate_limit::RateLimitLayer;
pub use security::security_headers;
