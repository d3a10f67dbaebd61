//! Path-prefix resolution of proxied requests

use crate::config::GatewayConfig;

/// A declared `path_prefix -> service` mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRoute {
    pub prefix: String,
    pub service: String,
}

/// Proxy routes ordered so the longest prefix is tried first
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<ProxyRoute>,
}

impl RouteTable {
    pub fn from_config(config: &GatewayConfig) -> Self {
        let mut routes: Vec<ProxyRoute> = config
            .services
            .iter()
            .filter(|(_, decl)| !decl.path_prefix.is_empty())
            .map(|(name, decl)| ProxyRoute {
                prefix: decl.path_prefix.clone(),
                service: name.clone(),
            })
            .collect();

        routes.sort_by(|a, b| {
            b.prefix
                .len()
                .cmp(&a.prefix.len())
                .then_with(|| a.prefix.cmp(&b.prefix))
        });

        Self { routes }
    }

    /// Service owning `path`, if any
    pub fn resolve(&self, path: &str) -> Option<&ProxyRoute> {
        self.routes.iter().find(|r| prefix_matches(&r.prefix, path))
    }

    pub fn routes(&self) -> &[ProxyRoute] {
        &self.routes
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Segment-aware prefix test: `/api/v1` covers `/api/v1` and `/api/v1/x`
/// but not `/api/v1x`.
pub fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
