use super::route::CompiledRoute;
use crate::config::{CircuitBreakerConfig, RouteConfig};
use crate::upstream::CircuitBreakerRegistry;
use std::sync::Arc;

/// The route table, read-only after startup.
///
/// Routes are kept in precedence order: the longest literal prefix first,
/// an exact pattern before a prefix pattern of the same length, and
/// otherwise declaration order. Matching returns the first route whose
/// pattern accepts the path.
pub struct RouteTable {
    routes: Vec<Arc<CompiledRoute>>,
}

impl RouteTable {
    pub fn new(mut routes: Vec<CompiledRoute>) -> Self {
        // Stable: equal keys keep declaration order.
        routes.sort_by_key(|r| (std::cmp::Reverse(r.pattern.literal_len()), r.pattern.is_prefix()));
        tracing::info!("routing: compiled route table, count={}", routes.len());
        Self {
            routes: routes.into_iter().map(Arc::new).collect(),
        }
    }

    /// Compile every configured route, registering breakers as it goes.
    pub fn build(
        configs: &[RouteConfig],
        breaker_defaults: &CircuitBreakerConfig,
        breakers: &CircuitBreakerRegistry,
    ) -> anyhow::Result<Self> {
        let routes = configs
            .iter()
            .map(|cfg| CompiledRoute::compile(cfg, breaker_defaults, breakers))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self::new(routes))
    }

    /// `path` is the request path without its query string.
    pub fn match_route(&self, path: &str) -> Option<Arc<CompiledRoute>> {
        self.routes
            .iter()
            .find(|r| r.pattern.matches(path))
            .cloned()
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn all_routes(&self) -> &[Arc<CompiledRoute>] {
        &self.routes
    }
}
