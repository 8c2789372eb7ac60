use super::pattern::PathPattern;
use crate::config::{CircuitBreakerConfig, RouteConfig};
use crate::proxy::filter::{build_route_filters, RouteFilter};
use crate::upstream::{CircuitBreakerRegistry, RetryPolicy, RouteBreaker};
use http::uri::{Authority, Scheme};
use std::sync::Arc;

/// Where a matched request is sent.
#[derive(Debug, Clone)]
pub enum RouteTarget {
    /// Resolved through the service registry on each attempt.
    Service(String),
    /// Fixed address, no registry lookup and no resilience filters.
    Direct { scheme: Scheme, authority: Authority },
}

impl RouteTarget {
    pub fn parse(uri: &str) -> anyhow::Result<Self> {
        if let Some(service) = uri.strip_prefix("lb://") {
            let service = service.trim_end_matches('/');
            if service.is_empty() {
                anyhow::bail!("service uri '{uri}' names no service");
            }
            return Ok(RouteTarget::Service(service.to_string()));
        }
        let parsed: http::Uri = uri
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid uri '{uri}': {e}"))?;
        match (parsed.scheme(), parsed.authority()) {
            (Some(scheme), Some(authority))
                if *scheme == Scheme::HTTP || *scheme == Scheme::HTTPS =>
            {
                Ok(RouteTarget::Direct {
                    scheme: scheme.clone(),
                    authority: authority.clone(),
                })
            }
            _ => anyhow::bail!("uri '{uri}' must be lb://<service> or http(s)://host:port"),
        }
    }
}

impl std::fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteTarget::Service(name) => write!(f, "lb://{}", name),
            RouteTarget::Direct { scheme, authority } => write!(f, "{}://{}", scheme, authority),
        }
    }
}

/// A compiled route, the runtime domain object.
///
/// Contains only the fields needed at request time. The original
/// `RouteConfig` DTO is consumed during compilation and not retained.
#[derive(Debug)]
pub struct CompiledRoute {
    pub id: String,
    pub path: String,
    pub pattern: PathPattern,
    pub target: RouteTarget,
    pub strip_prefix: usize,
    /// Overrides `upstream.max_body_bytes` for this route.
    pub max_body_bytes: Option<u64>,
    pub filters: Vec<RouteFilter>,
    pub retry: Option<RetryPolicy>,
    pub breaker: Option<Arc<RouteBreaker>>,
}

impl CompiledRoute {
    pub fn compile(
        cfg: &RouteConfig,
        breaker_defaults: &CircuitBreakerConfig,
        breakers: &CircuitBreakerRegistry,
    ) -> anyhow::Result<Self> {
        let target = RouteTarget::parse(&cfg.uri)
            .map_err(|e| anyhow::anyhow!("route '{}': {e}", cfg.id))?;
        let filters = build_route_filters(cfg, breaker_defaults, breakers)
            .map_err(|e| anyhow::anyhow!("route '{}': {e}", cfg.id))?;

        let retry = filters.iter().find_map(|f| match f {
            RouteFilter::Retry(p) => Some(p.clone()),
            _ => None,
        });
        let breaker = filters.iter().find_map(|f| match f {
            RouteFilter::CircuitBreaker(b) => Some(Arc::clone(b)),
            _ => None,
        });

        tracing::debug!(
            "routing: compiled route entry, id={}, path={}, target={}, filters={}",
            cfg.id,
            cfg.path,
            target,
            filters.len(),
        );

        Ok(Self {
            id: cfg.id.clone(),
            path: cfg.path.clone(),
            pattern: PathPattern::parse(&cfg.path),
            target,
            strip_prefix: cfg.strip_prefix,
            max_body_bytes: cfg.max_body_bytes,
            filters,
            retry,
            breaker,
        })
    }

    /// Path and query forwarded to the backend after dropping
    /// `strip_prefix` leading segments.
    pub fn forward_path(&self, path_and_query: &str) -> String {
        if self.strip_prefix == 0 {
            return path_and_query.to_string();
        }
        let (path, query) = match path_and_query.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (path_and_query, None),
        };
        let rest: Vec<&str> = path
            .trim_start_matches('/')
            .split('/')
            .skip(self.strip_prefix)
            .collect();
        let mut out = String::with_capacity(path_and_query.len());
        out.push('/');
        out.push_str(&rest.join("/"));
        if let Some(q) = query {
            out.push('?');
            out.push_str(q);
        }
        out
    }

    pub fn filter_names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|f| f.name()).collect()
    }
}
