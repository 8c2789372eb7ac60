use crate::config::{DiscoveryKind, GatewayConfig};
use crate::discovery::{ConsulClient, ConsulRegistry, ServiceRegistry, StaticRegistry};
use crate::metrics::Metrics;
use crate::proxy::filter::headers::GatewayMarkers;
use crate::proxy::filter::{build_global_filters, GlobalFilter};
use crate::proxy::{FallbackDispatcher, LocalEndpoints};
use crate::routing::RouteTable;
use crate::upstream::{build_http_client, AddressResolver, CircuitBreakerRegistry, HttpClient};
use anyhow::Result;
use std::sync::Arc;
use tracing::info;

/// Shared gateway state, cheaply cloneable.
///
/// Built once at startup. The route table, filter chains and fallback
/// entries are read-only afterwards; breaker and rate-limit state live
/// behind their own per-key locks.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub metrics: Metrics,
    pub routes: Arc<RouteTable>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub resolver: Arc<AddressResolver>,
    pub fallback: Arc<FallbackDispatcher>,
    pub local: Arc<LocalEndpoints>,
    pub filters: Arc<Vec<GlobalFilter>>,
    pub markers: Arc<GatewayMarkers>,
    pub client: HttpClient,
    /// Set when discovery is Consul; the bootstrap drives its poll loop.
    pub consul: Option<Arc<ConsulRegistry>>,
}

impl GatewayState {
    /// Must run inside the tokio runtime.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let metrics = Metrics::install();

        let consul = match config.discovery.kind {
            DiscoveryKind::Consul => {
                let client = ConsulClient::from_config(&config.discovery.consul)?;
                info!("discovery: consul registry, addr={}", client.base_url());
                Some(Arc::new(ConsulRegistry::new(client)))
            }
            DiscoveryKind::Static => None,
        };
        let registry: Arc<dyn ServiceRegistry> = match consul {
            Some(ref registry) => registry.clone(),
            None => {
                info!(
                    "discovery: static registry, services={}",
                    config.discovery.services.len()
                );
                Arc::new(StaticRegistry::new(&config.discovery.services))
            }
        };

        let breakers = Arc::new(CircuitBreakerRegistry::new());
        let routes = RouteTable::build(&config.routes, &config.circuit_breaker, &breakers)?;
        metrics::gauge!("gateway_config_routes_total").set(routes.route_count() as f64);

        let fallback = Arc::new(FallbackDispatcher::new(&config)?);
        let local = LocalEndpoints::new(Arc::clone(&fallback), Arc::clone(&registry));
        let markers = GatewayMarkers::from_config(&config.marker)?;
        let filters = build_global_filters(&config);
        let client = build_http_client(&config.upstream);

        info!(
            "server: state ready, routes={}, breakers={}, global_filters={:?}",
            routes.route_count(),
            breakers.len(),
            filters
        );

        Ok(Self {
            config: Arc::new(config),
            metrics,
            routes: Arc::new(routes),
            breakers,
            resolver: Arc::new(AddressResolver::new(registry)),
            fallback,
            local: Arc::new(local),
            filters: Arc::new(filters),
            markers: Arc::new(markers),
            client,
            consul,
        })
    }
}
