use super::client::ConsulClient;
use super::{ServiceInstance, ServiceRegistry};
use crate::config::StaticServiceConfig;
use crate::error::GatewayError;
use arc_swap::ArcSwap;
use std::collections::BTreeMap;
use std::sync::Arc;

type Membership = BTreeMap<String, Vec<ServiceInstance>>;

/// Fixed membership read from the config file.
pub struct StaticRegistry {
    services: Membership,
}

impl StaticRegistry {
    pub fn new(entries: &[StaticServiceConfig]) -> Self {
        let mut services = Membership::new();
        for entry in entries {
            let instances = services.entry(entry.name.clone()).or_default();
            for addr in &entry.addresses {
                match ServiceInstance::parse(addr) {
                    Some(inst) => instances.push(inst),
                    None => tracing::warn!(
                        "discovery: static: skipping invalid address, service={}, addr={}",
                        entry.name,
                        addr
                    ),
                }
            }
        }
        Self { services }
    }
}

impl ServiceRegistry for StaticRegistry {
    fn resolve(&self, service: &str) -> Vec<ServiceInstance> {
        self.services.get(service).cloned().unwrap_or_default()
    }

    fn services(&self) -> Membership {
        self.services.clone()
    }
}

/// Consul-backed membership, refreshed by polling.
///
/// Readers see an immutable snapshot swapped in whole after each poll, so
/// lookups never wait on the network.
pub struct ConsulRegistry {
    client: ConsulClient,
    snapshot: ArcSwap<Membership>,
}

impl ConsulRegistry {
    pub fn new(client: ConsulClient) -> Self {
        Self {
            client,
            snapshot: ArcSwap::from_pointee(Membership::new()),
        }
    }

    /// Poll the catalog and every service's passing instances, then publish
    /// the result. A service whose health query fails keeps its previous
    /// instances; a failed catalog query leaves the snapshot untouched.
    /// Returns the number of services in the published snapshot.
    pub async fn refresh(&self) -> Result<usize, GatewayError> {
        let names = match self.client.list_services().await {
            Ok(names) => names,
            Err(e) => {
                metrics::counter!("gateway_discovery_poll_total", "service" => "catalog", "result" => "error")
                    .increment(1);
                return Err(e);
            }
        };

        let queries = names.iter().map(|name| async move {
            (name, self.client.query_healthy_services(name).await)
        });
        let results = futures_util::future::join_all(queries).await;

        let previous = self.snapshot.load();
        let mut next = Membership::new();
        for (name, result) in results {
            match result {
                Ok(nodes) => {
                    let instances: Vec<ServiceInstance> =
                        nodes.into_iter().map(ServiceInstance::from).collect();
                    metrics::counter!("gateway_discovery_poll_total", "service" => name.clone(), "result" => "ok")
                        .increment(1);
                    metrics::gauge!("gateway_discovery_nodes", "service" => name.clone())
                        .set(instances.len() as f64);
                    next.insert(name.clone(), instances);
                }
                Err(e) => {
                    tracing::warn!(
                        "discovery: consul: health query failed, keeping previous instances, service={}, error={}",
                        name,
                        e
                    );
                    metrics::counter!("gateway_discovery_poll_total", "service" => name.clone(), "result" => "error")
                        .increment(1);
                    if let Some(prev) = previous.get(name) {
                        next.insert(name.clone(), prev.clone());
                    }
                }
            }
        }

        for gone in previous.keys().filter(|k| !next.contains_key(*k)) {
            tracing::info!("discovery: consul: service deregistered, service={}", gone);
            metrics::gauge!("gateway_discovery_nodes", "service" => gone.clone()).set(0.0);
        }

        let count = next.len();
        self.snapshot.store(Arc::new(next));
        Ok(count)
    }
}

impl ServiceRegistry for ConsulRegistry {
    fn resolve(&self, service: &str) -> Vec<ServiceInstance> {
        self.snapshot
            .load()
            .get(service)
            .cloned()
            .unwrap_or_default()
    }

    fn services(&self) -> Membership {
        Membership::clone(&self.snapshot.load())
    }
}
