use crate::discovery::{ServiceInstance, ServiceRegistry};
use crate::error::GatewayError;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Picks one live address per call, round-robin per service.
///
/// Membership is re-read from the registry on every call so a retry sees
/// the latest snapshot. Each service's counter starts at a random offset so
/// that several gateways restarted together do not all hit the first node.
pub struct AddressResolver {
    registry: Arc<dyn ServiceRegistry>,
    cursors: DashMap<String, AtomicUsize>,
}

impl AddressResolver {
    pub fn new(registry: Arc<dyn ServiceRegistry>) -> Self {
        Self {
            registry,
            cursors: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<dyn ServiceRegistry> {
        &self.registry
    }

    pub fn resolve(&self, service: &str) -> Result<ServiceInstance, GatewayError> {
        let mut instances = self.registry.resolve(service);
        if instances.is_empty() {
            return Err(GatewayError::BackendUnavailable(service.to_string()));
        }
        let n = self.next_index(service);
        Ok(instances.swap_remove(n % instances.len()))
    }

    fn next_index(&self, service: &str) -> usize {
        // Fast path: key already exists, no allocation.
        if let Some(cursor) = self.cursors.get(service) {
            return cursor.fetch_add(1, Ordering::Relaxed);
        }
        self.cursors
            .entry(service.to_string())
            .or_insert_with(|| AtomicUsize::new(rand::random::<u32>() as usize))
            .fetch_add(1, Ordering::Relaxed)
    }
}
