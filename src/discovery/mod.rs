pub mod client;
pub mod registry;

pub use client::{ConsulClient, ConsulServiceNode};
pub use registry::{ConsulRegistry, StaticRegistry};

use serde::Serialize;
use std::collections::BTreeMap;

/// One live network address of a logical service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ServiceInstance {
    pub host: String,
    pub port: u16,
}

impl ServiceInstance {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a `host:port` entry.
    pub fn parse(addr: &str) -> Option<Self> {
        let (host, port) = addr.rsplit_once(':')?;
        if host.is_empty() {
            return None;
        }
        Some(Self::new(host, port.parse().ok()?))
    }

    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn uri(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl From<ConsulServiceNode> for ServiceInstance {
    fn from(node: ConsulServiceNode) -> Self {
        Self::new(node.service_address, node.service_port)
    }
}

/// Directory mapping a logical service name to its live addresses.
///
/// Lookups are synchronous reads of the latest known membership; keeping
/// that membership fresh is the implementation's own business.
pub trait ServiceRegistry: Send + Sync {
    fn resolve(&self, service: &str) -> Vec<ServiceInstance>;

    /// Every known service and its live addresses.
    fn services(&self) -> BTreeMap<String, Vec<ServiceInstance>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_instance() {
        let inst = ServiceInstance::parse("10.0.0.1:8081").unwrap();
        assert_eq!(inst.host, "10.0.0.1");
        assert_eq!(inst.port, 8081);
        assert_eq!(inst.authority(), "10.0.0.1:8081");
        assert_eq!(inst.uri(), "http://10.0.0.1:8081");

        assert!(ServiceInstance::parse("localhost").is_none());
        assert!(ServiceInstance::parse(":80").is_none());
        assert!(ServiceInstance::parse("host:http").is_none());
    }
}
