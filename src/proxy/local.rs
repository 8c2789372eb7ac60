use crate::discovery::ServiceRegistry;
use crate::proxy::context::{json_response, BoxBody};
use crate::proxy::fallback::FallbackDispatcher;
use http::{Method, StatusCode};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Endpoints answered by the gateway itself on the proxy listener.
///
/// Only `GET` is served; any other method falls through to route matching.
/// A local path shadows a route with the same path.
pub struct LocalEndpoints {
    fallback: Arc<FallbackDispatcher>,
    registry: Arc<dyn ServiceRegistry>,
}

impl LocalEndpoints {
    pub fn new(fallback: Arc<FallbackDispatcher>, registry: Arc<dyn ServiceRegistry>) -> Self {
        Self { fallback, registry }
    }

    pub fn respond(&self, method: &Method, path: &str) -> Option<hyper::Response<BoxBody>> {
        if method != Method::GET {
            return None;
        }
        if let Some(entry) = self.fallback.for_path(path) {
            return Some(entry.to_response());
        }
        let body = match path {
            "/health" => json!({ "status": "UP", "timestamp": now_millis() }),
            "/services" => self.service_uris(),
            "/api/debug" => json!({ "status": "ok", "message": "API Gateway is working" }),
            "/api/debug/services" => self.service_instances(),
            _ => return None,
        };
        Some(json_response(StatusCode::OK, &body))
    }

    fn service_uris(&self) -> Value {
        let services: Map<String, Value> = self
            .registry
            .services()
            .into_iter()
            .map(|(name, instances)| {
                let uris = instances.iter().map(|i| Value::String(i.uri())).collect();
                (name, Value::Array(uris))
            })
            .collect();
        json!({ "services": services })
    }

    fn service_instances(&self) -> Value {
        let services = self.registry.services();
        let names: Vec<&String> = services.keys().collect();
        let instances: Map<String, Value> = services
            .iter()
            .map(|(name, instances)| {
                let entries = instances
                    .iter()
                    .map(|i| json!({ "host": i.host, "port": i.port, "uri": i.uri() }))
                    .collect();
                (name.clone(), Value::Array(entries))
            })
            .collect();
        json!({ "services": names, "instances": instances })
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
