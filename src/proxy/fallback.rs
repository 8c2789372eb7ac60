use crate::config::{GatewayConfig, RouteFallbackConfig};
use crate::error::GatewayError;
use crate::proxy::context::{body_response, BoxBody};
use bytes::Bytes;
use http::{HeaderValue, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;

/// A canned degraded response: always 503 with the standard
/// `{status, message, code}` JSON payload.
#[derive(Debug, Clone)]
pub struct FallbackEntry {
    pub message: String,
    body: Bytes,
}

impl FallbackEntry {
    pub const STATUS: StatusCode = StatusCode::SERVICE_UNAVAILABLE;

    pub fn new(message: &str) -> Self {
        let body = serde_json::json!({
            "status": "SERVICE_UNAVAILABLE",
            "message": message,
            "code": Self::STATUS.as_u16(),
        });
        Self {
            message: message.to_string(),
            body: Bytes::from(body.to_string()),
        }
    }

    fn from_route(cfg: &RouteFallbackConfig, default_message: &str) -> Self {
        Self::new(cfg.message.as_deref().unwrap_or(default_message))
    }

    pub fn to_response(&self) -> hyper::Response<BoxBody> {
        body_response(
            Self::STATUS,
            HeaderValue::from_static("application/json"),
            self.body.clone(),
        )
    }
}

/// Terminal error boundary for backend failures.
///
/// Every lookup yields an entry: a route without its own fallback gets the
/// generic one, so responding can never fail.
#[derive(Debug)]
pub struct FallbackDispatcher {
    generic: Arc<FallbackEntry>,
    by_route: HashMap<String, Arc<FallbackEntry>>,
    /// Entries also served as local endpoints, the generic path included.
    by_path: HashMap<String, Arc<FallbackEntry>>,
}

impl FallbackDispatcher {
    pub fn new(cfg: &GatewayConfig) -> anyhow::Result<Self> {
        let generic = Arc::new(FallbackEntry::new(&cfg.fallback.message));

        let mut by_route = HashMap::new();
        let mut by_path = HashMap::new();
        by_path.insert(cfg.fallback.path.clone(), Arc::clone(&generic));

        for route in &cfg.routes {
            let Some(ref fb) = route.fallback else {
                continue;
            };
            let entry = Arc::new(FallbackEntry::from_route(fb, &cfg.fallback.message));
            if let Some(ref path) = fb.path {
                by_path.insert(path.clone(), Arc::clone(&entry));
            }
            by_route.insert(route.id.clone(), entry);
        }

        tracing::info!(
            "fallback: dispatcher ready, routes={}, paths={}",
            by_route.len(),
            by_path.len()
        );

        Ok(Self {
            generic,
            by_route,
            by_path,
        })
    }

    pub fn generic(&self) -> &FallbackEntry {
        &self.generic
    }

    pub fn for_route(&self, route_id: &str) -> &FallbackEntry {
        self.by_route
            .get(route_id)
            .map(Arc::as_ref)
            .unwrap_or(&self.generic)
    }

    pub fn for_path(&self, path: &str) -> Option<&FallbackEntry> {
        self.by_path.get(path).map(Arc::as_ref)
    }

    /// Answer a backend failure on `route_id`.
    pub fn respond(&self, route_id: &str, err: &GatewayError) -> hyper::Response<BoxBody> {
        metrics::counter!(
            "gateway_fallback_total",
            "route" => route_id.to_owned(),
            "reason" => err.outcome(),
        )
        .increment(1);
        tracing::debug!("fallback: serving, route={}, reason={}", route_id, err);
        self.for_route(route_id).to_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouteConfig;
    use http_body_util::BodyExt;

    fn route(id: &str, fallback: Option<RouteFallbackConfig>) -> RouteConfig {
        RouteConfig {
            id: id.into(),
            path: format!("/api/{}/**", id),
            uri: format!("lb://{}", id),
            strip_prefix: 0,
            max_body_bytes: None,
            fallback,
            filters: vec![],
        }
    }

    fn fallback(path: Option<&str>, message: Option<&str>) -> RouteFallbackConfig {
        RouteFallbackConfig {
            path: path.map(String::from),
            message: message.map(String::from),
        }
    }

    fn dispatcher() -> FallbackDispatcher {
        let mut cfg = GatewayConfig::default();
        cfg.routes = vec![
            route(
                "products",
                Some(fallback(
                    Some("/api/fallback/products"),
                    Some("Product service is currently unavailable. Please try again later."),
                )),
            ),
            route("legacy", Some(fallback(None, None))),
            route("cart", None),
        ];
        FallbackDispatcher::new(&cfg).unwrap()
    }

    async fn body_json(resp: hyper::Response<BoxBody>) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_route_entry_message() {
        let d = dispatcher();
        let resp = d.respond("products", &GatewayError::CircuitOpen("p".into()));
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let v = body_json(resp).await;
        assert_eq!(v["status"], "SERVICE_UNAVAILABLE");
        assert_eq!(
            v["message"],
            "Product service is currently unavailable. Please try again later."
        );
        assert_eq!(v["code"], 503);
    }

    #[tokio::test]
    async fn test_missing_route_entry_uses_generic() {
        let d = dispatcher();
        let resp = d.respond("cart", &GatewayError::CallTimeout);
        let v = body_json(resp).await;
        assert_eq!(
            v["message"],
            "The service is temporarily unavailable. Please try again later."
        );
        let resp = d.respond("no-such-route", &GatewayError::CallTimeout);
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_entry_without_message_is_generic_json() {
        let d = dispatcher();
        let resp = d.respond("legacy", &GatewayError::CallFailed("x".into()));
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.headers().get("content-type").unwrap(), "application/json");
        let v = body_json(resp).await;
        assert_eq!(v["status"], "SERVICE_UNAVAILABLE");
        assert_eq!(
            v["message"],
            "The service is temporarily unavailable. Please try again later."
        );
        assert_eq!(v["code"], 503);
    }

    #[test]
    fn test_paths() {
        let d = dispatcher();
        assert!(d.for_path("/fallback").is_some());
        assert!(d.for_path("/api/fallback/products").is_some());
        assert!(d.for_path("/api/fallback/cart").is_none());
        assert_eq!(
            d.generic().message,
            "The service is temporarily unavailable. Please try again later."
        );
    }
}
