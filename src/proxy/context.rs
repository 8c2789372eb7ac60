use crate::error::GatewayError;
use crate::upstream::CallPermit;
use bytes::Bytes;
use http::{HeaderValue, Method, StatusCode};
use http_body_util::{BodyExt, Full};
use std::net::SocketAddr;
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Build a response with a fixed body and content type.
pub fn body_response(
    status: StatusCode,
    content_type: HeaderValue,
    body: impl Into<Bytes>,
) -> hyper::Response<BoxBody> {
    let mut resp = hyper::Response::new(full_body(body));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(http::header::CONTENT_TYPE, content_type);
    resp
}

pub fn json_response(status: StatusCode, value: &serde_json::Value) -> hyper::Response<BoxBody> {
    body_response(
        status,
        HeaderValue::from_static("application/json"),
        value.to_string(),
    )
}

/// `{"status": "<REASON>", "message": "...", "code": <u16>}`
pub fn error_json(status: StatusCode, reason: &str, message: &str) -> hyper::Response<BoxBody> {
    json_response(
        status,
        &serde_json::json!({
            "status": reason,
            "message": message,
            "code": status.as_u16(),
        }),
    )
}

pub fn error_response(err: &GatewayError) -> hyper::Response<BoxBody> {
    error_json(err.status(), err.reason(), &err.to_string())
}

/// Per-request state threaded through the filter pipeline.
pub struct RequestContext {
    pub method: Method,
    pub path: String,
    pub host: String,
    pub peer_addr: SocketAddr,
    /// Rate-limit key, the client's address.
    pub client_key: String,
    pub route_id: String,
    pub upstream_addr: String,
    /// Backend dials made for this request.
    pub attempts: u32,
    /// Short label for the access log and the `outcome` metric label.
    pub outcome: &'static str,
    pub start: Instant,
    pub upstream_start: Option<Instant>,
    /// Breaker permit taken by the circuit-breaker gate for the first attempt.
    pub permit: Option<CallPermit>,
}

impl RequestContext {
    pub fn new(
        method: Method,
        path: String,
        host: String,
        peer_addr: SocketAddr,
        client_key: String,
    ) -> Self {
        Self {
            method,
            path,
            host,
            peer_addr,
            client_key,
            route_id: String::new(),
            upstream_addr: String::new(),
            attempts: 0,
            outcome: "ok",
            start: Instant::now(),
            upstream_start: None,
            permit: None,
        }
    }

    /// Bind the request to a matched route.
    pub fn enter_route(&mut self, route_id: &str) {
        self.route_id = route_id.to_string();
        metrics::gauge!("gateway_http_requests_in_flight", "route" => self.route_id.clone())
            .increment(1.0);
    }

    pub fn fail(&mut self, err: &GatewayError) {
        self.outcome = err.outcome();
    }

    pub fn finalize_metrics(&self, resp_status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(resp_status);

        metrics::counter!(
            "gateway_http_requests_total",
            "route" => self.route_id.clone(),
            "method" => self.method.as_str().to_owned(),
            "status_code" => status_str.to_owned(),
            "outcome" => self.outcome,
        )
        .increment(1);

        metrics::histogram!(
            "gateway_http_request_duration_seconds",
            "route" => self.route_id.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());

        if let Some(upstream_start) = self.upstream_start {
            metrics::histogram!(
                "gateway_upstream_request_duration_seconds",
                "route" => self.route_id.clone(),
            )
            .record(upstream_start.elapsed().as_secs_f64());
        }

        if !self.route_id.is_empty() {
            metrics::gauge!("gateway_http_requests_in_flight", "route" => self.route_id.clone())
                .decrement(1.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    fn ctx() -> RequestContext {
        RequestContext::new(
            Method::GET,
            "/api/products/1".to_string(),
            "gateway.local".to_string(),
            "127.0.0.1:40000".parse().unwrap(),
            "127.0.0.1".to_string(),
        )
    }

    #[test]
    fn test_request_context_new() {
        let ctx = ctx();
        assert_eq!(ctx.path, "/api/products/1");
        assert_eq!(ctx.route_id, "");
        assert_eq!(ctx.attempts, 0);
        assert_eq!(ctx.outcome, "ok");
        assert!(ctx.upstream_start.is_none());
        assert!(ctx.permit.is_none());
    }

    #[test]
    fn test_fail_sets_outcome() {
        let mut ctx = ctx();
        ctx.fail(&GatewayError::CircuitOpen("b".into()));
        assert_eq!(ctx.outcome, "circuit_open");
    }

    #[tokio::test]
    async fn test_error_response_body() {
        let resp = error_response(&GatewayError::RateLimited);
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "application/json"
        );
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["status"], "TOO_MANY_REQUESTS");
        assert_eq!(v["message"], "too many requests");
        assert_eq!(v["code"], 429);
    }

    #[test]
    fn test_finalize_metrics() {
        let mut ctx = ctx();
        ctx.enter_route("product-service");
        ctx.upstream_addr = "10.0.0.1:8081".to_string();
        ctx.upstream_start = Some(Instant::now());
        ctx.finalize_metrics(200);
    }
}
