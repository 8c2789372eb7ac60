use super::GatewayState;
use crate::proxy::context::{body_response, json_response, BoxBody};
use http::{HeaderValue, StatusCode};
use hyper::body::Incoming;
use hyper::{Request, Response};
use serde_json::json;

pub fn handle_admin(
    req: Request<Incoming>,
    state: GatewayState,
) -> Result<Response<BoxBody>, hyper::Error> {
    let resp = match req.uri().path() {
        "/health" | "/healthz" => json_response(StatusCode::OK, &json!({ "status": "ok" })),

        "/ready" | "/readyz" => json_response(
            StatusCode::OK,
            &json!({
                "status": "ready",
                "total_routes": state.routes.route_count(),
                "breakers": state.breakers.len(),
                "services": state.resolver.registry().services().len(),
            }),
        ),

        "/metrics" => body_response(
            StatusCode::OK,
            HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            state.metrics.render(),
        ),

        "/routes" => {
            let routes: Vec<serde_json::Value> = state
                .routes
                .all_routes()
                .iter()
                .map(|r| {
                    json!({
                        "id": r.id,
                        "path": r.path,
                        "target": r.target.to_string(),
                        "strip_prefix": r.strip_prefix,
                        "filters": r.filter_names(),
                        "breaker": r.breaker.as_ref().map(|b| b.name().to_string()),
                    })
                })
                .collect();
            json_response(StatusCode::OK, &json!(routes))
        }

        "/breakers" => json_response(StatusCode::OK, &json!(state.breakers.snapshots())),

        _ => json_response(StatusCode::NOT_FOUND, &json!({ "error": "not found" })),
    };
    Ok(resp)
}
