use crate::error::GatewayError;
use crate::proxy::context::{empty_body, error_response, full_body, BoxBody, RequestContext};
use crate::proxy::filter::rate_limit::client_key;
use crate::proxy::filter::FilterResult;
use crate::routing::{CompiledRoute, RouteTarget};
use crate::server::GatewayState;
use crate::upstream::{CallOutcome, CallPermit};
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::uri::Scheme;
use http::{HeaderMap, HeaderName, HeaderValue};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, warn};

/// Handle an incoming HTTP request through a phased lifecycle:
///
/// 1. GLOBAL: logging, then rate limiting (may short-circuit with 429)
/// 2. LOCAL: endpoints the gateway answers itself
/// 3. ROUTE_MATCH: longest-prefix route lookup (404 when nothing matches)
/// 4. ON_REQUEST: route filters in configuration order, breaker gate included
/// 5. UPSTREAM: resolve, dial and retry within the call budget
/// 6. ON_RESPONSE: route filters in reverse, then global filters in reverse
///
/// Every failure is turned into a response here; nothing is returned as an
/// error to hyper.
pub async fn handle_request(
    req: Request<Incoming>,
    state: GatewayState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let key = client_key(
        peer_addr,
        req.headers(),
        state.config.server.trust_forwarded_for,
    );
    let mut ctx = RequestContext::new(
        req.method().clone(),
        req.uri().path().to_string(),
        host,
        peer_addr,
        key,
    );

    let filters = state.filters.as_slice();
    let mut entered = 0;
    let mut rejected = None;
    for filter in filters {
        entered += 1;
        if let FilterResult::Reject(err) = filter.on_request(&mut ctx).await {
            rejected = Some(err);
            break;
        }
    }

    let mut resp = match rejected {
        Some(err) => {
            ctx.fail(&err);
            error_response(&err)
        }
        None => dispatch(req, &mut ctx, &state).await,
    };

    for filter in filters[..entered].iter().rev() {
        filter.on_response(&ctx, &mut resp);
    }
    Ok(resp)
}

async fn dispatch(
    req: Request<Incoming>,
    ctx: &mut RequestContext,
    state: &GatewayState,
) -> Response<BoxBody> {
    if let Some(resp) = state.local.respond(&ctx.method, &ctx.path) {
        return resp;
    }

    let Some(route) = state.routes.match_route(&ctx.path) else {
        debug!("proxy: no route matched, path={}", ctx.path);
        let err = GatewayError::RouteNotFound;
        ctx.fail(&err);
        return error_response(&err);
    };
    ctx.enter_route(&route.id);

    let (parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());
    let mut headers = parts.headers;
    remove_hop_headers(&mut headers);
    inject_forwarded_headers(&mut headers, ctx.peer_addr, &ctx.host);
    state.markers.mark_request(&mut headers);

    // Reject early when Content-Length already exceeds the limit.
    let max_body = route
        .max_body_bytes
        .unwrap_or(state.config.upstream.max_body_bytes);
    let mut rejected = match content_length(&headers) {
        Some(len) if len > max_body => {
            debug!(
                "proxy: body too large, content_length={}, max={}, route={}",
                len, max_body, route.id
            );
            Some(GatewayError::PayloadTooLarge(max_body))
        }
        _ => None,
    };

    let mut entered = 0;
    if rejected.is_none() {
        for filter in &route.filters {
            entered += 1;
            if let FilterResult::Reject(err) = filter.on_request(ctx, &mut headers) {
                rejected = Some(err);
                break;
            }
        }
    }

    let result = match rejected {
        Some(err) => Err(err),
        None => {
            phase_upstream(ctx, &route, state, &path_and_query, headers, body, max_body).await
        }
    };
    let mut resp = match result {
        Ok(resp) => resp,
        Err(err) => failure_response(ctx, state, &err),
    };

    for filter in route.filters[..entered].iter().rev() {
        filter.on_response(ctx, &mut resp);
    }
    state.markers.mark_response(resp.headers_mut());
    resp
}

fn failure_response(
    ctx: &mut RequestContext,
    state: &GatewayState,
    err: &GatewayError,
) -> Response<BoxBody> {
    ctx.fail(err);
    if err.uses_fallback() {
        warn!(
            "proxy: backend failure, route={}, upstream={}, attempts={}, error={}",
            ctx.route_id, ctx.upstream_addr, ctx.attempts, err
        );
        state.fallback.respond(&ctx.route_id, err)
    } else {
        error_response(err)
    }
}

/// Dial the route's backend, retrying per the route policy.
///
/// A body that may be replayed is buffered up to `max_body` bytes; a
/// streamed body is only checked against `Content-Length` beforehand.
/// All attempts share the `upstream.timeout` budget. Every attempt takes its
/// own breaker permit and records its own outcome, so one request that fails
/// three times contributes three failure samples.
async fn phase_upstream(
    ctx: &mut RequestContext,
    route: &CompiledRoute,
    state: &GatewayState,
    path_and_query: &str,
    headers: HeaderMap,
    body: Incoming,
    max_body: u64,
) -> Result<Response<BoxBody>, GatewayError> {
    let attempts = route
        .retry
        .as_ref()
        .map(|p| p.attempts_for(&ctx.method))
        .unwrap_or(1);
    let retrying = attempts > 1;
    let forward_path = route.forward_path(path_and_query);
    let deadline = Instant::now() + state.config.upstream.timeout;

    // Buffer the body only when it may have to be replayed.
    let (body_bytes, mut streaming_body) = if retrying {
        let limit = usize::try_from(max_body).unwrap_or(usize::MAX);
        match Limited::new(body, limit).collect().await {
            Ok(collected) => (Some(collected.to_bytes()), None),
            Err(e) if e.is::<LengthLimitError>() => {
                debug!(
                    "proxy: buffered body too large, max={}, route={}",
                    max_body, route.id
                );
                return Err(GatewayError::PayloadTooLarge(max_body));
            }
            Err(e) => {
                warn!(
                    "proxy: failed to read request body, route={}, error={}",
                    route.id, e
                );
                return Err(GatewayError::InvalidRequest(e.to_string()));
            }
        }
    } else {
        (None, Some(body.boxed()))
    };

    let mut permit = ctx.permit.take();
    ctx.upstream_start = Some(Instant::now());

    for attempt in 1..=attempts {
        if attempt > 1 {
            if let Some(ref breaker) = route.breaker {
                match breaker.try_acquire() {
                    Some(p) => permit = Some(p),
                    None => return Err(GatewayError::CircuitOpen(breaker.name().to_string())),
                }
            }
        }

        let (scheme, authority) = match route.target {
            RouteTarget::Direct {
                ref scheme,
                ref authority,
            } => (scheme.clone(), authority.to_string()),
            RouteTarget::Service(ref service) => match state.resolver.resolve(service) {
                Ok(instance) => (Scheme::HTTP, instance.authority()),
                Err(err) => {
                    settle(&mut permit, CallOutcome::Failure);
                    return Err(err);
                }
            },
        };
        ctx.attempts = attempt;
        ctx.upstream_addr.clear();
        ctx.upstream_addr.push_str(&authority);

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            settle(&mut permit, CallOutcome::Failure);
            return Err(GatewayError::CallTimeout);
        }

        let mut req_headers = headers.clone();
        if let Ok(v) = HeaderValue::from_str(&authority) {
            req_headers.insert(HOST, v);
        }
        let req_body = match body_bytes {
            Some(ref bytes) => full_body(bytes.clone()),
            None => streaming_body.take().unwrap_or_else(empty_body),
        };
        let mut upstream_req = Request::builder()
            .method(ctx.method.clone())
            .uri(format!("{}://{}{}", scheme, authority, forward_path))
            .body(req_body)
            .map_err(|e| GatewayError::Internal(format!("upstream request: {e}")))?;
        *upstream_req.headers_mut() = req_headers;

        match tokio::time::timeout(remaining, state.client.request(upstream_req)).await {
            Ok(Ok(resp)) => {
                let status = resp.status().as_u16();
                let failed = route
                    .breaker
                    .as_ref()
                    .is_some_and(|b| b.is_failure_status(status));
                settle(
                    &mut permit,
                    if failed {
                        CallOutcome::Failure
                    } else {
                        CallOutcome::Success
                    },
                );

                let retryable =
                    retrying && route.retry.as_ref().is_some_and(|p| p.retries_status(status));
                if !retryable {
                    return Ok(build_downstream_response(resp));
                }
                if attempt == attempts {
                    return Err(GatewayError::CallFailed(format!(
                        "status {} after {} attempts",
                        status, attempt
                    )));
                }
                debug!(
                    "proxy: retryable status {}, route={}, upstream={}, attempt={}/{}",
                    status, route.id, authority, attempt, attempts
                );
                note_retry(route, "status");
            }
            Ok(Err(e)) => {
                settle(&mut permit, CallOutcome::Failure);
                if !retrying || attempt == attempts {
                    return Err(GatewayError::CallFailed(e.to_string()));
                }
                debug!(
                    "proxy: connect error (retrying), route={}, upstream={}, attempt={}/{}, error={}",
                    route.id, authority, attempt, attempts, e
                );
                note_retry(route, "connect_error");
            }
            Err(_) => {
                settle(&mut permit, CallOutcome::Failure);
                return Err(GatewayError::CallTimeout);
            }
        }

        if let Some(ref policy) = route.retry {
            if !policy.backoff.is_zero() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                tokio::time::sleep(policy.backoff.min(remaining)).await;
            }
        }
    }

    Err(GatewayError::Internal("retry loop ended without a result".into()))
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn settle(permit: &mut Option<CallPermit>, outcome: CallOutcome) {
    if let Some(p) = permit.take() {
        p.record(outcome);
    }
}

fn note_retry(route: &CompiledRoute, reason: &'static str) {
    metrics::counter!(
        "gateway_upstream_retries_total",
        "route" => route.id.clone(),
        "reason" => reason,
    )
    .increment(1);
}

fn build_downstream_response(upstream_resp: Response<Incoming>) -> Response<BoxBody> {
    let (mut parts, body) = upstream_resp.into_parts();
    remove_hop_headers(&mut parts.headers);
    Response::from_parts(parts, body.boxed())
}

fn remove_hop_headers(headers: &mut HeaderMap) {
    let hop_headers: &[HeaderName] = &[
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailers"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
    ];

    for h in hop_headers {
        headers.remove(h);
    }
}

/// Inject standard `X-Forwarded-*` and `X-Real-IP` headers so backends can
/// identify the original client.
///
/// - `X-Forwarded-For`: the TCP peer IP appended to any existing value.
/// - `X-Forwarded-Proto`: kept when present, otherwise `http`.
/// - `X-Forwarded-Host`: the original `Host` header value.
/// - `X-Real-IP`: always the immediate peer.
fn inject_forwarded_headers(headers: &mut HeaderMap, peer_addr: SocketAddr, original_host: &str) {
    static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");
    static XFP: HeaderName = HeaderName::from_static("x-forwarded-proto");
    static XFH: HeaderName = HeaderName::from_static("x-forwarded-host");
    static XRI: HeaderName = HeaderName::from_static("x-real-ip");

    let peer_ip = peer_addr.ip().to_string();

    if let Some(existing) = headers.get(&XFF).and_then(|v| v.to_str().ok()) {
        let combined = format!("{}, {}", existing, peer_ip);
        if let Ok(v) = HeaderValue::from_str(&combined) {
            headers.insert(XFF.clone(), v);
        }
    } else if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XFF.clone(), v);
    }

    if !headers.contains_key(&XFP) {
        headers.insert(XFP.clone(), HeaderValue::from_static("http"));
    }

    if !original_host.is_empty() {
        if let Ok(v) = HeaderValue::from_str(original_host) {
            headers.insert(XFH.clone(), v);
        }
    }

    if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XRI.clone(), v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "192.168.1.7:52000".parse().unwrap()
    }

    #[test]
    fn test_remove_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("x-request-id", HeaderValue::from_static("abc"));
        remove_hop_headers(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("x-request-id"));
    }

    #[test]
    fn test_content_length() {
        let mut headers = HeaderMap::new();
        assert_eq!(content_length(&headers), None);
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("4096"));
        assert_eq!(content_length(&headers), Some(4096));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("lots"));
        assert_eq!(content_length(&headers), None);
    }

    #[test]
    fn test_forwarded_headers_fresh() {
        let mut headers = HeaderMap::new();
        inject_forwarded_headers(&mut headers, peer(), "shop.example.com");
        assert_eq!(headers["x-forwarded-for"], "192.168.1.7");
        assert_eq!(headers["x-forwarded-proto"], "http");
        assert_eq!(headers["x-forwarded-host"], "shop.example.com");
        assert_eq!(headers["x-real-ip"], "192.168.1.7");
    }

    #[test]
    fn test_forwarded_for_appends() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.1.1.1"));
        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        inject_forwarded_headers(&mut headers, peer(), "");
        assert_eq!(headers["x-forwarded-for"], "10.1.1.1, 192.168.1.7");
        assert_eq!(headers["x-forwarded-proto"], "https");
        assert!(!headers.contains_key("x-forwarded-host"));
    }
}
