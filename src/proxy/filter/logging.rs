use crate::proxy::context::{BoxBody, RequestContext};

pub(super) fn logging_on_request(ctx: &RequestContext) {
    tracing::info!(
        method = %ctx.method,
        path = %ctx.path,
        client = %ctx.client_key,
        "request"
    );
}

/// Access log plus request metrics, emitted once per request whatever the
/// outcome.
pub(super) fn logging_on_response(ctx: &RequestContext, resp: &hyper::Response<BoxBody>) {
    let status = resp.status().as_u16();
    let latency_ms = ctx.start.elapsed().as_secs_f64() * 1000.0;
    let upstream_ms = ctx
        .upstream_start
        .map(|t| t.elapsed().as_secs_f64() * 1000.0);

    tracing::info!(
        client_ip = %ctx.peer_addr.ip(),
        method = %ctx.method,
        host = %ctx.host,
        path = %ctx.path,
        status,
        outcome = ctx.outcome,
        route = %ctx.route_id,
        upstream = %ctx.upstream_addr,
        attempts = ctx.attempts,
        latency_ms,
        upstream_ms,
        "access"
    );

    ctx.finalize_metrics(status);
}
