pub mod headers;
mod logging;
pub mod rate_limit;

use crate::config::{CircuitBreakerConfig, FilterConfig, GatewayConfig, RouteConfig};
use crate::error::GatewayError;
use crate::proxy::context::{BoxBody, RequestContext};
use crate::upstream::{CircuitBreakerRegistry, RetryPolicy, RouteBreaker};
use headers::{DedupeRule, HeaderOp};
use rate_limit::RateLimiter;
use std::sync::Arc;

/// Result of a filter's on_request phase.
pub enum FilterResult {
    /// Continue to the next filter / phase.
    Continue,
    /// Short-circuit: the pipeline renders this failure as the response.
    Reject(GatewayError),
}

/// Filters that run for every request, before routing.
///
/// Ordered by `order()`, lowest first; ties keep declaration order. On the
/// way out, `on_response` runs in reverse over the filters that were entered.
pub enum GlobalFilter {
    Logging,
    RateLimit(Arc<RateLimiter>),
}

impl std::fmt::Debug for GlobalFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl GlobalFilter {
    pub fn name(&self) -> &'static str {
        match self {
            GlobalFilter::Logging => "logging",
            GlobalFilter::RateLimit(_) => "rate_limit",
        }
    }

    pub fn order(&self) -> i32 {
        match self {
            GlobalFilter::Logging => i32::MIN,
            GlobalFilter::RateLimit(_) => i32::MIN + 1,
        }
    }

    pub async fn on_request(&self, ctx: &mut RequestContext) -> FilterResult {
        match self {
            GlobalFilter::Logging => {
                logging::logging_on_request(ctx);
                FilterResult::Continue
            }
            GlobalFilter::RateLimit(limiter) => rate_limit::rate_limit_on_request(limiter, ctx).await,
        }
    }

    pub fn on_response(&self, ctx: &RequestContext, resp: &mut hyper::Response<BoxBody>) {
        match self {
            GlobalFilter::Logging => logging::logging_on_response(ctx, resp),
            GlobalFilter::RateLimit(_) => {
                // No response-phase logic for rate limiting.
            }
        }
    }
}

/// Build the global chain once at startup. Must run inside the tokio
/// runtime when idle eviction is enabled, since it spawns the GC task.
pub fn build_global_filters(cfg: &GatewayConfig) -> Vec<GlobalFilter> {
    let mut filters = vec![GlobalFilter::Logging];

    if cfg.rate_limit.enabled {
        let limiter = Arc::new(RateLimiter::new(&cfg.rate_limit));
        if !cfg.rate_limit.idle_eviction.is_zero() {
            limiter.start_gc(cfg.rate_limit.idle_eviction);
        }
        filters.push(GlobalFilter::RateLimit(limiter));
    }

    // Stable: equal orders keep declaration order.
    filters.sort_by_key(|f| f.order());
    filters
}

/// Enum-based route filter with static dispatch.
///
/// Filters are pre-built once when the route is compiled, NOT per-request,
/// and run in configuration order.
pub enum RouteFilter {
    RequestHeader(HeaderOp),
    ResponseHeader(HeaderOp),
    DedupeResponseHeader(DedupeRule),
    /// Gate: takes the breaker permit for the first backend attempt.
    CircuitBreaker(Arc<RouteBreaker>),
    /// Consumed by the upstream phase; no request or response logic.
    Retry(RetryPolicy),
}

impl std::fmt::Debug for RouteFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteFilter::RequestHeader(op) | RouteFilter::ResponseHeader(op) => f
                .debug_struct(self.name())
                .field("header", &op.name)
                .field("action", &op.action)
                .finish(),
            RouteFilter::DedupeResponseHeader(rule) => f
                .debug_struct(self.name())
                .field("headers", &rule.names)
                .field("strategy", &rule.strategy)
                .finish(),
            RouteFilter::CircuitBreaker(b) => f
                .debug_struct(self.name())
                .field("breaker", &b.name())
                .finish(),
            RouteFilter::Retry(policy) => f
                .debug_struct(self.name())
                .field("max_attempts", &policy.max_attempts)
                .finish(),
        }
    }
}

impl RouteFilter {
    pub fn name(&self) -> &'static str {
        match self {
            RouteFilter::RequestHeader(_) => "request_header",
            RouteFilter::ResponseHeader(_) => "response_header",
            RouteFilter::DedupeResponseHeader(_) => "dedupe_response_header",
            RouteFilter::CircuitBreaker(_) => "circuit_breaker",
            RouteFilter::Retry(_) => "retry",
        }
    }

    /// Request phase: runs after route resolution, before the backend call.
    /// Return `FilterResult::Reject` to short-circuit.
    pub fn on_request(&self, ctx: &mut RequestContext, headers: &mut http::HeaderMap) -> FilterResult {
        match self {
            RouteFilter::RequestHeader(op) => {
                op.apply(headers);
                FilterResult::Continue
            }
            RouteFilter::CircuitBreaker(breaker) => match breaker.try_acquire() {
                Some(permit) => {
                    ctx.permit = Some(permit);
                    FilterResult::Continue
                }
                None => {
                    tracing::debug!(
                        "filter: circuit_breaker: rejected, route={}, breaker={}",
                        ctx.route_id,
                        breaker.name()
                    );
                    FilterResult::Reject(GatewayError::CircuitOpen(breaker.name().to_string()))
                }
            },
            RouteFilter::ResponseHeader(_)
            | RouteFilter::DedupeResponseHeader(_)
            | RouteFilter::Retry(_) => FilterResult::Continue,
        }
    }

    /// Response phase: runs on every response for the route, fallbacks included.
    pub fn on_response(&self, _ctx: &RequestContext, resp: &mut hyper::Response<BoxBody>) {
        match self {
            RouteFilter::ResponseHeader(op) => op.apply(resp.headers_mut()),
            RouteFilter::DedupeResponseHeader(rule) => rule.apply(resp.headers_mut()),
            RouteFilter::RequestHeader(_)
            | RouteFilter::CircuitBreaker(_)
            | RouteFilter::Retry(_) => {}
        }
    }
}

/// Build the filter chain for a route at startup.
///
/// Circuit-breaker filters inherit unset fields from `defaults` and are
/// registered in `breakers` under their name, or the route id when unnamed.
pub fn build_route_filters(
    route: &RouteConfig,
    defaults: &CircuitBreakerConfig,
    breakers: &CircuitBreakerRegistry,
) -> anyhow::Result<Vec<RouteFilter>> {
    let mut filters = Vec::with_capacity(route.filters.len());

    for cfg in &route.filters {
        let filter = match cfg {
            FilterConfig::RequestHeader(h) => RouteFilter::RequestHeader(HeaderOp::compile(h)?),
            FilterConfig::ResponseHeader(h) => RouteFilter::ResponseHeader(HeaderOp::compile(h)?),
            FilterConfig::DedupeResponseHeader(d) => {
                RouteFilter::DedupeResponseHeader(DedupeRule::compile(d)?)
            }
            FilterConfig::CircuitBreaker(cb) => {
                let name = cb.name.as_deref().unwrap_or(&route.id);
                RouteFilter::CircuitBreaker(breakers.get_or_create(name, &defaults.merged(cb)))
            }
            FilterConfig::Retry(r) => RouteFilter::Retry(RetryPolicy::from_config(r)),
        };
        filters.push(filter);
    }

    Ok(filters)
}
