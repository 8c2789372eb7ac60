use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`, `gauge!`,
/// `histogram!`) can be used anywhere in the codebase. The `PrometheusHandle`
/// is retained solely for rendering the `/metrics` endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric descriptions.
    ///
    /// Idempotent: later calls share the first recorder, so several gateways
    /// can be built in one process.
    pub fn install() -> Self {
        let handle = HANDLE.get_or_init(|| {
            let handle = match install_recorder() {
                Ok(handle) => handle,
                Err(e) => {
                    // Another recorder owns the process; render an empty registry.
                    tracing::warn!("metrics: recorder not installed, error={}", e);
                    PrometheusBuilder::new().build_recorder().handle()
                }
            };
            describe();
            handle
        });
        Self {
            handle: handle.clone(),
        }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("_duration_seconds".to_string()),
            LATENCY_BUCKETS,
        )?
        .install_recorder()
}

/// Adds HELP / TYPE lines.
fn describe() {
    // request path
    describe_counter!(
        "gateway_http_requests_total",
        Unit::Count,
        "Total HTTP requests processed"
    );
    describe_histogram!(
        "gateway_http_request_duration_seconds",
        Unit::Seconds,
        "Total request duration from client perspective"
    );
    describe_histogram!(
        "gateway_upstream_request_duration_seconds",
        Unit::Seconds,
        "Upstream request duration, retries included"
    );
    describe_gauge!(
        "gateway_http_requests_in_flight",
        Unit::Count,
        "Number of routed requests currently being processed"
    );

    // rate limiting
    describe_counter!(
        "gateway_rate_limit_rejected_total",
        Unit::Count,
        "Total requests rejected by rate limiter"
    );
    describe_counter!(
        "gateway_rate_limit_allowed_total",
        Unit::Count,
        "Total requests allowed by rate limiter"
    );

    // retries & circuit breaker
    describe_counter!(
        "gateway_upstream_retries_total",
        Unit::Count,
        "Total upstream retry attempts"
    );
    describe_counter!(
        "gateway_circuit_breaker_rejected_total",
        Unit::Count,
        "Total calls rejected by circuit breaker"
    );
    describe_counter!(
        "gateway_circuit_breaker_transitions_total",
        Unit::Count,
        "Circuit breaker state transitions"
    );
    describe_gauge!(
        "gateway_circuit_breaker_state",
        Unit::Count,
        "Circuit breaker state: 0=closed 1=open 2=half-open"
    );
    describe_counter!(
        "gateway_fallback_total",
        Unit::Count,
        "Total fallback responses served for backend failures"
    );

    // service discovery
    describe_counter!(
        "gateway_discovery_poll_total",
        Unit::Count,
        "Total service registry poll attempts"
    );
    describe_gauge!(
        "gateway_discovery_nodes",
        Unit::Count,
        "Number of live nodes per service"
    );

    // connections
    describe_gauge!(
        "gateway_connections_active",
        Unit::Count,
        "Number of active downstream connections"
    );
    describe_counter!(
        "gateway_connections_total",
        Unit::Count,
        "Total connections accepted"
    );

    // config
    describe_gauge!(
        "gateway_config_routes_total",
        Unit::Count,
        "Number of routes currently loaded"
    );
}
