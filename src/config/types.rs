use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

/// Deserialize a `T` that implements `Default`, treating `null` the same as
/// a missing field. Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Human-readable durations (`"10s"`, `"250ms"`, `"1m"`).
mod duration_str {
    use super::*;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

mod opt_duration_str {
    use super::*;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_str(&humantime::format_duration(*d).to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        match Option::<String>::deserialize(d)? {
            Some(raw) => humantime::parse_duration(&raw)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Audit headers stamped on forwarded requests and proxied responses.
    #[serde(default)]
    pub marker: MarkerConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Defaults for every `circuit_breaker` route filter.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub fallback: FallbackConfig,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_admin_listen")]
    pub admin_listen: String,

    /// Key the rate limiter on the left-most `X-Forwarded-For` entry instead
    /// of the TCP peer. Only safe behind a trusted proxy.
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            admin_listen: default_admin_listen(),
            trust_forwarded_for: false,
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_admin_listen() -> String {
    "0.0.0.0:9091".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Total budget for one proxied call, retries included.
    #[serde(default = "default_upstream_timeout", with = "duration_str")]
    pub timeout: Duration,

    #[serde(default = "default_connect_timeout", with = "duration_str")]
    pub connect_timeout: Duration,

    #[serde(default = "default_pool_idle_timeout", with = "duration_str")]
    pub pool_idle_timeout: Duration,

    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle_per_host: usize,

    /// Default `false`, typical for internal services with self-signed certs.
    #[serde(default)]
    pub tls_verify: bool,

    /// Largest request body accepted, checked against `Content-Length` and
    /// enforced while buffering a body for retries. Larger requests get 413.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout: default_upstream_timeout(),
            connect_timeout: default_connect_timeout(),
            pool_idle_timeout: default_pool_idle_timeout(),
            pool_max_idle_per_host: default_pool_max_idle(),
            tls_verify: false,
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_max_body_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_upstream_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_pool_idle_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_pool_max_idle() -> usize {
    64
}

/// An empty header name disables that marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkerConfig {
    #[serde(default = "default_marker_request")]
    pub request_header: String,

    #[serde(default = "default_marker_response")]
    pub response_header: String,

    #[serde(default = "default_marker_value")]
    pub value: String,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            request_header: default_marker_request(),
            response_header: default_marker_response(),
            value: default_marker_value(),
        }
    }
}

fn default_marker_request() -> String {
    "x-gateway-request".to_string()
}

fn default_marker_response() -> String {
    "x-gateway-response".to_string()
}

fn default_marker_value() -> String {
    "true".to_string()
}

/// Per-client fixed-window limit applied to every request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_max_requests")]
    pub max_requests: u64,

    #[serde(default = "default_rate_window", with = "duration_str")]
    pub window: Duration,

    /// Evict counters idle for longer than this. Zero keeps every counter
    /// for the life of the process.
    #[serde(default, with = "duration_str")]
    pub idle_eviction: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: default_max_requests(),
            window: default_rate_window(),
            idle_eviction: Duration::ZERO,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_requests() -> u64 {
    50
}

fn default_rate_window() -> Duration {
    Duration::from_secs(60)
}

/// State machine: Closed → Open → HalfOpen → Closed/Open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_window_size")]
    pub sliding_window_size: usize,

    /// Percentage in (0, 100].
    #[serde(default = "default_failure_rate")]
    pub failure_rate_threshold: f64,

    #[serde(default = "default_wait_duration", with = "duration_str")]
    pub wait_duration: Duration,

    #[serde(default = "default_half_open_calls")]
    pub permitted_half_open_calls: u32,

    /// Response statuses recorded as failures.
    #[serde(default = "default_failure_statuses")]
    pub failure_statuses: Vec<u16>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            sliding_window_size: default_window_size(),
            failure_rate_threshold: default_failure_rate(),
            wait_duration: default_wait_duration(),
            permitted_half_open_calls: default_half_open_calls(),
            failure_statuses: default_failure_statuses(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Apply a route filter's overrides on top of these defaults.
    pub fn merged(&self, overrides: &CircuitBreakerFilterConfig) -> Self {
        Self {
            sliding_window_size: overrides
                .sliding_window_size
                .unwrap_or(self.sliding_window_size),
            failure_rate_threshold: overrides
                .failure_rate_threshold
                .unwrap_or(self.failure_rate_threshold),
            wait_duration: overrides.wait_duration.unwrap_or(self.wait_duration),
            permitted_half_open_calls: overrides
                .permitted_half_open_calls
                .unwrap_or(self.permitted_half_open_calls),
            failure_statuses: overrides
                .failure_statuses
                .clone()
                .unwrap_or_else(|| self.failure_statuses.clone()),
        }
    }
}

fn default_window_size() -> usize {
    10
}

fn default_failure_rate() -> f64 {
    50.0
}

fn default_wait_duration() -> Duration {
    Duration::from_secs(10)
}

fn default_half_open_calls() -> u32 {
    5
}

fn default_failure_statuses() -> Vec<u16> {
    vec![500, 502, 503, 504]
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryKind {
    #[default]
    Static,
    Consul,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(rename = "type", default)]
    pub kind: DiscoveryKind,

    #[serde(default)]
    pub consul: ConsulConfig,

    /// Entries for the static registry; ignored for consul discovery.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub services: Vec<StaticServiceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsulConfig {
    #[serde(default = "default_consul_addr")]
    pub address: String,

    #[serde(default)]
    pub datacenter: Option<String>,

    #[serde(default)]
    pub token: Option<String>,

    #[serde(default = "default_poll_interval", with = "duration_str")]
    pub poll_interval: Duration,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: default_consul_addr(),
            datacenter: None,
            token: None,
            poll_interval: default_poll_interval(),
        }
    }
}

fn default_consul_addr() -> String {
    "http://127.0.0.1:8500".to_string()
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticServiceConfig {
    pub name: String,

    /// `host:port` entries.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub addresses: Vec<String>,
}

/// The generic fallback, served at `path` and used by routes without their
/// own entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    #[serde(default = "default_fallback_message")]
    pub message: String,

    #[serde(default = "default_fallback_path")]
    pub path: String,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            message: default_fallback_message(),
            path: default_fallback_path(),
        }
    }
}

fn default_fallback_message() -> String {
    "The service is temporarily unavailable. Please try again later.".to_string()
}

fn default_fallback_path() -> String {
    "/fallback".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub id: String,

    /// `/api/products/**` matches the prefix at a segment boundary; a
    /// pattern without `**` matches exactly.
    pub path: String,

    /// `lb://<service>` resolves through the registry; `http(s)://host:port`
    /// dials directly.
    pub uri: String,

    /// Leading path segments dropped before forwarding.
    #[serde(default)]
    pub strip_prefix: usize,

    /// Request body limit for this route; `None` uses `upstream.max_body_bytes`.
    #[serde(default)]
    pub max_body_bytes: Option<u64>,

    #[serde(default)]
    pub fallback: Option<RouteFallbackConfig>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub filters: Vec<FilterConfig>,
}

/// A route's degraded response, rendered as the standard 503 JSON payload
/// around `message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteFallbackConfig {
    /// Also serve this entry locally at the given path.
    #[serde(default)]
    pub path: Option<String>,

    #[serde(default)]
    pub message: Option<String>,
}

/// Route filters, applied in declaration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterConfig {
    RequestHeader(HeaderFilterConfig),
    ResponseHeader(HeaderFilterConfig),
    DedupeResponseHeader(DedupeFilterConfig),
    CircuitBreaker(CircuitBreakerFilterConfig),
    Retry(RetryFilterConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderFilterConfig {
    pub name: String,

    #[serde(default)]
    pub value: String,

    #[serde(default)]
    pub action: HeaderAction,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderAction {
    #[default]
    Set,
    Add,
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupeFilterConfig {
    /// Space-separated header names.
    pub name: String,

    #[serde(default)]
    pub strategy: DedupeStrategy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupeStrategy {
    #[default]
    #[serde(alias = "RETAIN_FIRST")]
    RetainFirst,
    #[serde(alias = "RETAIN_LAST")]
    RetainLast,
    #[serde(alias = "RETAIN_UNIQUE")]
    RetainUnique,
}

/// Unset fields inherit from the top-level `[circuit_breaker]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CircuitBreakerFilterConfig {
    /// Breaker identity; defaults to the route id. Routes naming the same
    /// breaker share its state.
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub sliding_window_size: Option<usize>,

    #[serde(default)]
    pub failure_rate_threshold: Option<f64>,

    #[serde(default, with = "opt_duration_str")]
    pub wait_duration: Option<Duration>,

    #[serde(default)]
    pub permitted_half_open_calls: Option<u32>,

    #[serde(default)]
    pub failure_statuses: Option<Vec<u16>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryFilterConfig {
    /// Total attempts, the first call included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_statuses")]
    pub statuses: Vec<u16>,

    /// Methods eligible for reissue. Empty means every method.
    #[serde(default = "default_retry_methods")]
    pub methods: Vec<String>,

    #[serde(default, with = "duration_str")]
    pub backoff: Duration,
}

impl Default for RetryFilterConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            statuses: default_retry_statuses(),
            methods: default_retry_methods(),
            backoff: Duration::ZERO,
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_statuses() -> Vec<u16> {
    vec![500, 502, 503]
}

fn default_retry_methods() -> Vec<String> {
    vec!["GET".to_string()]
}
