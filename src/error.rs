use http::StatusCode;
use std::fmt;

/// Every way a request can fail inside the gateway.
///
/// The request-path variants are always turned into a well-formed response
/// by the pipeline; `Http` and `Consul` only surface from discovery calls.
#[derive(Debug)]
pub enum GatewayError {
    RouteNotFound,
    BackendUnavailable(String),
    CallFailed(String),
    CallTimeout,
    RateLimited,
    CircuitOpen(String),
    InvalidRequest(String),
    PayloadTooLarge(u64),
    Http(reqwest::Error),
    Consul(String),
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::RouteNotFound => StatusCode::NOT_FOUND,
            GatewayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::BackendUnavailable(_)
            | GatewayError::CallFailed(_)
            | GatewayError::CallTimeout
            | GatewayError::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Http(_) | GatewayError::Consul(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Machine-readable status constant used in JSON error bodies.
    pub fn reason(&self) -> &'static str {
        match self.status() {
            StatusCode::NOT_FOUND => "NOT_FOUND",
            StatusCode::TOO_MANY_REQUESTS => "TOO_MANY_REQUESTS",
            StatusCode::BAD_REQUEST => "BAD_REQUEST",
            StatusCode::PAYLOAD_TOO_LARGE => "PAYLOAD_TOO_LARGE",
            StatusCode::SERVICE_UNAVAILABLE => "SERVICE_UNAVAILABLE",
            _ => "INTERNAL_SERVER_ERROR",
        }
    }

    /// Short label for access logs and the `outcome` metric label.
    pub fn outcome(&self) -> &'static str {
        match self {
            GatewayError::RouteNotFound => "route_not_found",
            GatewayError::BackendUnavailable(_) => "backend_unavailable",
            GatewayError::CallFailed(_) => "call_failed",
            GatewayError::CallTimeout => "call_timeout",
            GatewayError::RateLimited => "rate_limited",
            GatewayError::CircuitOpen(_) => "circuit_open",
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::PayloadTooLarge(_) => "payload_too_large",
            GatewayError::Http(_) | GatewayError::Consul(_) | GatewayError::Internal(_) => {
                "internal_error"
            }
        }
    }

    /// Whether this failure is answered by the fallback dispatcher rather
    /// than a plain error body.
    pub fn uses_fallback(&self) -> bool {
        matches!(
            self,
            GatewayError::BackendUnavailable(_)
                | GatewayError::CallFailed(_)
                | GatewayError::CallTimeout
                | GatewayError::CircuitOpen(_)
        )
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::RouteNotFound => write!(f, "no route matched"),
            GatewayError::BackendUnavailable(service) => {
                write!(f, "no live address for service: {}", service)
            }
            GatewayError::CallFailed(msg) => write!(f, "backend call failed: {}", msg),
            GatewayError::CallTimeout => write!(f, "backend call timed out"),
            GatewayError::RateLimited => write!(f, "too many requests"),
            GatewayError::CircuitOpen(name) => write!(f, "circuit breaker open: {}", name),
            GatewayError::InvalidRequest(msg) => write!(f, "invalid request: {}", msg),
            GatewayError::PayloadTooLarge(max) => {
                write!(f, "request body exceeds {} bytes", max)
            }
            GatewayError::Http(e) => write!(f, "http error: {}", e),
            GatewayError::Consul(msg) => write!(f, "consul error: {}", msg),
            GatewayError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_route_not_found() {
        assert_eq!(GatewayError::RouteNotFound.to_string(), "no route matched");
    }

    #[test]
    fn display_backend_unavailable() {
        assert_eq!(
            GatewayError::BackendUnavailable("cart-service".to_string()).to_string(),
            "no live address for service: cart-service"
        );
    }

    #[test]
    fn display_call_failed() {
        assert_eq!(
            GatewayError::CallFailed("conn refused".to_string()).to_string(),
            "backend call failed: conn refused"
        );
    }

    #[test]
    fn display_circuit_open() {
        assert_eq!(
            GatewayError::CircuitOpen("productCircuitBreaker".to_string()).to_string(),
            "circuit breaker open: productCircuitBreaker"
        );
    }

    #[test]
    fn display_consul() {
        assert_eq!(
            GatewayError::Consul("timeout".to_string()).to_string(),
            "consul error: timeout"
        );
    }

    #[test]
    fn status_mapping() {
        assert_eq!(GatewayError::RouteNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            GatewayError::RateLimited.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::CallTimeout.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::CircuitOpen("b".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::Internal("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn only_backend_failures_use_fallback() {
        assert!(GatewayError::BackendUnavailable("s".into()).uses_fallback());
        assert!(GatewayError::CallFailed("x".into()).uses_fallback());
        assert!(GatewayError::CallTimeout.uses_fallback());
        assert!(GatewayError::CircuitOpen("b".into()).uses_fallback());
        assert!(!GatewayError::RouteNotFound.uses_fallback());
        assert!(!GatewayError::RateLimited.uses_fallback());
        assert!(!GatewayError::InvalidRequest("x".into()).uses_fallback());
        assert!(!GatewayError::PayloadTooLarge(1).uses_fallback());
    }

    #[test]
    fn reason_constants() {
        assert_eq!(GatewayError::RouteNotFound.reason(), "NOT_FOUND");
        assert_eq!(GatewayError::RateLimited.reason(), "TOO_MANY_REQUESTS");
        assert_eq!(GatewayError::CallTimeout.reason(), "SERVICE_UNAVAILABLE");
        assert_eq!(GatewayError::PayloadTooLarge(1).reason(), "PAYLOAD_TOO_LARGE");
        assert_eq!(
            GatewayError::PayloadTooLarge(1).status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }
}
