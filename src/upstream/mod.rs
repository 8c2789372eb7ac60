pub mod circuit_breaker;
pub mod client;
pub mod resolver;
pub mod retry;
pub mod window;

pub use circuit_breaker::{BreakerMode, BreakerSnapshot, CallPermit, CircuitBreakerRegistry, RouteBreaker};
pub use client::{build_http_client, HttpClient};
pub use resolver::AddressResolver;
pub use retry::RetryPolicy;
pub use window::{CallOutcome, OutcomeWindow};
