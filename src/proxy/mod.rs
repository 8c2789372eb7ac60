pub mod context;
pub mod fallback;
pub mod filter;
mod handler;
pub mod local;

pub use context::BoxBody;
pub use fallback::{FallbackDispatcher, FallbackEntry};
pub use handler::handle_request;
pub use local::LocalEndpoints;
