mod matcher;
mod pattern;
mod route;

pub use matcher::RouteTable;
pub use pattern::PathPattern;
pub use route::{CompiledRoute, RouteTarget};
