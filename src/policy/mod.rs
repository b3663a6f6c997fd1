//! Policy engine: path containment and host allow/deny matching.

pub mod host;
pub mod path;

pub use host::{normalize_host, HostPolicy, PolicyViolation};
pub use path::{ContainmentError, PathJail};
