//! Observability Module
//!
//! - `events`: structured registry lifecycle events
//! - `metrics`: counters and gauges through the `metrics` facade
//! - `tracing`: subscriber setup for binaries embedding the registry

pub mod events;
pub mod metrics;
pub mod tracing;

pub use self::metrics::describe_metrics;
pub use self::tracing::{init_tracing, TracingConfig};
