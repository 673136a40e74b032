//! Observability: structured logging and metrics.
//!
//! - Logging goes through `tracing`; the subscriber is installed by the binary
//!   with a configurable format (pretty, compact, JSON)
//! - Prometheus metrics are recorded through the `metrics` facade and are
//!   no-ops unless the `prometheus` feature is compiled

pub mod metrics;
#[cfg(feature = "cli")]
mod tracing_init;

#[cfg(feature = "cli")]
pub use tracing_init::*;
