//! Shared configuration, error types, IDs, and observability primitives for czar crates.
//!
//! Architecture role:
//! - defines the czar configuration passed to the dispatch and merge layers
//! - provides common [`CzarError`] / [`Result`] contracts and the error classes
//!   used to decide between retrying and aborting a query
//! - hosts the injected prometheus metrics registry and optional exporter
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]
//! - `metrics_exporter` (feature-gated)
//!
//! Feature flags:
//! - `profiling`: enables the metrics HTTP exporter helpers.

pub mod config;
pub mod error;
pub mod ids;
pub mod metrics;
#[cfg(feature = "profiling")]
pub mod metrics_exporter;

pub use config::{CzarConfig, MergeEngine};
pub use error::{CzarError, ErrorClass, QueryError, Result};
pub use ids::*;
pub use metrics::MetricsRegistry;
#[cfg(feature = "profiling")]
pub use metrics_exporter::run_metrics_exporter;

/// Current wall clock in unix milliseconds.
pub fn now_ms() -> Result<u64> {
    Ok(std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|e| CzarError::Dispatch(format!("clock error: {e}")))?
        .as_millis() as u64)
}
