//! Prometheus metrics for retention runs.
//!
//! Provides metrics for:
//! - Per-entity outcomes
//! - Records touched per collection
//! - Run-fatal errors

#[cfg(feature = "prometheus")]
use metrics::counter;
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::config::MetricsConfig;

/// Initialize the metrics system and start the scrape listener.
#[cfg(feature = "prometheus")]
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if !config.enabled {
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(config.listen)
        .install()
        .map_err(|e| MetricsError::Install(e.to_string()))?;

    tracing::info!(listen = %config.listen, "Prometheus exporter listening");
    Ok(())
}

/// Initialize the metrics system (no-op without prometheus feature).
#[cfg(not(feature = "prometheus"))]
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if config.enabled {
        tracing::warn!(
            "Metrics are enabled in config but the 'prometheus' feature is not compiled. \
            Rebuild with: cargo build --features prometheus"
        );
    }
    Ok(())
}

/// Record one entity outcome.
///
/// # Arguments
/// * `plan` - The plan name
/// * `outcome` - "retired", "skipped" or "failed"
pub fn record_outcome(plan: &str, outcome: &str) {
    #[cfg(feature = "prometheus")]
    {
        counter!(
            "retention_outcomes_total",
            "plan" => plan.to_string(),
            "outcome" => outcome.to_string()
        )
        .increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (plan, outcome);
    }
}

/// Record records deleted, updated or archived in a collection.
pub fn record_records_affected(collection: &str, count: u64) {
    #[cfg(feature = "prometheus")]
    {
        counter!(
            "retention_records_affected_total",
            "collection" => collection.to_string()
        )
        .increment(count);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (collection, count);
    }
}

/// Record a run that ended on a fatal error.
pub fn record_run_error(plan: &str) {
    #[cfg(feature = "prometheus")]
    {
        counter!("retention_run_errors_total", "plan" => plan.to_string()).increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = plan;
    }
}

/// Metrics initialization errors.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Failed to install metrics recorder: {0}")]
    Install(String),
}
