//! Prometheus metrics for the bootstrap and execution-context layer.
//!
//! This module provides metric collection for:
//! - Execution contexts (opened, committed, rolled back, close failures)
//! - Subsystem bootstrap failures, labelled by subsystem
//!
//! # Example
//!
//! ```rust,no_run
//! use agora_runtime::metrics::MetricsServer;
//!
//! let mut server = MetricsServer::new();
//! server.start()?;
//!
//! if let Some(text) = server.render() {
//!     println!("{text}");
//! }
//! # Ok::<(), agora_runtime::metrics::MetricsError>(())
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder plus the handle used to render scrape text.
///
/// The HTTP surface belongs to the web layer; it calls [`render`](Self::render)
/// from its `/metrics` route.
#[derive(Default)]
pub struct MetricsServer {
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a server with no recorder installed yet.
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Describe every metric and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), this logs a
    /// warning and succeeds without a handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!("Prometheus metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(
        "execution_context_opened_total",
        "Total number of execution contexts opened"
    );
    describe_counter!(
        "execution_context_commits_total",
        "Total number of transactions committed at context close"
    );
    describe_counter!(
        "execution_context_rollbacks_total",
        "Total number of transactions rolled back at context close"
    );
    describe_counter!(
        "execution_context_close_failures_total",
        "Total number of commit, rollback or release failures during close"
    );
    describe_histogram!(
        "execution_context_duration_seconds",
        "Time between opening and closing an execution context"
    );

    describe_counter!(
        "bootstrap_failures_total",
        "Total number of subsystem start-up failures, by subsystem"
    );
}

/// Execution context metrics recorder.
pub struct ExecutionMetrics;

impl ExecutionMetrics {
    /// Record a context being opened.
    pub fn record_open() {
        counter!("execution_context_opened_total").increment(1);
    }

    /// Record a commit at close.
    pub fn record_commit() {
        counter!("execution_context_commits_total").increment(1);
    }

    /// Record a rollback at close.
    pub fn record_rollback() {
        counter!("execution_context_rollbacks_total").increment(1);
    }

    /// Record a failed commit, rollback or release.
    pub fn record_close_failure(step: &'static str) {
        counter!("execution_context_close_failures_total", "step" => step).increment(1);
    }

    /// Record how long the context was open.
    pub fn record_duration(duration: Duration) {
        histogram!("execution_context_duration_seconds").record(duration.as_secs_f64());
    }
}

/// Bootstrap metrics recorder.
pub struct BootstrapMetrics;

impl BootstrapMetrics {
    /// Record a subsystem failing to start.
    pub fn record_failure(subsystem: &'static str) {
        counter!("bootstrap_failures_total", "subsystem" => subsystem).increment(1);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_metrics_server_creation() {
        let server = MetricsServer::new();
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[test]
    fn test_metrics_server_render() {
        let mut server = MetricsServer::new();
        server.start().unwrap();

        ExecutionMetrics::record_open();
        ExecutionMetrics::record_commit();
        BootstrapMetrics::record_failure("cache engine");

        // Another test may have installed the recorder first; then there is
        // no handle but the counters are still recorded.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("execution_context_opened_total"));
            assert!(rendered.contains("bootstrap_failures_total"));
        }
    }

    #[test]
    fn test_start_twice_is_tolerated() {
        let mut first = MetricsServer::new();
        let mut second = MetricsServer::new();

        assert!(first.start().is_ok());
        assert!(second.start().is_ok());
    }
}
