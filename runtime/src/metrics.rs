//! Prometheus metrics for pipelines, reactive commands and retries.
//!
//! The runtime records through the `metrics` facade unconditionally; nothing
//! is exported until an application installs a recorder. [`MetricsRecorder`]
//! installs the Prometheus one and renders the text exposition format.
//!
//! # Example
//!
//! ```rust,no_run
//! use command_flow_runtime::metrics::MetricsRecorder;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut recorder = MetricsRecorder::new();
//! recorder.install()?;
//!
//! if let Some(text) = recorder.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Metric names recorded by the runtime.
pub mod names {
    /// Executions started by idempotent pipelines
    pub const PIPELINE_STARTED: &str = "command_pipeline_started_total";
    /// Commands dropped because their key was already in flight
    pub const PIPELINE_DEDUPLICATED: &str = "command_pipeline_deduplicated_total";
    /// Executions cancelled by key, handle or shutdown
    pub const PIPELINE_CANCELLED: &str = "command_pipeline_cancelled_total";
    /// Executions that ended with an effect error
    pub const PIPELINE_FAILED: &str = "command_pipeline_failed_total";
    /// Executions that completed cleanly
    pub const PIPELINE_COMPLETED: &str = "command_pipeline_completed_total";
    /// Keys currently in flight
    pub const PIPELINE_IN_FLIGHT: &str = "command_pipeline_in_flight";
    /// Wall time of an execution, start to termination
    pub const PIPELINE_DURATION: &str = "command_pipeline_execution_duration_seconds";
    /// Reactive command executions started
    pub const COMMAND_EXECUTIONS: &str = "reactive_command_executions_total";
    /// Reactive command executions that failed
    pub const COMMAND_ERRORS: &str = "reactive_command_errors_total";
    /// Retries scheduled after a transient failure
    pub const RETRY_ATTEMPTS: &str = "retry_attempts_total";
    /// Failures propagated after the retry policy gave up
    pub const RETRY_EXHAUSTED: &str = "retry_exhausted_total";
}

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

/// Installs the Prometheus recorder and renders its output.
#[derive(Default)]
pub struct MetricsRecorder {
    handle: Option<PrometheusHandle>,
}

impl MetricsRecorder {
    /// Create an uninstalled recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Describe every runtime metric and install the global recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., in tests), this logs a
    /// warning and succeeds without a render handle.
    pub fn install(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
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
                    tracing::warn!(
                        "Metrics recorder already initialized, skipping re-initialization"
                    );
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
    /// Returns `None` if this recorder did not install the exporter.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    describe_counter!(
        names::PIPELINE_STARTED,
        "Total number of executions started by idempotent pipelines"
    );
    describe_counter!(
        names::PIPELINE_DEDUPLICATED,
        "Total number of commands dropped because their key was in flight"
    );
    describe_counter!(
        names::PIPELINE_CANCELLED,
        "Total number of pipeline executions cancelled"
    );
    describe_counter!(
        names::PIPELINE_FAILED,
        "Total number of pipeline executions ending in an effect error"
    );
    describe_counter!(
        names::PIPELINE_COMPLETED,
        "Total number of pipeline executions completing cleanly"
    );
    describe_gauge!(names::PIPELINE_IN_FLIGHT, "Number of keys currently in flight");
    describe_histogram!(
        names::PIPELINE_DURATION,
        "Time from execution start to completion or failure"
    );
    describe_counter!(
        names::COMMAND_EXECUTIONS,
        "Total number of reactive command executions"
    );
    describe_counter!(
        names::COMMAND_ERRORS,
        "Total number of reactive command executions that failed"
    );
    describe_counter!(
        names::RETRY_ATTEMPTS,
        "Total number of retries scheduled after transient failures"
    );
    describe_counter!(
        names::RETRY_EXHAUSTED,
        "Total number of failures propagated by the retry policy"
    );
}
