//! # Command Flow Runtime
//!
//! Tokio runtime for the Command Flow architecture.
//!
//! This crate drives effects: it spawns their result streams, deduplicates
//! commands by key, cancels in-flight work, retries transient failures and
//! folds outputs back into state.
//!
//! ## Core Components
//!
//! - **`IdempotentPipeline`**: At most one in-flight execution per command key
//! - **`CommandDispatcher`**: Routes a command to every pipeline of its family
//! - **`ReactiveCommand`**: Triggerable command with a shared result feed
//! - **Retry**: Exponential backoff with transient/terminal classification
//!
//! ## Example
//!
//! ```
//! use command_flow_core::command::Command;
//! use command_flow_core::effect::{just, FnEffect};
//! use command_flow_core::state::ReactiveState;
//! use command_flow_core::reducer::FnReducer;
//! use command_flow_runtime::{CommandDispatcher, IdempotentPipeline, PipelineConfig};
//! use std::sync::Arc;
//!
//! #[derive(Clone, Debug)]
//! struct Refresh(u32);
//!
//! impl Command for Refresh {
//!     fn name(&self) -> &'static str { "refresh" }
//! }
//!
//! # tokio_test::block_on(async {
//! let total = ReactiveState::new(0u32);
//! let pipeline = IdempotentPipeline::with_reducer(
//!     PipelineConfig::new("refresh"),
//!     FnEffect::new(|cmd: Refresh, _| just(cmd.0)),
//!     |cmd: &Refresh| format!("refresh:{}", cmd.0),
//!     total.clone(),
//!     FnReducer::new(|sum: &u32, _: &Refresh, n: &u32| sum + n),
//! );
//!
//! let dispatcher = CommandDispatcher::new();
//! dispatcher.register(Arc::new(pipeline)).expect("register");
//! let handles = dispatcher.dispatch(Refresh(2)).expect("dispatch");
//! assert_eq!(handles.len(), 1);
//! # });
//! ```

/// Retry logic with exponential backoff
pub mod retry;

/// Prometheus metrics for observability
pub mod metrics;

/// Idempotent command pipelines
pub mod pipeline;

/// Routing commands to pipelines
pub mod dispatcher;

/// Triggerable commands with shared results
pub mod reactive_command;

/// Error types for the runtime
pub mod error {
    use command_flow_core::error::KeyError;
    use thiserror::Error;

    /// Errors returned when starting command executions.
    ///
    /// Effect failures are never returned here; they are reported through
    /// failure feeds and status cells.
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum PipelineError {
        /// The idempotency key could not be derived
        #[error("Cannot derive command key: {0}")]
        Key(#[from] KeyError),

        /// `execute` was called outside a Tokio runtime
        #[error("No Tokio runtime available to drive the effect")]
        NoRuntime,

        /// The command or dispatcher has been disposed
        #[error("Command target has been disposed")]
        Disposed,
    }
}

/// Runtime configuration
pub mod config {
    use crate::retry::RetryPolicy;

    /// Configuration for an [`IdempotentPipeline`](crate::pipeline::IdempotentPipeline).
    #[derive(Debug, Clone, PartialEq)]
    pub struct PipelineConfig {
        /// Pipeline name, used in logs and metric labels
        pub name: String,
        /// Retry policy wrapped around every execution; `None` runs the
        /// effect once
        pub retry_policy: Option<RetryPolicy>,
    }

    impl PipelineConfig {
        /// Create a configuration without retries.
        #[must_use]
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                retry_policy: None,
            }
        }

        /// Set the retry policy
        #[must_use]
        pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
            self.retry_policy = Some(policy);
            self
        }

        /// Run effects once, without retries
        #[must_use]
        pub fn without_retry(mut self) -> Self {
            self.retry_policy = None;
            self
        }
    }

    impl Default for PipelineConfig {
        fn default() -> Self {
            Self::new("pipeline")
        }
    }
}

pub use config::PipelineConfig;
pub use dispatcher::CommandDispatcher;
pub use error::PipelineError;
pub use pipeline::{CommandPipeline, ExecutionHandle, IdempotentPipeline, PipelineFailure};
pub use reactive_command::ReactiveCommand;
pub use retry::{RetryPolicy, retry_with_backoff};

#[cfg(test)]
mod tests {
    use super::*;
    use command_flow_core::error::KeyError;
    use std::time::Duration;

    #[test]
    fn test_pipeline_config_builders() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(50))
            .build();
        let config = PipelineConfig::new("orders").with_retry_policy(policy.clone());

        assert_eq!(config.name, "orders");
        assert_eq!(config.retry_policy, Some(policy));
        assert_eq!(config.without_retry().retry_policy, None);
        assert_eq!(PipelineConfig::default().name, "pipeline");
    }

    #[test]
    fn test_key_error_converts() {
        let error: PipelineError = KeyError::Unavailable("no user".into()).into();
        assert_eq!(
            error.to_string(),
            "Cannot derive command key: Command key unavailable: no user"
        );
    }
}
