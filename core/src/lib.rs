//! # Command Flow Core
//!
//! Core traits and reactive primitives for the Command Flow architecture.
//!
//! This crate models UI-style application state as observable values and
//! routes user intents ("commands") through side-effect handlers
//! ("effects") whose results are folded back into state by pure reducers.
//! It has no dependency on an async runtime; the `command-flow-runtime`
//! crate drives effects on Tokio.
//!
//! ## Core Concepts
//!
//! - **Subject**: Ordered, synchronous fan-out broadcaster
//! - **`ReactiveState`**: Single-value cell broadcasting distinct changes
//! - **`AsyncState`**: Data cell plus an Idle/Loading/Error status
//! - **Command**: Immutable intent value, one enum per command family
//! - **Effect**: `(Command, CancellationToken) → ResultStream<Output>`, cold
//! - **Reducer**: Pure `(State, Command, Output) → State`
//! - **`EventBus`**: In-process typed publish/subscribe
//! - **`ResourceArena`**: Release-everything-once teardown
//!
//! ## Data Flow
//!
//! ```text
//! command ──► pipeline ──► effect stream ──► status tracker ──► reducer ──► state cell
//!                ▲                                                            │
//!                └──────── event bus (cancel / reset) ◄──── observers ◄───────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use command_flow_core::async_state::{AsyncState, AsyncStatus};
//! use command_flow_core::effect::ResultStream;
//! use futures::StreamExt;
//!
//! # tokio_test::block_on(async {
//! let orders = AsyncState::new(Vec::<String>::new());
//! let source: ResultStream<String> =
//!     Box::pin(futures::stream::iter(vec![Ok("order-1".to_string())]));
//!
//! let mut tracked = orders.tracker().track(source);
//! while let Some(Ok(order)) = tracked.next().await {
//!     let _ = orders.data().update(|list| {
//!         let mut next = list.clone();
//!         next.push(order.clone());
//!         next
//!     });
//! }
//!
//! assert_eq!(orders.data().value(), vec!["order-1".to_string()]);
//! assert_eq!(orders.status().value(), AsyncStatus::Idle);
//! # });
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use tokio_util::sync::CancellationToken;

/// Synchronous broadcaster and subscription tokens
pub mod subject;

/// Deterministic teardown of owned resources
pub mod disposable;

/// Reactive State Cell
pub mod state;

/// Async status tracking over result streams
pub mod async_state;

/// Effect contract and result streams
pub mod effect;

/// In-process application event bus
pub mod event_bus;

/// Explicit view-model binding registration
pub mod view_model;

/// Error types shared across the framework
pub mod error {
    use thiserror::Error;

    /// Failure produced by an effect.
    ///
    /// The variants carry enough structure for the retry policy to tell
    /// transient failures from terminal ones. The type is `Clone` because the
    /// same cause is both delivered to stream consumers and held by
    /// [`AsyncStatus::Error`](crate::async_state::AsyncStatus::Error).
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum EffectError {
        /// Credentials could not be obtained; never retried
        #[error("Authentication unavailable: {0}")]
        AuthenticationUnavailable(String),

        /// No network path exists (DNS failure, connection refused, or the
        /// transport produced no status code)
        #[error("Network unreachable: {0}")]
        Unreachable(String),

        /// The request timed out in transit
        #[error("Request timed out: {0}")]
        Timeout(String),

        /// The remote side answered with a non-success status code
        #[error("Request failed with status {status}: {message}")]
        Http {
            /// HTTP status code
            status: u16,
            /// Response reason or body excerpt
            message: String,
        },

        /// Any other failure
        #[error("Effect failed: {0}")]
        Failed(String),
    }

    impl EffectError {
        /// Create an [`EffectError::Http`].
        #[must_use]
        pub fn http(status: u16, message: impl Into<String>) -> Self {
            Self::Http {
                status,
                message: message.into(),
            }
        }

        /// Create an [`EffectError::Failed`].
        #[must_use]
        pub fn failed(message: impl Into<String>) -> Self {
            Self::Failed(message.into())
        }

        /// Status code, when the failure came from an HTTP response.
        #[must_use]
        pub const fn status(&self) -> Option<u16> {
            match self {
                Self::Http { status, .. } => Some(*status),
                _ => None,
            }
        }
    }

    /// Errors from [`ReactiveState`](crate::state::ReactiveState) operations.
    #[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
    pub enum StateError {
        /// The cell has been disposed and no longer accepts writes
        #[error("Reactive state cell has been disposed")]
        Disposed,
    }

    /// Errors from command key derivation.
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum KeyError {
        /// The key depends on context that is not available (for example no
        /// authenticated user)
        #[error("Command key unavailable: {0}")]
        Unavailable(String),
    }
}

/// Command module - Intent values and idempotency keys
///
/// A command family is a single enum whose variants are the requests the
/// family supports. Its effect declares one output type (usually an enum as
/// well), which keeps `Command → Output` pairs explicit without marker
/// traits per request.
pub mod command {
    use super::error::KeyError;
    use std::fmt::Debug;

    /// An immutable request for an action.
    ///
    /// Equal field values mean the same logical request.
    ///
    /// # Example
    ///
    /// ```
    /// use command_flow_core::command::Command;
    ///
    /// #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    /// enum OrderCommand {
    ///     Load { order_id: String },
    ///     LoadAll,
    /// }
    ///
    /// impl Command for OrderCommand {
    ///     fn name(&self) -> &'static str {
    ///         match self {
    ///             Self::Load { .. } => "order.load",
    ///             Self::LoadAll => "order.load_all",
    ///         }
    ///     }
    /// }
    /// ```
    pub trait Command: Clone + Debug + Send + Sync + 'static {
        /// Stable name used in logs and metrics
        fn name(&self) -> &'static str;
    }

    /// Derives the idempotency key of a command.
    ///
    /// Two commands with the same key running at the same time are
    /// duplicates; the pipeline drops the second one.
    pub trait CommandKey<C>: Send + Sync {
        /// Key for `command`.
        ///
        /// # Errors
        ///
        /// Returns [`KeyError::Unavailable`] when the key depends on context
        /// that is missing (the command is then not executed).
        fn key(&self, command: &C) -> Result<String, KeyError>;

        /// Key of the work currently tied to the ambient context, if known.
        ///
        /// Used during teardown (for example on sign-out) when no command
        /// value is at hand to derive the key from.
        fn current_key(&self) -> Option<String> {
            None
        }

        /// Called after `key` was claimed for a new execution. Not called
        /// for dropped duplicates or when `execute` fails.
        fn claimed(&self, _key: &str) {}
    }

    impl<C, F> CommandKey<C> for F
    where
        F: Fn(&C) -> String + Send + Sync,
    {
        fn key(&self, command: &C) -> Result<String, KeyError> {
            Ok(self(command))
        }
    }
}

/// Reducer module - Folding effect output into state
pub mod reducer {
    use std::marker::PhantomData;

    /// Pure fold of a command's output into the prior state.
    ///
    /// No I/O, no side effects, deterministic in its three inputs. The
    /// runtime calls it once per successful emission and never for cancelled
    /// or failed executions.
    ///
    /// # Example
    ///
    /// ```
    /// use command_flow_core::reducer::Reducer;
    ///
    /// struct Append;
    ///
    /// impl Reducer for Append {
    ///     type State = Vec<u32>;
    ///     type Command = ();
    ///     type Output = u32;
    ///
    ///     fn reduce(&self, state: &Vec<u32>, _: &(), output: &u32) -> Vec<u32> {
    ///         let mut next = state.clone();
    ///         next.push(*output);
    ///         next
    ///     }
    /// }
    ///
    /// assert_eq!(Append.reduce(&vec![1], &(), &2), vec![1, 2]);
    /// ```
    pub trait Reducer: Send + Sync {
        /// The state being folded
        type State;

        /// The command family that produced the output
        type Command;

        /// The effect output type
        type Output;

        /// Compute the next state.
        fn reduce(
            &self,
            state: &Self::State,
            command: &Self::Command,
            output: &Self::Output,
        ) -> Self::State;
    }

    /// [`Reducer`] backed by a closure.
    pub struct FnReducer<S, C, O, F> {
        f: F,
        _types: PhantomData<fn(&S, &C, &O) -> S>,
    }

    impl<S, C, O, F> FnReducer<S, C, O, F>
    where
        F: Fn(&S, &C, &O) -> S + Send + Sync,
    {
        /// Wrap `f` as a reducer.
        #[must_use]
        pub const fn new(f: F) -> Self {
            Self {
                f,
                _types: PhantomData,
            }
        }
    }

    impl<S, C, O, F> Reducer for FnReducer<S, C, O, F>
    where
        F: Fn(&S, &C, &O) -> S + Send + Sync,
    {
        type State = S;
        type Command = C;
        type Output = O;

        fn reduce(&self, state: &S, command: &C, output: &O) -> S {
            (self.f)(state, command, output)
        }
    }
}

/// Environment module - Dependency injection traits
///
/// External dependencies used by effects are abstracted behind traits and
/// handed to the effect at construction.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall clock.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

pub use async_state::{AsyncState, AsyncStatus, StatusTracker};
pub use command::{Command, CommandKey};
pub use disposable::{Disposable, ResourceArena};
pub use effect::{Effect, FnEffect, ResultStream};
pub use error::{EffectError, KeyError, StateError};
pub use event_bus::{AppEvent, EventBus};
pub use reducer::{FnReducer, Reducer};
pub use state::ReactiveState;
pub use subject::{Notification, Subject, Subscription};
