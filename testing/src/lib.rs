//! # Command Flow Testing
//!
//! Testing utilities and helpers for the Command Flow architecture.
//!
//! This crate provides:
//! - Mock implementations of Environment traits
//! - Scripted effects for driving pipelines and commands deterministically
//! - Recording observers for subjects and state cells
//! - A Given-When-Then harness for reducers
//! - Property-based testing strategies
//!
//! ## Example
//!
//! ```
//! use command_flow_core::state::ReactiveState;
//! use command_flow_testing::{RecordingObserver, test_clock};
//! use command_flow_core::environment::Clock;
//!
//! let clock = test_clock();
//! let cell = ReactiveState::new(clock.now());
//! let recorder = RecordingObserver::new();
//! let _sub = recorder.attach_state(&cell);
//!
//! assert!(recorder.is_empty());
//! ```

use chrono::{DateTime, Utc};
use command_flow_core::environment::Clock;
use std::time::Duration;

mod recording;
pub mod reducer_test;
mod scripted;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex, PoisonError};

    /// Fixed clock for deterministic tests
    ///
    /// Returns the same time until [`advance`](Self::advance) is called.
    /// Clones share the same time.
    ///
    /// # Example
    ///
    /// ```
    /// use command_flow_testing::mocks::FixedClock;
    /// use command_flow_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2);
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward.
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use command_flow_core::error::EffectError;
    use proptest::prelude::*;

    /// Any HTTP error status (400..=599).
    pub fn http_status() -> impl Strategy<Value = u16> {
        400u16..=599
    }

    /// Statuses the retry policy treats as transient.
    pub fn transient_status() -> impl Strategy<Value = u16> {
        http_status().prop_filter("terminal status", |status| {
            matches!(*status, 408 | 429) || (*status >= 500 && !matches!(*status, 501 | 505))
        })
    }

    /// Any effect error.
    pub fn effect_error() -> impl Strategy<Value = EffectError> {
        let message = "[a-z ]{0,16}";
        prop_oneof![
            message.prop_map(EffectError::AuthenticationUnavailable),
            message.prop_map(EffectError::Unreachable),
            message.prop_map(EffectError::Timeout),
            (http_status(), message).prop_map(|(status, msg)| EffectError::http(status, msg)),
            message.prop_map(EffectError::Failed),
        ]
    }

    /// Effect errors the retry policy treats as transient.
    pub fn transient_error() -> impl Strategy<Value = EffectError> {
        let message = "[a-z ]{0,16}";
        prop_oneof![
            message.prop_map(EffectError::Timeout),
            message.prop_map(EffectError::Failed),
            (transient_status(), message).prop_map(|(status, msg)| EffectError::http(status, msg)),
        ]
    }
}

/// Poll `predicate` every millisecond until it holds or `timeout` elapses.
///
/// Returns whether the predicate held. Works with a paused tokio clock.
pub async fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

/// Route `tracing` output to the test harness.
///
/// Honors `RUST_LOG`; safe to call from every test.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use mocks::{FixedClock, test_clock};
pub use recording::RecordingObserver;
pub use reducer_test::ReducerTest;
pub use scripted::{Script, ScriptedEffect};
