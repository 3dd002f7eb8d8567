//! Reactive State Cell.
//!
//! A [`ReactiveState`] owns one current value and broadcasts every distinct
//! new value to its observers synchronously, in subscription order.
//!
//! ```
//! use command_flow_core::state::ReactiveState;
//!
//! # fn main() -> Result<(), command_flow_core::error::StateError> {
//! let cell = ReactiveState::new(1);
//! cell.set(2)?;
//! cell.update(|v| v * 10)?;
//! assert_eq!(cell.value(), 20);
//! # Ok(())
//! # }
//! ```

use crate::disposable::Disposable;
use crate::error::StateError;
use crate::subject::{Notification, Subject, Subscription, lock};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

struct Inner<T> {
    value: Mutex<T>,
    changes: Subject<T>,
    disposed: AtomicBool,
}

/// Mutable single-value container broadcasting its changes.
///
/// Cloning yields another handle to the same cell; the creating component is
/// still considered the owner and is responsible for disposing it.
pub struct ReactiveState<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for ReactiveState<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> ReactiveState<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a cell holding `initial`.
    #[must_use]
    pub fn new(initial: T) -> Self {
        Self {
            inner: Arc::new(Inner {
                value: Mutex::new(initial),
                changes: Subject::new(),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Current value.
    ///
    /// Still readable after disposal (the last value is retained).
    #[must_use]
    pub fn value(&self) -> T {
        lock(&self.inner.value).clone()
    }

    /// Read the current value through a closure without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&lock(&self.inner.value))
    }

    /// Replace the value and notify observers.
    ///
    /// Setting a value equal to the current one is accepted but not
    /// broadcast.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Disposed`] if the cell has been disposed.
    pub fn set(&self, value: T) -> Result<(), StateError> {
        self.update(move |_| value)
    }

    /// Replace the value with `f(current)` and notify observers.
    ///
    /// `f` runs exactly once, while the cell is locked, so concurrent updates
    /// never observe each other's intermediate state.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Disposed`] if the cell has been disposed.
    pub fn update<F>(&self, f: F) -> Result<(), StateError>
    where
        F: FnOnce(&T) -> T,
    {
        let changed = {
            let mut current = lock(&self.inner.value);
            if self.inner.disposed.load(Ordering::Acquire) {
                return Err(StateError::Disposed);
            }
            let next = f(&current);
            if next == *current {
                None
            } else {
                *current = next.clone();
                Some(next)
            }
        };

        if let Some(value) = changed {
            self.inner.changes.next(&value);
        }
        Ok(())
    }

    /// Observe all future distinct values.
    pub fn changes<F>(&self, on_change: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.inner.changes.subscribe(on_change)
    }

    /// Observe future values and the completion signal sent on disposal.
    pub fn changes_notifications<F>(&self, observer: F) -> Subscription
    where
        F: Fn(Notification<'_, T>) + Send + Sync + 'static,
    {
        self.inner.changes.subscribe_notifications(observer)
    }

    /// Dispose the cell: further writes fail and observers are completed.
    pub fn dispose(&self) {
        let already = {
            let _guard = lock(&self.inner.value);
            self.inner.disposed.swap(true, Ordering::AcqRel)
        };
        if !already {
            self.inner.changes.complete();
        }
    }

    /// Whether [`dispose`](Self::dispose) has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }
}

impl<T> Disposable for ReactiveState<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn dispose(&self) {
        Self::dispose(self);
    }
}

impl<T> fmt::Debug for ReactiveState<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactiveState")
            .field("value", &*lock(&self.inner.value))
            .field("disposed", &self.inner.disposed.load(Ordering::Acquire))
            .finish()
    }
}
