//! Async Status Tracker.
//!
//! [`StatusTracker`] wraps result streams so that a shared status cell
//! reflects whether any tracked operation is in flight:
//!
//! | Event                                   | Counter | Status                    |
//! |-----------------------------------------|---------|---------------------------|
//! | wrapped stream first polled             | +1      | `Loading` on 0 → 1        |
//! | source completes (or stream is dropped) | −1      | `Idle` on → 0             |
//! | source yields `Err(cause)`              | −1      | `Error(cause)`, always    |
//!
//! An error always surfaces, but a later clean completion of a different
//! operation that brings the counter to zero resets the status to `Idle`.

use crate::disposable::Disposable;
use crate::effect::ResultStream;
use crate::error::EffectError;
use crate::state::ReactiveState;
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Derived view of tracked operations.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AsyncStatus {
    /// Nothing in flight
    #[default]
    Idle,
    /// At least one operation in flight
    Loading,
    /// The most recent terminated operation failed
    Error(EffectError),
}

impl AsyncStatus {
    /// Whether the status is [`AsyncStatus::Idle`].
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Whether the status is [`AsyncStatus::Loading`].
    #[must_use]
    pub const fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    /// The failure cause, if any.
    #[must_use]
    pub const fn error(&self) -> Option<&EffectError> {
        match self {
            Self::Error(error) => Some(error),
            _ => None,
        }
    }
}

/// Counts in-flight operations and drives a status cell.
#[derive(Clone)]
pub struct StatusTracker {
    status: ReactiveState<AsyncStatus>,
    in_flight: Arc<AtomicUsize>,
}

impl StatusTracker {
    /// Create a tracker writing into `status`.
    #[must_use]
    pub fn new(status: ReactiveState<AsyncStatus>) -> Self {
        Self {
            status,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The status cell this tracker writes to.
    #[must_use]
    pub const fn status(&self) -> &ReactiveState<AsyncStatus> {
        &self.status
    }

    /// Number of tracked operations currently running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wrap `source`; values and errors pass through unchanged.
    pub fn track<T>(&self, source: ResultStream<T>) -> ResultStream<T>
    where
        T: Send + 'static,
    {
        self.track_with(move || Ok(source))
    }

    /// Wrap a deferred source.
    ///
    /// `factory` runs when the returned stream is first polled. If it fails,
    /// the status becomes `Error`, the counter stays balanced, and the error
    /// is yielded as the only item.
    pub fn track_with<T, F>(&self, factory: F) -> ResultStream<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<ResultStream<T>, EffectError> + Send + 'static,
    {
        let tracker = self.clone();
        Box::pin(async_stream::stream! {
            let mut guard = TrackGuard::enter(tracker);
            match factory() {
                Err(error) => {
                    guard.finish(Some(error.clone()));
                    yield Err(error);
                }
                Ok(mut source) => {
                    let mut failure = None;
                    while let Some(item) = source.next().await {
                        match item {
                            Ok(value) => {
                                yield Ok(value);
                            }
                            Err(error) => {
                                failure = Some(error);
                                break;
                            }
                        }
                    }
                    match failure {
                        Some(error) => {
                            guard.finish(Some(error.clone()));
                            yield Err(error);
                        }
                        None => guard.finish(None),
                    }
                }
            }
        })
    }

    fn set_status(&self, status: AsyncStatus) {
        if self.status.set(status).is_err() {
            tracing::trace!("Status cell disposed; dropping status update");
        }
    }
}

impl fmt::Debug for StatusTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusTracker")
            .field("status", &self.status.value())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// One tracked operation; decrements exactly once, on finish or drop.
struct TrackGuard {
    tracker: StatusTracker,
    finished: bool,
}

impl TrackGuard {
    fn enter(tracker: StatusTracker) -> Self {
        if tracker.in_flight.fetch_add(1, Ordering::SeqCst) == 0 {
            tracker.set_status(AsyncStatus::Loading);
        }
        Self {
            tracker,
            finished: false,
        }
    }

    fn finish(&mut self, failure: Option<EffectError>) {
        if self.finished {
            return;
        }
        self.finished = true;

        let remaining = self.tracker.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        match failure {
            Some(error) => self.tracker.set_status(AsyncStatus::Error(error)),
            None if remaining == 0 => self.tracker.set_status(AsyncStatus::Idle),
            None => {}
        }
    }
}

impl Drop for TrackGuard {
    fn drop(&mut self) {
        // Dropped mid-stream: the consumer cancelled.
        self.finish(None);
    }
}

/// A data cell paired with the status of the operations that feed it.
///
/// # Example
///
/// ```
/// use command_flow_core::async_state::{AsyncState, AsyncStatus};
///
/// let profile = AsyncState::new(None::<String>);
/// assert_eq!(profile.status().value(), AsyncStatus::Idle);
/// assert_eq!(profile.data().value(), None);
/// ```
pub struct AsyncState<T> {
    data: ReactiveState<T>,
    tracker: StatusTracker,
}

impl<T> Clone for AsyncState<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            tracker: self.tracker.clone(),
        }
    }
}

impl<T> AsyncState<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create an idle state holding `initial`.
    #[must_use]
    pub fn new(initial: T) -> Self {
        Self {
            data: ReactiveState::new(initial),
            tracker: StatusTracker::new(ReactiveState::new(AsyncStatus::Idle)),
        }
    }

    /// The data cell.
    #[must_use]
    pub const fn data(&self) -> &ReactiveState<T> {
        &self.data
    }

    /// The status cell.
    #[must_use]
    pub const fn status(&self) -> &ReactiveState<AsyncStatus> {
        self.tracker.status()
    }

    /// The tracker feeding the status cell.
    #[must_use]
    pub const fn tracker(&self) -> &StatusTracker {
        &self.tracker
    }

    /// Dispose both cells.
    pub fn dispose(&self) {
        self.data.dispose();
        self.tracker.status().dispose();
    }
}

impl<T> Disposable for AsyncState<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn dispose(&self) {
        Self::dispose(self);
    }
}

impl<T> fmt::Debug for AsyncState<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncState")
            .field("data", &self.data)
            .field("tracker", &self.tracker)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subject::lock;
    use futures::FutureExt;
    use futures::channel::oneshot;
    use futures::stream;
    use std::sync::Mutex;

    fn gated(rx: oneshot::Receiver<Result<u32, EffectError>>) -> ResultStream<u32> {
        stream::once(async move {
            rx.await
                .unwrap_or_else(|_| Err(EffectError::failed("sender dropped")))
        })
        .boxed()
    }

    #[tokio::test]
    async fn single_operation_goes_loading_then_idle() {
        let state = AsyncState::new(0u32);
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&transitions);
        let _sub = state
            .status()
            .changes(move |s| lock(&sink).push(s.clone()));

        let (tx, rx) = oneshot::channel();
        let mut tracked = state.tracker().track(gated(rx));
        assert!(state.status().value().is_idle(), "tracking is lazy");

        assert!(tracked.next().now_or_never().is_none());
        assert!(state.status().value().is_loading());

        assert!(tx.send(Ok(7)).is_ok());
        assert_eq!(tracked.next().await, Some(Ok(7)));
        assert_eq!(tracked.next().await, None);

        assert_eq!(
            *lock(&transitions),
            vec![AsyncStatus::Loading, AsyncStatus::Idle]
        );
        assert_eq!(state.tracker().in_flight(), 0);
    }

    #[tokio::test]
    async fn error_surfaces_then_later_completion_resets_to_idle() {
        let state = AsyncState::new(0u32);
        let (tx_a, rx_a) = oneshot::channel();
        let (tx_b, rx_b) = oneshot::channel();
        let mut a = state.tracker().track(gated(rx_a));
        let mut b = state.tracker().track(gated(rx_b));

        assert!(a.next().now_or_never().is_none());
        assert!(b.next().now_or_never().is_none());
        assert_eq!(state.tracker().in_flight(), 2);

        let cause = EffectError::http(500, "boom");
        assert!(tx_a.send(Err(cause.clone())).is_ok());
        assert_eq!(a.next().await, Some(Err(cause.clone())));
        assert_eq!(state.status().value(), AsyncStatus::Error(cause));
        assert_eq!(state.tracker().in_flight(), 1);

        assert!(tx_b.send(Ok(1)).is_ok());
        assert_eq!(b.next().await, Some(Ok(1)));
        assert_eq!(b.next().await, None);
        assert_eq!(state.status().value(), AsyncStatus::Idle);
    }

    #[tokio::test]
    async fn failing_factory_reports_error_and_balances_counter() {
        let state = AsyncState::new(0u32);
        let tracked = state
            .tracker()
            .track_with::<u32, _>(|| Err(EffectError::failed("synchronous")));

        let items: Vec<_> = tracked.collect().await;
        assert_eq!(items, vec![Err(EffectError::failed("synchronous"))]);
        assert_eq!(
            state.status().value().error(),
            Some(&EffectError::failed("synchronous"))
        );
        assert_eq!(state.tracker().in_flight(), 0);
    }

    #[tokio::test]
    async fn dropping_tracked_stream_counts_as_completion() {
        let state = AsyncState::new(0u32);
        let (_tx, rx) = oneshot::channel();
        let mut tracked = state.tracker().track(gated(rx));

        assert!(tracked.next().now_or_never().is_none());
        assert!(state.status().value().is_loading());

        drop(tracked);
        assert_eq!(state.tracker().in_flight(), 0);
        assert!(state.status().value().is_idle());
    }

    #[test]
    fn dispose_disposes_both_cells() {
        let state = AsyncState::new(1u32);
        Disposable::dispose(&state);
        assert!(state.data().is_disposed());
        assert!(state.status().is_disposed());
    }
}
