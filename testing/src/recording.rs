//! Observers that record what they see.

use command_flow_core::state::ReactiveState;
use command_flow_core::subject::{Notification, Subject, Subscription};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Records every value delivered to it, and whether the source completed.
///
/// Clones share the same recording.
///
/// # Example
///
/// ```
/// use command_flow_core::state::ReactiveState;
/// use command_flow_testing::RecordingObserver;
///
/// let cell = ReactiveState::new(0);
/// let recorder = RecordingObserver::new();
/// let _sub = recorder.attach_state(&cell);
///
/// let _ = cell.set(1);
/// let _ = cell.set(1);
/// let _ = cell.set(2);
/// cell.dispose();
///
/// assert_eq!(recorder.values(), vec![1, 2]);
/// assert!(recorder.is_completed());
/// ```
pub struct RecordingObserver<T> {
    values: Arc<Mutex<Vec<T>>>,
    completed: Arc<AtomicBool>,
}

impl<T> Clone for RecordingObserver<T> {
    fn clone(&self) -> Self {
        Self {
            values: Arc::clone(&self.values),
            completed: Arc::clone(&self.completed),
        }
    }
}

impl<T> Default for RecordingObserver<T> {
    fn default() -> Self {
        Self {
            values: Arc::new(Mutex::new(Vec::new())),
            completed: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl<T> RecordingObserver<T>
where
    T: Clone + Send + 'static,
{
    /// An empty recording.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn recorded(&self) -> MutexGuard<'_, Vec<T>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one value.
    pub fn record(&self, value: &T) {
        self.recorded().push(value.clone());
    }

    /// A value observer feeding this recording.
    #[must_use]
    pub fn observer(&self) -> impl Fn(&T) + Send + Sync + use<T> {
        let recorder = self.clone();
        move |value| recorder.record(value)
    }

    /// A notification observer feeding this recording.
    #[must_use]
    pub fn notification_observer(&self) -> impl Fn(Notification<'_, T>) + Send + Sync + use<T> {
        let recorder = self.clone();
        move |notification| match notification {
            Notification::Next(value) => recorder.record(value),
            Notification::Completed => recorder.completed.store(true, Ordering::SeqCst),
        }
    }

    /// Subscribe to a subject.
    pub fn attach(&self, subject: &Subject<T>) -> Subscription {
        subject.subscribe_notifications(self.notification_observer())
    }

    /// Subscribe to a state cell's changes.
    pub fn attach_state(&self, state: &ReactiveState<T>) -> Subscription
    where
        T: PartialEq + Sync,
    {
        state.changes_notifications(self.notification_observer())
    }

    /// Everything recorded so far.
    #[must_use]
    pub fn values(&self) -> Vec<T> {
        self.recorded().clone()
    }

    /// Number of recorded values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.recorded().len()
    }

    /// Whether nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.recorded().is_empty()
    }

    /// The latest recorded value.
    #[must_use]
    pub fn last(&self) -> Option<T> {
        self.recorded().last().cloned()
    }

    /// Whether the source sent its completion signal.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` values are recorded.
    ///
    /// Returns `false` on timeout.
    pub async fn wait_for_len(&self, count: usize, timeout: Duration) -> bool {
        crate::wait_until(timeout, || self.len() >= count).await
    }
}

impl<T> fmt::Debug for RecordingObserver<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingObserver")
            .field(
                "values",
                &*self.values.lock().unwrap_or_else(PoisonError::into_inner),
            )
            .field("completed", &self.completed.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_subject_values_and_completion() {
        let subject = Subject::new();
        let recorder = RecordingObserver::new();
        let _sub = recorder.attach(&subject);

        subject.next(&"a");
        subject.next(&"b");
        assert!(!recorder.is_completed());
        subject.complete();

        assert_eq!(recorder.values(), vec!["a", "b"]);
        assert_eq!(recorder.last(), Some("b"));
        assert!(recorder.is_completed());
    }

    #[test]
    fn test_plain_observer_records_values_only() {
        let subject = Subject::new();
        let recorder = RecordingObserver::new();
        let _sub = subject.subscribe(recorder.observer());

        subject.next(&1);
        subject.complete();

        assert_eq!(recorder.values(), vec![1]);
        assert!(!recorder.is_completed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_len_times_out() {
        let recorder = RecordingObserver::<u8>::new();
        assert!(!recorder.wait_for_len(1, Duration::from_millis(50)).await);
        recorder.record(&1);
        assert!(recorder.wait_for_len(1, Duration::from_millis(50)).await);
    }
}
