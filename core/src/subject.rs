//! Synchronous fan-out broadcaster.
//!
//! [`Subject`] is the publish/subscribe primitive everything else in this
//! crate is built on. It keeps an ordered list of observers and delivers each
//! notification to all of them, in subscription order, on the calling thread.
//!
//! # Delivery
//!
//! ```text
//!  next(&v) ──► snapshot observers ──► observer 1 ──► observer 2 ──► ...
//!                (lock released)
//! ```
//!
//! Observers are invoked outside the internal lock, so an observer may
//! subscribe, unsubscribe or publish again from inside its callback.
//!
//! # Example
//!
//! ```
//! use command_flow_core::subject::Subject;
//! use std::sync::{Arc, Mutex};
//!
//! let subject = Subject::new();
//! let seen = Arc::new(Mutex::new(Vec::new()));
//!
//! let sink = Arc::clone(&seen);
//! let subscription = subject.subscribe(move |v: &i32| {
//!     sink.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(*v);
//! });
//!
//! subject.next(&1);
//! subject.next(&2);
//! drop(subscription);
//! subject.next(&3);
//!
//! assert_eq!(*seen.lock().unwrap_or_else(std::sync::PoisonError::into_inner), vec![1, 2]);
//! ```

use crate::disposable::Disposable;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// Observer callbacks never run under these locks, so a poisoned lock only
/// means a panic happened between two plain field updates.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A single notification delivered to an observer.
#[derive(Debug)]
pub enum Notification<'a, T> {
    /// A new value
    Next(&'a T),
    /// The source terminated; no further values follow
    Completed,
}

type Observer<T> = Arc<dyn Fn(Notification<'_, T>) + Send + Sync>;

struct SubjectState<T> {
    observers: Vec<(u64, Observer<T>)>,
    next_id: u64,
    completed: bool,
}

/// Ordered, synchronous broadcaster of `T` values.
///
/// Cloning a `Subject` yields another handle to the same observer list.
pub struct Subject<T> {
    state: Arc<Mutex<SubjectState<T>>>,
}

impl<T> Clone for Subject<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> Default for Subject<T>
where
    T: 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Subject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("Subject")
            .field("observers", &state.observers.len())
            .field("completed", &state.completed)
            .finish()
    }
}

impl<T> Subject<T>
where
    T: 'static,
{
    /// Create a subject with no observers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SubjectState {
                observers: Vec::new(),
                next_id: 0,
                completed: false,
            })),
        }
    }

    /// Subscribe to values only.
    pub fn subscribe<F>(&self, on_next: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.subscribe_notifications(move |notification| {
            if let Notification::Next(value) = notification {
                on_next(value);
            }
        })
    }

    /// Subscribe to values and to the completion signal.
    ///
    /// Subscribing to an already completed subject delivers
    /// [`Notification::Completed`] immediately and returns an inert
    /// subscription.
    pub fn subscribe_notifications<F>(&self, observer: F) -> Subscription
    where
        F: Fn(Notification<'_, T>) + Send + Sync + 'static,
    {
        let mut state = lock(&self.state);
        if state.completed {
            drop(state);
            observer(Notification::Completed);
            return Subscription::empty();
        }

        let id = state.next_id;
        state.next_id += 1;
        state.observers.push((id, Arc::new(observer)));
        drop(state);

        let weak: Weak<Mutex<SubjectState<T>>> = Arc::downgrade(&self.state);
        Subscription::new(move || {
            if let Some(state) = weak.upgrade() {
                lock(&state).observers.retain(|(observer_id, _)| *observer_id != id);
            }
        })
    }

    /// Deliver `value` to every current observer, in subscription order.
    ///
    /// Returns the number of observers reached. Values sent after
    /// [`complete`](Self::complete) are discarded.
    pub fn next(&self, value: &T) -> usize {
        let observers = {
            let state = lock(&self.state);
            if state.completed {
                return 0;
            }
            state
                .observers
                .iter()
                .map(|(_, observer)| Arc::clone(observer))
                .collect::<Vec<_>>()
        };

        for observer in &observers {
            observer(Notification::Next(value));
        }
        observers.len()
    }

    /// Terminate the subject.
    ///
    /// Every current observer receives [`Notification::Completed`] once and
    /// is then detached. Calling this more than once has no effect.
    pub fn complete(&self) {
        let observers = {
            let mut state = lock(&self.state);
            if state.completed {
                return;
            }
            state.completed = true;
            std::mem::take(&mut state.observers)
        };

        for (_, observer) in observers {
            observer(Notification::Completed);
        }
    }

    /// Whether [`complete`](Self::complete) has been called.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        lock(&self.state).completed
    }

    /// Number of attached observers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        lock(&self.state).observers.len()
    }
}

/// Token returned by every `subscribe` call.
///
/// Dropping the token (or calling [`unsubscribe`](Self::unsubscribe))
/// detaches the observer. Detaching twice is harmless.
#[must_use = "dropping a Subscription detaches its observer"]
pub struct Subscription {
    detach: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    /// Create a subscription that runs `detach` once when released.
    pub fn new<F>(detach: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            detach: Mutex::new(Some(Box::new(detach))),
        }
    }

    /// A subscription that is not attached to anything.
    pub fn empty() -> Self {
        Self {
            detach: Mutex::new(None),
        }
    }

    /// Detach the observer now.
    pub fn unsubscribe(&self) {
        let detach = lock(&self.detach).take();
        if let Some(detach) = detach {
            detach();
        }
    }

    /// Whether the observer is still attached.
    #[must_use]
    pub fn is_active(&self) -> bool {
        lock(&self.detach).is_some()
    }
}

impl Disposable for Subscription {
    fn dispose(&self) {
        self.unsubscribe();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn collector() -> (Arc<Mutex<Vec<i32>>>, impl Fn(&i32) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |v: &i32| lock(&sink).push(*v))
    }

    #[test]
    fn delivers_in_subscription_order() {
        let subject = Subject::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&order);
        let _a = subject.subscribe(move |v: &i32| lock(&first).push(("a", *v)));
        let second = Arc::clone(&order);
        let _b = subject.subscribe(move |v: &i32| lock(&second).push(("b", *v)));

        assert_eq!(subject.next(&7), 2);
        assert_eq!(*lock(&order), vec![("a", 7), ("b", 7)]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let subject = Subject::new();
        let (seen, observer) = collector();
        let subscription = subject.subscribe(observer);

        subject.next(&1);
        subscription.unsubscribe();
        subscription.unsubscribe();
        subject.next(&2);

        assert_eq!(*lock(&seen), vec![1]);
        assert_eq!(subject.observer_count(), 0);
    }

    #[test]
    fn complete_notifies_once_and_stops_values() {
        let subject = Subject::<i32>::new();
        let completions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&completions);
        let _sub = subject.subscribe_notifications(move |n| {
            if matches!(n, Notification::Completed) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        subject.complete();
        subject.complete();

        assert_eq!(completions.load(Ordering::SeqCst), 1);
        assert_eq!(subject.next(&1), 0);
    }

    #[test]
    fn late_subscriber_to_completed_subject_sees_completion() {
        let subject = Subject::<i32>::new();
        subject.complete();

        let completed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&completed);
        let subscription = subject.subscribe_notifications(move |n| {
            if matches!(n, Notification::Completed) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert!(!subscription.is_active());
    }

    #[test]
    fn observer_may_unsubscribe_itself_during_delivery() {
        let subject = Subject::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(AtomicUsize::new(0));

        let inner_slot = Arc::clone(&slot);
        let inner_calls = Arc::clone(&calls);
        let subscription = subject.subscribe(move |_: &i32| {
            inner_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(sub) = lock(&inner_slot).take() {
                sub.unsubscribe();
            }
        });
        *lock(&slot) = Some(subscription);

        subject.next(&1);
        subject.next(&2);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
