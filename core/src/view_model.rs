//! Explicit view-model bindings.
//!
//! A view-model lists the feeds a UI should re-render on through
//! [`Bindable::bindings`]. [`ViewModel::bind`] subscribes to every listed
//! feed and folds them into one `state_changed` notification, and owns the
//! resulting subscriptions in its [`ResourceArena`].
//!
//! # Example
//!
//! ```
//! use command_flow_core::state::ReactiveState;
//! use command_flow_core::view_model::{Bindable, Binding, ViewModel};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct Counter {
//!     count: ReactiveState<u32>,
//! }
//!
//! impl Bindable for Counter {
//!     fn bindings(&self) -> Vec<Binding> {
//!         vec![Binding::state("count", &self.count)]
//!     }
//! }
//!
//! let counter = Counter { count: ReactiveState::new(0) };
//! let vm = ViewModel::new();
//! vm.bind(&counter);
//!
//! let renders = Arc::new(AtomicUsize::new(0));
//! let r = Arc::clone(&renders);
//! let _render = vm.on_state_changed(move || { r.fetch_add(1, Ordering::SeqCst); });
//!
//! let _ = counter.count.set(1);
//! assert_eq!(renders.load(Ordering::SeqCst), 1);
//! ```

use crate::disposable::{Disposable, ResourceArena};
use crate::state::ReactiveState;
use crate::subject::{Subject, Subscription};
use std::fmt;
use std::sync::Arc;

type Notify = Arc<dyn Fn() + Send + Sync>;
type Attach = Box<dyn Fn(Notify) -> Subscription + Send + Sync>;

/// One bindable feed of a view-model.
pub struct Binding {
    name: &'static str,
    attach: Attach,
}

impl Binding {
    /// A binding from a custom attach function.
    pub fn new<F>(name: &'static str, attach: F) -> Self
    where
        F: Fn(Notify) -> Subscription + Send + Sync + 'static,
    {
        Self {
            name,
            attach: Box::new(attach),
        }
    }

    /// Bind to the change feed of a state cell.
    pub fn state<T>(name: &'static str, state: &ReactiveState<T>) -> Self
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        let state = state.clone();
        Self::new(name, move |notify| state.changes(move |_| notify()))
    }

    /// Bind to every value of a subject.
    pub fn subject<T>(name: &'static str, subject: &Subject<T>) -> Self
    where
        T: 'static,
    {
        let subject = subject.clone();
        Self::new(name, move |notify| subject.subscribe(move |_| notify()))
    }

    /// Binding name, for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    fn attach(&self, notify: Notify) -> Subscription {
        (self.attach)(notify)
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding").field("name", &self.name).finish()
    }
}

/// Something that exposes UI-bound feeds.
pub trait Bindable {
    /// Every feed a consumer should observe.
    fn bindings(&self) -> Vec<Binding>;
}

/// Base for view-models: a resource arena plus a `state_changed` signal.
#[derive(Debug, Default)]
pub struct ViewModel {
    arena: ResourceArena,
    state_changed: Subject<()>,
}

impl ViewModel {
    /// Create an empty view-model base.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The arena owning this view-model's resources.
    #[must_use]
    pub const fn arena(&self) -> &ResourceArena {
        &self.arena
    }

    /// Register a resource for teardown and return it.
    pub fn track<R>(&self, resource: R) -> R
    where
        R: Disposable + Clone + 'static,
    {
        self.arena.track(resource)
    }

    /// Keep a subscription alive until the view-model is disposed.
    pub fn keep(&self, subscription: Subscription) {
        self.arena.adopt(subscription);
    }

    /// Subscribe to every binding of `source`; each emission raises
    /// `state_changed`. Returns the number of bindings attached.
    pub fn bind(&self, source: &impl Bindable) -> usize {
        let bindings = source.bindings();
        for binding in &bindings {
            let signal = self.state_changed.clone();
            let subscription = binding.attach(Arc::new(move || {
                signal.next(&());
            }));
            tracing::trace!(binding = binding.name(), "Attached view-model binding");
            self.arena.adopt(subscription);
        }
        bindings.len()
    }

    /// Observe re-render requests.
    pub fn on_state_changed<F>(&self, f: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.state_changed.subscribe(move |_| f())
    }

    /// Request a re-render manually.
    pub fn raise_state_changed(&self) {
        self.state_changed.next(&());
    }

    /// Release every owned resource and complete `state_changed`.
    pub fn dispose(&self) {
        self.arena.dispose();
        self.state_changed.complete();
    }

    /// Whether [`dispose`](Self::dispose) has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.arena.is_disposed()
    }
}

impl Disposable for ViewModel {
    fn dispose(&self) {
        Self::dispose(self);
    }
}
