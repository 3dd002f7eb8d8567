//! Deterministic teardown.
//!
//! Every long-lived resource in the framework (subscriptions, state cells,
//! reactive commands, in-flight executions) implements [`Disposable`]. An
//! owning unit such as a view-model collects them in a [`ResourceArena`] and
//! releases all of them with a single call.

use crate::subject::lock;
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// A resource that can be released.
///
/// Implementations must be idempotent: disposing twice is a no-op.
pub trait Disposable: Send + Sync {
    /// Release the resource.
    fn dispose(&self);
}

impl<D> Disposable for std::sync::Arc<D>
where
    D: Disposable + ?Sized,
{
    fn dispose(&self) {
        (**self).dispose();
    }
}

/// Owner of a set of resources released together exactly once.
///
/// - Resources tracked after disposal are released immediately.
/// - Re-entrant disposal (a resource disposing its own arena) is ignored.
/// - Dropping the arena disposes it, so early returns during construction
///   still release what was tracked so far.
///
/// # Example
///
/// ```
/// use command_flow_core::disposable::ResourceArena;
/// use command_flow_core::state::ReactiveState;
///
/// let arena = ResourceArena::new();
/// let count = arena.track(ReactiveState::new(0));
///
/// arena.dispose();
/// assert!(count.is_disposed());
/// ```
#[derive(Default)]
pub struct ResourceArena {
    resources: Mutex<Vec<Box<dyn Disposable>>>,
    disposed: AtomicBool,
}

impl ResourceArena {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource and hand back a handle to it.
    ///
    /// `R` is usually a cheap shared handle (`Clone` over an `Arc`), so the
    /// arena keeps one clone and the caller keeps the other.
    pub fn track<R>(&self, resource: R) -> R
    where
        R: Disposable + Clone + 'static,
    {
        self.adopt(resource.clone());
        resource
    }

    /// Register a resource the arena takes sole ownership of.
    pub fn adopt<R>(&self, resource: R)
    where
        R: Disposable + 'static,
    {
        if self.disposed.load(Ordering::Acquire) {
            resource.dispose();
            return;
        }

        let mut resources = lock(&self.resources);
        // Re-check under the lock: dispose() may have run in between.
        if self.disposed.load(Ordering::Acquire) {
            drop(resources);
            resource.dispose();
            return;
        }
        resources.push(Box::new(resource));
    }

    /// Release every tracked resource, in registration order.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let resources = std::mem::take(&mut *lock(&self.resources));
        tracing::trace!(count = resources.len(), "Disposing resource arena");
        for resource in resources {
            resource.dispose();
        }
    }

    /// Whether [`dispose`](Self::dispose) has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Number of resources currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.resources).len()
    }

    /// Whether the arena holds no resources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Disposable for ResourceArena {
    fn dispose(&self) {
        Self::dispose(self);
    }
}

impl Drop for ResourceArena {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for ResourceArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceArena")
            .field("resources", &self.len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone, Default)]
    struct Counted(Arc<AtomicUsize>);

    impl Disposable for Counted {
        fn dispose(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn releases_each_resource_once() {
        let arena = ResourceArena::new();
        let a = arena.track(Counted::default());
        let b = arena.track(Counted::default());

        arena.dispose();
        arena.dispose();
        drop(arena);

        assert_eq!(a.0.load(Ordering::SeqCst), 1);
        assert_eq!(b.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn tracking_after_disposal_releases_immediately() {
        let arena = ResourceArena::new();
        arena.dispose();

        let late = arena.track(Counted::default());
        assert_eq!(late.0.load(Ordering::SeqCst), 1);
        assert!(arena.is_empty());
    }

    #[test]
    fn drop_disposes() {
        let resource = Counted::default();
        {
            let arena = ResourceArena::new();
            arena.adopt(resource.clone());
        }
        assert_eq!(resource.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reentrant_dispose_is_ignored() {
        struct Reenter(Arc<ResourceArena>, Counted);
        impl Disposable for Reenter {
            fn dispose(&self) {
                self.0.dispose();
                self.1.dispose();
            }
        }

        let arena = Arc::new(ResourceArena::new());
        let counted = Counted::default();
        arena.adopt(Reenter(Arc::clone(&arena), counted.clone()));

        arena.dispose();
        assert_eq!(counted.0.load(Ordering::SeqCst), 1);
    }
}
