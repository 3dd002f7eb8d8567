//! Session expiry handling.
//!
//! On `SessionExpired` the user is sent to the login page with the current
//! location as `returnUrl`, unless already on the login page.

use command_flow_core::disposable::Disposable;
use command_flow_core::event_bus::{EventBus, SessionExpired};
use command_flow_core::subject::Subscription;
use std::sync::{Arc, Mutex, PoisonError};

/// Client-side navigation.
pub trait Navigator: Send + Sync {
    /// Current location relative to the application base, without a
    /// leading slash (for example `orders/42?tab=lines`).
    fn current_path(&self) -> String;

    /// Go to `path`; `replace` overwrites the current history entry.
    fn navigate_to(&self, path: &str, replace: bool);
}

/// A recorded navigation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Navigation {
    /// Target path
    pub path: String,
    /// Whether the history entry was replaced
    pub replace: bool,
}

#[derive(Debug, Default)]
struct History {
    current: String,
    entries: Vec<Navigation>,
}

/// [`Navigator`] keeping its history in memory. Clones share the history.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNavigator {
    history: Arc<Mutex<History>>,
}

impl InMemoryNavigator {
    /// A navigator positioned at `path`.
    #[must_use]
    pub fn at(path: impl Into<String>) -> Self {
        let navigator = Self::default();
        navigator.lock().current = path.into();
        navigator
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, History> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every navigation so far, oldest first.
    #[must_use]
    pub fn navigations(&self) -> Vec<Navigation> {
        self.lock().entries.clone()
    }
}

impl Navigator for InMemoryNavigator {
    fn current_path(&self) -> String {
        self.lock().current.clone()
    }

    fn navigate_to(&self, path: &str, replace: bool) {
        let mut history = self.lock();
        history.current = path.trim_start_matches('/').to_string();
        history.entries.push(Navigation {
            path: path.to_string(),
            replace,
        });
    }
}

/// Redirects to the login page when the session expires.
#[derive(Debug)]
pub struct SessionExpiredSubscriber {
    subscription: Subscription,
}

impl SessionExpiredSubscriber {
    /// Start listening on `bus`; `login_path` has no leading slash.
    #[must_use]
    pub fn new(
        bus: &EventBus,
        navigator: Arc<dyn Navigator>,
        login_path: impl Into<String>,
    ) -> Self {
        let login_path = login_path.into();
        let subscription = bus.of_type(move |_: &SessionExpired| {
            let current = navigator.current_path();
            if starts_with_ignore_case(&current, &login_path) {
                tracing::debug!(path = %current, "Already on the login page");
                return;
            }
            tracing::info!("Session expired, redirecting to login page");
            let target = login_redirect(&login_path, &current);
            navigator.navigate_to(&target, true);
        });
        Self { subscription }
    }
}

impl Disposable for SessionExpiredSubscriber {
    fn dispose(&self) {
        self.subscription.unsubscribe();
    }
}

/// Login URL returning to `current` after sign-in.
#[must_use]
pub fn login_redirect(login_path: &str, current: &str) -> String {
    format!("{login_path}?returnUrl={}", urlencoding::encode(current))
}

fn starts_with_ignore_case(value: &str, prefix: &str) -> bool {
    value
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}
