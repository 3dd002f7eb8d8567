//! Authentication state.
//!
//! [`AuthStore`] holds who is signed in. [`AuthStateSubscriber`] keeps it in
//! sync with `AuthStateChanged` events from the bus, ignoring repeats of the
//! same `(is_authenticated, name)` pair.

use command_flow_core::disposable::Disposable;
use command_flow_core::event_bus::{AuthStateChanged, EventBus, Principal};
use command_flow_core::state::ReactiveState;
use command_flow_core::subject::Subscription;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};

/// Snapshot of the signed-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthState {
    /// Whether a user is signed in
    pub is_authenticated: bool,
    /// Login name of the signed-in user
    pub user_name: Option<String>,
    /// Granted roles
    pub roles: Vec<String>,
    /// Whether the initial authentication check is still pending
    pub is_loading: bool,
}

impl AuthState {
    /// State before the first authentication check completed.
    #[must_use]
    pub const fn unknown() -> Self {
        Self {
            is_authenticated: false,
            user_name: None,
            roles: Vec::new(),
            is_loading: true,
        }
    }

    /// Whether the user holds `role`.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

impl Default for AuthState {
    fn default() -> Self {
        Self::unknown()
    }
}

/// Observable holder of the [`AuthState`]. Clones share the state.
#[derive(Debug, Clone)]
pub struct AuthStore {
    state: ReactiveState<AuthState>,
}

impl Default for AuthStore {
    fn default() -> Self {
        Self {
            state: ReactiveState::new(AuthState::unknown()),
        }
    }
}

impl AuthStore {
    /// A store in the [`AuthState::unknown`] state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The underlying state cell.
    #[must_use]
    pub const fn state(&self) -> &ReactiveState<AuthState> {
        &self.state
    }

    /// Current snapshot.
    #[must_use]
    pub fn current(&self) -> AuthState {
        self.state.value()
    }

    /// Name of the signed-in user, if any.
    #[must_use]
    pub fn user_name(&self) -> Option<String> {
        self.state
            .with(|s| s.user_name.clone().filter(|_| s.is_authenticated))
    }

    /// Record a signed-in user.
    pub fn set_authenticated<I, S>(&self, user_name: impl Into<String>, roles: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let next = AuthState {
            is_authenticated: true,
            user_name: Some(user_name.into()),
            roles: roles.into_iter().map(Into::into).collect(),
            is_loading: false,
        };
        if self.state.set(next).is_err() {
            tracing::debug!("Auth store disposed; ignoring sign-in");
        }
    }

    /// Record that nobody is signed in.
    pub fn set_anonymous(&self) {
        let next = AuthState {
            is_loading: false,
            ..AuthState::unknown()
        };
        if self.state.set(next).is_err() {
            tracing::debug!("Auth store disposed; ignoring sign-out");
        }
    }
}

impl Disposable for AuthStore {
    fn dispose(&self) {
        self.state.dispose();
    }
}

type Identity = (bool, Option<String>);

/// Applies `AuthStateChanged` events to an [`AuthStore`].
#[derive(Debug)]
pub struct AuthStateSubscriber {
    subscription: Subscription,
}

impl AuthStateSubscriber {
    /// Start listening on `bus`.
    #[must_use]
    pub fn new(bus: &EventBus, store: AuthStore) -> Self {
        let last: Mutex<Option<Identity>> = Mutex::new(None);
        let subscription = bus.of_type(move |event: &AuthStateChanged| {
            let principal = &event.principal;
            let identity = (principal.is_authenticated, principal.name.clone());
            {
                let mut last = last.lock().unwrap_or_else(PoisonError::into_inner);
                if last.as_ref() == Some(&identity) {
                    tracing::trace!("Auth state unchanged; skipping");
                    return;
                }
                *last = Some(identity);
            }
            apply(&store, principal);
        });
        Self { subscription }
    }
}

fn apply(store: &AuthStore, principal: &Principal) {
    tracing::info!(
        user = principal.name.as_deref().unwrap_or("-"),
        is_authenticated = principal.is_authenticated,
        "Authentication state changed"
    );
    if principal.is_authenticated {
        store.set_authenticated(
            principal.name.clone().unwrap_or_else(|| "Unknown".to_string()),
            principal.roles.iter().cloned(),
        );
    } else {
        store.set_anonymous();
    }
}

impl Disposable for AuthStateSubscriber {
    fn dispose(&self) {
        self.subscription.unsubscribe();
    }
}
