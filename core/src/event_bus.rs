//! In-process application event bus.
//!
//! The [`EventBus`] is the single cross-component signaling channel. It is
//! created explicitly at startup, shared by `Arc`, and shut down with the
//! application; there is no global instance.
//!
//! # Semantics
//!
//! - **Synchronous**: `publish` returns after every observer ran
//! - **Ordered**: observers run in subscription order
//! - **No replay**: observers attached after a publish never see it
//!
//! # Example
//!
//! ```
//! use command_flow_core::event_bus::{AppEvent, AuthStateChanged, EventBus, Principal};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicBool, Ordering};
//!
//! let bus: EventBus = EventBus::new();
//! let signed_out = Arc::new(AtomicBool::new(false));
//!
//! let flag = Arc::clone(&signed_out);
//! let _sub = bus.of_type(move |evt: &AuthStateChanged| {
//!     if !evt.principal.is_authenticated {
//!         flag.store(true, Ordering::SeqCst);
//!     }
//! });
//!
//! bus.publish(AppEvent::AuthStateChanged(AuthStateChanged {
//!     principal: Principal::anonymous(),
//! }));
//! assert!(signed_out.load(Ordering::SeqCst));
//! ```

use crate::subject::{Subject, Subscription};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity attached to an authentication state change.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Principal {
    /// Stable user identifier (subject claim)
    pub user_id: Option<String>,
    /// Display / login name
    pub name: Option<String>,
    /// Whether the principal is signed in
    pub is_authenticated: bool,
    /// Granted roles
    pub roles: Vec<String>,
}

impl Principal {
    /// An unauthenticated principal.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// A signed-in principal.
    #[must_use]
    pub fn authenticated(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            name: Some(name.into()),
            is_authenticated: true,
            roles: Vec::new(),
        }
    }

    /// Add roles.
    #[must_use]
    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles.extend(roles.into_iter().map(Into::into));
        self
    }
}

/// The session expired or no session exists at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionExpired;

/// The user explicitly signed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserLoggedOut;

/// Authentication state changed to `principal`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthStateChanged {
    /// The new principal
    pub principal: Principal,
}

/// Feature-specific load / reset trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Trigger name, e.g. `"orders.reload"`
    pub name: String,
}

impl DomainEvent {
    /// A trigger named `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Application events carried by the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppEvent {
    /// See [`SessionExpired`]
    SessionExpired(SessionExpired),
    /// See [`UserLoggedOut`]
    UserLoggedOut(UserLoggedOut),
    /// See [`AuthStateChanged`]
    AuthStateChanged(AuthStateChanged),
    /// See [`DomainEvent`]
    Domain(DomainEvent),
}

impl AppEvent {
    /// Event name for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SessionExpired(_) => "session_expired",
            Self::UserLoggedOut(_) => "user_logged_out",
            Self::AuthStateChanged(_) => "auth_state_changed",
            Self::Domain(_) => "domain",
        }
    }
}

/// Extract a typed payload from a bus event.
///
/// Implemented by every payload type so observers can filter with
/// [`EventBus::of_type`].
pub trait FromEvent<E>: Sized {
    /// The payload if `event` carries one of this type.
    fn from_event(event: &E) -> Option<&Self>;
}

macro_rules! app_event_payload {
    ($payload:ty, $variant:ident) => {
        impl FromEvent<AppEvent> for $payload {
            fn from_event(event: &AppEvent) -> Option<&Self> {
                match event {
                    AppEvent::$variant(payload) => Some(payload),
                    _ => None,
                }
            }
        }

        impl From<$payload> for AppEvent {
            fn from(payload: $payload) -> Self {
                Self::$variant(payload)
            }
        }
    };
}

app_event_payload!(SessionExpired, SessionExpired);
app_event_payload!(UserLoggedOut, UserLoggedOut);
app_event_payload!(AuthStateChanged, AuthStateChanged);
app_event_payload!(DomainEvent, Domain);

/// Process-wide publish/subscribe channel.
pub struct EventBus<E = AppEvent> {
    events: Subject<E>,
}

impl<E> EventBus<E>
where
    E: fmt::Debug + Send + Sync + 'static,
{
    /// Create a bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: Subject::new(),
        }
    }

    /// Deliver `event` to every current subscriber.
    ///
    /// Returns the number of observers reached (including observers that
    /// filtered the event out).
    pub fn publish(&self, event: impl Into<E>) -> usize {
        let event = event.into();
        let reached = self.events.next(&event);
        tracing::debug!(?event, reached, "Published application event");
        reached
    }

    /// Observe every event.
    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.events.subscribe(observer)
    }

    /// Observe events carrying a `T` payload.
    pub fn of_type<T, F>(&self, observer: F) -> Subscription
    where
        T: FromEvent<E> + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.events.subscribe(move |event| {
            if let Some(payload) = T::from_event(event) {
                observer(payload);
            }
        })
    }

    /// Number of attached observers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.events.observer_count()
    }

    /// Stop the bus: observers are completed and later publishes are
    /// discarded.
    pub fn shutdown(&self) {
        tracing::info!("Shutting down event bus");
        self.events.complete();
    }
}

impl<E> Default for EventBus<E>
where
    E: fmt::Debug + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for EventBus<E>
where
    E: 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.events.observer_count())
            .finish()
    }
}
