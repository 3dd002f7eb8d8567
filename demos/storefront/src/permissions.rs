//! Permissions of the signed-in user.
//!
//! Permissions load through an idempotent pipeline keyed by user, so a burst
//! of sign-in events loads them once. Signing out cancels a running load
//! and resets the store; a cancelled load never reaches the reducer.

use crate::auth::AuthStore;
use command_flow_core::CancellationToken;
use command_flow_core::async_state::AsyncState;
use command_flow_core::command::{Command, CommandKey};
use command_flow_core::disposable::Disposable;
use command_flow_core::effect::{Effect, ResultStream, from_future};
use command_flow_core::error::{EffectError, KeyError};
use command_flow_core::event_bus::{AuthStateChanged, EventBus, UserLoggedOut};
use command_flow_core::reducer::Reducer;
use command_flow_core::subject::Subscription;
use command_flow_runtime::{CommandDispatcher, IdempotentPipeline, PipelineConfig};
use futures::future::BoxFuture;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Set of permission names.
pub type Permissions = BTreeSet<String>;

/// Load the permissions of `user`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoadPermissions {
    /// Login name
    pub user: String,
}

impl LoadPermissions {
    /// Load the permissions of `user`.
    #[must_use]
    pub fn for_user(user: impl Into<String>) -> Self {
        Self { user: user.into() }
    }
}

impl Command for LoadPermissions {
    fn name(&self) -> &'static str {
        "permissions.load"
    }
}

/// Keys permission loads by user and remembers the key of the latest load
/// that actually started, so a sign-out can cancel it without knowing who
/// was signed in.
#[derive(Debug, Clone, Default)]
pub struct PermissionKey {
    current: Arc<Mutex<Option<String>>>,
}

impl PermissionKey {
    /// A key deriver with no current key.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CommandKey<LoadPermissions> for PermissionKey {
    fn key(&self, command: &LoadPermissions) -> Result<String, KeyError> {
        let user = command.user.trim();
        if user.is_empty() {
            return Err(KeyError::Unavailable("no signed-in user".into()));
        }
        Ok(format!("permissions:{user}"))
    }

    fn claimed(&self, key: &str) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(key.to_string());
    }

    fn current_key(&self) -> Option<String> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Permission backend.
pub trait PermissionApi: Send + Sync {
    /// Permissions granted to `user`.
    fn permissions(&self, user: &str) -> BoxFuture<'static, Result<Permissions, EffectError>>;
}

/// In-memory [`PermissionApi`] with simulated latency.
#[derive(Clone, Default)]
pub struct InMemoryPermissionApi {
    grants: Arc<Mutex<HashMap<String, Permissions>>>,
    failures: Arc<Mutex<VecDeque<EffectError>>>,
    latency: Duration,
    calls: Arc<AtomicUsize>,
}

impl InMemoryPermissionApi {
    /// An API with no grants answering after `latency`.
    #[must_use]
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    /// Grant `permissions` to `user`, replacing earlier grants.
    pub fn grant<I, S>(&self, user: impl Into<String>, permissions: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.grants
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user.into(), permissions.into_iter().map(Into::into).collect());
    }

    /// Make the next call fail with `error`.
    pub fn fail_next(&self, error: EffectError) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(error);
    }

    /// Number of calls made so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PermissionApi for InMemoryPermissionApi {
    fn permissions(&self, user: &str) -> BoxFuture<'static, Result<Permissions, EffectError>> {
        let api = self.clone();
        let user = user.to_string();
        Box::pin(async move {
            api.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(api.latency).await;
            if let Some(error) = api
                .failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
            {
                return Err(error);
            }
            Ok(api
                .grants
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&user)
                .cloned()
                .unwrap_or_default())
        })
    }
}

impl fmt::Debug for InMemoryPermissionApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryPermissionApi")
            .field("latency", &self.latency)
            .field("calls", &self.calls())
            .finish_non_exhaustive()
    }
}

/// Loads permissions from a [`PermissionApi`].
#[derive(Clone)]
pub struct PermissionEffect {
    api: Arc<dyn PermissionApi>,
}

impl PermissionEffect {
    /// Create the effect.
    #[must_use]
    pub fn new(api: Arc<dyn PermissionApi>) -> Self {
        Self { api }
    }
}

impl Effect for PermissionEffect {
    type Command = LoadPermissions;
    type Output = Permissions;

    fn handle(
        &self,
        command: LoadPermissions,
        cancel: CancellationToken,
    ) -> ResultStream<Permissions> {
        tracing::info!(user = %command.user, "Loading permissions");
        from_future(cancel, self.api.permissions(&command.user))
    }
}

impl fmt::Debug for PermissionEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionEffect").finish_non_exhaustive()
    }
}

/// Permissions known to the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionState {
    /// Granted permissions
    pub permissions: Permissions,
    /// Whether a load has completed since the last reset
    pub is_initialized: bool,
}

/// Replaces the permission set with each loaded one.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissionReducer;

impl Reducer for PermissionReducer {
    type State = PermissionState;
    type Command = LoadPermissions;
    type Output = Permissions;

    fn reduce(
        &self,
        _: &PermissionState,
        _: &LoadPermissions,
        output: &Permissions,
    ) -> PermissionState {
        PermissionState {
            permissions: output.clone(),
            is_initialized: true,
        }
    }
}

/// Permission state behind an idempotent pipeline.
#[derive(Clone)]
pub struct PermissionStore {
    state: AsyncState<PermissionState>,
    pipeline: Arc<IdempotentPipeline<PermissionEffect>>,
}

impl PermissionStore {
    /// Create the store and its pipeline.
    #[must_use]
    pub fn new(effect: PermissionEffect) -> Self {
        let state = AsyncState::new(PermissionState::default());
        let pipeline = IdempotentPipeline::with_reducer(
            PipelineConfig::new("permissions"),
            effect,
            PermissionKey::new(),
            state.data().clone(),
            PermissionReducer,
        )
        .with_tracker(state.tracker().clone());

        Self {
            state,
            pipeline: Arc::new(pipeline),
        }
    }

    /// Data and status cells.
    #[must_use]
    pub const fn state(&self) -> &AsyncState<PermissionState> {
        &self.state
    }

    /// The pipeline to register with the dispatcher.
    #[must_use]
    pub fn pipeline(&self) -> Arc<IdempotentPipeline<PermissionEffect>> {
        Arc::clone(&self.pipeline)
    }

    /// Whether a load has completed since the last reset.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state.data().with(|s| s.is_initialized)
    }

    /// Granted permissions.
    #[must_use]
    pub fn permissions(&self) -> Permissions {
        self.state.data().with(|s| s.permissions.clone())
    }

    /// Whether `permission` is granted.
    #[must_use]
    pub fn has(&self, permission: &str) -> bool {
        self.state.data().with(|s| s.permissions.contains(permission))
    }

    /// Forget every permission.
    pub fn reset(&self) {
        if self.state.data().set(PermissionState::default()).is_err() {
            tracing::debug!("Permission store disposed; ignoring reset");
        }
    }
}

impl Disposable for PermissionStore {
    fn dispose(&self) {
        self.state.dispose();
    }
}

impl fmt::Debug for PermissionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionStore")
            .field("state", &self.state)
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

/// Loads permissions on sign-in; cancels the load and resets the store on
/// [`UserLoggedOut`] or an anonymous [`AuthStateChanged`].
#[derive(Debug)]
pub struct AuthPermissionSync {
    auth_changes: Subscription,
    logouts: Subscription,
}

impl AuthPermissionSync {
    /// Start listening on `bus`.
    #[must_use]
    pub fn new(bus: &EventBus, dispatcher: Arc<CommandDispatcher>, store: PermissionStore) -> Self {
        let sign_out = {
            let dispatcher = Arc::clone(&dispatcher);
            move |store: &PermissionStore| {
                let cancelled = dispatcher.cancel_current::<LoadPermissions>();
                tracing::debug!(cancelled, "Signed out; resetting permissions");
                store.reset();
            }
        };
        let logout_reset = sign_out.clone();
        let logout_store = store.clone();

        let auth_changes = bus.of_type(move |event: &AuthStateChanged| {
            let principal = &event.principal;
            match principal.name.as_deref().filter(|_| principal.is_authenticated) {
                Some(user) => {
                    if let Err(error) = dispatcher.dispatch(LoadPermissions::for_user(user)) {
                        tracing::warn!(%error, user, "Could not start permission load");
                    }
                }
                None => sign_out(&store),
            }
        });
        let logouts = bus.of_type(move |_: &UserLoggedOut| logout_reset(&logout_store));

        Self {
            auth_changes,
            logouts,
        }
    }
}

impl Disposable for AuthPermissionSync {
    fn dispose(&self) {
        self.auth_changes.unsubscribe();
        self.logouts.unsubscribe();
    }
}

/// Whether the signed-in user of `auth` holds `permission` in `store`.
#[must_use]
pub fn is_granted(auth: &AuthStore, store: &PermissionStore, permission: &str) -> bool {
    auth.current().is_authenticated && store.has(permission)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code
mod tests {
    use super::*;
    use command_flow_core::async_state::AsyncStatus;
    use command_flow_core::event_bus::{AppEvent, Principal};
    use command_flow_runtime::{CommandPipeline, PipelineError};

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn test_key_per_user_and_current_key() {
        let keys = PermissionKey::new();
        assert_eq!(keys.current_key(), None);
        assert_eq!(
            keys.key(&LoadPermissions::for_user("ada")).unwrap(),
            "permissions:ada"
        );
        assert_eq!(keys.current_key(), None);
        keys.claimed("permissions:ada");
        assert_eq!(keys.current_key(), Some("permissions:ada".to_string()));
        assert!(matches!(
            keys.key(&LoadPermissions::for_user(" ")),
            Err(KeyError::Unavailable(_))
        ));
    }

    #[test]
    fn test_key_not_recorded_when_load_cannot_start() {
        let keys = PermissionKey::new();
        let pipeline = IdempotentPipeline::new(
            PipelineConfig::new("permissions"),
            PermissionEffect::new(Arc::new(InMemoryPermissionApi::new(ms(10)))),
            keys.clone(),
            |_: &LoadPermissions, _: Permissions| {},
        );

        assert_eq!(
            pipeline.execute(LoadPermissions::for_user("ada")).unwrap_err(),
            PipelineError::NoRuntime
        );
        assert_eq!(keys.current_key(), None);
        assert!(!pipeline.cancel_current());
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_recorded_when_load_starts() {
        let keys = PermissionKey::new();
        let pipeline = IdempotentPipeline::new(
            PipelineConfig::new("permissions"),
            PermissionEffect::new(Arc::new(InMemoryPermissionApi::new(ms(10)))),
            keys.clone(),
            |_: &LoadPermissions, _: Permissions| {},
        );

        assert!(pipeline.execute(LoadPermissions::for_user("ada")).unwrap().is_started());
        assert_eq!(keys.current_key(), Some("permissions:ada".to_string()));
        assert!(pipeline.cancel_current());
        assert!(!pipeline.is_running("permissions:ada"));
    }

    #[test]
    fn test_reducer_marks_initialized() {
        let granted: Permissions = ["orders.read".to_string()].into_iter().collect();
        let state = PermissionReducer.reduce(
            &PermissionState::default(),
            &LoadPermissions::for_user("ada"),
            &granted,
        );
        assert!(state.is_initialized);
        assert_eq!(state.permissions, granted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_loads_and_resets() {
        let api = InMemoryPermissionApi::new(ms(10));
        api.grant("ada", ["orders.read", "orders.write"]);
        let store = PermissionStore::new(PermissionEffect::new(Arc::new(api.clone())));
        let pipeline = store.pipeline();

        pipeline.execute(LoadPermissions::for_user("ada")).unwrap();
        assert!(!pipeline.execute(LoadPermissions::for_user("ada")).unwrap().is_started());
        tokio::time::sleep(ms(50)).await;

        assert!(store.is_initialized());
        assert!(store.has("orders.write"));
        assert_eq!(store.state().status().value(), AsyncStatus::Idle);
        assert_eq!(api.calls(), 1);

        store.reset();
        assert!(!store.is_initialized());
        assert!(store.permissions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_loads_on_sign_in() {
        let bus: EventBus = EventBus::new();
        let dispatcher = Arc::new(CommandDispatcher::new());
        let api = InMemoryPermissionApi::new(ms(10));
        api.grant("ada", ["orders.read"]);
        let store = PermissionStore::new(PermissionEffect::new(Arc::new(api)));
        dispatcher.register(store.pipeline()).unwrap();
        let auth = AuthStore::new();
        auth.set_authenticated("ada", Vec::<String>::new());
        let _sync = AuthPermissionSync::new(&bus, Arc::clone(&dispatcher), store.clone());

        bus.publish(AppEvent::AuthStateChanged(AuthStateChanged {
            principal: Principal::authenticated("u-1", "ada"),
        }));
        tokio::time::sleep(ms(50)).await;

        assert!(is_granted(&auth, &store, "orders.read"));
        assert!(!is_granted(&auth, &store, "orders.delete"));
    }
}
