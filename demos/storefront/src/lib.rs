//! # Storefront
//!
//! A client-side storefront built on Command Flow:
//!
//! - **Auth**: an observable auth store fed by `AuthStateChanged` events
//! - **Permissions**: loaded once per sign-in, cancelled and reset on sign-out
//! - **Orders**: single orders loaded through an idempotent pipeline with
//!   retry, reloaded or cleared by bus triggers, and an order list driven by
//!   a reactive command
//! - **Session**: redirect to the login page when the session expires
//!
//! [`Storefront`] wires these together around one event bus and one command
//! dispatcher.

use command_flow_core::disposable::{Disposable, ResourceArena};
use command_flow_core::environment::Clock;
use command_flow_core::event_bus::{
    AuthStateChanged, DomainEvent, EventBus, Principal, SessionExpired, UserLoggedOut,
};
use command_flow_runtime::{CommandDispatcher, ExecutionHandle, PipelineError};
use std::fmt;
use std::sync::Arc;

pub mod auth;
pub mod config;
pub mod orders;
pub mod permissions;
pub mod session;

use auth::{AuthStateSubscriber, AuthStore};
use config::StorefrontConfig;
use orders::{
    InMemoryOrderApi, ORDERS_RELOAD, ORDERS_RESET, OrderCommand, OrderEffect, OrderStore,
    OrderTriggerSubscriber, OrdersViewModel,
};
use permissions::{AuthPermissionSync, InMemoryPermissionApi, PermissionEffect, PermissionStore};
use session::{Navigator, SessionExpiredSubscriber};

/// The assembled application.
pub struct Storefront {
    config: StorefrontConfig,
    bus: EventBus,
    dispatcher: Arc<CommandDispatcher>,
    auth: AuthStore,
    orders: OrderStore,
    order_effect: OrderEffect,
    order_api: InMemoryOrderApi,
    permissions: PermissionStore,
    permission_api: InMemoryPermissionApi,
    subscribers: ResourceArena,
}

impl Storefront {
    /// Build the application: stores, pipelines and event subscribers.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] if a pipeline cannot be registered.
    pub fn new(
        config: StorefrontConfig,
        clock: Arc<dyn Clock>,
        navigator: Arc<dyn Navigator>,
    ) -> Result<Self, PipelineError> {
        let bus: EventBus = EventBus::new();
        let dispatcher = Arc::new(CommandDispatcher::new());

        let order_api = InMemoryOrderApi::new(clock, config.api_latency);
        let order_effect =
            OrderEffect::new(Arc::new(order_api.clone()), config.order_retry.clone());
        let orders = OrderStore::new(order_effect.clone());
        dispatcher.register(orders.pipeline())?;

        let permission_api = InMemoryPermissionApi::new(config.api_latency);
        let permissions =
            PermissionStore::new(PermissionEffect::new(Arc::new(permission_api.clone())));
        dispatcher.register(permissions.pipeline())?;

        let auth = AuthStore::new();
        let subscribers = ResourceArena::new();
        subscribers.adopt(AuthStateSubscriber::new(&bus, auth.clone()));
        subscribers.adopt(AuthPermissionSync::new(
            &bus,
            Arc::clone(&dispatcher),
            permissions.clone(),
        ));
        subscribers.adopt(OrderTriggerSubscriber::new(
            &bus,
            Arc::clone(&dispatcher),
            orders.clone(),
        ));
        subscribers.adopt(SessionExpiredSubscriber::new(
            &bus,
            navigator,
            config.login_path.clone(),
        ));

        tracing::info!(
            pipelines = dispatcher.pipeline_count(),
            subscribers = bus.subscriber_count(),
            "Storefront initialized"
        );

        Ok(Self {
            config,
            bus,
            dispatcher,
            auth,
            orders,
            order_effect,
            order_api,
            permissions,
            permission_api,
            subscribers,
        })
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &StorefrontConfig {
        &self.config
    }

    /// The application event bus.
    #[must_use]
    pub const fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The command dispatcher.
    #[must_use]
    pub const fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    /// Who is signed in.
    #[must_use]
    pub const fn auth(&self) -> &AuthStore {
        &self.auth
    }

    /// Loaded orders.
    #[must_use]
    pub const fn orders(&self) -> &OrderStore {
        &self.orders
    }

    /// Permissions of the signed-in user.
    #[must_use]
    pub const fn permissions(&self) -> &PermissionStore {
        &self.permissions
    }

    /// Backing order data.
    #[must_use]
    pub const fn order_api(&self) -> &InMemoryOrderApi {
        &self.order_api
    }

    /// Backing permission data.
    #[must_use]
    pub const fn permission_api(&self) -> &InMemoryPermissionApi {
        &self.permission_api
    }

    /// A fresh order list screen.
    #[must_use]
    pub fn orders_view_model(&self) -> OrdersViewModel {
        OrdersViewModel::new(self.order_effect.clone())
    }

    /// Load one order into the order store.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] if the dispatcher is disposed or no Tokio
    /// runtime is available.
    pub fn load_order(&self, order_id: &str) -> Result<Vec<ExecutionHandle>, PipelineError> {
        self.dispatcher.dispatch(OrderCommand::load(order_id))
    }

    /// Announce a signed-in user.
    pub fn sign_in(&self, principal: Principal) {
        self.bus.publish(AuthStateChanged { principal });
    }

    /// Ask the order store to reload the order list.
    pub fn refresh_orders(&self) {
        self.bus.publish(DomainEvent::new(ORDERS_RELOAD));
    }

    /// Announce that the user signed out; permissions and loaded orders are
    /// dropped.
    pub fn sign_out(&self) {
        self.bus.publish(UserLoggedOut);
        self.bus.publish(DomainEvent::new(ORDERS_RESET));
        self.bus.publish(AuthStateChanged {
            principal: Principal::anonymous(),
        });
    }

    /// Announce that the session expired.
    pub fn expire_session(&self) {
        self.bus.publish(SessionExpired);
    }

    /// Stop listening, cancel running work and close the bus.
    pub fn shutdown(&self) {
        self.subscribers.dispose();
        self.dispatcher.dispose();
        self.bus.shutdown();
        self.orders.dispose();
        self.permissions.dispose();
        self.auth.dispose();
        tracing::info!("Storefront shut down");
    }
}

impl fmt::Debug for Storefront {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storefront")
            .field("config", &self.config)
            .field("dispatcher", &self.dispatcher)
            .field("orders", &self.orders)
            .field("permissions", &self.permissions)
            .finish_non_exhaustive()
    }
}
