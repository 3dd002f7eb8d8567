//! Order feature.
//!
//! - [`OrderApi`]: the backend boundary, with an in-memory implementation
//! - [`OrderEffect`]: loads one order (header and lines composed, retried
//!   with backoff) or the order list
//! - [`OrderReducer`] / [`OrderStore`]: folds loaded orders into state
//!   behind an idempotent pipeline keyed by order id
//! - [`OrdersViewModel`]: the order list screen, driven by a reactive command

use chrono::{DateTime, Utc};
use command_flow_core::CancellationToken;
use command_flow_core::async_state::AsyncState;
use command_flow_core::command::Command;
use command_flow_core::disposable::Disposable;
use command_flow_core::effect::{Effect, ResultStream, from_future};
use command_flow_core::environment::Clock;
use command_flow_core::error::EffectError;
use command_flow_core::event_bus::{DomainEvent, EventBus};
use command_flow_core::reducer::{FnReducer, Reducer};
use command_flow_core::subject::Subscription;
use command_flow_core::view_model::{Bindable, Binding, ViewModel};
use command_flow_runtime::retry::{RetryPolicy, retry_with_backoff};
use command_flow_runtime::{
    CommandDispatcher, CommandPipeline, IdempotentPipeline, PipelineConfig, PipelineError,
    ReactiveCommand,
};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

// ============================================================================
// Types
// ============================================================================

/// Lifecycle of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Placed, not paid
    New,
    /// Paid, not shipped
    Paid,
    /// Delivered
    Completed,
}

/// Order header as stored by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderHeader {
    /// Order id
    pub id: String,
    /// Human-facing order number
    pub number: String,
    /// Customer display name
    pub customer_name: String,
    /// Current status
    pub status: OrderStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// One line of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    /// Product SKU
    pub sku: String,
    /// Units ordered
    pub quantity: u32,
    /// Price per unit in cents
    pub unit_price_cents: u64,
}

impl OrderLine {
    /// Line total in cents.
    #[must_use]
    pub fn total_cents(&self) -> u64 {
        self.unit_price_cents.saturating_mul(u64::from(self.quantity))
    }
}

/// An order with its lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Header fields
    pub header: OrderHeader,
    /// Lines in display order
    pub lines: Vec<OrderLine>,
}

impl Order {
    /// Combine a header with its lines.
    #[must_use]
    pub const fn compose(header: OrderHeader, lines: Vec<OrderLine>) -> Self {
        Self { header, lines }
    }

    /// Order total in cents.
    #[must_use]
    pub fn total_cents(&self) -> u64 {
        self.lines.iter().map(OrderLine::total_cents).sum()
    }

    /// List entry for this order.
    #[must_use]
    pub fn overview(&self) -> OrderOverview {
        OrderOverview {
            id: self.header.id.clone(),
            number: self.header.number.clone(),
            customer_name: self.header.customer_name.clone(),
            amount_cents: self.total_cents(),
            status: self.header.status,
            created_at: self.header.created_at,
        }
    }
}

/// Order list entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderOverview {
    /// Order id
    pub id: String,
    /// Human-facing order number
    pub number: String,
    /// Customer display name
    pub customer_name: String,
    /// Order total in cents
    pub amount_cents: u64,
    /// Current status
    pub status: OrderStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Backend boundary
// ============================================================================

/// Order backend.
pub trait OrderApi: Send + Sync {
    /// Fetch an order header; `None` if no such order exists.
    fn find_order(&self, id: &str) -> BoxFuture<'static, Result<Option<OrderHeader>, EffectError>>;

    /// Fetch the lines of an order.
    fn order_lines(&self, id: &str) -> BoxFuture<'static, Result<Vec<OrderLine>, EffectError>>;

    /// Fetch the order list, newest first.
    fn list_orders(&self) -> BoxFuture<'static, Result<Vec<OrderOverview>, EffectError>>;
}

#[derive(Default)]
struct Backend {
    orders: BTreeMap<String, Order>,
    failures: VecDeque<EffectError>,
}

/// In-memory [`OrderApi`] with simulated latency and failure injection.
///
/// Clones share the same data.
#[derive(Clone)]
pub struct InMemoryOrderApi {
    backend: Arc<Mutex<Backend>>,
    clock: Arc<dyn Clock>,
    latency: Duration,
    calls: Arc<AtomicUsize>,
}

impl InMemoryOrderApi {
    /// An empty backend answering after `latency`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, latency: Duration) -> Self {
        Self {
            backend: Arc::new(Mutex::new(Backend::default())),
            clock,
            latency,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn backend(&self) -> std::sync::MutexGuard<'_, Backend> {
        self.backend.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a new order stamped with the current time.
    pub fn place_order(
        &self,
        id: impl Into<String>,
        customer_name: impl Into<String>,
        lines: Vec<OrderLine>,
    ) -> Order {
        let id = id.into();
        let mut backend = self.backend();
        let header = OrderHeader {
            number: format!("SO-{:05}", backend.orders.len() + 1),
            id: id.clone(),
            customer_name: customer_name.into(),
            status: OrderStatus::New,
            created_at: self.clock.now(),
        };
        let order = Order::compose(header, lines);
        backend.orders.insert(id, order.clone());
        order
    }

    /// Make the next backend call fail with `error`.
    pub fn fail_next(&self, error: EffectError) {
        self.backend().failures.push_back(error);
    }

    /// Number of backend calls made so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn respond<T, F>(&self, answer: F) -> BoxFuture<'static, Result<T, EffectError>>
    where
        T: Send + 'static,
        F: FnOnce(&Backend) -> T + Send + 'static,
    {
        let api = self.clone();
        Box::pin(async move {
            api.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(api.latency).await;
            let mut backend = api.backend();
            match backend.failures.pop_front() {
                Some(error) => Err(error),
                None => Ok(answer(&backend)),
            }
        })
    }
}

impl OrderApi for InMemoryOrderApi {
    fn find_order(&self, id: &str) -> BoxFuture<'static, Result<Option<OrderHeader>, EffectError>> {
        let id = id.to_string();
        self.respond(move |backend| backend.orders.get(&id).map(|o| o.header.clone()))
    }

    fn order_lines(&self, id: &str) -> BoxFuture<'static, Result<Vec<OrderLine>, EffectError>> {
        let id = id.to_string();
        self.respond(move |backend| {
            backend
                .orders
                .get(&id)
                .map(|o| o.lines.clone())
                .unwrap_or_default()
        })
    }

    fn list_orders(&self) -> BoxFuture<'static, Result<Vec<OrderOverview>, EffectError>> {
        self.respond(|backend| {
            let mut list: Vec<OrderOverview> =
                backend.orders.values().map(Order::overview).collect();
            list.sort_by(|a, b| {
                b.created_at
                    .cmp(&a.created_at)
                    .then_with(|| b.number.cmp(&a.number))
            });
            list
        })
    }
}

impl fmt::Debug for InMemoryOrderApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryOrderApi")
            .field("orders", &self.backend().orders.len())
            .field("latency", &self.latency)
            .field("calls", &self.calls())
            .finish()
    }
}

// ============================================================================
// Commands, effect, reducer
// ============================================================================

/// Order commands.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OrderCommand {
    /// Load one order with its lines
    Load {
        /// Order id
        order_id: String,
    },
    /// Load the order list
    LoadAll,
}

impl OrderCommand {
    /// Load the order `order_id`.
    #[must_use]
    pub fn load(order_id: impl Into<String>) -> Self {
        Self::Load {
            order_id: order_id.into(),
        }
    }

    /// Idempotency key.
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            Self::Load { order_id } => format!("order:{order_id}"),
            Self::LoadAll => "orders:all".to_string(),
        }
    }
}

impl Command for OrderCommand {
    fn name(&self) -> &'static str {
        match self {
            Self::Load { .. } => "order.load",
            Self::LoadAll => "order.load_all",
        }
    }
}

/// Output of the order effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderOutput {
    /// A single order; `None` if it does not exist
    Loaded(Option<Order>),
    /// The order list
    Listed(Vec<OrderOverview>),
}

/// Runs [`OrderCommand`]s against an [`OrderApi`].
#[derive(Clone)]
pub struct OrderEffect {
    api: Arc<dyn OrderApi>,
    retry: RetryPolicy,
}

impl OrderEffect {
    /// Create the effect; single-order loads are retried with `retry`.
    #[must_use]
    pub fn new(api: Arc<dyn OrderApi>, retry: RetryPolicy) -> Self {
        Self { api, retry }
    }

    fn load(&self, order_id: String, cancel: CancellationToken) -> ResultStream<OrderOutput> {
        let api = Arc::clone(&self.api);
        retry_with_backoff(self.retry.clone(), move || {
            let api = Arc::clone(&api);
            let order_id = order_id.clone();
            from_future(cancel.clone(), fetch_order(api, order_id))
        })
    }
}

async fn fetch_order(
    api: Arc<dyn OrderApi>,
    order_id: String,
) -> Result<OrderOutput, EffectError> {
    let Some(header) = api.find_order(&order_id).await? else {
        return Ok(OrderOutput::Loaded(None));
    };
    let lines = api.order_lines(&order_id).await?;
    Ok(OrderOutput::Loaded(Some(Order::compose(header, lines))))
}

impl Effect for OrderEffect {
    type Command = OrderCommand;
    type Output = OrderOutput;

    fn handle(
        &self,
        command: OrderCommand,
        cancel: CancellationToken,
    ) -> ResultStream<OrderOutput> {
        tracing::debug!(command = command.name(), "Handling order command");
        match command {
            OrderCommand::Load { order_id } => self.load(order_id, cancel),
            OrderCommand::LoadAll => {
                let list = self.api.list_orders();
                from_future(cancel, async move { list.await.map(OrderOutput::Listed) })
            }
        }
    }
}

impl fmt::Debug for OrderEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderEffect")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Orders known to the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrdersState {
    /// Loaded orders by id
    pub orders: BTreeMap<String, Order>,
    /// Ids requested but not found
    pub missing: Vec<String>,
    /// Latest order list
    pub overview: Vec<OrderOverview>,
}

impl OrdersState {
    /// A loaded order.
    #[must_use]
    pub fn order(&self, id: &str) -> Option<&Order> {
        self.orders.get(id)
    }
}

/// Folds [`OrderOutput`]s into [`OrdersState`].
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderReducer;

impl Reducer for OrderReducer {
    type State = OrdersState;
    type Command = OrderCommand;
    type Output = OrderOutput;

    fn reduce(
        &self,
        state: &OrdersState,
        command: &OrderCommand,
        output: &OrderOutput,
    ) -> OrdersState {
        let mut next = state.clone();
        match (command, output) {
            (_, OrderOutput::Loaded(Some(order))) => {
                next.missing.retain(|id| id != &order.header.id);
                next.orders.insert(order.header.id.clone(), order.clone());
            }
            (OrderCommand::Load { order_id }, OrderOutput::Loaded(None)) => {
                next.orders.remove(order_id);
                if !next.missing.contains(order_id) {
                    next.missing.push(order_id.clone());
                }
            }
            (_, OrderOutput::Listed(list)) => next.overview.clone_from(list),
            (OrderCommand::LoadAll, OrderOutput::Loaded(None)) => {}
        }
        next
    }
}

// ============================================================================
// Store
// ============================================================================

/// Order state behind an idempotent pipeline.
///
/// Register [`pipeline`](Self::pipeline) with the dispatcher; concurrent
/// loads of the same order run the backend calls once.
#[derive(Clone)]
pub struct OrderStore {
    state: AsyncState<OrdersState>,
    pipeline: Arc<IdempotentPipeline<OrderEffect>>,
}

impl OrderStore {
    /// Create the store and its pipeline.
    #[must_use]
    pub fn new(effect: OrderEffect) -> Self {
        let state = AsyncState::new(OrdersState::default());
        let pipeline = IdempotentPipeline::with_reducer(
            PipelineConfig::new("orders"),
            effect,
            OrderCommand::key,
            state.data().clone(),
            OrderReducer,
        )
        .with_tracker(state.tracker().clone());

        Self {
            state,
            pipeline: Arc::new(pipeline),
        }
    }

    /// Data and status cells.
    #[must_use]
    pub const fn state(&self) -> &AsyncState<OrdersState> {
        &self.state
    }

    /// The pipeline to register with the dispatcher.
    #[must_use]
    pub fn pipeline(&self) -> Arc<IdempotentPipeline<OrderEffect>> {
        Arc::clone(&self.pipeline)
    }

    /// A loaded order.
    #[must_use]
    pub fn order(&self, id: &str) -> Option<Order> {
        self.state.data().with(|s| s.order(id).cloned())
    }

    /// Cancel running loads and forget every loaded order.
    pub fn reset(&self) {
        let cancelled = self.pipeline.cancel_all();
        if self.state.data().set(OrdersState::default()).is_err() {
            tracing::debug!("Order store disposed; ignoring reset");
            return;
        }
        tracing::debug!(cancelled, "Order store reset");
    }
}

impl Disposable for OrderStore {
    fn dispose(&self) {
        self.state.dispose();
    }
}

impl fmt::Debug for OrderStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderStore")
            .field("status", &self.state.status().value())
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

// ============================================================================
// Bus triggers
// ============================================================================

/// Bus trigger: reload the order list into the order store.
pub const ORDERS_RELOAD: &str = "orders.reload";

/// Bus trigger: cancel order loads and clear the order store.
pub const ORDERS_RESET: &str = "orders.reset";

/// Applies [`ORDERS_RELOAD`] and [`ORDERS_RESET`] triggers to an
/// [`OrderStore`].
#[derive(Debug)]
pub struct OrderTriggerSubscriber {
    subscription: Subscription,
}

impl OrderTriggerSubscriber {
    /// Start listening on `bus`.
    #[must_use]
    pub fn new(bus: &EventBus, dispatcher: Arc<CommandDispatcher>, store: OrderStore) -> Self {
        let subscription = bus.of_type(move |event: &DomainEvent| match event.name.as_str() {
            ORDERS_RELOAD => {
                if let Err(error) = dispatcher.dispatch(OrderCommand::LoadAll) {
                    tracing::warn!(%error, "Could not reload orders");
                }
            }
            ORDERS_RESET => store.reset(),
            _ => {}
        });
        Self { subscription }
    }
}

impl Disposable for OrderTriggerSubscriber {
    fn dispose(&self) {
        self.subscription.unsubscribe();
    }
}

// ============================================================================
// View-model
// ============================================================================

/// The order list screen.
pub struct OrdersViewModel {
    base: ViewModel,
    orders: AsyncState<Vec<OrderOverview>>,
    load: ReactiveCommand<OrderEffect>,
}

impl OrdersViewModel {
    /// Create the view-model; nothing loads until [`load_orders`](Self::load_orders).
    #[must_use]
    pub fn new(effect: OrderEffect) -> Self {
        let base = ViewModel::new();
        let orders = base.track(AsyncState::new(Vec::new()));
        let load = base.track(ReactiveCommand::with_reducer(
            &orders,
            effect,
            FnReducer::new(
                |current: &Vec<OrderOverview>, _: &OrderCommand, output: &OrderOutput| {
                    match output {
                        OrderOutput::Listed(list) => list.clone(),
                        OrderOutput::Loaded(_) => current.clone(),
                    }
                },
            ),
        ));
        base.keep(load.results(|output| {
            if let OrderOutput::Listed(list) = output {
                tracing::info!(count = list.len(), "Loaded orders");
            }
        }));

        let vm = Self { base, orders, load };
        vm.base.bind(&vm);
        vm
    }

    /// Trigger a reload of the list.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] if the view-model is disposed or no Tokio
    /// runtime is available.
    pub fn load_orders(&self) -> Result<(), PipelineError> {
        self.load.execute(OrderCommand::LoadAll)
    }

    /// The list and its loading status.
    #[must_use]
    pub const fn orders(&self) -> &AsyncState<Vec<OrderOverview>> {
        &self.orders
    }

    /// The view-model base (re-render signal and resources).
    #[must_use]
    pub const fn base(&self) -> &ViewModel {
        &self.base
    }

    /// Release every resource; running loads are cancelled.
    pub fn dispose(&self) {
        self.base.dispose();
    }
}

impl Bindable for OrdersViewModel {
    fn bindings(&self) -> Vec<Binding> {
        vec![
            Binding::state("orders", self.orders.data()),
            Binding::state("status", self.orders.status()),
        ]
    }
}

impl Disposable for OrdersViewModel {
    fn dispose(&self) {
        Self::dispose(self);
    }
}

impl fmt::Debug for OrdersViewModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrdersViewModel")
            .field("orders", &self.orders)
            .field("load", &self.load)
            .finish_non_exhaustive()
    }
}
