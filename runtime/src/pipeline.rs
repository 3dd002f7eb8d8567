//! Idempotent command pipelines.
//!
//! A pipeline runs one effect for one command family and guarantees that at
//! most one execution per command key is in flight:
//!
//! ```text
//! execute(cmd) ──► key(cmd) ──► registry ──┬─ key present ──► dropped (debug log)
//!                                          └─ key absent ───► spawn: effect stream
//!                                                                 │
//!          cancel(key) ──► remove entry + signal token ──────────►│ stream dropped
//!                                                                 ▼
//!                             Ok(output) ──► on_output(cmd, output)
//!                             Err(e)     ──► remove entry, publish failure
//!                             end        ──► remove entry
//! ```
//!
//! A registry entry is removed exactly once, by whichever comes first:
//! completion, failure or cancellation. Entries carry a generation number so
//! a stale handle or a finishing execution never removes an entry that a
//! newer execution of the same key created.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::metrics::{counter, gauge, histogram, names};
use crate::retry::retry_with_backoff;
use command_flow_core::async_state::StatusTracker;
use command_flow_core::command::{Command, CommandKey};
use command_flow_core::disposable::Disposable;
use command_flow_core::effect::{Effect, ResultStream};
use command_flow_core::error::EffectError;
use command_flow_core::reducer::Reducer;
use command_flow_core::state::ReactiveState;
use command_flow_core::subject::{Subject, Subscription};
use futures::StreamExt;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// A runner for one command family.
pub trait CommandPipeline: Send + Sync {
    /// The command family accepted
    type Command: Command;

    /// Pipeline name, for logs.
    fn name(&self) -> &str;

    /// Start executing `command` unless an execution with the same key is
    /// already in flight.
    ///
    /// Returns immediately; the effect runs on the Tokio runtime. Effect
    /// failures are not returned here.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::Key`] if the key cannot be derived
    /// - [`PipelineError::NoRuntime`] if called outside a Tokio runtime
    fn execute(&self, command: Self::Command) -> Result<ExecutionHandle, PipelineError>;

    /// Cancel the in-flight execution for `key`. Returns whether one was
    /// running; cancelling an unknown key is a no-op.
    fn cancel(&self, key: &str) -> bool;

    /// Cancel the execution tied to the ambient context, as reported by
    /// [`CommandKey::current_key`].
    fn cancel_current(&self) -> bool;

    /// Cancel every in-flight execution. Returns how many were running.
    fn cancel_all(&self) -> usize;

    /// Whether an execution for `key` is in flight.
    fn is_running(&self, key: &str) -> bool;
}

/// An execution that ended with an effect error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineFailure {
    /// Name of the pipeline that ran the command
    pub pipeline: String,
    /// Key of the failed execution
    pub key: String,
    /// Name of the failed command
    pub command: &'static str,
    /// The terminal effect error
    pub error: EffectError,
}

struct InFlight {
    generation: u64,
    cancel: CancellationToken,
}

/// Key → in-flight execution map shared by a pipeline and its tasks.
struct Registry {
    pipeline: Arc<str>,
    entries: Mutex<HashMap<String, InFlight>>,
    next_generation: AtomicU64,
}

impl Registry {
    fn new(pipeline: Arc<str>) -> Self {
        Self {
            pipeline,
            entries: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, InFlight>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report_in_flight(&self, in_flight: usize) {
        #[allow(clippy::cast_precision_loss)] // Gauge values are f64
        gauge!(names::PIPELINE_IN_FLIGHT, "pipeline" => self.pipeline.to_string())
            .set(in_flight as f64);
    }

    /// Claim `key`; `None` if it is already in flight.
    fn register(&self, key: &str) -> Option<(u64, CancellationToken)> {
        let mut entries = self.entries();
        let claimed = match entries.entry(key.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let cancel = CancellationToken::new();
                slot.insert(InFlight {
                    generation,
                    cancel: cancel.clone(),
                });
                Some((generation, cancel))
            }
        };
        let in_flight = entries.len();
        drop(entries);

        if claimed.is_some() {
            self.report_in_flight(in_flight);
        }
        claimed
    }

    /// Remove the entry for `key` if it still belongs to `generation`
    /// (`None` matches any generation).
    fn take(&self, key: &str, generation: Option<u64>) -> Option<InFlight> {
        let mut entries = self.entries();
        let owned = entries
            .get(key)
            .is_some_and(|entry| generation.is_none_or(|g| entry.generation == g));
        let removed = if owned { entries.remove(key) } else { None };
        let in_flight = entries.len();
        drop(entries);

        if removed.is_some() {
            self.report_in_flight(in_flight);
        }
        removed
    }

    /// Termination path: forget the entry without signalling it.
    fn release(&self, key: &str, generation: u64) -> bool {
        self.take(key, Some(generation)).is_some()
    }

    /// Cancellation path: forget the entry and signal its token.
    fn cancel(&self, key: &str, generation: Option<u64>) -> bool {
        match self.take(key, generation) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn cancel_all(&self) -> usize {
        let drained: Vec<InFlight> = self.entries().drain().map(|(_, entry)| entry).collect();
        for entry in &drained {
            entry.cancel.cancel();
        }
        self.report_in_flight(0);
        drained.len()
    }

    fn contains(&self, key: &str) -> bool {
        self.entries().contains_key(key)
    }

    fn len(&self) -> usize {
        self.entries().len()
    }

    fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries().keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Handle to one started execution.
///
/// Cancelling through the handle only affects the execution it was issued
/// for, never a later execution of the same key. Dropping the handle does
/// not cancel anything.
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    target: Option<HandleTarget>,
}

#[derive(Debug, Clone)]
struct HandleTarget {
    registry: Weak<Registry>,
    key: String,
    generation: u64,
}

impl ExecutionHandle {
    /// Handle for a command that was dropped as a duplicate.
    #[must_use]
    pub const fn duplicate() -> Self {
        Self { target: None }
    }

    fn started(registry: &Arc<Registry>, key: &str, generation: u64) -> Self {
        Self {
            target: Some(HandleTarget {
                registry: Arc::downgrade(registry),
                key: key.to_string(),
                generation,
            }),
        }
    }

    /// Whether the command started a new execution (`false` when it was
    /// dropped as a duplicate).
    #[must_use]
    pub const fn is_started(&self) -> bool {
        self.target.is_some()
    }

    /// Key of the started execution.
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        self.target.as_ref().map(|t| t.key.as_str())
    }

    /// Whether this execution is still in flight.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.target.as_ref().is_some_and(|t| {
            t.registry.upgrade().is_some_and(|registry| {
                registry
                    .entries()
                    .get(&t.key)
                    .is_some_and(|entry| entry.generation == t.generation)
            })
        })
    }

    /// Cancel this execution. Returns whether it was still in flight.
    pub fn cancel(&self) -> bool {
        self.target.as_ref().is_some_and(|t| {
            t.registry
                .upgrade()
                .is_some_and(|registry| registry.cancel(&t.key, Some(t.generation)))
        })
    }
}

impl Disposable for ExecutionHandle {
    fn dispose(&self) {
        self.cancel();
    }
}

type OutputHandler<C, O> = Arc<dyn Fn(&C, O) + Send + Sync>;

/// Pipeline allowing at most one in-flight execution per command key.
///
/// # Example
///
/// ```
/// use command_flow_core::command::Command;
/// use command_flow_core::effect::{from_future, FnEffect};
/// use command_flow_runtime::{CommandPipeline, IdempotentPipeline, PipelineConfig};
/// use std::time::Duration;
///
/// #[derive(Clone, Debug)]
/// struct Touch(String);
///
/// impl Command for Touch {
///     fn name(&self) -> &'static str { "touch" }
/// }
///
/// # tokio_test::block_on(async {
/// let pipeline = IdempotentPipeline::new(
///     PipelineConfig::new("touch"),
///     FnEffect::new(|_: Touch, cancel| {
///         from_future(cancel, async {
///             tokio::time::sleep(Duration::from_secs(1)).await;
///             Ok(())
///         })
///     }),
///     |cmd: &Touch| cmd.0.clone(),
///     |_: &Touch, ()| {},
/// );
///
/// let first = pipeline.execute(Touch("a".into())).expect("execute");
/// let second = pipeline.execute(Touch("a".into())).expect("execute");
/// assert!(first.is_started());
/// assert!(!second.is_started());
/// assert!(pipeline.cancel("a"));
/// assert!(!pipeline.cancel("a"));
/// # });
/// ```
pub struct IdempotentPipeline<E: Effect> {
    config: PipelineConfig,
    name: Arc<str>,
    effect: Arc<E>,
    keys: Arc<dyn CommandKey<E::Command>>,
    on_output: OutputHandler<E::Command, E::Output>,
    registry: Arc<Registry>,
    failures: Subject<PipelineFailure>,
    tracker: Option<StatusTracker>,
}

impl<E: Effect> IdempotentPipeline<E> {
    /// Create a pipeline running `effect`, deduplicating by `keys` and
    /// handing every successful output to `on_output`.
    #[must_use]
    pub fn new<K, F>(config: PipelineConfig, effect: E, keys: K, on_output: F) -> Self
    where
        K: CommandKey<E::Command> + 'static,
        F: Fn(&E::Command, E::Output) + Send + Sync + 'static,
    {
        let name: Arc<str> = Arc::from(config.name.as_str());
        Self {
            registry: Arc::new(Registry::new(Arc::clone(&name))),
            name,
            config,
            effect: Arc::new(effect),
            keys: Arc::new(keys),
            on_output: Arc::new(on_output),
            failures: Subject::new(),
            tracker: None,
        }
    }

    /// Report every execution to `tracker`, so its status cell shows
    /// `Loading` while any execution of this pipeline runs.
    #[must_use]
    pub fn with_tracker(mut self, tracker: StatusTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Create a pipeline folding every output into `state` with `reducer`.
    ///
    /// The reducer runs once per successful emission and never for failed or
    /// cancelled executions.
    #[must_use]
    pub fn with_reducer<K, R>(
        config: PipelineConfig,
        effect: E,
        keys: K,
        state: ReactiveState<R::State>,
        reducer: R,
    ) -> Self
    where
        K: CommandKey<E::Command> + 'static,
        R: Reducer<Command = E::Command, Output = E::Output> + 'static,
        R::State: Clone + PartialEq + Send + Sync + 'static,
    {
        Self::new(config, effect, keys, move |command, output| {
            if state
                .update(|current| reducer.reduce(current, command, &output))
                .is_err()
            {
                tracing::debug!(command = command.name(), "State disposed; dropping output");
            }
        })
    }

    /// The pipeline configuration.
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Number of in-flight executions.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.registry.len()
    }

    /// Keys of in-flight executions, sorted.
    #[must_use]
    pub fn in_flight_keys(&self) -> Vec<String> {
        self.registry.keys()
    }

    /// Observe executions that ended with an effect error.
    pub fn on_failure<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&PipelineFailure) + Send + Sync + 'static,
    {
        self.failures.subscribe(observer)
    }

    fn source(&self, command: &E::Command, cancel: &CancellationToken) -> ResultStream<E::Output> {
        let source = match &self.config.retry_policy {
            Some(policy) => {
                let effect = Arc::clone(&self.effect);
                let command = command.clone();
                let cancel = cancel.clone();
                retry_with_backoff(policy.clone(), move || {
                    effect.handle(command.clone(), cancel.clone())
                })
            }
            None => self.effect.handle(command.clone(), cancel.clone()),
        };

        match &self.tracker {
            Some(tracker) => tracker.track(source),
            None => source,
        }
    }
}

impl<E: Effect> CommandPipeline for IdempotentPipeline<E> {
    type Command = E::Command;

    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, command: E::Command) -> Result<ExecutionHandle, PipelineError> {
        let key = self.keys.key(&command)?;
        let runtime = Handle::try_current().map_err(|_| PipelineError::NoRuntime)?;

        let Some((generation, cancel)) = self.registry.register(&key) else {
            tracing::debug!(
                pipeline = %self.name,
                key = %key,
                command = command.name(),
                "Command already in flight, dropping duplicate"
            );
            counter!(names::PIPELINE_DEDUPLICATED, "pipeline" => self.name.to_string())
                .increment(1);
            return Ok(ExecutionHandle::duplicate());
        };
        self.keys.claimed(&key);

        tracing::info!(
            pipeline = %self.name,
            key = %key,
            command = command.name(),
            "Executing command"
        );
        counter!(names::PIPELINE_STARTED, "pipeline" => self.name.to_string()).increment(1);

        let source = self.source(&command, &cancel);
        let handle = ExecutionHandle::started(&self.registry, &key, generation);
        let span = tracing::info_span!(
            "pipeline_execution",
            pipeline = %self.name,
            key = %key,
            command = command.name()
        );
        let execution = Execution {
            pipeline: Arc::clone(&self.name),
            key,
            generation,
            command,
            cancel,
            registry: Arc::clone(&self.registry),
            on_output: Arc::clone(&self.on_output),
            failures: self.failures.clone(),
        };
        runtime.spawn(execution.drive(source).instrument(span));

        Ok(handle)
    }

    fn cancel(&self, key: &str) -> bool {
        let cancelled = self.registry.cancel(key, None);
        if cancelled {
            tracing::debug!(pipeline = %self.name, key, "Cancelled execution");
        }
        cancelled
    }

    fn cancel_current(&self) -> bool {
        self.keys
            .current_key()
            .is_some_and(|key| self.cancel(&key))
    }

    fn cancel_all(&self) -> usize {
        let cancelled = self.registry.cancel_all();
        if cancelled > 0 {
            tracing::info!(pipeline = %self.name, cancelled, "Cancelled all executions");
        }
        cancelled
    }

    fn is_running(&self, key: &str) -> bool {
        self.registry.contains(key)
    }
}

impl<E: Effect> fmt::Debug for IdempotentPipeline<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdempotentPipeline")
            .field("config", &self.config)
            .field("in_flight", &self.registry.len())
            .finish_non_exhaustive()
    }
}

/// One spawned execution.
struct Execution<C, O> {
    pipeline: Arc<str>,
    key: String,
    generation: u64,
    command: C,
    cancel: CancellationToken,
    registry: Arc<Registry>,
    on_output: OutputHandler<C, O>,
    failures: Subject<PipelineFailure>,
}

impl<C, O> Execution<C, O>
where
    C: Command,
    O: Send + 'static,
{
    async fn drive(self, mut source: ResultStream<O>) {
        let started = Instant::now();

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => {
                    tracing::debug!("Execution cancelled");
                    counter!(names::PIPELINE_CANCELLED, "pipeline" => self.pipeline.to_string())
                        .increment(1);
                    break;
                }

                item = source.next() => match item {
                    Some(Ok(output)) => {
                        if !self.cancel.is_cancelled() {
                            (self.on_output)(&self.command, output);
                        }
                    }
                    Some(Err(error)) => {
                        self.fail(error);
                        break;
                    }
                    None => {
                        self.registry.release(&self.key, self.generation);
                        tracing::debug!("Execution completed");
                        counter!(names::PIPELINE_COMPLETED, "pipeline" => self.pipeline.to_string())
                            .increment(1);
                        break;
                    }
                }
            }
        }

        histogram!(names::PIPELINE_DURATION, "pipeline" => self.pipeline.to_string())
            .record(started.elapsed().as_secs_f64());
    }

    fn fail(&self, error: EffectError) {
        self.registry.release(&self.key, self.generation);
        tracing::warn!(error = %error, "Execution failed");
        counter!(names::PIPELINE_FAILED, "pipeline" => self.pipeline.to_string()).increment(1);
        self.failures.next(&PipelineFailure {
            pipeline: self.pipeline.to_string(),
            key: self.key.clone(),
            command: self.command.name(),
            error,
        });
    }
}

impl<C, O> Drop for Execution<C, O> {
    fn drop(&mut self) {
        // Task aborted (runtime shutdown) before reaching a terminal item.
        self.registry.release(&self.key, self.generation);
    }
}
