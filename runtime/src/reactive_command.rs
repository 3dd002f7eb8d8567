//! Reactive commands.
//!
//! A [`ReactiveCommand`] is the UI-facing trigger for an effect. Each
//! `execute` starts one execution on the Tokio runtime; every execution's
//! values are broadcast on one shared result feed, so any number of
//! observers see the same values without re-running the effect.
//!
//! Failures never reach the result feed. They are reported on the error
//! feed and, when a status tracker is attached, through the status cell.
//! The command keeps accepting executions after a failure.
//!
//! Unlike [`IdempotentPipeline`](crate::pipeline::IdempotentPipeline), a
//! reactive command does not deduplicate: two `execute` calls run the effect
//! twice.

use crate::error::PipelineError;
use crate::metrics::{counter, names};
use crate::retry::{RetryPolicy, retry_with_backoff};
use command_flow_core::async_state::{AsyncState, StatusTracker};
use command_flow_core::command::Command;
use command_flow_core::disposable::Disposable;
use command_flow_core::effect::{Effect, FnEffect, ResultStream};
use command_flow_core::error::EffectError;
use command_flow_core::reducer::Reducer;
use command_flow_core::subject::{Subject, Subscription};
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

type ResultHandler<C, O> = Arc<dyn Fn(&C, &O) + Send + Sync>;

struct Inner<E: Effect> {
    name: String,
    effect: Arc<E>,
    tracker: Option<StatusTracker>,
    on_result: Option<ResultHandler<E::Command, E::Output>>,
    retry: Option<RetryPolicy>,
    results: Subject<E::Output>,
    errors: Subject<EffectError>,
    shutdown: CancellationToken,
    running: AtomicUsize,
}

impl<E: Effect> Inner<E> {
    fn source(&self, command: &E::Command, cancel: &CancellationToken) -> ResultStream<E::Output> {
        let source = match &self.retry {
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

    /// Drive one execution; `running` was incremented by the caller.
    async fn run(self: Arc<Self>, command: E::Command, cancel: CancellationToken) {
        let mut source = self.source(&command, &cancel);

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    tracing::debug!("Command execution cancelled");
                    break;
                }

                item = source.next() => match item {
                    Some(Ok(output)) => {
                        if cancel.is_cancelled() {
                            continue;
                        }
                        if let Some(on_result) = &self.on_result {
                            on_result(&command, &output);
                        }
                        self.results.next(&output);
                    }
                    Some(Err(error)) => {
                        tracing::warn!(error = %error, "Command execution failed");
                        counter!(names::COMMAND_ERRORS, "command" => self.name.clone())
                            .increment(1);
                        self.errors.next(&error);
                        break;
                    }
                    None => break,
                }
            }
        }

        // Releases the status tracker before the running count drops.
        drop(source);
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Triggerable command with a shared result feed.
///
/// # Example
///
/// ```
/// use command_flow_core::async_state::AsyncState;
/// use command_flow_core::command::Command;
/// use command_flow_core::effect::{just, FnEffect};
/// use command_flow_core::reducer::FnReducer;
/// use command_flow_runtime::ReactiveCommand;
///
/// #[derive(Clone, Debug)]
/// struct Add(i64);
///
/// impl Command for Add {
///     fn name(&self) -> &'static str { "add" }
/// }
///
/// # tokio_test::block_on(async {
/// let total = AsyncState::new(0i64);
/// let add = ReactiveCommand::with_reducer(
///     &total,
///     FnEffect::new(|cmd: Add, _| just(cmd.0)),
///     FnReducer::new(|sum: &i64, _: &Add, n: &i64| sum + n),
/// );
///
/// add.execute(Add(5)).expect("execute");
/// # });
/// ```
pub struct ReactiveCommand<E: Effect> {
    inner: Arc<Inner<E>>,
}

impl<E: Effect> Clone for ReactiveCommand<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Effect> ReactiveCommand<E> {
    /// Start building a command around `effect`.
    #[must_use]
    pub fn builder(effect: E) -> ReactiveCommandBuilder<E> {
        ReactiveCommandBuilder {
            name: None,
            effect,
            tracker: None,
            on_result: None,
            retry: None,
        }
    }

    /// A command with no status tracking and no result callback.
    #[must_use]
    pub fn new(effect: E) -> Self {
        Self::builder(effect).build()
    }

    /// A command whose status drives `state`'s status cell and whose
    /// results are folded into `state`'s data cell by `reducer`.
    #[must_use]
    pub fn with_reducer<R>(state: &AsyncState<R::State>, effect: E, reducer: R) -> Self
    where
        R: Reducer<Command = E::Command, Output = E::Output> + 'static,
        R::State: Clone + PartialEq + Send + Sync + 'static,
    {
        let data = state.data().clone();
        Self::builder(effect)
            .tracker(state.tracker().clone())
            .on_result(move |command, output| {
                if data
                    .update(|current| reducer.reduce(current, command, output))
                    .is_err()
                {
                    tracing::debug!(command = command.name(), "State disposed; dropping result");
                }
            })
            .build()
    }

    /// Command name, for logs and metric labels.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Trigger one execution of the effect.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::Disposed`] after [`dispose`](Self::dispose)
    /// - [`PipelineError::NoRuntime`] if called outside a Tokio runtime
    pub fn execute(&self, command: E::Command) -> Result<(), PipelineError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(PipelineError::Disposed);
        }
        let runtime = Handle::try_current().map_err(|_| PipelineError::NoRuntime)?;

        tracing::debug!(command = command.name(), "Executing reactive command");
        counter!(names::COMMAND_EXECUTIONS, "command" => self.inner.name.clone()).increment(1);

        let span = tracing::debug_span!(
            "reactive_command",
            name = %self.inner.name,
            command = command.name()
        );
        let cancel = self.inner.shutdown.child_token();
        self.inner.running.fetch_add(1, Ordering::SeqCst);
        runtime.spawn(Arc::clone(&self.inner).run(command, cancel).instrument(span));
        Ok(())
    }

    /// Observe every successful output of every execution.
    pub fn results<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&E::Output) + Send + Sync + 'static,
    {
        self.inner.results.subscribe(observer)
    }

    /// Observe execution failures.
    pub fn errors<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&EffectError) + Send + Sync + 'static,
    {
        self.inner.errors.subscribe(observer)
    }

    /// Number of executions currently running.
    #[must_use]
    pub fn running(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Whether [`dispose`](Self::dispose) has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Cancel running executions, complete both feeds and reject further
    /// executions. Idempotent.
    pub fn dispose(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        self.inner.results.complete();
        self.inner.errors.complete();
        tracing::debug!(name = %self.inner.name, "Reactive command disposed");
    }
}

impl<C, O, F> ReactiveCommand<FnEffect<C, O, F>>
where
    C: Command,
    O: Send + 'static,
    F: Fn(C, CancellationToken) -> ResultStream<O> + Send + Sync + 'static,
{
    /// A command around a closure returning a result stream.
    #[must_use]
    pub fn from_fn(f: F) -> Self {
        Self::new(FnEffect::new(f))
    }
}

impl<E: Effect> Disposable for ReactiveCommand<E> {
    fn dispose(&self) {
        Self::dispose(self);
    }
}

impl<E: Effect> fmt::Debug for ReactiveCommand<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactiveCommand")
            .field("name", &self.inner.name)
            .field("running", &self.running())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

/// Builder for [`ReactiveCommand`].
pub struct ReactiveCommandBuilder<E: Effect> {
    name: Option<String>,
    effect: E,
    tracker: Option<StatusTracker>,
    on_result: Option<ResultHandler<E::Command, E::Output>>,
    retry: Option<RetryPolicy>,
}

impl<E: Effect> ReactiveCommandBuilder<E> {
    /// Set the name used in logs and metrics.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Drive `tracker`'s status cell from every execution.
    #[must_use]
    pub fn tracker(mut self, tracker: StatusTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Call `f` with each successful output, before result observers.
    #[must_use]
    pub fn on_result<F>(mut self, f: F) -> Self
    where
        F: Fn(&E::Command, &E::Output) + Send + Sync + 'static,
    {
        self.on_result = Some(Arc::new(f));
        self
    }

    /// Retry failing executions with `policy`.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Build the command.
    #[must_use]
    pub fn build(self) -> ReactiveCommand<E> {
        ReactiveCommand {
            inner: Arc::new(Inner {
                name: self
                    .name
                    .unwrap_or_else(|| std::any::type_name::<E::Command>().to_string()),
                effect: Arc::new(self.effect),
                tracker: self.tracker,
                on_result: self.on_result,
                retry: self.retry,
                results: Subject::new(),
                errors: Subject::new(),
                shutdown: CancellationToken::new(),
                running: AtomicUsize::new(0),
            }),
        }
    }
}
