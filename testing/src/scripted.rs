//! Scripted effects.
//!
//! [`ScriptedEffect`] plays back a prepared [`Script`] per invocation:
//! values, failures, delays, or waiting for cancellation. It records every
//! command it ran and how many runs were cancelled, so tests can assert on
//! dedupe, retry and cancellation behavior without a real backend.

use command_flow_core::CancellationToken;
use command_flow_core::command::Command;
use command_flow_core::effect::{Effect, ResultStream};
use command_flow_core::error::EffectError;
use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
enum Step<O> {
    Value(O),
    Fail(EffectError),
    Delay(Duration),
    Pending,
}

/// What one invocation of a [`ScriptedEffect`] does, step by step.
///
/// A script that runs out of steps completes the stream.
#[derive(Debug, Clone)]
pub struct Script<O> {
    steps: Vec<Step<O>>,
}

impl<O> Default for Script<O> {
    fn default() -> Self {
        Self { steps: Vec::new() }
    }
}

impl<O> Script<O> {
    /// An empty script (completes without values).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A script yielding `value` once.
    #[must_use]
    pub fn ok(value: O) -> Self {
        Self::new().value(value)
    }

    /// A script failing with `error`.
    #[must_use]
    pub fn err(error: EffectError) -> Self {
        Self::new().fail(error)
    }

    /// A script that never produces anything and ends on cancellation.
    #[must_use]
    pub fn pending() -> Self {
        Self::new().wait_for_cancel()
    }

    /// Yield `value`.
    #[must_use]
    pub fn value(mut self, value: O) -> Self {
        self.steps.push(Step::Value(value));
        self
    }

    /// Fail with `error`; later steps are never reached.
    #[must_use]
    pub fn fail(mut self, error: EffectError) -> Self {
        self.steps.push(Step::Fail(error));
        self
    }

    /// Sleep for `delay` (cancellable).
    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.steps.push(Step::Delay(delay));
        self
    }

    /// Wait until the execution is cancelled.
    #[must_use]
    pub fn wait_for_cancel(mut self) -> Self {
        self.steps.push(Step::Pending);
        self
    }
}

struct Shared<C, O> {
    scripts: Mutex<VecDeque<Script<O>>>,
    fallback: Mutex<Script<O>>,
    commands: Mutex<Vec<C>>,
    invocations: AtomicUsize,
    cancellations: AtomicUsize,
}

/// Effect playing back scripts, one per invocation.
///
/// Queued scripts run in order; once the queue is empty every invocation
/// runs the fallback script (by default: complete without values). An
/// invocation counts when its stream is first polled, not when `handle` is
/// called.
///
/// # Example
///
/// ```
/// use command_flow_core::command::Command;
/// use command_flow_core::effect::Effect;
/// use command_flow_core::error::EffectError;
/// use command_flow_core::CancellationToken;
/// use command_flow_testing::{Script, ScriptedEffect};
/// use futures::StreamExt;
///
/// #[derive(Clone, Debug)]
/// struct Ping;
///
/// impl Command for Ping {
///     fn name(&self) -> &'static str { "ping" }
/// }
///
/// # tokio_test::block_on(async {
/// let effect = ScriptedEffect::<Ping, u32>::new()
///     .then(Script::err(EffectError::http(503, "busy")))
///     .always(Script::ok(1));
///
/// let first: Vec<_> = effect.handle(Ping, CancellationToken::new()).collect().await;
/// let second: Vec<_> = effect.handle(Ping, CancellationToken::new()).collect().await;
///
/// assert_eq!(first, vec![Err(EffectError::http(503, "busy"))]);
/// assert_eq!(second, vec![Ok(1)]);
/// assert_eq!(effect.invocations(), 2);
/// # });
/// ```
pub struct ScriptedEffect<C, O> {
    shared: Arc<Shared<C, O>>,
    _types: PhantomData<fn(C) -> O>,
}

impl<C, O> Clone for ScriptedEffect<C, O> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            _types: PhantomData,
        }
    }
}

impl<C, O> Default for ScriptedEffect<C, O> {
    fn default() -> Self {
        Self {
            shared: Arc::new(Shared {
                scripts: Mutex::new(VecDeque::new()),
                fallback: Mutex::new(Script::new()),
                commands: Mutex::new(Vec::new()),
                invocations: AtomicUsize::new(0),
                cancellations: AtomicUsize::new(0),
            }),
            _types: PhantomData,
        }
    }
}

impl<C, O> ScriptedEffect<C, O>
where
    C: Clone,
    O: Clone,
{
    /// An effect whose every invocation completes without values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `script` for the next unscripted invocation.
    #[must_use]
    pub fn then(self, script: Script<O>) -> Self {
        self.push(script);
        self
    }

    /// Run `script` whenever the queue is empty.
    #[must_use]
    pub fn always(self, script: Script<O>) -> Self {
        *lock(&self.shared.fallback) = script;
        self
    }

    /// Queue `script` through a shared handle.
    pub fn push(&self, script: Script<O>) {
        lock(&self.shared.scripts).push_back(script);
    }

    /// Number of invocations whose stream was polled.
    #[must_use]
    pub fn invocations(&self) -> usize {
        self.shared.invocations.load(Ordering::SeqCst)
    }

    /// Number of invocations that observed cancellation.
    #[must_use]
    pub fn cancellations(&self) -> usize {
        self.shared.cancellations.load(Ordering::SeqCst)
    }

    /// Commands of every polled invocation, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<C> {
        lock(&self.shared.commands).clone()
    }

    fn next_script(&self) -> Script<O> {
        let queued = lock(&self.shared.scripts).pop_front();
        queued.unwrap_or_else(|| lock(&self.shared.fallback).clone())
    }
}

impl<C, O> Effect for ScriptedEffect<C, O>
where
    C: Command,
    O: Clone + Send + Sync + 'static,
{
    type Command = C;
    type Output = O;

    fn handle(&self, command: C, cancel: CancellationToken) -> ResultStream<O> {
        let effect = self.clone();
        Box::pin(async_stream::stream! {
            effect.shared.invocations.fetch_add(1, Ordering::SeqCst);
            lock(&effect.shared.commands).push(command);
            let script = effect.next_script();

            for step in script.steps {
                match step {
                    Step::Value(value) => {
                        yield Ok(value);
                    }
                    Step::Fail(error) => {
                        yield Err(error);
                        break;
                    }
                    Step::Delay(delay) => {
                        let cancelled = tokio::select! {
                            () = cancel.cancelled() => true,
                            () = tokio::time::sleep(delay) => false,
                        };
                        if cancelled {
                            effect.shared.cancellations.fetch_add(1, Ordering::SeqCst);
                            break;
                        }
                    }
                    Step::Pending => {
                        cancel.cancelled().await;
                        effect.shared.cancellations.fetch_add(1, Ordering::SeqCst);
                        break;
                    }
                }
            }
        })
    }
}

impl<C, O> fmt::Debug for ScriptedEffect<C, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedEffect")
            .field("invocations", &self.shared.invocations.load(Ordering::SeqCst))
            .field("cancellations", &self.shared.cancellations.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[derive(Clone, Debug, PartialEq, Eq)]
    struct Ping(u8);

    impl Command for Ping {
        fn name(&self) -> &'static str {
            "ping"
        }
    }

    #[tokio::test]
    async fn test_scripts_run_in_order_then_fallback() {
        let effect = ScriptedEffect::<Ping, &'static str>::new()
            .then(Script::ok("first"))
            .then(Script::new().value("a").value("b"))
            .always(Script::ok("again"));

        let mut seen = Vec::new();
        for n in 0..4 {
            let items: Vec<_> = effect.handle(Ping(n), CancellationToken::new()).collect().await;
            seen.push(items);
        }

        assert_eq!(
            seen,
            vec![
                vec![Ok("first")],
                vec![Ok("a"), Ok("b")],
                vec![Ok("again")],
                vec![Ok("again")],
            ]
        );
        assert_eq!(effect.commands(), vec![Ping(0), Ping(1), Ping(2), Ping(3)]);
    }

    #[tokio::test]
    async fn test_handle_is_cold() {
        let effect = ScriptedEffect::<Ping, u8>::new().always(Script::ok(1));
        let stream = effect.handle(Ping(1), CancellationToken::new());
        assert_eq!(effect.invocations(), 0);
        drop(stream);
        assert_eq!(effect.invocations(), 0);
    }

    #[tokio::test]
    async fn test_pending_ends_on_cancel() {
        let effect = ScriptedEffect::<Ping, u8>::new().always(Script::pending());
        let cancel = CancellationToken::new();
        let stream = effect.handle(Ping(1), cancel.clone());

        let collector = tokio::spawn(stream.collect::<Vec<_>>());
        tokio::task::yield_now().await;
        cancel.cancel();

        let items = collector.await.unwrap_or_default();
        assert!(items.is_empty());
        assert_eq!(effect.cancellations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_then_value() {
        let effect = ScriptedEffect::<Ping, u8>::new()
            .always(Script::new().delay(Duration::from_millis(300)).value(9));

        let started = tokio::time::Instant::now();
        let items: Vec<_> = effect.handle(Ping(0), CancellationToken::new()).collect().await;

        assert_eq!(items, vec![Ok(9)]);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }
}
