//! Effect contract.
//!
//! An effect is the side-effect boundary of the framework: given a command
//! and a cancellation token it returns a [`ResultStream`] describing the work.
//! The stream is *cold*: nothing happens until it is polled, and polling it
//! twice (via two `handle` calls) performs the work twice.
//!
//! # Rules for implementors
//!
//! - Do not start work in `handle` itself; put it inside the returned stream.
//! - Report request-shaped failures as `Err` items, never by panicking.
//! - An `Err` item is terminal: consumers stop polling after it.
//! - Stop producing values once the token is cancelled. Cancellation is not
//!   an error; the stream simply ends.

use crate::command::Command;
use crate::error::EffectError;
use futures::stream::{self, BoxStream, StreamExt};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Asynchronous sequence of effect results.
pub type ResultStream<T> = BoxStream<'static, Result<T, EffectError>>;

/// Handler executing one command family.
///
/// # Example
///
/// ```
/// use command_flow_core::effect::{Effect, ResultStream, from_future};
/// use command_flow_core::command::Command;
/// use command_flow_core::CancellationToken;
///
/// #[derive(Clone, Debug)]
/// struct Ping;
///
/// impl Command for Ping {
///     fn name(&self) -> &'static str { "ping" }
/// }
///
/// struct PingEffect;
///
/// impl Effect for PingEffect {
///     type Command = Ping;
///     type Output = &'static str;
///
///     fn handle(&self, _: Ping, cancel: CancellationToken) -> ResultStream<&'static str> {
///         from_future(cancel, async { Ok("pong") })
///     }
/// }
/// ```
pub trait Effect: Send + Sync + 'static {
    /// The command family handled
    type Command: Command;

    /// The value produced on success
    type Output: Send + 'static;

    /// Describe the work for `command`.
    fn handle(&self, command: Self::Command, cancel: CancellationToken)
    -> ResultStream<Self::Output>;
}

impl<E> Effect for Arc<E>
where
    E: Effect + ?Sized,
{
    type Command = E::Command;
    type Output = E::Output;

    fn handle(
        &self,
        command: Self::Command,
        cancel: CancellationToken,
    ) -> ResultStream<Self::Output> {
        (**self).handle(command, cancel)
    }
}

/// [`Effect`] backed by a closure returning a stream.
pub struct FnEffect<C, O, F> {
    f: F,
    _types: PhantomData<fn(C) -> O>,
}

impl<C, O, F> FnEffect<C, O, F>
where
    C: Command,
    O: Send + 'static,
    F: Fn(C, CancellationToken) -> ResultStream<O> + Send + Sync + 'static,
{
    /// Wrap `f` as an effect.
    #[must_use]
    pub const fn new(f: F) -> Self {
        Self {
            f,
            _types: PhantomData,
        }
    }
}

impl<C, O, F> Effect for FnEffect<C, O, F>
where
    C: Command,
    O: Send + 'static,
    F: Fn(C, CancellationToken) -> ResultStream<O> + Send + Sync + 'static,
{
    type Command = C;
    type Output = O;

    fn handle(&self, command: C, cancel: CancellationToken) -> ResultStream<O> {
        (self.f)(command, cancel)
    }
}

/// Single-value stream from a future, abandoned when `cancel` fires.
///
/// The future is not polled until the stream is, which keeps the effect
/// cold.
pub fn from_future<T, Fut>(cancel: CancellationToken, future: Fut) -> ResultStream<T>
where
    T: Send + 'static,
    Fut: Future<Output = Result<T, EffectError>> + Send + 'static,
{
    cancellable(cancel, stream::once(future).boxed())
}

/// End `source` as soon as `cancel` fires, without an error item.
pub fn cancellable<T>(cancel: CancellationToken, source: ResultStream<T>) -> ResultStream<T>
where
    T: Send + 'static,
{
    source.take_until(cancel.cancelled_owned()).boxed()
}

/// Stream yielding `value` once.
pub fn just<T>(value: T) -> ResultStream<T>
where
    T: Send + 'static,
{
    stream::once(async move { Ok(value) }).boxed()
}

/// Stream failing with `error`.
pub fn fail<T>(error: EffectError) -> ResultStream<T>
where
    T: Send + 'static,
{
    stream::once(async move { Err(error) }).boxed()
}

/// Stream completing without values.
pub fn empty<T>() -> ResultStream<T>
where
    T: Send + 'static,
{
    stream::empty().boxed()
}
