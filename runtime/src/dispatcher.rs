//! Command dispatch.
//!
//! The dispatcher routes a command to every pipeline registered for its
//! command family. Pipelines are registered explicitly at startup; there is
//! no discovery. Each family may have several pipelines (for example one
//! loading data and one recording an audit trail), and each receives its own
//! copy of the command.

use crate::error::PipelineError;
use crate::pipeline::{CommandPipeline, ExecutionHandle};
use command_flow_core::command::Command;
use command_flow_core::disposable::Disposable;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

type Pipelines<C> = Vec<Arc<dyn CommandPipeline<Command = C>>>;

/// Family-independent view of a pipeline, used at shutdown.
trait Teardown: Send + Sync {
    fn pipeline_name(&self) -> &str;
    fn shutdown(&self) -> usize;
}

impl<P> Teardown for P
where
    P: CommandPipeline,
{
    fn pipeline_name(&self) -> &str {
        self.name()
    }

    fn shutdown(&self) -> usize {
        self.cancel_all()
    }
}

/// Routes commands to the pipelines of their family.
///
/// Created at application startup and disposed at shutdown. Disposal
/// cancels every in-flight execution of every registered pipeline.
#[derive(Default)]
pub struct CommandDispatcher {
    routes: RwLock<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
    teardown: Mutex<Vec<Arc<dyn Teardown>>>,
    disposed: AtomicBool,
}

impl CommandDispatcher {
    /// Create a dispatcher with no pipelines.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `pipeline` for its command family.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Disposed`] after [`dispose`](Self::dispose);
    /// the pipeline is then not routed and its in-flight work is cancelled.
    pub fn register<P>(&self, pipeline: Arc<P>) -> Result<(), PipelineError>
    where
        P: CommandPipeline + 'static,
    {
        let mut teardown = self.teardown.lock().unwrap_or_else(PoisonError::into_inner);
        if self.disposed.load(Ordering::Acquire) {
            drop(teardown);
            let cancelled = pipeline.cancel_all();
            tracing::warn!(
                pipeline = pipeline.name(),
                cancelled,
                "Dispatcher disposed, rejecting pipeline"
            );
            return Err(PipelineError::Disposed);
        }
        tracing::debug!(
            pipeline = pipeline.name(),
            family = std::any::type_name::<P::Command>(),
            "Registered command pipeline"
        );
        teardown.push(pipeline.clone() as Arc<dyn Teardown>);

        let pipeline: Arc<dyn CommandPipeline<Command = P::Command>> = pipeline;
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        let route = routes.entry(TypeId::of::<P::Command>()).or_insert_with(|| {
            Box::new(Pipelines::<P::Command>::new()) as Box<dyn Any + Send + Sync>
        });
        if let Some(pipelines) = route.downcast_mut::<Pipelines<P::Command>>() {
            pipelines.push(pipeline);
        }
        Ok(())
    }

    /// Pipelines registered for command family `C`, in registration order.
    #[must_use]
    pub fn pipelines<C: Command>(&self) -> Pipelines<C> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&TypeId::of::<C>())
            .and_then(|route| route.downcast_ref::<Pipelines<C>>())
            .cloned()
            .unwrap_or_default()
    }

    /// Send `command` to every pipeline of its family.
    ///
    /// Returns one handle per pipeline; a handle is not started when that
    /// pipeline dropped the command as a duplicate. A family without
    /// pipelines is logged and ignored.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::Disposed`] after [`dispose`](Self::dispose)
    /// - any error a pipeline returns from `execute` (later pipelines are
    ///   not tried)
    #[tracing::instrument(skip(self, command), fields(command = command.name()), name = "dispatch")]
    pub fn dispatch<C: Command>(&self, command: C) -> Result<Vec<ExecutionHandle>, PipelineError> {
        if self.disposed.load(Ordering::Acquire) {
            tracing::warn!("Dispatcher disposed, rejecting command");
            return Err(PipelineError::Disposed);
        }

        let pipelines = self.pipelines::<C>();
        if pipelines.is_empty() {
            tracing::warn!("No pipeline registered for command");
            return Ok(Vec::new());
        }

        pipelines
            .iter()
            .map(|pipeline| pipeline.execute(command.clone()))
            .collect()
    }

    /// Cancel `key` in every pipeline of family `C`. Returns how many
    /// executions were cancelled.
    pub fn cancel<C: Command>(&self, key: &str) -> usize {
        self.pipelines::<C>()
            .iter()
            .filter(|pipeline| pipeline.cancel(key))
            .count()
    }

    /// Cancel the ambient-context execution in every pipeline of family
    /// `C`. Returns how many executions were cancelled.
    pub fn cancel_current<C: Command>(&self) -> usize {
        self.pipelines::<C>()
            .iter()
            .filter(|pipeline| pipeline.cancel_current())
            .count()
    }

    /// Number of registered pipelines across all families.
    #[must_use]
    pub fn pipeline_count(&self) -> usize {
        self.teardown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether [`dispose`](Self::dispose) has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Cancel all in-flight work and reject further dispatches.
    /// Idempotent.
    pub fn dispose(&self) {
        let mut teardown = self.teardown.lock().unwrap_or_else(PoisonError::into_inner);
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let pipelines: Vec<Arc<dyn Teardown>> = teardown.drain(..).collect();
        drop(teardown);
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        let cancelled: usize = pipelines
            .iter()
            .map(|pipeline| {
                let cancelled = pipeline.shutdown();
                tracing::debug!(
                    pipeline = pipeline.pipeline_name(),
                    cancelled,
                    "Pipeline shut down"
                );
                cancelled
            })
            .sum();
        tracing::info!(
            pipelines = pipelines.len(),
            cancelled,
            "Command dispatcher disposed"
        );
    }
}

impl Disposable for CommandDispatcher {
    fn dispose(&self) {
        Self::dispose(self);
    }
}

impl fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("pipelines", &self.pipeline_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
