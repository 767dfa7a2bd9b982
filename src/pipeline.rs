use crate::config::PipelineConfig;
use crate::context::Context;
use crate::error::{PipelineError, StepError};
use crate::event::{ContextEvent, Listeners, PipelineEvent, RunId, Subscription};
use crate::step::{Step, StepName};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use std::task::{self, Poll};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

/// An ordered, append-only list of steps run one after another against a
/// shared [`Context`].
///
/// A pipeline can be run any number of times, also concurrently; every run
/// keeps its own cursor and context. A pipeline is itself a [`Step`], so it
/// can be nested inside another pipeline, where it shares the parent's context.
///
/// # Examples
///
/// ```
/// use nagare::prelude::*;
///
/// # #[tokio::main]
/// # async fn main() {
/// let pipeline = pipe![
///     from_fn(|ctx: Context| {
///         ctx.data().insert("one", 1i64);
///         ctx.done();
///     }),
///     from_fn(|ctx: Context| {
///         let one = ctx.data().get::<i64>("one").copied().unwrap_or_default();
///         ctx.data().insert("two", one + 1);
///         ctx.done();
///     }),
/// ];
///
/// let run = pipeline.run(Data::new());
/// let ctx = run.context();
/// run.await.expect("both steps succeed");
///
/// assert_eq!(ctx.data().get::<i64>("one"), Some(&1));
/// assert_eq!(ctx.data().get::<i64>("two"), Some(&2));
/// # }
/// ```
pub struct Pipeline {
    config: PipelineConfig,
    steps: RwLock<Vec<Arc<dyn Step>>>,
    listeners: Listeners<PipelineEvent>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let steps = self.read_steps(|steps| steps.iter().map(|s| s.name()).collect::<Vec<_>>());
        f.debug_struct("Pipeline")
            .field("name", &self.config.name)
            .field("steps", &steps)
            .finish()
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    /// Creates an empty pipeline.
    pub fn new() -> Self {
        Self::with_config(PipelineConfig::default())
    }

    /// Creates an empty pipeline with the given name.
    pub fn named(name: impl Into<String>) -> Self {
        Self::with_config(PipelineConfig { name: name.into() })
    }

    pub fn with_config(config: PipelineConfig) -> Self {
        Self {
            config,
            steps: RwLock::new(Vec::new()),
            listeners: Listeners::default(),
        }
    }

    /// Creates a pipeline holding `steps` in iteration order.
    pub fn from_steps<I>(steps: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Step>>,
    {
        let pipeline = Self::new();
        pipeline
            .steps
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(steps);
        pipeline
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Appends a step and returns the pipeline, so calls can be chained.
    ///
    /// Appending is allowed at any time, even while runs are in flight; a run
    /// that has not yet passed the end of the list will execute the new step.
    pub fn step<S: Step + 'static>(&self, step: S) -> &Self {
        self.steps
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(step));
        self
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.read_steps(|steps| steps.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attaches a listener that receives the events of every later run.
    pub fn subscribe(&self) -> Subscription<PipelineEvent> {
        self.listeners.subscribe()
    }

    /// Prepares a run over `input`, a [`Context`] to reuse or [`Data`](crate::Data)
    /// to wrap in a fresh one.
    ///
    /// The context is available right away through [`Run::context`]. No step
    /// starts until the returned [`Run`] is awaited, so data inserted into that
    /// context before awaiting is visible to the first step. Use
    /// [`spawn`](Pipeline::spawn) to start executing immediately.
    pub fn run(&self, input: impl Into<Context>) -> Run<'_> {
        let ctx = input.into();
        let id = RunId::next();
        let task_ctx = ctx.clone();
        let future = async move { self.drive(&task_ctx, id).await };
        Run {
            id,
            ctx,
            future: Box::pin(future),
        }
    }

    /// Starts a run on the tokio runtime and returns immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(self: &Arc<Self>, input: impl Into<Context>) -> RunHandle {
        let ctx = input.into();
        let id = RunId::next();
        let pipeline = Arc::clone(self);
        let task_ctx = ctx.clone();
        let join = tokio::spawn(async move { pipeline.drive(&task_ctx, id).await });
        RunHandle { id, ctx, join }
    }

    fn read_steps<R>(&self, f: impl FnOnce(&[Arc<dyn Step>]) -> R) -> R {
        f(&self.steps.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn step_at(&self, cursor: usize) -> Option<Arc<dyn Step>> {
        self.read_steps(|steps| steps.get(cursor).cloned())
    }

    /// Runs every step in order against `ctx`, stopping at the first failure.
    async fn drive(&self, ctx: &Context, run: RunId) -> Result<(), StepError> {
        let span = info_span!("pipeline_run", pipeline = %self.config.name, %run);
        async move {
            info!("Pipeline '{}' started with {} steps", self.config.name, self.len());

            if let Some(error) = ctx.error_value() {
                warn!("Context already errored, refusing to resume: {}", error);
                return Err(self.finish_failed(ctx, run, error));
            }

            // run-local cursor
            let mut cursor = 0;
            while let Some(step) = self.step_at(cursor) {
                let name = step.name();
                debug!("Executing step {} ({})", cursor + 1, name);

                let outcome = match self.call_step(step.as_ref(), ctx, run).await {
                    Ok(()) => ctx.error_value().map_or(Ok(()), Err),
                    Err(error) => Err(error),
                };
                if let Err(error) = outcome {
                    ctx.record_failure(&error);
                    warn!("Step '{}' failed: {}", name, error);
                    return Err(self.finish_failed(ctx, run, error));
                }

                debug!("Step '{}' completed successfully", name);
                cursor += 1;
            }

            info!(
                "Pipeline '{}' completed after {} steps in {:?}",
                self.config.name,
                cursor,
                ctx.elapsed()
            );
            self.listeners.emit(PipelineEvent::Completed {
                run,
                errored: false,
                ctx: ctx.clone(),
            });
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Invokes one step, relaying its warnings as pipeline events.
    async fn call_step(&self, step: &dyn Step, ctx: &Context, run: RunId) -> Result<(), StepError> {
        let mut signals = ctx.subscribe();
        let call = step.call(ctx);
        tokio::pin!(call);

        let outcome = loop {
            tokio::select! {
                biased;
                outcome = &mut call => break outcome,
                Some(signal) = signals.recv() => self.relay(signal, run),
            }
        };
        for signal in signals.drain() {
            self.relay(signal, run);
        }
        outcome
    }

    fn relay(&self, signal: ContextEvent, run: RunId) {
        if let ContextEvent::Warned(message) = signal {
            warn!("Pipeline '{}' warning: {}", self.config.name, message);
            self.listeners
                .emit(PipelineEvent::Warned { run, message });
        }
    }

    fn finish_failed(&self, ctx: &Context, run: RunId, error: StepError) -> StepError {
        self.listeners.emit(PipelineEvent::Failed {
            run,
            error: error.clone(),
            ctx: ctx.clone(),
        });
        self.listeners.emit(PipelineEvent::Completed {
            run,
            errored: true,
            ctx: ctx.clone(),
        });
        error
    }
}

#[async_trait]
impl Step for Pipeline {
    /// Runs this pipeline as a step of another, sharing the parent's context.
    async fn call(&self, ctx: &Context) -> Result<(), StepError> {
        self.drive(ctx, RunId::next()).await
    }

    fn name(&self) -> StepName {
        StepName::new(self.config.name.clone())
    }
}

/// A pending run returned by [`Pipeline::run`].
///
/// Await it to execute the steps; it resolves to the run's outcome.
#[must_use = "a run does nothing unless awaited"]
pub struct Run<'a> {
    id: RunId,
    ctx: Context,
    future: Pin<Box<dyn Future<Output = Result<(), StepError>> + Send + 'a>>,
}

impl fmt::Debug for Run<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Run")
            .field("id", &self.id)
            .field("ctx", &self.ctx)
            .finish()
    }
}

impl Run<'_> {
    pub fn id(&self) -> RunId {
        self.id
    }

    /// The context this run operates on.
    pub fn context(&self) -> Context {
        self.ctx.clone()
    }
}

impl Future for Run<'_> {
    type Output = Result<(), StepError>;

    fn poll(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        self.get_mut().future.as_mut().poll(cx)
    }
}

/// A run started with [`Pipeline::spawn`].
#[derive(Debug)]
pub struct RunHandle {
    id: RunId,
    ctx: Context,
    join: JoinHandle<Result<(), StepError>>,
}

impl RunHandle {
    pub fn id(&self) -> RunId {
        self.id
    }

    /// The context this run operates on.
    pub fn context(&self) -> Context {
        self.ctx.clone()
    }

    /// Whether the run has reached its end.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Waits for the run to end.
    pub async fn wait(self) -> Result<(), PipelineError> {
        match self.join.await {
            Ok(outcome) => outcome.map_err(PipelineError::from),
            Err(e) => Err(PipelineError::Aborted(e.to_string())),
        }
    }
}
