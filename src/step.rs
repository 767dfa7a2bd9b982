use crate::context::Context;
use crate::error::StepError;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Type-safe step name wrapper, used in logs.
///
/// # Examples
///
/// ```
/// use nagare::StepName;
///
/// let name = StepName::new("ProcessData");
/// assert_eq!(name.as_str(), "ProcessData");
///
/// let name: StepName = "ValidateInput".into();
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepName(String);

impl StepName {
    /// Creates a new StepName
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Creates a StepName from a type's name (extracts last segment)
    pub fn from_type_name<T: ?Sized>() -> Self {
        let full_name = std::any::type_name::<T>();
        let without_generics = full_name.split('<').next().unwrap_or(full_name);
        let short_name = without_generics
            .rsplit("::")
            .next()
            .unwrap_or("UnknownStep");
        Self::new(short_name)
    }

    /// Returns the step name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StepName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl PartialEq<&str> for StepName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// A unit of work in a pipeline.
///
/// Anything that can run against a [`Context`] and eventually produce a
/// terminal outcome is a step: the [`from_fn`] and [`from_async_fn`]
/// adapters, a [`Pipeline`](crate::Pipeline), or your own type.
///
/// Returning `Err`, or calling [`Context::error`] during the call, fails the
/// step and stops the run.
///
/// # Examples
///
/// ```
/// use nagare::prelude::*;
/// use async_trait::async_trait;
///
/// #[derive(Debug)]
/// struct Greet;
///
/// #[async_trait]
/// impl Step for Greet {
///     async fn call(&self, ctx: &Context) -> Result<(), StepError> {
///         ctx.data().insert("greeting", "hello".to_string());
///         Ok(())
///     }
/// }
///
/// # #[tokio::main]
/// # async fn main() {
/// let pipeline = pipe![Greet];
/// let run = pipeline.run(Data::new());
/// let ctx = run.context();
/// run.await.expect("greet never fails");
/// assert_eq!(ctx.data().get::<String>("greeting").map(String::as_str), Some("hello"));
/// # }
/// ```
#[async_trait]
pub trait Step: Send + Sync {
    /// Runs the step to its terminal outcome.
    async fn call(&self, ctx: &Context) -> Result<(), StepError>;

    /// Returns the step name.
    ///
    /// By default, uses the type name. Override to provide a custom name.
    fn name(&self) -> StepName {
        StepName::from_type_name::<Self>()
    }
}

#[async_trait]
impl<S: Step + ?Sized> Step for Arc<S> {
    async fn call(&self, ctx: &Context) -> Result<(), StepError> {
        (**self).call(ctx).await
    }

    fn name(&self) -> StepName {
        (**self).name()
    }
}

#[async_trait]
impl<S: Step + ?Sized> Step for Box<S> {
    async fn call(&self, ctx: &Context) -> Result<(), StepError> {
        (**self).call(ctx).await
    }

    fn name(&self) -> StepName {
        (**self).name()
    }
}

/// A step driven by a callback that signals through its context.
///
/// Built with [`from_fn`].
pub struct FnStep<F> {
    name: StepName,
    f: F,
}

impl<F> fmt::Debug for FnStep<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStep").field("name", &self.name).finish()
    }
}

impl<F> FnStep<F> {
    /// Replaces the name used in logs.
    pub fn named(mut self, name: impl Into<StepName>) -> Self {
        self.name = name.into();
        self
    }
}

/// Wraps a callback as a step.
///
/// The callback receives the context and must eventually call
/// [`Context::done`] or [`Context::error`] exactly once. It may hand the
/// context to another task and signal later; the run waits until it does.
/// A panic inside the callback fails the step. If every handle to the
/// context is dropped without a signal the step fails as well.
///
/// # Examples
///
/// ```
/// use nagare::prelude::*;
///
/// let step = from_fn(|ctx: Context| {
///     ctx.data().insert("gotIt", true);
///     ctx.done();
/// });
/// # let _ = step;
/// ```
pub fn from_fn<F>(f: F) -> FnStep<F>
where
    F: Fn(Context) + Send + Sync,
{
    FnStep {
        name: StepName::new("fn"),
        f,
    }
}

#[async_trait]
impl<F> Step for FnStep<F>
where
    F: Fn(Context) + Send + Sync,
{
    async fn call(&self, ctx: &Context) -> Result<(), StepError> {
        let (bound, outcome) = ctx.bind_step();
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| (self.f)(bound.clone()))) {
            bound.error(StepError::from_panic(payload));
        }
        drop(bound);

        match outcome.await {
            Ok(result) => result,
            Err(_) => Err(StepError::Failed(format!(
                "step '{}' dropped its context without signalling",
                self.name
            ))),
        }
    }

    fn name(&self) -> StepName {
        self.name.clone()
    }
}

/// A step driven by an async function returning its outcome.
///
/// Built with [`from_async_fn`].
pub struct AsyncFnStep<F> {
    name: StepName,
    f: F,
}

impl<F> fmt::Debug for AsyncFnStep<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncFnStep")
            .field("name", &self.name)
            .finish()
    }
}

impl<F> AsyncFnStep<F> {
    /// Replaces the name used in logs.
    pub fn named(mut self, name: impl Into<StepName>) -> Self {
        self.name = name.into();
        self
    }
}

/// Wraps an async function as a step.
///
/// The returned future resolves to the step's outcome; `done` is implied by
/// `Ok(())`. Warnings go through [`Context::warn`] as usual.
///
/// # Examples
///
/// ```
/// use nagare::prelude::*;
/// use std::time::Duration;
///
/// let step = from_async_fn(|ctx: Context| async move {
///     tokio::time::sleep(Duration::from_millis(1)).await;
///     ctx.data().insert("slept", true);
///     Ok(())
/// });
/// # let _ = step;
/// ```
pub fn from_async_fn<F, Fut>(f: F) -> AsyncFnStep<F>
where
    F: Fn(Context) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), StepError>> + Send + 'static,
{
    AsyncFnStep {
        name: StepName::new("async_fn"),
        f,
    }
}

#[async_trait]
impl<F, Fut> Step for AsyncFnStep<F>
where
    F: Fn(Context) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), StepError>> + Send + 'static,
{
    async fn call(&self, ctx: &Context) -> Result<(), StepError> {
        (self.f)(ctx.clone()).await
    }

    fn name(&self) -> StepName {
        self.name.clone()
    }
}
