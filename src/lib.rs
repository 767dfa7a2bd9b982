//! # Nagare (流れ)
//!
//! A minimal sequential step-execution engine for Rust.
//!
//! The name "Nagare" (流れ) means "flow" or "stream" in Japanese: work moves
//! through a pipeline one step at a time, in order, carrying its context
//! along.
//!
//! ## Features
//!
//! - **Strict ordering**: a step never starts before the previous one signalled
//! - **Short-circuit on error**: the first failure ends the run, nothing else runs
//! - **Nesting**: a [`Pipeline`] is a [`Step`], sub-pipelines share the parent's context
//! - **Independent runs**: every run owns its cursor and context, even concurrently
//! - **Typed signals**: [`PipelineEvent`] and [`ContextEvent`] instead of string names
//!
//! ## Quick Start
//!
//! ```rust
//! use nagare::prelude::*;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let pipeline = pipe![
//!     from_fn(|ctx: Context| {
//!         ctx.data().insert("one", 1i64);
//!         ctx.done();
//!     }),
//!     from_fn(|ctx: Context| {
//!         let one = ctx.data().get::<i64>("one").copied().unwrap_or_default();
//!         ctx.data().insert("two", one + 1);
//!         ctx.done();
//!     }),
//! ];
//!
//! let run = pipeline.run(Data::new());
//! let ctx = run.context();
//! run.await.expect("pipeline failed");
//!
//! assert_eq!(ctx.data().get::<i64>("two"), Some(&2));
//! # }
//! ```
//!
//! ## Sub-pipelines
//!
//! ```rust
//! use nagare::prelude::*;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bump = || from_fn(|ctx: Context| {
//!     if let Some(seen) = ctx.data().get_mut::<u32>("seen") {
//!         *seen += 1;
//!     }
//!     ctx.done();
//! });
//!
//! let inner = Arc::new(pipe![bump()]);
//! let outer = pipe![bump(), Arc::clone(&inner), bump()];
//!
//! let run = outer.run(Data::new().with("seen", 0u32));
//! let ctx = run.context();
//! run.await.expect("pipeline failed");
//! assert_eq!(ctx.data().get::<u32>("seen"), Some(&3));
//! # }
//! ```
//!
//! ## Error Handling
//!
//! ```rust
//! use nagare::prelude::*;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let pipeline = pipe![
//!     from_fn(|ctx: Context| ctx.error("BOOM!")),
//!     from_fn(|_ctx: Context| unreachable!("never runs")),
//! ];
//! let mut events = pipeline.subscribe();
//!
//! if let Err(error) = pipeline.run(Data::new()).await {
//!     eprintln!("Pipeline failed: {}", error);
//! }
//!
//! while let Some(event) = events.try_recv() {
//!     match event {
//!         PipelineEvent::Failed { error, .. } => eprintln!("failed: {}", error),
//!         PipelineEvent::Completed { errored, .. } => assert!(errored),
//!         PipelineEvent::Warned { message, .. } => eprintln!("warning: {}", message),
//!     }
//! }
//! # }
//! ```

mod config;
mod context;
mod error;
mod event;
mod pipeline;
mod step;

pub mod prelude;

pub use config::PipelineConfig;
pub use context::{Context, ContextKey, Data};
pub use error::{PipelineError, StepError};
pub use event::{ContextEvent, PipelineEvent, RunId, Subscription};
pub use pipeline::{Pipeline, Run, RunHandle};
pub use step::{from_async_fn, from_fn, AsyncFnStep, FnStep, Step, StepName};

/// Builds a [`Pipeline`] from a list of steps, appended in order.
///
/// Steps may be of different types: function adapters, your own [`Step`]
/// implementations, or shared sub-pipelines (`Arc<Pipeline>`).
///
/// # Example
///
/// ```rust
/// use nagare::prelude::*;
///
/// let empty = pipe![];
/// assert!(empty.is_empty());
///
/// let two = pipe![
///     from_fn(|ctx: Context| ctx.done()),
///     from_fn(|ctx: Context| ctx.done()),
/// ];
/// assert_eq!(two.len(), 2);
/// ```
#[macro_export]
macro_rules! pipe {
    ($($step:expr),* $(,)?) => {{
        let pipeline = $crate::Pipeline::new();
        $( pipeline.step($step); )*
        pipeline
    }};
}
