//! Commonly used types and traits

pub use crate::context::{Context, Data};
pub use crate::error::{PipelineError, StepError};
pub use crate::event::{ContextEvent, PipelineEvent};
pub use crate::pipe;
pub use crate::pipeline::Pipeline;
pub use crate::step::{from_async_fn, from_fn, Step, StepName};
