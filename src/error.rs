use std::any::Any;
use std::error::Error as StdError;
use std::sync::Arc;
use thiserror::Error;

/// The failure a step reports through [`Context::error`](crate::Context::error)
/// or by returning `Err` from [`Step::call`](crate::Step::call).
///
/// `StepError` is cheap to clone so that the same failure can be delivered to
/// every listener of a context and of its pipeline.
///
/// # Non-Exhaustive
///
/// New variants may be added later. Always include a wildcard arm:
///
/// ```
/// use nagare::StepError;
///
/// fn describe(error: &StepError) -> String {
///     match error {
///         StepError::Failed(message) => format!("failed: {message}"),
///         StepError::Panicked(note) => format!("panicked: {note}"),
///         _ => error.to_string(),
///     }
/// }
///
/// assert_eq!(describe(&"BOOM!".into()), "failed: BOOM!");
/// ```
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum StepError {
    /// A step signalled failure with a plain message.
    #[error("{0}")]
    Failed(String),

    /// A step signalled failure with an existing error value.
    #[error(transparent)]
    Source(Arc<dyn StdError + Send + Sync>),

    /// A callback step panicked instead of signalling.
    ///
    /// The payload is coerced into a note; payloads that are neither `&str`
    /// nor `String` are described generically.
    #[error("step panicked: {0}")]
    Panicked(String),
}

impl StepError {
    /// Wraps an arbitrary error value.
    pub fn from_error<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        StepError::Source(Arc::new(error))
    }

    /// Coerces a panic payload (or any other untyped value) into a step error.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let note = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string payload of unknown type".to_string()
        };
        StepError::Panicked(note)
    }
}

impl From<&str> for StepError {
    fn from(message: &str) -> Self {
        StepError::Failed(message.to_string())
    }
}

impl From<String> for StepError {
    fn from(message: String) -> Self {
        StepError::Failed(message)
    }
}

impl From<Box<dyn StdError + Send + Sync>> for StepError {
    fn from(error: Box<dyn StdError + Send + Sync>) -> Self {
        StepError::Source(Arc::from(error))
    }
}

impl From<std::io::Error> for StepError {
    fn from(error: std::io::Error) -> Self {
        StepError::from_error(error)
    }
}

/// Errors surfaced to callers waiting on a spawned run.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum PipelineError {
    /// A step of the run failed; remaining steps were skipped.
    #[error("pipeline step failed: {0}")]
    Step(#[from] StepError),

    /// The task driving the run panicked or was cancelled.
    #[error("pipeline run aborted: {0}")]
    Aborted(String),
}
