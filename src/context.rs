//! Per-run state shared by the steps of one pipeline run.

use crate::error::StepError;
use crate::event::{ContextEvent, Listeners, Subscription};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::debug;

/// Type-safe context key wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextKey(String);

impl ContextKey {
    /// Creates a new ContextKey.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ContextKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ContextKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::borrow::Borrow<str> for ContextKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// The payload a run carries from step to step.
///
/// Stores values of any `Send + Sync` type, retrieved by downcasting.
///
/// # Examples
///
/// ```
/// use nagare::Data;
///
/// let mut data = Data::new().with("user_id", 123u64);
/// data.insert("name", "Alice".to_string());
///
/// assert_eq!(data.get::<u64>("user_id"), Some(&123));
/// assert_eq!(data.get::<String>("name"), Some(&"Alice".to_string()));
///
/// // Wrong type returns None
/// assert_eq!(data.get::<String>("user_id"), None);
/// ```
#[derive(Default)]
pub struct Data {
    entries: HashMap<ContextKey, Box<dyn Any + Send + Sync>>,
}

impl fmt::Debug for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Data")
            .field("keys", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Data {
    /// Creates an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value and returns the payload, for building initial data.
    pub fn with<T: Any + Send + Sync>(mut self, key: impl Into<ContextKey>, value: T) -> Self {
        self.insert(key, value);
        self
    }

    /// Inserts a value with the given key.
    ///
    /// If the key already exists, the previous value is replaced.
    pub fn insert<T: Any + Send + Sync>(&mut self, key: impl Into<ContextKey>, value: T) {
        self.entries.insert(key.into(), Box::new(value));
    }

    /// Returns a reference to the value for the given key.
    ///
    /// Returns `None` if the key doesn't exist or the type doesn't match.
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.entries.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    /// Returns a mutable reference to the value for the given key.
    pub fn get_mut<T: Any>(&mut self, key: &str) -> Option<&mut T> {
        self.entries.get_mut(key).and_then(|v| v.downcast_mut::<T>())
    }

    /// Removes a value by key and returns it.
    ///
    /// Returns `None` if the key doesn't exist or the type doesn't match. A
    /// value of the wrong type is left in place.
    pub fn remove<T: Any>(&mut self, key: &str) -> Option<T> {
        self.get::<T>(key)?;
        self.entries
            .remove(key)
            .and_then(|v| v.downcast::<T>().ok())
            .map(|b| *b)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &ContextKey> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Where a callback step's terminal signal is delivered.
type StepSlot = Mutex<Option<oneshot::Sender<Result<(), StepError>>>>;

struct Shared {
    data: Mutex<Data>,
    errored: AtomicBool,
    first_error: Mutex<Option<StepError>>,
    listeners: Listeners<ContextEvent>,
    started_at: Instant,
}

/// Handle to the state of one pipeline run.
///
/// A context owns the run's [`Data`] and is the channel through which steps
/// report their outcome: [`done`](Context::done), [`error`](Context::error)
/// and [`warn`](Context::warn). Cloning a context is cheap; every clone sees
/// the same data, error flag and listeners.
///
/// # Examples
///
/// ```
/// use nagare::{Context, ContextEvent, Data};
///
/// let ctx = Context::new(Data::new().with("x", 1i64));
/// let mut events = ctx.subscribe();
///
/// ctx.warn("careful");
/// ctx.error("BOOM!");
///
/// assert!(ctx.has_errored());
/// assert_eq!(ctx.data().get::<i64>("x"), Some(&1));
/// assert!(matches!(events.try_recv(), Some(ContextEvent::Warned(m)) if m == "careful"));
/// assert!(matches!(events.try_recv(), Some(ContextEvent::Failed(_))));
/// assert!(matches!(events.try_recv(), Some(ContextEvent::Completed)));
/// ```
#[derive(Clone)]
pub struct Context {
    shared: Arc<Shared>,
    slot: Option<Arc<StepSlot>>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Context");
        match self.shared.data.try_lock() {
            Ok(data) => s.field("data", &*data),
            Err(_) => s.field("data", &"<locked>"),
        };
        s.field("has_errored", &self.has_errored())
            .field("started_at", &self.shared.started_at)
            .finish()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(Data::new())
    }
}

impl From<Data> for Context {
    fn from(data: Data) -> Self {
        Self::new(data)
    }
}

impl Context {
    /// Creates a context that owns `data`.
    pub fn new(data: Data) -> Self {
        Self {
            shared: Arc::new(Shared {
                data: Mutex::new(data),
                errored: AtomicBool::new(false),
                first_error: Mutex::new(None),
                listeners: Listeners::default(),
                started_at: Instant::now(),
            }),
            slot: None,
        }
    }

    /// Locks the run's data.
    ///
    /// Do not hold the guard across an `.await`.
    pub fn data(&self) -> MutexGuard<'_, Data> {
        self.shared
            .data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` with the data locked and returns its result.
    pub fn with_data<R>(&self, f: impl FnOnce(&mut Data) -> R) -> R {
        f(&mut self.data())
    }

    /// Signals that the current step finished.
    ///
    /// Only the first signal of a step releases it; later calls are broadcast
    /// to listeners but never advance the pipeline again.
    pub fn done(&self) {
        self.shared.listeners.emit(ContextEvent::Completed);
        self.release(Ok(()));
    }

    /// Signals an unrecoverable failure.
    ///
    /// Marks the context as errored, broadcasts `Failed` followed by
    /// `Completed`, and stops the run that owns this context.
    ///
    /// Accepts messages, `std::io::Error`, boxed errors and ready
    /// [`StepError`]s. Wrap any other error type with
    /// [`StepError::from_error`].
    pub fn error(&self, error: impl Into<StepError>) {
        let error = error.into();
        self.shared.errored.store(true, Ordering::SeqCst);
        {
            let mut first = self
                .shared
                .first_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if first.is_none() {
                *first = Some(error.clone());
            }
        }
        self.shared
            .listeners
            .emit(ContextEvent::Failed(error.clone()));
        self.shared.listeners.emit(ContextEvent::Completed);
        self.release(Err(error));
    }

    /// Broadcasts a warning. Never affects sequencing.
    pub fn warn(&self, message: impl Into<String>) {
        self.shared
            .listeners
            .emit(ContextEvent::Warned(message.into()));
    }

    /// Whether `error` has been called on this context.
    pub fn has_errored(&self) -> bool {
        self.shared.errored.load(Ordering::SeqCst)
    }

    /// The first error reported on this context, if any.
    pub fn error_value(&self) -> Option<StepError> {
        self.shared
            .first_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Attaches a listener for every later signal on this context.
    pub fn subscribe(&self) -> Subscription<ContextEvent> {
        self.shared.listeners.subscribe()
    }

    /// Time elapsed since the context was created.
    pub fn elapsed(&self) -> Duration {
        self.shared.started_at.elapsed()
    }

    /// Returns `true` if both handles point at the same run state.
    pub fn same_run(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Returns a handle bound to a fresh step slot, and the receiver that
    /// resolves with the first `done`/`error` made through that handle.
    pub(crate) fn bind_step(&self) -> (Context, oneshot::Receiver<Result<(), StepError>>) {
        let (tx, rx) = oneshot::channel();
        let bound = Context {
            shared: Arc::clone(&self.shared),
            slot: Some(Arc::new(Mutex::new(Some(tx)))),
        };
        (bound, rx)
    }

    /// Records a failure that a step returned instead of signalling.
    pub(crate) fn record_failure(&self, error: &StepError) {
        if !self.has_errored() {
            self.error(error.clone());
        }
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        self.shared.listeners.len()
    }

    fn release(&self, outcome: Result<(), StepError>) {
        let Some(slot) = &self.slot else {
            return;
        };
        let sender = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
        match sender {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => debug!("step signalled more than once; ignoring"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heterogeneous_storage() {
        let ctx = Context::default();
        {
            let mut data = ctx.data();
            data.insert("int", 42i32);
            data.insert("string", "hello".to_string());
            data.insert("bool", true);
        }

        let data = ctx.data();
        assert_eq!(data.get::<i32>("int"), Some(&42));
        assert_eq!(data.get::<String>("string"), Some(&"hello".to_string()));
        assert_eq!(data.get::<bool>("bool"), Some(&true));
        assert_eq!(data.get::<String>("int"), None);
        assert_eq!(data.len(), 3);
    }

    #[test]
    fn test_get_mut_and_remove() {
        let mut data = Data::new().with("count", 0i32);
        if let Some(count) = data.get_mut::<i32>("count") {
            *count += 1;
        }
        assert_eq!(data.get::<i32>("count"), Some(&1));

        // wrong type leaves the entry alone
        assert_eq!(data.remove::<String>("count"), None);
        assert!(data.contains_key("count"));

        assert_eq!(data.remove::<i32>("count"), Some(1));
        assert!(data.is_empty());
    }

    #[test]
    fn test_initial_data_is_moved_in() {
        let ctx = Context::new(Data::new().with("original", "here"));
        assert_eq!(ctx.data().get::<&'static str>("original"), Some(&"here"));
        assert!(!ctx.has_errored());
        assert!(ctx.error_value().is_none());
    }

    #[test]
    fn test_clones_share_state() {
        let ctx = Context::default();
        let other = ctx.clone();
        other.with_data(|d| d.insert("touched", true));
        assert_eq!(ctx.data().get::<bool>("touched"), Some(&true));
        assert!(ctx.same_run(&other));
        assert!(!ctx.same_run(&Context::default()));
    }

    #[test]
    fn test_error_broadcasts_failed_then_completed() {
        let ctx = Context::default();
        let mut events = ctx.subscribe();

        ctx.error("first");
        ctx.error(String::from("second"));

        assert!(ctx.has_errored());
        assert_eq!(ctx.error_value().map(|e| e.to_string()), Some("first".into()));

        let events = events.drain();
        assert_eq!(events.len(), 4);
        assert!(matches!(&events[0], ContextEvent::Failed(e) if e.to_string() == "first"));
        assert!(matches!(events[1], ContextEvent::Completed));
    }

    #[test]
    fn test_done_and_warn_broadcast() {
        let ctx = Context::default();
        let mut a = ctx.subscribe();
        let mut b = ctx.subscribe();

        ctx.warn("one");
        ctx.done();

        for events in [a.drain(), b.drain()] {
            assert_eq!(events.len(), 2);
            assert!(matches!(&events[0], ContextEvent::Warned(m) if m == "one"));
            assert!(matches!(events[1], ContextEvent::Completed));
        }
        assert!(!ctx.has_errored());
    }

    #[test]
    fn test_bound_handle_releases_once() {
        let ctx = Context::default();
        let (bound, mut rx) = ctx.bind_step();

        bound.done();
        bound.error("too late");

        assert!(matches!(rx.try_recv(), Ok(Ok(()))));
        // the late error still marks the context
        assert!(ctx.has_errored());
    }

    #[test]
    fn test_unbound_handle_does_not_release_step() {
        let ctx = Context::default();
        let (_bound, mut rx) = ctx.bind_step();

        ctx.done();

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_error_accepts_wrapped_error_types() {
        #[derive(Debug, thiserror::Error)]
        #[error("quota exceeded")]
        struct QuotaError;

        let ctx = Context::default();
        ctx.error(StepError::from_error(QuotaError));

        assert!(matches!(ctx.error_value(), Some(StepError::Source(_))));
        assert_eq!(
            ctx.error_value().map(|e| e.to_string()),
            Some("quota exceeded".into())
        );
    }

    #[test]
    fn test_record_failure_only_once() {
        let ctx = Context::default();
        let mut events = ctx.subscribe();

        ctx.error("reported");
        ctx.record_failure(&StepError::from("returned"));

        assert_eq!(events.drain().len(), 2);
        assert_eq!(
            ctx.error_value().map(|e| e.to_string()),
            Some("reported".into())
        );
    }

    #[test]
    fn test_context_elapsed_time() {
        let ctx = Context::default();
        std::thread::sleep(Duration::from_millis(10));
        assert!(ctx.elapsed() >= Duration::from_millis(10));
    }
}
