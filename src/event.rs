//! Typed signals broadcast by contexts and pipelines.

use crate::context::Context;
use crate::error::StepError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

/// Identifies one invocation of [`Pipeline::run`](crate::Pipeline::run).
///
/// Ids are unique within a process and increase monotonically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(u64);

impl RunId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

/// A signal emitted on a [`Context`](crate::Context).
#[derive(Debug, Clone)]
pub enum ContextEvent {
    /// `done` was called, or `error` finished broadcasting.
    Completed,
    /// `error` was called.
    Failed(StepError),
    /// `warn` was called.
    Warned(String),
}

/// A signal emitted by a [`Pipeline`](crate::Pipeline) about one of its runs.
///
/// For every run exactly one `Completed` is emitted, always last. A failed run
/// emits `Failed` immediately before it and sets `errored`.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A step of the run warned.
    Warned {
        /// The run that produced the warning.
        run: RunId,
        /// The warning text.
        message: String,
    },
    /// A step of the run failed; no further step will execute.
    Failed {
        /// The run that failed.
        run: RunId,
        /// The failure reported by the step.
        error: StepError,
        /// The run's context, holding the data as the failing step left it.
        ctx: Context,
    },
    /// The run reached its end.
    Completed {
        /// The run that completed.
        run: RunId,
        /// `true` when a `Failed` event preceded this one.
        errored: bool,
        /// The run's context.
        ctx: Context,
    },
}

impl PipelineEvent {
    /// The run this event belongs to.
    pub fn run(&self) -> RunId {
        match self {
            PipelineEvent::Warned { run, .. }
            | PipelineEvent::Failed { run, .. }
            | PipelineEvent::Completed { run, .. } => *run,
        }
    }
}

/// Receiving end of a listener attached with `subscribe`.
///
/// Dropping the subscription detaches the listener.
#[derive(Debug)]
pub struct Subscription<E> {
    rx: UnboundedReceiver<E>,
}

impl<E> Subscription<E> {
    /// Waits for the next event.
    ///
    /// Returns `None` once the emitter is gone and every buffered event was read.
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    /// Returns a buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<E> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Drains every event that is already buffered.
    pub fn drain(&mut self) -> Vec<E> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

/// Set of listeners that receive every event emitted after they attached.
pub(crate) struct Listeners<E> {
    senders: Mutex<Vec<UnboundedSender<E>>>,
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }
}

impl<E: Clone> Listeners<E> {
    /// Attaches a new listener, dropping the ones whose subscription is gone.
    pub(crate) fn subscribe(&self) -> Subscription<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        senders.retain(|tx| !tx.is_closed());
        senders.push(tx);
        Subscription { rx }
    }

    /// Sends `event` to every live listener, pruning the ones that were dropped.
    pub(crate) fn emit(&self, event: E) {
        let mut senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_to_all_listeners() {
        let listeners = Listeners::<u32>::default();
        let mut first = listeners.subscribe();
        let mut second = listeners.subscribe();

        listeners.emit(1);
        listeners.emit(2);

        assert_eq!(first.drain(), vec![1, 2]);
        assert_eq!(second.drain(), vec![1, 2]);
    }

    #[test]
    fn test_late_listener_misses_earlier_events() {
        let listeners = Listeners::<u32>::default();
        listeners.emit(1);
        let mut late = listeners.subscribe();
        listeners.emit(2);

        assert_eq!(late.drain(), vec![2]);
    }

    #[test]
    fn test_dropped_listener_is_pruned() {
        let listeners = Listeners::<u32>::default();
        let _kept = listeners.subscribe();
        drop(listeners.subscribe());
        assert_eq!(listeners.len(), 2);

        listeners.emit(7);
        assert_eq!(listeners.len(), 1);
    }

    #[test]
    fn test_subscribe_prunes_dropped_listeners() {
        let listeners = Listeners::<u32>::default();
        for _ in 0..100 {
            drop(listeners.subscribe());
        }
        let _kept = listeners.subscribe();
        assert_eq!(listeners.len(), 1);
    }

    #[test]
    fn test_run_ids_are_unique() {
        let a = RunId::next();
        let b = RunId::next();
        assert_ne!(a, b);
        assert!(b > a);
        assert_eq!(a.to_string(), format!("run-{}", a.as_u64()));
    }
}
