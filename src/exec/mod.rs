//! Serial execution of pipeline state mutations.
//!
//! All task-graph mutations run on one logical queue: boxed jobs are sent
//! over a channel and drained by a single tokio task that owns the state.
//! Continuations scheduled from worker threads re-enter through the same
//! channel, so no job ever observes the state mid-mutation and no lock is
//! held across callbacks.

pub mod work_queue;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

/// Handle for submitting jobs to a [`spawn`]ed serial loop.
pub(crate) struct SerialExecutor<S> {
    tx: mpsc::UnboundedSender<Job<S>>,
    closed: Arc<AtomicBool>,
}

impl<S> Clone for SerialExecutor<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            closed: Arc::clone(&self.closed),
        }
    }
}

impl<S: Send + 'static> SerialExecutor<S> {
    /// Enqueues a job. Jobs run in submission order; a job submitted after
    /// the owning loop shut down is dropped.
    pub fn submit(&self, job: impl FnOnce(&mut S) + Send + 'static) {
        let _ = self.tx.send(Box::new(job));
    }

    /// Stops the loop after the jobs already queued have run. The state
    /// itself holds a handle, so dropping handles alone cannot end the
    /// loop.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.tx.send(Box::new(|_| {}));
    }
}

/// Moves `state` into a dedicated task and returns the submission handle.
/// The loop ends when the last handle is dropped and the queue drains.
pub(crate) fn spawn<S: Send + 'static>(state: S) -> SerialExecutor<S> {
    spawn_with(|_| state)
}

/// Like [`spawn`], but the state is built with access to its own handle so
/// jobs can schedule continuations onto the loop they run on.
pub(crate) fn spawn_with<S: Send + 'static>(
    make: impl FnOnce(SerialExecutor<S>) -> S,
) -> SerialExecutor<S> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Job<S>>();
    let handle = SerialExecutor {
        tx,
        closed: Arc::new(AtomicBool::new(false)),
    };
    let closed = Arc::clone(&handle.closed);
    let mut state = make(handle.clone());
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            job(&mut state);
            if closed.load(Ordering::SeqCst) {
                break;
            }
        }
    });
    handle
}
