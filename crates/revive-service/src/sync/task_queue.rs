use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use sentry::{Hub, SentryFutureExt};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::utils::defer::defer;

/// An error returned for a unit of work scheduled on a [`TaskQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The work panicked. The queue itself is unaffected and continues with the next task.
    #[error("task panicked")]
    Panicked,
    /// The work was dropped before it completed, because its runtime shut down.
    #[error("task was dropped before completion")]
    Dropped,
}

type Tail = Shared<BoxFuture<'static, ()>>;

/// Runs asynchronous units of work one after another, in the order they were scheduled.
///
/// Every scheduled unit becomes the continuation of the previously scheduled one. The queue only
/// holds a lock while swapping out its tail, never while work executes, so scheduling is cheap
/// even when the queued work is slow.
///
/// The work itself runs as a task on the provided runtime, and keeps going even if the caller
/// stops waiting for its result. Every `yield_every`-th unit yields back to the scheduler once
/// before it starts, so a burst of queued work does not monopolize a worker thread.
pub struct TaskQueue {
    tail: Mutex<Tail>,
    scheduled: AtomicUsize,
    pending: Arc<AtomicUsize>,
    yield_every: Option<NonZeroUsize>,
    runtime: Handle,
}

impl TaskQueue {
    /// Creates an empty queue spawning its work onto `runtime`.
    pub fn new(runtime: Handle, yield_every: Option<usize>) -> Self {
        Self {
            tail: Mutex::new(futures::future::ready(()).boxed().shared()),
            scheduled: AtomicUsize::new(0),
            pending: Default::default(),
            yield_every: yield_every.and_then(NonZeroUsize::new),
            runtime,
        }
    }

    /// The runtime this queue spawns its work onto.
    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// The number of scheduled units that have not finished yet.
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Schedules `work` to run after everything scheduled before it has finished.
    ///
    /// The returned future resolves to the output of `work`. Dropping it does not cancel the work.
    pub fn schedule<F, Fut, R>(
        &self,
        work: F,
    ) -> impl Future<Output = Result<R, TaskError>> + Send + 'static + use<F, Fut, R>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel::<()>();

        // The next unit waits for `done_tx` to be consumed or dropped, whichever comes first.
        let done = async move {
            done_rx.await.ok();
        }
        .boxed()
        .shared();

        let previous = {
            let mut tail = self.tail.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *tail, done)
        };

        let sequence = self.scheduled.fetch_add(1, Ordering::Relaxed) + 1;
        let yield_first = self
            .yield_every
            .is_some_and(|every| sequence % every.get() == 0);

        self.pending.fetch_add(1, Ordering::Relaxed);
        let pending = Arc::clone(&self.pending);
        let pending_token = defer(move || {
            pending.fetch_sub(1, Ordering::Relaxed);
        });

        let task = async move {
            previous.await;

            if yield_first {
                metric!(counter("task_queue.yield") += 1);
                tokio::task::yield_now().await;
            }

            let result = AssertUnwindSafe(async move { work().await })
                .catch_unwind()
                .await;

            drop(pending_token);
            done_tx.send(()).ok();
            result_tx.send(result).ok();
        };
        self.runtime
            .spawn(task.bind_hub(Hub::new_from_top(Hub::current())));

        async move {
            match result_rx.await {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(_panic)) => Err(TaskError::Panicked),
                Err(_) => Err(TaskError::Dropped),
            }
        }
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("pending", &self.len())
            .field("yield_every", &self.yield_every)
            .finish()
    }
}
