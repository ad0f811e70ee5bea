use std::future::Future;

use tokio::runtime::Handle;

use super::error::SourceResult;
use crate::config::SaveQueueConfig;
use crate::sync::TaskQueue;

/// The process-wide queue all cells persist their values through.
///
/// Saves from every cell sharing a queue run strictly one at a time, in the order they were
/// enqueued. Recovery of values is not affected by this and keeps running in parallel.
///
/// A save that fails or panics only affects the callers awaiting that particular save.
#[derive(Debug)]
pub struct SaveQueue {
    tasks: TaskQueue,
}

impl SaveQueue {
    pub fn new(config: &SaveQueueConfig, runtime: Handle) -> Self {
        Self {
            tasks: TaskQueue::new(runtime, config.yield_every),
        }
    }

    /// The runtime saves are executed on.
    pub fn runtime(&self) -> &Handle {
        self.tasks.runtime()
    }

    /// The number of saves that were enqueued but have not completed yet.
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Appends `save` to the queue.
    ///
    /// The returned future resolves once the save has run. It does not need to be polled for the
    /// save to make progress.
    pub fn enqueue<F, Fut, R>(
        &self,
        save: F,
    ) -> impl Future<Output = SourceResult<R>> + Send + 'static + use<F, Fut, R>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = SourceResult<R>> + Send + 'static,
        R: Send + 'static,
    {
        let result = self.tasks.schedule(save);
        metric!(gauge("save_queue.pending") = self.pending() as u64);

        async move { result.await? }
    }
}
