use std::fmt;
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapAny;
use async_trait::async_trait;
use sentry::{Hub, SentryFutureExt};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::error::{SourceResult, ValueResult};
use super::retain::Retainer;
use super::save_queue::SaveQueue;
use super::source::{RecoverySource, SaveSource, ValueSource};
use crate::sync::CoalescingLock;

static NEXT_CELL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a [`ValueCell`].
///
/// Derived cells get an identity of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellId(pub(crate) u64);

impl CellId {
    fn next() -> Self {
        Self(NEXT_CELL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cell#{}", self.0)
    }
}

/// Whether the lineage of a cell has been persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveState {
    /// Nothing was persisted yet. The next produced value will be saved.
    Unsaved,
    /// A save is queued or running.
    Saving,
    /// A save succeeded. Values are recovered from the persisted form from now on.
    Saved,
}

struct Lineage<T: Send + Sync + 'static> {
    recovery: Arc<dyn RecoverySource<T>>,
    state: SaveState,
}

struct CellInner<T: Send + Sync + 'static> {
    id: CellId,
    name: &'static str,

    /// The last produced value, if it is still alive.
    value: ArcSwapAny<Weak<T>>,
    /// Serializes recoveries, and the swap of the recovery after a save.
    lock: CoalescingLock,
    lineage: Mutex<Lineage<T>>,

    save: Option<Arc<dyn SaveSource<T>>>,
    save_queue: Arc<SaveQueue>,
    /// Signalled whenever a save of this cell finishes, successful or not.
    save_done: Notify,

    retainer: Retainer,
    weigher: fn(&T) -> u32,
    lock_timeout: Option<Duration>,
}

impl<T: Send + Sync + 'static> CellInner<T> {
    fn lineage(&self) -> MutexGuard<'_, Lineage<T>> {
        self.lineage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the live value, if there is one.
    fn lookup(&self) -> Option<Arc<T>> {
        let value = self.value.load().upgrade()?;
        self.retainer.touch(self.id);
        metric!(counter("cells.memory.hit") += 1);
        Some(value)
    }

    /// The recovery to run next, and where it recovers from.
    fn current_recovery(&self) -> (Arc<dyn RecoverySource<T>>, &'static str) {
        let lineage = self.lineage();
        let origin = match lineage.state {
            SaveState::Saved => "saved",
            SaveState::Unsaved | SaveState::Saving => "initial",
        };
        (Arc::clone(&lineage.recovery), origin)
    }

    fn record_recovery(&self, origin: &'static str, started: Instant, result: &SourceResult<Arc<T>>) {
        metric!(timer("cells.recovery.duration") = started.elapsed(), "source" => origin);
        match result {
            Ok(_) => {
                metric!(counter("cells.recovery") += 1, "source" => origin);
                tracing::trace!(cell = %self.id, name = self.name, origin, "recovered value");
            }
            Err(error) => {
                metric!(counter("cells.recovery.failed") += 1, "source" => origin);
                let error: &dyn std::error::Error = error;
                tracing::debug!(cell = %self.id, name = self.name, origin, error, "recovery failed");
            }
        }
    }

    /// Applies the outcome of a save to the lineage.
    ///
    /// `instance` is the saved value. It stays alive until the new recovery is in place.
    async fn finish_save(
        &self,
        result: SourceResult<Arc<dyn RecoverySource<T>>>,
        instance: Arc<T>,
    ) {
        // A token that is never cancelled, acquiring can only succeed.
        let guard = self.lock.acquire(&CancellationToken::new()).await.ok();
        let mut lineage = self.lineage();

        match result {
            Ok(recovery) => {
                lineage.recovery = recovery;
                lineage.state = SaveState::Saved;
                metric!(counter("cells.save") += 1, "status" => "ok");
                tracing::trace!(cell = %self.id, name = self.name, "saved value");
            }
            Err(error) => {
                lineage.state = SaveState::Unsaved;
                metric!(counter("cells.save") += 1, "status" => "failed");
                let error: &dyn std::error::Error = &error;
                tracing::error!(cell = %self.id, name = self.name, error, "failed to save value");
            }
        }

        // Nobody observes the new state before the saved instance is released.
        drop(instance);
        drop(lineage);
        drop(guard);
        self.save_done.notify_waiters();
    }
}

impl<T: Send + Sync + 'static> Drop for CellInner<T> {
    fn drop(&mut self) {
        self.retainer.release(self.id);
    }
}

/// A value that is produced on demand, cached weakly, and recovered when needed again.
///
/// The cell only keeps a weak reference to the value it produced last. While anybody holds the
/// value, including the [`Retainer`], accesses are served from memory without taking any lock.
/// Once it was reclaimed, the next access runs the cell's [`RecoverySource`] again. Concurrent
/// accesses to a cell without a live value wait for a single recovery, and all observe its result.
///
/// If the cell has a [`SaveSource`], the first value it produces is persisted through the global
/// [`SaveQueue`]. When that save succeeds, the cell switches over to the recovery returned by the
/// save, so subsequent recoveries read the persisted form instead of computing from scratch.
///
/// Cloning a cell is cheap, and all clones share the same state.
pub struct ValueCell<T: Send + Sync + 'static> {
    inner: Arc<CellInner<T>>,
}

impl<T: Send + Sync + 'static> Clone for ValueCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> ValueCell<T> {
    pub fn id(&self) -> CellId {
        self.inner.id
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    pub fn save_state(&self) -> SaveState {
        self.inner.lineage().state
    }

    /// Whether the value of this cell was persisted.
    ///
    /// Once this returns `true`, it always will.
    pub fn is_saved(&self) -> bool {
        self.save_state() == SaveState::Saved
    }

    /// Waits until no save of this cell is in flight.
    ///
    /// Returns whether the cell is saved.
    pub async fn wait_saved(&self) -> bool {
        loop {
            let mut notified = pin!(self.inner.save_done.notified());
            notified.as_mut().enable();

            let state = self.save_state();
            match state {
                SaveState::Saving => notified.await,
                state => return state == SaveState::Saved,
            }
        }
    }

    /// Creates a new cell continuing the lineage of this one.
    ///
    /// The derived cell starts out saved, recovers from the persisted form of this cell, and never
    /// saves again. It shares the current value of this cell, if it is alive.
    ///
    /// Returns `None` if this cell was not saved yet.
    pub fn derive(&self) -> Option<Self> {
        let inner = &self.inner;
        let recovery = {
            let lineage = inner.lineage();
            if lineage.state != SaveState::Saved {
                return None;
            }
            Arc::clone(&lineage.recovery)
        };

        let derived = CellInner {
            id: CellId::next(),
            name: inner.name,
            value: ArcSwapAny::new(inner.value.load_full()),
            lock: CoalescingLock::mutex(),
            lineage: Mutex::new(Lineage {
                recovery,
                state: SaveState::Saved,
            }),
            save: None,
            save_queue: Arc::clone(&inner.save_queue),
            save_done: Notify::new(),
            retainer: inner.retainer.clone(),
            weigher: inner.weigher,
            lock_timeout: inner.lock_timeout,
        };

        metric!(counter("cells.derived") += 1);
        tracing::debug!(parent = %inner.id, cell = %derived.id, name = inner.name, "derived cell");

        Some(Self {
            inner: Arc::new(derived),
        })
    }

    /// Makes `value` the current value of the cell.
    ///
    /// Must be called while holding the cell's lock, or before the cell is shared.
    fn publish(&self, value: Arc<T>) -> Arc<T> {
        let inner = &self.inner;
        inner.value.store(Arc::downgrade(&value));

        let weight = (inner.weigher)(&value);
        inner.retainer.retain(inner.id, value.clone(), weight);

        self.start_save(&value);
        value
    }

    /// Enqueues a save of `value`, unless the lineage is already saved or being saved.
    fn start_save(&self, value: &Arc<T>) {
        let inner = &self.inner;
        let Some(save) = inner.save.clone() else {
            return;
        };
        {
            let mut lineage = inner.lineage();
            if lineage.state != SaveState::Unsaved {
                return;
            }
            lineage.state = SaveState::Saving;
        }
        tracing::trace!(cell = %inner.id, name = inner.name, "enqueueing save");

        let saved = {
            let value = Arc::clone(value);
            inner
                .save_queue
                .enqueue(move || async move { save.save(value).await })
        };

        let instance = Arc::clone(value);
        let cell = Arc::downgrade(inner);
        let completion = async move {
            let result = saved.await;
            // Nothing to update if the cell is gone.
            if let Some(inner) = cell.upgrade() {
                inner.finish_save(result, instance).await;
            }
        };
        inner
            .save_queue
            .runtime()
            .spawn(completion.bind_hub(Hub::new_from_top(Hub::current())));
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> ValueSource<T> for ValueCell<T> {
    fn try_get(&self) -> Option<Arc<T>> {
        self.inner.lookup()
    }

    fn get(&self, cancel: &CancellationToken) -> ValueResult<Arc<T>> {
        metric!(counter("cells.access") += 1, "mode" => "blocking");
        if let Some(value) = self.inner.lookup() {
            return Ok(value);
        }

        let inner = &self.inner;
        let _guard = inner.lock.acquire_blocking(cancel, inner.lock_timeout)?;

        // Somebody else may have recovered the value while we were waiting.
        if let Some(value) = inner.lookup() {
            return Ok(value);
        }

        let (recovery, origin) = inner.current_recovery();
        let started = Instant::now();
        let recovered = recovery.recover(cancel);
        inner.record_recovery(origin, started, &recovered);

        Ok(self.publish(recovered?))
    }

    async fn get_async(&self, cancel: &CancellationToken) -> ValueResult<Arc<T>> {
        metric!(counter("cells.access") += 1, "mode" => "async");
        if let Some(value) = self.inner.lookup() {
            return Ok(value);
        }

        let inner = &self.inner;
        let _guard = inner.lock.acquire(cancel).await?;

        // Somebody else may have recovered the value while we were waiting.
        if let Some(value) = inner.lookup() {
            return Ok(value);
        }

        let (recovery, origin) = inner.current_recovery();
        let started = Instant::now();
        let recovered = recovery.recover_async(cancel).await;
        inner.record_recovery(origin, started, &recovered);

        Ok(self.publish(recovered?))
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for ValueCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueCell")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.save_state())
            .field("live", &(self.inner.value.load().strong_count() > 0))
            .field("lock", &self.inner.lock)
            .finish()
    }
}

fn default_weight<T>(_value: &T) -> u32 {
    std::mem::size_of::<T>() as u32
}

/// Configures and creates a [`ValueCell`].
pub struct CellBuilder<T: Send + Sync + 'static> {
    recovery: Arc<dyn RecoverySource<T>>,
    save: Option<Arc<dyn SaveSource<T>>>,
    save_queue: Arc<SaveQueue>,
    retainer: Retainer,
    name: &'static str,
    weigher: fn(&T) -> u32,
    lock_timeout: Option<Duration>,
    initial_value: Option<Arc<T>>,
}

impl<T: Send + Sync + 'static> CellBuilder<T> {
    pub fn new(
        recovery: impl RecoverySource<T> + 'static,
        save_queue: Arc<SaveQueue>,
        retainer: Retainer,
    ) -> Self {
        Self {
            recovery: Arc::new(recovery),
            save: None,
            save_queue,
            retainer,
            name: "unnamed",
            weigher: default_weight::<T>,
            lock_timeout: None,
            initial_value: None,
        }
    }

    /// Persists the first produced value through `save`.
    pub fn save(mut self, save: impl SaveSource<T> + 'static) -> Self {
        self.save = Some(Arc::new(save));
        self
    }

    /// A name used in logs.
    pub fn name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// The weight of a value towards the retention budget.
    ///
    /// Defaults to the stack size of `T`, which is only accurate for values without indirection.
    pub fn weigher(mut self, weigher: fn(&T) -> u32) -> Self {
        self.weigher = weigher;
        self
    }

    /// How long blocking callers wait for a recovery running on another thread.
    pub fn lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Publishes an already produced value as the cell's first value.
    ///
    /// The value counts as the first production of the cell, and is saved if the cell saves.
    /// The cell itself only holds it weakly: it stays alive while the caller, the [`Retainer`] or
    /// a pending save holds on to it. With none of these, it is gone once `build` returns and the
    /// first access recovers it.
    pub fn initial_value(mut self, value: Arc<T>) -> Self {
        self.initial_value = Some(value);
        self
    }

    pub fn build(self) -> ValueCell<T> {
        let cell = ValueCell {
            inner: Arc::new(CellInner {
                id: CellId::next(),
                name: self.name,
                value: ArcSwapAny::new(Weak::new()),
                lock: CoalescingLock::mutex(),
                lineage: Mutex::new(Lineage {
                    recovery: self.recovery,
                    state: SaveState::Unsaved,
                }),
                save: self.save,
                save_queue: self.save_queue,
                save_done: Notify::new(),
                retainer: self.retainer,
                weigher: self.weigher,
                lock_timeout: self.lock_timeout,
            }),
        };

        if let Some(value) = self.initial_value {
            cell.publish(value);
        }
        cell
    }
}
