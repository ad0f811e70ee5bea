use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::{Pin, pin};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Wake, Waker};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// An error returned when waiting on a [`CoalescingLock`] did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AcquireError {
    /// The waiter's cancellation token fired before the lock was handed to it.
    #[error("acquisition was cancelled")]
    Cancelled,
    /// The blocking wait exceeded its timeout.
    #[error("acquisition timed out after {0:?}")]
    TimedOut(Duration),
}

const WAITING: u8 = 0;
const GRANTED: u8 = 1;
const ABANDONED: u8 = 2;

/// A single queued acquirer.
///
/// The state only ever moves away from `WAITING`, either to `GRANTED` by a releasing holder or to
/// `ABANDONED` by the waiter itself. Whoever wins that race owns the permit.
struct Waiter {
    state: AtomicU8,
    waker: Mutex<Option<Waker>>,
}

impl Waiter {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(WAITING),
            waker: Mutex::new(None),
        }
    }

    fn is_granted(&self) -> bool {
        self.state.load(Ordering::Acquire) == GRANTED
    }

    fn try_grant(&self) -> bool {
        self.state
            .compare_exchange(WAITING, GRANTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn try_abandon(&self) -> bool {
        self.state
            .compare_exchange(WAITING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn register(&self, waker: &Waker) {
        let mut slot = self.waker.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(existing) if existing.will_wake(waker) => {}
            _ => *slot = Some(waker.clone()),
        }
    }

    fn wake(&self) {
        let waker = self
            .waker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

struct LockState {
    permits: usize,
    /// Queued acquirers in FIFO order. The deque does not allocate until the lock is contended.
    waiters: VecDeque<Arc<Waiter>>,
}

/// A counting lock that can be waited on both by blocking threads and by suspended tasks.
///
/// All acquirers share a single FIFO of waiters, so a thread calling
/// [`acquire_blocking`](Self::acquire_blocking) and a task awaiting [`acquire`](Self::acquire)
/// are served in the order they started waiting. Holding a [`CoalescingGuard`] represents one
/// permit; dropping it hands the permit to the next live waiter.
///
/// Waiting is cancellable through a [`CancellationToken`]. A cancelled waiter never ends up
/// holding the lock: if a permit was handed to it at the same moment it gave up, the permit is
/// passed on to the next waiter on its behalf.
///
/// An uncontended lock is a mutex-protected counter and performs no heap allocation. Waiter
/// nodes are only allocated when an acquirer actually has to wait.
pub struct CoalescingLock {
    state: Mutex<LockState>,
}

impl CoalescingLock {
    /// Creates a lock with `permits` initially available permits.
    pub const fn new(permits: usize) -> Self {
        Self {
            state: Mutex::new(LockState {
                permits,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Creates a binary lock, allowing a single holder at a time.
    pub const fn mutex() -> Self {
        Self::new(1)
    }

    fn lock_state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The number of permits that can be acquired right now without waiting.
    pub fn available_permits(&self) -> usize {
        self.lock_state().permits
    }

    /// The number of acquirers currently queued.
    pub fn waiters(&self) -> usize {
        self.lock_state().waiters.len()
    }

    /// Acquires a permit if one is available and nobody is queued before us.
    pub fn try_acquire(&self) -> Option<CoalescingGuard<'_>> {
        let mut state = self.lock_state();
        if state.permits > 0 && state.waiters.is_empty() {
            state.permits -= 1;
            Some(CoalescingGuard { lock: self })
        } else {
            None
        }
    }

    /// Returns one permit to the lock.
    ///
    /// This is what dropping a [`CoalescingGuard`] does. The permit goes to the oldest waiter that
    /// has not abandoned its wait, or back into the pool if there is none.
    pub fn release(&self) {
        let granted = {
            let mut state = self.lock_state();
            loop {
                match state.waiters.pop_front() {
                    Some(waiter) => {
                        if waiter.try_grant() {
                            break Some(waiter);
                        }
                    }
                    None => {
                        state.permits += 1;
                        break None;
                    }
                }
            }
        };

        if let Some(waiter) = granted {
            waiter.wake();
        }
    }

    /// Takes a permit right away, or queues a new waiter.
    fn enqueue(&self) -> Result<CoalescingGuard<'_>, Arc<Waiter>> {
        let mut state = self.lock_state();
        if state.permits > 0 && state.waiters.is_empty() {
            state.permits -= 1;
            return Ok(CoalescingGuard { lock: self });
        }

        let waiter = Arc::new(Waiter::new());
        state.waiters.push_back(Arc::clone(&waiter));
        Err(waiter)
    }

    /// Gives up waiting.
    ///
    /// If the waiter was granted the permit concurrently, it is released again so the next
    /// waiter gets it.
    fn abandon(&self, waiter: &Arc<Waiter>) {
        if waiter.try_abandon() {
            let mut state = self.lock_state();
            state.waiters.retain(|queued| !Arc::ptr_eq(queued, waiter));
        } else if waiter.is_granted() {
            self.release();
        }
    }

    /// Waits for a permit without blocking the current thread.
    ///
    /// Resolves to [`AcquireError::Cancelled`] if `cancel` fires first. The returned future may
    /// also simply be dropped, which gives up the wait in the same way.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<CoalescingGuard<'_>, AcquireError> {
        if cancel.is_cancelled() {
            return Err(AcquireError::Cancelled);
        }

        tokio::select! {
            biased;

            guard = Acquire::new(self) => Ok(guard),
            _ = cancel.cancelled() => Err(AcquireError::Cancelled),
        }
    }

    /// Waits for a permit by blocking the current thread.
    ///
    /// The wait ends early when `cancel` fires, or when `timeout` elapses if one is given.
    pub fn acquire_blocking(
        &self,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<CoalescingGuard<'_>, AcquireError> {
        if cancel.is_cancelled() {
            return Err(AcquireError::Cancelled);
        }

        let waiter = match self.enqueue() {
            Ok(guard) => return Ok(guard),
            Err(waiter) => waiter,
        };

        // A timeout too large to be represented waits without bound.
        let deadline = timeout
            .and_then(|timeout| Some((Instant::now().checked_add(timeout)?, timeout)));

        // Both a grant and the cancellation token wake this thread through the same waker.
        let waker = Waker::from(Arc::new(ThreadWaker(thread::current())));
        let mut cx = Context::from_waker(&waker);
        waiter.register(&waker);
        let mut cancelled = pin!(cancel.cancelled());

        loop {
            if waiter.is_granted() {
                return Ok(CoalescingGuard { lock: self });
            }
            if cancelled.as_mut().poll(&mut cx).is_ready() {
                self.abandon(&waiter);
                return Err(AcquireError::Cancelled);
            }
            match deadline {
                Some((deadline, timeout)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        self.abandon(&waiter);
                        return Err(AcquireError::TimedOut(timeout));
                    }
                    thread::park_timeout(deadline - now);
                }
                None => thread::park(),
            }
        }
    }
}

impl Default for CoalescingLock {
    fn default() -> Self {
        Self::mutex()
    }
}

impl fmt::Debug for CoalescingLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("CoalescingLock")
            .field("permits", &state.permits)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

/// A held permit of a [`CoalescingLock`], released on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct CoalescingGuard<'a> {
    lock: &'a CoalescingLock,
}

impl Drop for CoalescingGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

impl fmt::Debug for CoalescingGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoalescingGuard").finish_non_exhaustive()
    }
}

struct ThreadWaker(Thread);

impl Wake for ThreadWaker {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.unpark();
    }
}

/// The suspending half of the lock, queued on first poll.
///
/// Dropping it before it resolved abandons the wait.
struct Acquire<'a> {
    lock: &'a CoalescingLock,
    waiter: Option<Arc<Waiter>>,
}

impl<'a> Acquire<'a> {
    fn new(lock: &'a CoalescingLock) -> Self {
        Self { lock, waiter: None }
    }
}

impl<'a> Future for Acquire<'a> {
    type Output = CoalescingGuard<'a>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let lock = this.lock;

        let waiter = match this.waiter.take() {
            Some(waiter) => waiter,
            None => match lock.enqueue() {
                Ok(guard) => return Poll::Ready(guard),
                Err(waiter) => waiter,
            },
        };

        // Register first, so a grant racing with this poll is never missed.
        waiter.register(cx.waker());
        if waiter.is_granted() {
            return Poll::Ready(CoalescingGuard { lock });
        }

        this.waiter = Some(waiter);
        Poll::Pending
    }
}

impl Drop for Acquire<'_> {
    fn drop(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            self.lock.abandon(&waiter);
        }
    }
}
