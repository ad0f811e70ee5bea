//! # Recoverable value cells
//!
//! A [`ValueCell`] holds on to an expensive, immutable value only as long as it is useful to keep
//! it in memory. When the value was dropped, the cell produces it again on the next access, either
//! by computing it from scratch or by reading back a copy that was persisted earlier.
//!
//! ## Accessing a value
//!
//! An access goes through the following steps:
//! - First, the weak reference to the last produced value is checked. This never takes a lock.
//! - On miss, the caller waits for the cell's [`CoalescingLock`](crate::sync::CoalescingLock).
//!   Blocking callers park their thread, async callers suspend their task. Both wait in one queue.
//! - Once holding the lock, the weak reference is checked again, as a concurrent caller may have
//!   produced the value in the meantime.
//! - On miss, the cell runs its current [`RecoverySource`] and publishes the result.
//!
//! Only one recovery per cell runs at a time, and every caller waiting on it sees the same value.
//!
//! ## Saving
//!
//! Cells constructed with a [`SaveSource`] persist the first value they produce. Saves of all cells
//! go through the global [`SaveQueue`] and run strictly one after another, in the order they were
//! requested. A successful save hands back a new recovery, which reads the persisted copy, and the
//! cell uses it from then on. A failed save is logged, and the next produced value is saved again.
//!
//! A saved cell can be turned into any number of [derived](ValueCell::derive) cells, which share
//! the persisted copy and never save on their own.
//!
//! ## Retention
//!
//! Values are dropped as soon as nobody holds them anymore. The [`Retainer`] keeps recently produced
//! values alive within a weight budget, and drops them when they were idle for too long. Evicting
//! from the retainer is how memory pressure is applied to cells.
//!
//! ### Metrics
//!
//! - `cells.access`: All accesses, tagged with the `mode` of access (`blocking` or `async`).
//! - `cells.memory.hit`: Accesses served by a live value.
//! - `cells.recovery`: Recoveries run, tagged with their `source` (`initial` or `saved`).
//! - `cells.recovery.failed`: Recoveries that returned an error.
//! - `cells.recovery.duration`: How long recoveries took.
//! - `cells.save`: Completed saves, tagged with their `status`.
//! - `cells.derived`: Derived cells created.
//! - `save_queue.pending`: The number of queued saves, sampled on every enqueue.

mod error;
mod holders;
mod recoverable;
mod retain;
mod save_queue;
mod source;

pub use error::{SourceError, SourceResult, ValueError, ValueResult};
pub use holders::{ConstantValueSource, WeakValueSource};
pub use recoverable::{CellBuilder, CellId, SaveState, ValueCell};
pub use retain::Retainer;
pub use save_queue::SaveQueue;
pub use source::{
    AsyncRecoveryFn, RecoveryFn, RecoverySource, SaveFn, SaveSource, ValueSource, recovery_fn,
    recovery_fn_async, save_fn,
};
