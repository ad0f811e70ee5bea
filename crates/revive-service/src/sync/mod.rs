//! Synchronization primitives shared by the value cells.
//!
//! - [`CoalescingLock`] serializes the read-or-recompute section of a cell, and can be waited on
//!   by blocking threads and suspended tasks alike.
//! - [`TaskQueue`] runs asynchronous work strictly one unit after another.

mod lock;
mod task_queue;

pub use lock::{AcquireError, CoalescingGuard, CoalescingLock};
pub use task_queue::{TaskError, TaskQueue};
