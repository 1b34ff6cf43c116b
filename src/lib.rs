//! Single-flight execution of expensive operations.
//!
//! A [`CoalescingExecutor`] wraps an operation and an execution context. Any number of callers,
//! on any threads, can ask for a result with [`CoalescingExecutor::trigger`]. At most one run of
//! the operation is claimed at a time, and every caller that triggers while a run is claimed
//! receives a [`Handle`] to that same run, and so the same value or the same error.
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use coalescer::{CoalescingExecutor, TaskQueue};
//!
//! static RUNS: AtomicUsize = AtomicUsize::new(0);
//!
//! let queue = TaskQueue::new();
//! let executor = CoalescingExecutor::new(
//!     || Ok::<_, String>(RUNS.fetch_add(1, Ordering::SeqCst) + 1),
//!     queue.clone(),
//! );
//!
//! let a = executor.trigger();
//! let b = executor.trigger();
//! assert!(a.ptr_eq(&b));
//!
//! a.start();
//! b.start();
//! queue.run_until_idle();
//!
//! assert_eq!(a.outcome(), Some(Ok(1)));
//! assert_eq!(b.outcome(), Some(Ok(1)));
//! assert!(!executor.is_claimed());
//! ```
//!
//! Enable the `tracing` feature to emit round lifecycle events.

mod executor;
mod handle;
mod spawn;
pub mod utils;

pub use executor::*;
pub use handle::*;
pub use spawn::*;
