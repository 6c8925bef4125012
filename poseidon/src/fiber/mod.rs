//! Stackful cooperative fibers.
//!
//! Thousands of fibers multiplex onto one OS thread. A fiber suspends
//! only at explicit yield points, parking on a [`FiberFuture`] with a
//! bounded-time suspension; producers on other threads complete futures
//! and the scheduler resumes the parked fibers in its next round.

mod context;

mod future;
pub use future::{FiberFuture, FutureResult, ValueFuture};

mod scheduler;
pub use scheduler::FiberScheduler;

mod stack;

use crate::task::AtomicAsyncState;

/// A suspendable task with its own stack.
///
/// `execute` runs on the fiber's private stack and may call
/// [`FiberScheduler::check_and_yield`] any number of times. The
/// scheduler holds the only strong reference while the fiber is live and
/// releases it when `execute` returns.
pub trait Fiber: Send + Sync + 'static {
    fn state(&self) -> &AtomicAsyncState;

    fn execute(&self);
}
