use super::scheduler::QueuedFiber;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// A one-shot synchronisation object fibers can park on.
///
/// `ready` transitions from `false` to `true` exactly once. The producer
/// that completes the future wakes every parked fiber; there is no
/// direct cross-thread switch, the fiber thread picks them up in its
/// next scheduling round.
#[derive(Default)]
pub struct FiberFuture {
    ready: AtomicBool,
    waiters: Mutex<Vec<Weak<QueuedFiber>>>,
}

impl FiberFuture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Completes the future and wakes every waiter.
    ///
    /// Returns `false` if the future was already ready.
    pub fn mark_ready(&self) -> bool {
        let mut waiters = self.waiters.lock();
        if self.ready.swap(true, Ordering::AcqRel) {
            return false;
        }

        for waiter in waiters.drain(..) {
            if let Some(qf) = waiter.upgrade() {
                qf.wake();
            }
        }
        true
    }

    /// Registers a fiber to be woken on completion.
    ///
    /// Returns `false` when the future is already ready, in which case
    /// the fiber must not suspend.
    pub(crate) fn park(&self, waiter: &Arc<QueuedFiber>) -> bool {
        let mut waiters = self.waiters.lock();
        if self.ready.load(Ordering::Acquire) {
            return false;
        }
        waiters.push(Arc::downgrade(waiter));
        true
    }
}

/// The result slot of a typed future.
pub enum FutureResult<T> {
    Unset,
    Value(T),
    Error(String),
}

/// A [`FiberFuture`] carrying a typed value or an error message.
pub struct ValueFuture<T> {
    core: Arc<FiberFuture>,
    result: Mutex<FutureResult<T>>,
}

impl<T> Default for ValueFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ValueFuture<T> {
    pub fn new() -> Self {
        Self {
            core: Arc::new(FiberFuture::new()),
            result: Mutex::new(FutureResult::Unset),
        }
    }

    /// The untyped core, as accepted by
    /// [`FiberScheduler::check_and_yield`](super::FiberScheduler::check_and_yield).
    pub fn core(&self) -> &Arc<FiberFuture> {
        &self.core
    }

    pub fn is_ready(&self) -> bool {
        self.core.is_ready()
    }

    /// Stores the value and completes the future. Only the first
    /// `set_value`/`set_error` wins; later calls return `false`.
    pub fn set_value(&self, value: T) -> bool {
        self.set(FutureResult::Value(value))
    }

    pub fn set_error(&self, error: impl Into<String>) -> bool {
        self.set(FutureResult::Error(error.into()))
    }

    fn set(&self, result: FutureResult<T>) -> bool {
        {
            let mut slot = self.result.lock();
            if !matches!(*slot, FutureResult::Unset) {
                return false;
            }
            *slot = result;
        }
        self.core.mark_ready();
        true
    }

    /// Removes and returns the stored result.
    pub fn take(&self) -> FutureResult<T> {
        std::mem::replace(&mut *self.result.lock(), FutureResult::Unset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(FiberFuture: Send, Sync);
    assert_impl_all!(ValueFuture<Vec<u8>>: Send, Sync);

    #[test]
    fn test_ready_transition_is_once_only() {
        let futr = FiberFuture::new();
        assert!(!futr.is_ready());
        assert!(futr.mark_ready());
        assert!(!futr.mark_ready());
        assert!(futr.is_ready());
    }

    #[test]
    fn test_value_future_first_setter_wins() {
        let futr = ValueFuture::<u32>::new();
        assert!(futr.set_value(1));
        assert!(!futr.set_value(2));
        assert!(!futr.set_error("late"));

        match futr.take() {
            FutureResult::Value(v) => assert_eq!(v, 1),
            _ => panic!("expected a value"),
        }
        assert!(matches!(futr.take(), FutureResult::Unset));
    }

    #[test]
    fn test_error_completes_core() {
        let futr = ValueFuture::<u32>::new();
        futr.set_error("broken");
        assert!(futr.core().is_ready());
        assert!(matches!(futr.take(), FutureResult::Error(_)));
    }
}
