//! One-shot and periodic timers.

mod driver;
pub use driver::TimerDriver;

use crate::task::AtomicAsyncState;
use std::sync::atomic::{AtomicU64, Ordering};

/// Driver-side bookkeeping embedded in every timer.
///
/// The serial identifies the latest `insert` of the timer; heap entries
/// left over from an earlier arming carry a stale serial and are
/// discarded instead of fired.
#[derive(Debug, Default)]
pub struct TimerCtl {
    serial: AtomicU64,
    state: AtomicAsyncState,
}

impl TimerCtl {
    pub const fn new() -> Self {
        Self {
            serial: AtomicU64::new(0),
            state: AtomicAsyncState::new(),
        }
    }

    pub(crate) fn serial(&self) -> u64 {
        self.serial.load(Ordering::Acquire)
    }

    pub(crate) fn set_serial(&self, serial: u64) {
        self.serial.store(serial, Ordering::Release);
    }

    pub fn state(&self) -> &AtomicAsyncState {
        &self.state
    }
}

/// A callback fired at deadlines by the [`TimerDriver`].
pub trait Timer: Send + Sync + 'static {
    fn ctl(&self) -> &TimerCtl;

    /// Invoked with the current monotonic time in milliseconds.
    fn on_tick(&self, now_ms: i64);
}
