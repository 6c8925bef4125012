use super::Timer;
use crate::task::AsyncState;
use crate::utils::callback::run_callback;
use crate::utils::clock::monotonic_ms;
use anyhow::{anyhow, Result};
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// 1000 days, the sanity bound on delays and periods.
const MAX_DELAY_MS: i64 = 1000 * 24 * 3600 * 1000;

struct QueuedTimer {
    timer: Weak<dyn Timer>,
    serial: u64,
    next: i64,
    period: i64,
}

// Min-heap on (next, serial): deadline order, ties broken by insertion.
impl PartialEq for QueuedTimer {
    fn eq(&self, other: &Self) -> bool {
        (self.next, self.serial) == (other.next, other.serial)
    }
}
impl Eq for QueuedTimer {}
impl PartialOrd for QueuedTimer {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedTimer {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.next, other.serial).cmp(&(self.next, self.serial))
    }
}

struct Heap {
    pq: BinaryHeap<QueuedTimer>,
    serial: u64,
}

/// Fires timer callbacks from a min-heap of deadlines.
pub struct TimerDriver {
    heap: Mutex<Heap>,
    avail: Condvar,
}

impl Default for TimerDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerDriver {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(Heap {
                pq: BinaryHeap::new(),
                // A random starting serial keeps serials from colliding
                // with stale ones after a restart-in-place.
                serial: rand::thread_rng().gen(),
            }),
            avail: Condvar::new(),
        }
    }

    /// The driver's monotonic clock, in milliseconds.
    pub fn clock() -> i64 {
        monotonic_ms()
    }

    /// Registers `timer` to fire after `delay` and then every `period`.
    ///
    /// A zero period makes the timer one-shot. Re-inserting an already
    /// armed timer re-arms it: entries from the earlier arming are
    /// invalidated by the serial check and silently dropped.
    pub fn insert(&self, timer: &Arc<dyn Timer>, delay: Duration, period: Duration) -> Result<()> {
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        let period_ms = i64::try_from(period.as_millis()).unwrap_or(i64::MAX);

        if delay_ms > MAX_DELAY_MS {
            return Err(anyhow!("timer delay out of range: {:?}", delay));
        }
        if period_ms > MAX_DELAY_MS {
            return Err(anyhow!("timer period out of range: {:?}", period));
        }

        let mut heap = self.heap.lock();
        heap.serial += 1;
        timer.ctl().set_serial(heap.serial);

        let elem = QueuedTimer {
            timer: Arc::downgrade(timer),
            serial: heap.serial,
            next: Self::clock() + delay_ms,
            period: period_ms,
        };
        heap.pq.push(elem);
        self.avail.notify_one();
        Ok(())
    }

    /// One driver round: wait for the earliest deadline, then fire it.
    pub fn thread_loop(&self) {
        let mut heap = self.heap.lock();
        while heap.pq.is_empty() {
            self.avail.wait(&mut heap);
        }

        let now = Self::clock();
        let next = heap.pq.peek().expect("heap non-empty").next;
        if now < next {
            let wait = Duration::from_millis((next - now) as u64);
            self.avail.wait_for(&mut heap, wait);
            return;
        }

        let mut elem = heap.pq.pop().expect("heap non-empty");
        let timer = match elem.timer.upgrade() {
            Some(timer) if elem.serial == timer.ctl().serial() => timer,
            // Dead or re-armed; drop the stale entry.
            _ => return,
        };

        let next_state;
        if elem.period != 0 {
            elem.next += elem.period;
            heap.pq.push(elem);
            next_state = AsyncState::Suspended;
        } else {
            next_state = AsyncState::Finished;
        }
        drop(heap);

        timer.ctl().state().store(AsyncState::Running);
        run_callback("timer callback", || timer.on_tick(now));
        timer.ctl().state().store(next_state);
    }

    /// Number of queued entries, including stale ones.
    pub fn size(&self) -> usize {
        self.heap.lock().pq.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::TimerCtl;
    use static_assertions::assert_impl_all;
    use std::sync::atomic::{AtomicUsize, Ordering};

    assert_impl_all!(TimerDriver: Send, Sync);

    struct TickCounter {
        ctl: TimerCtl,
        ticks: AtomicUsize,
    }

    impl TickCounter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                ctl: TimerCtl::new(),
                ticks: AtomicUsize::new(0),
            })
        }
    }

    impl Timer for TickCounter {
        fn ctl(&self) -> &TimerCtl {
            &self.ctl
        }
        fn on_tick(&self, _now_ms: i64) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_zero_delay_one_shot_fires_once() {
        let driver = TimerDriver::new();
        let timer = TickCounter::new();
        driver
            .insert(
                &(timer.clone() as Arc<dyn Timer>),
                Duration::ZERO,
                Duration::ZERO,
            )
            .unwrap();

        driver.thread_loop();
        assert_eq!(timer.ticks.load(Ordering::SeqCst), 1);
        assert_eq!(timer.ctl.state().load(), AsyncState::Finished);
        assert_eq!(driver.size(), 0);
    }

    #[test]
    fn test_periodic_timer_reinserts() {
        let driver = TimerDriver::new();
        let timer = TickCounter::new();
        driver
            .insert(
                &(timer.clone() as Arc<dyn Timer>),
                Duration::ZERO,
                Duration::from_millis(1),
            )
            .unwrap();

        while timer.ticks.load(Ordering::SeqCst) < 3 {
            driver.thread_loop();
        }
        assert_eq!(timer.ctl.state().load(), AsyncState::Suspended);
        assert_eq!(driver.size(), 1);
    }

    #[test]
    fn test_rearm_invalidates_stale_entry() {
        let driver = TimerDriver::new();
        let timer = TickCounter::new();
        let as_dyn = timer.clone() as Arc<dyn Timer>;

        driver
            .insert(&as_dyn, Duration::ZERO, Duration::ZERO)
            .unwrap();
        driver
            .insert(&as_dyn, Duration::ZERO, Duration::ZERO)
            .unwrap();
        assert_eq!(driver.size(), 2);

        // First pop hits whichever entry sorts first; only the one with
        // the current serial may fire.
        driver.thread_loop();
        driver.thread_loop();
        assert_eq!(timer.ticks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_timer_never_fires() {
        let driver = TimerDriver::new();
        let timer = TickCounter::new();
        driver
            .insert(
                &(timer.clone() as Arc<dyn Timer>),
                Duration::ZERO,
                Duration::ZERO,
            )
            .unwrap();
        drop(timer);

        driver.thread_loop();
        assert_eq!(driver.size(), 0);
    }

    #[test]
    fn test_delay_out_of_range_rejected() {
        let driver = TimerDriver::new();
        let timer = TickCounter::new();
        let res = driver.insert(
            &(timer as Arc<dyn Timer>),
            Duration::from_secs(2000 * 24 * 3600),
            Duration::ZERO,
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_deadline_order_with_serial_tie_break() {
        let driver = TimerDriver::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        struct Ordered {
            ctl: TimerCtl,
            order: Arc<Mutex<Vec<usize>>>,
            id: usize,
        }
        impl Timer for Ordered {
            fn ctl(&self) -> &TimerCtl {
                &self.ctl
            }
            fn on_tick(&self, _now_ms: i64) {
                self.order.lock().push(self.id);
            }
        }

        let timers: Vec<Arc<dyn Timer>> = (0..3)
            .map(|id| {
                Arc::new(Ordered {
                    ctl: TimerCtl::new(),
                    order: order.clone(),
                    id,
                }) as Arc<dyn Timer>
            })
            .collect();

        // Same (zero) deadline for all three: insertion order must win.
        for timer in &timers {
            driver.insert(timer, Duration::ZERO, Duration::ZERO).unwrap();
        }
        for _ in 0..3 {
            driver.thread_loop();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }
}
