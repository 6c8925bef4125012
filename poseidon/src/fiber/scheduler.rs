use super::context::{self, RawContext};
use super::stack::FiberStack;
use super::{Fiber, FiberFuture};
use crate::config::ConfigFile;
use crate::task::AsyncState;
use crate::utils::callback::run_callback;
use crate::utils::clock::monotonic_ms;
use crate::utils::sys::page_size;
use anyhow::{anyhow, Result};
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

const DEFAULT_STACK_VM_SIZE: usize = 0x40000; // 256 KiB
const DEFAULT_WARN_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_FAIL_TIMEOUT: Duration = Duration::from_secs(300);

/// Idle wait when the ready set is empty, so the bootstrap loop can
/// re-check its exit condition.
const IDLE_WAIT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
struct Config {
    stack_vm_size: usize,
    warn_timeout: Duration,
    fail_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stack_vm_size: DEFAULT_STACK_VM_SIZE,
            warn_timeout: DEFAULT_WARN_TIMEOUT,
            fail_timeout: DEFAULT_FAIL_TIMEOUT,
        }
    }
}

struct QfInner {
    started: bool,
    finished: bool,
    stack: Option<FiberStack>,
    ctx: Box<RawContext>,
    futr: Option<Arc<FiberFuture>>,

    /// Absolute times, monotonic milliseconds. `i64::MAX` means never.
    yield_time: i64,
    warn_time: i64,
    fail_time: i64,
}

/// Scheduler-side wrapper around a live fiber.
pub(crate) struct QueuedFiber {
    fiber: Arc<dyn Fiber>,
    sched: Weak<Shared>,
    self_weak: Weak<QueuedFiber>,

    /// Serial of the newest heap key for this fiber; older keys are
    /// stale and discarded on pop, like re-armed timers.
    key_serial: AtomicU64,

    /// Set by a completed future; cleared when the fiber resumes.
    wake_now: AtomicBool,

    inner: Mutex<QfInner>,
}

// The inner context and stack are only ever touched on the fiber thread;
// the mutex exists to order those accesses against launch and wake.
unsafe impl Send for QueuedFiber {}
unsafe impl Sync for QueuedFiber {}

impl QueuedFiber {
    /// Marks this fiber due immediately. Called by completed futures
    /// from any thread.
    pub(crate) fn wake(self: &Arc<Self>) {
        self.wake_now.store(true, Ordering::Release);
        if let Some(shared) = self.sched.upgrade() {
            shared.requeue(self, monotonic_ms());
        }
    }

    fn next_key_serial(&self) -> u64 {
        self.key_serial.fetch_add(1, Ordering::AcqRel) + 1
    }
}

struct QfKey {
    time: i64,
    serial: u64,
    qf: Arc<QueuedFiber>,
}

// Min-heap on (time, serial); the fiber itself does not order.
impl PartialEq for QfKey {
    fn eq(&self, other: &Self) -> bool {
        (self.time, self.serial) == (other.time, other.serial)
    }
}
impl Eq for QfKey {}
impl PartialOrd for QfKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for QfKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.time, other.serial).cmp(&(self.time, self.serial))
    }
}

struct Pq {
    heap: BinaryHeap<QfKey>,
    live: usize,
}

struct Shared {
    conf: Mutex<Config>,
    pq: Mutex<Pq>,
    avail: Condvar,
}

impl Shared {
    fn requeue(&self, qf: &Arc<QueuedFiber>, time: i64) {
        let serial = qf.next_key_serial();
        let mut pq = self.pq.lock();
        pq.heap.push(QfKey {
            time,
            serial,
            qf: qf.clone(),
        });
        self.avail.notify_one();
    }
}

// The scheduler context and current fiber for this thread, valid while a
// scheduling round is switching in and out of a fiber.
struct SwitchPoint {
    sched_ctx: RawContext,
    qf: *const QueuedFiber,
}

thread_local! {
    static CURRENT: Cell<*mut SwitchPoint> = const { Cell::new(std::ptr::null_mut()) };
}

/// Multiplexes stackful fibers onto the calling OS thread.
pub struct FiberScheduler {
    shared: Arc<Shared>,
}

impl Default for FiberScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl FiberScheduler {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                conf: Mutex::new(Config::default()),
                pq: Mutex::new(Pq {
                    heap: BinaryHeap::new(),
                    live: 0,
                }),
                avail: Condvar::new(),
            }),
        }
    }

    /// Re-reads `fiber.*` configuration.
    pub fn reload(&self, file: &ConfigFile) -> Result<()> {
        let mut conf = Config::default();

        let value = file.query(&["fiber", "stack_vm_size"])?;
        if let Some(size) = value.as_i64() {
            if size != 0 {
                if !(0x10000..=0x7FFF_0000).contains(&size) {
                    return Err(anyhow!("`fiber.stack_vm_size` value `{}` out of range", size));
                }
                conf.stack_vm_size = (size as usize).div_ceil(page_size()) * page_size();
            }
        } else if !value.is_null() {
            log::warn!(
                "Ignoring `fiber.stack_vm_size`: expecting an `integer`, got `{}`",
                value
            );
        }

        let value = file.query(&["fiber", "warn_timeout"])?;
        if let Some(secs) = value.as_i64() {
            conf.warn_timeout = Duration::from_secs(secs.max(0) as u64);
        } else if !value.is_null() {
            log::warn!(
                "Ignoring `fiber.warn_timeout`: expecting an `integer`, got `{}`",
                value
            );
        }

        let value = file.query(&["fiber", "fail_timeout"])?;
        if let Some(secs) = value.as_i64() {
            conf.fail_timeout = Duration::from_secs(secs.max(0) as u64);
        } else if !value.is_null() {
            log::warn!(
                "Ignoring `fiber.fail_timeout`: expecting an `integer`, got `{}`",
                value
            );
        }

        *self.shared.conf.lock() = conf;
        Ok(())
    }

    /// Number of fibers being scheduled.
    pub fn size(&self) -> usize {
        self.shared.pq.lock().live
    }

    /// Takes ownership of `fiber` and schedules it for execution.
    ///
    /// The stack is allocated here so that resource exhaustion surfaces
    /// to the caller instead of silently dropping the fiber later.
    pub fn launch(&self, fiber: Arc<dyn Fiber>) -> Result<()> {
        let conf = self.shared.conf.lock().clone();
        let stack = FiberStack::alloc(conf.stack_vm_size)?;

        let qf = Arc::new_cyclic(|self_weak| QueuedFiber {
            fiber,
            sched: Arc::downgrade(&self.shared),
            self_weak: self_weak.clone(),
            key_serial: AtomicU64::new(0),
            wake_now: AtomicBool::new(false),
            inner: Mutex::new(QfInner {
                started: false,
                finished: false,
                stack: Some(stack),
                ctx: context::zeroed_context(),
                futr: None,
                yield_time: 0,
                warn_time: i64::MAX,
                fail_time: i64::MAX,
            }),
        });

        {
            let mut inner = qf.inner.lock();
            let arg = Arc::as_ptr(&qf) as usize;
            let (lo, usable) = {
                let stack = inner.stack.as_ref().expect("stack just allocated");
                (stack.lo(), stack.usable())
            };
            unsafe {
                context::prepare(&mut inner.ctx, lo, usable, fiber_entry, arg);
            }
        }

        let serial = qf.next_key_serial();
        let mut pq = self.shared.pq.lock();
        pq.live += 1;
        pq.heap.push(QfKey {
            time: monotonic_ms(),
            serial,
            qf,
        });
        self.shared.avail.notify_one();
        Ok(())
    }

    /// The fiber currently executing on this thread, if any.
    pub fn self_opt(&self) -> Option<Arc<dyn Fiber>> {
        let sp = CURRENT.with(|c| c.get());
        if sp.is_null() {
            return None;
        }
        let qf = unsafe { &*(*sp).qf };
        Some(qf.fiber.clone())
    }

    /// One scheduling round. Must be called from the fiber thread.
    pub fn thread_loop(&self) {
        let mut pq = self.shared.pq.lock();
        if pq.heap.is_empty() {
            self.shared.avail.wait_for(&mut pq, IDLE_WAIT);
            return;
        }

        let now = monotonic_ms();
        {
            let head = pq.heap.peek().expect("heap non-empty");
            if head.serial != head.qf.key_serial.load(Ordering::Acquire) {
                // Superseded by a newer key.
                pq.heap.pop();
                return;
            }
            if head.time > now {
                let wait = Duration::from_millis((head.time - now) as u64).min(IDLE_WAIT);
                self.shared.avail.wait_for(&mut pq, wait);
                return;
            }
        }

        let key = pq.heap.pop().expect("heap non-empty");
        drop(pq);
        let qf = key.qf;

        // Decide whether the fiber is due.
        let mut inner = qf.inner.lock();
        let resume = if !inner.started {
            true
        } else {
            let futr_ready = inner.futr.as_ref().map_or(true, |f| f.is_ready());
            if futr_ready || qf.wake_now.load(Ordering::Acquire) || now >= inner.fail_time {
                true
            } else {
                if now >= inner.warn_time {
                    log::warn!(
                        "Fiber has been suspended for {} ms",
                        now - inner.yield_time
                    );
                    inner.warn_time = i64::MAX;
                }
                false
            }
        };

        if !resume {
            let next = inner.warn_time.min(inner.fail_time);
            drop(inner);
            if next != i64::MAX {
                self.shared.requeue(&qf, next);
            }
            // With no deadline left, only a future wake can requeue it.
            return;
        }

        // Switch into the fiber.
        if !inner.started {
            inner.started = true;
        }
        qf.wake_now.store(false, Ordering::Release);
        qf.fiber.state().store(AsyncState::Running);

        let fiber_ctx: *mut RawContext = &mut *inner.ctx;
        drop(inner);

        let mut sp = Box::new(SwitchPoint {
            sched_ctx: unsafe { std::mem::zeroed() },
            qf: Arc::as_ptr(&qf),
        });
        CURRENT.with(|c| c.set(&mut *sp));
        unsafe {
            context::swap(&mut sp.sched_ctx, fiber_ctx);
        }
        CURRENT.with(|c| c.set(std::ptr::null_mut()));

        // Back from the fiber: it either finished or yielded.
        let mut inner = qf.inner.lock();
        if inner.finished {
            qf.fiber.state().store(AsyncState::Finished);
            inner.stack = None;
            inner.futr = None;
            drop(inner);
            self.shared.pq.lock().live -= 1;
        } else {
            qf.fiber.state().store(AsyncState::Suspended);
            let next = match &inner.futr {
                Some(futr) if !futr.is_ready() => inner.warn_time.min(inner.fail_time),
                // Plain yield, or the future raced ready: due again now.
                _ => monotonic_ms(),
            };
            drop(inner);
            if next != i64::MAX {
                self.shared.requeue(&qf, next);
            }
        }
    }

    /// Suspends the current fiber until `futr_opt` becomes ready.
    ///
    /// Must be called from inside a fiber. If the future is already
    /// ready, returns immediately without suspending. The suspension
    /// never exceeds the fail timeout: on expiry the fiber is resumed
    /// with the future still unready and must cope with that.
    pub fn check_and_yield(
        &self,
        futr_opt: Option<&Arc<FiberFuture>>,
        fail_timeout_override: Option<Duration>,
    ) -> Result<()> {
        let sp = CURRENT.with(|c| c.get());
        if sp.is_null() {
            return Err(anyhow!("no fiber is being scheduled on this thread"));
        }
        let qf = unsafe { &*(*sp).qf };

        let conf = self.shared.conf.lock().clone();
        let fail_timeout = fail_timeout_override.unwrap_or(conf.fail_timeout);
        let now = monotonic_ms();

        {
            let mut inner = qf.inner.lock();
            inner.yield_time = now;
            inner.warn_time = now.saturating_add(conf.warn_timeout.as_millis() as i64);
            inner.fail_time = now.saturating_add(fail_timeout.as_millis() as i64);
            inner.futr = futr_opt.cloned();
        }

        if let Some(futr) = futr_opt {
            let self_arc = qf.self_weak.upgrade().expect("fiber is being scheduled");
            if !futr.park(&self_arc) {
                // Already ready; never suspend.
                qf.inner.lock().futr = None;
                return Ok(());
            }
        }

        qf.fiber.state().store(AsyncState::Suspended);
        let fiber_ctx: *mut RawContext = {
            let mut inner = qf.inner.lock();
            &mut *inner.ctx
        };
        unsafe {
            context::swap(fiber_ctx, &mut (*sp).sched_ctx);
        }

        // Resumed.
        qf.inner.lock().futr = None;
        Ok(())
    }
}

extern "C" fn fiber_entry(hi: u32, lo: u32) {
    let qf = unsafe { &*(context::join_arg(hi, lo) as *const QueuedFiber) };

    run_callback("fiber", || qf.fiber.execute());

    qf.inner.lock().finished = true;

    // Final switch back to the scheduler; this context is never resumed.
    loop {
        let sp = CURRENT.with(|c| c.get());
        let fiber_ctx: *mut RawContext = {
            let mut inner = qf.inner.lock();
            &mut *inner.ctx
        };
        unsafe {
            context::swap(fiber_ctx, &mut (*sp).sched_ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::AtomicAsyncState;
    use std::sync::atomic::AtomicUsize;

    fn drive_until_empty(sched: &FiberScheduler) {
        let mut rounds = 0;
        while sched.size() > 0 {
            sched.thread_loop();
            rounds += 1;
            assert!(rounds < 100_000, "scheduler failed to drain");
        }
    }

    struct FnFiber<F: Fn() + Send + Sync + 'static> {
        state: AtomicAsyncState,
        body: F,
    }

    impl<F: Fn() + Send + Sync + 'static> FnFiber<F> {
        fn new(body: F) -> Arc<Self> {
            Arc::new(Self {
                state: AtomicAsyncState::new(),
                body,
            })
        }
    }

    impl<F: Fn() + Send + Sync + 'static> Fiber for FnFiber<F> {
        fn state(&self) -> &AtomicAsyncState {
            &self.state
        }
        fn execute(&self) {
            (self.body)();
        }
    }

    #[test]
    fn test_fiber_runs_to_completion() {
        let sched = FiberScheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits2 = hits.clone();
        let fiber = FnFiber::new(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        sched.launch(fiber.clone()).unwrap();
        assert_eq!(sched.size(), 1);

        drive_until_empty(&sched);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(fiber.state.load(), AsyncState::Finished);
    }

    #[test]
    fn test_yield_on_ready_future_never_suspends() {
        let sched = Arc::new(FiberScheduler::new());
        let futr = Arc::new(FiberFuture::new());
        futr.mark_ready();

        let steps = Arc::new(AtomicUsize::new(0));
        let (sched2, futr2, steps2) = (sched.clone(), futr.clone(), steps.clone());
        sched
            .launch(FnFiber::new(move || {
                steps2.fetch_add(1, Ordering::SeqCst);
                sched2.check_and_yield(Some(&futr2), None).unwrap();
                steps2.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        // A single round suffices: the yield is a no-op.
        sched.thread_loop();
        assert_eq!(steps.load(Ordering::SeqCst), 2);
        assert_eq!(sched.size(), 0);
    }

    #[test]
    fn test_future_wake_resumes_fiber() {
        let sched = Arc::new(FiberScheduler::new());
        let futr = Arc::new(FiberFuture::new());
        let done = Arc::new(AtomicBool::new(false));

        let (sched2, futr2, done2) = (sched.clone(), futr.clone(), done.clone());
        sched
            .launch(FnFiber::new(move || {
                sched2.check_and_yield(Some(&futr2), None).unwrap();
                assert!(futr2.is_ready());
                done2.store(true, Ordering::SeqCst);
            }))
            .unwrap();

        // Park it.
        sched.thread_loop();
        assert!(!done.load(Ordering::SeqCst));

        let waker = {
            let futr = futr.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                futr.mark_ready();
            })
        };

        drive_until_empty(&sched);
        waker.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn test_fail_timeout_resumes_with_unready_future() {
        let sched = Arc::new(FiberScheduler::new());
        let futr = Arc::new(FiberFuture::new());
        let observed_ready = Arc::new(AtomicBool::new(true));

        let (sched2, futr2, observed2) = (sched.clone(), futr.clone(), observed_ready.clone());
        sched
            .launch(FnFiber::new(move || {
                sched2
                    .check_and_yield(Some(&futr2), Some(Duration::from_millis(50)))
                    .unwrap();
                observed2.store(futr2.is_ready(), Ordering::SeqCst);
            }))
            .unwrap();

        let start = monotonic_ms();
        drive_until_empty(&sched);
        let elapsed = monotonic_ms() - start;

        assert!(!observed_ready.load(Ordering::SeqCst));
        assert!(elapsed >= 50, "resumed after {} ms", elapsed);
    }

    #[test]
    fn test_plain_yield_round_robins() {
        let sched = Arc::new(FiberScheduler::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        for id in 0..2 {
            let (sched2, log2) = (sched.clone(), log.clone());
            sched
                .launch(FnFiber::new(move || {
                    for step in 0..3 {
                        log2.lock().push((id, step));
                        sched2.check_and_yield(None, None).unwrap();
                    }
                }))
                .unwrap();
        }

        drive_until_empty(&sched);
        let entries = log.lock();
        assert_eq!(entries.len(), 6);
        // Both fibers made progress interleaved, not serially.
        let first_of_second = entries.iter().position(|&(id, _)| id == 1).unwrap();
        assert!(first_of_second < 3);
    }

    #[test]
    fn test_panicking_fiber_is_released() {
        let sched = FiberScheduler::new();
        sched
            .launch(FnFiber::new(|| panic!("fiber failure")))
            .unwrap();
        drive_until_empty(&sched);
        assert_eq!(sched.size(), 0);
    }
}
