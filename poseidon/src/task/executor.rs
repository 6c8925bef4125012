use super::{AsyncState, AsyncTask};
use crate::utils::callback::run_callback;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};

/// FIFO executor for CPU- or blocking-IO-bound work.
///
/// The bootstrap spawns several identical worker threads over one shared
/// queue. The queue holds weak references: an owner that drops its task
/// before a worker picks it up cancels it implicitly.
pub struct TaskExecutor {
    queue: Mutex<VecDeque<Weak<dyn AsyncTask>>>,
    avail: Condvar,
}

impl Default for TaskExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskExecutor {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            avail: Condvar::new(),
        }
    }

    /// Appends a task to the queue. Tasks are not reordered.
    pub fn enqueue(&self, task: &Arc<dyn AsyncTask>) {
        let mut queue = self.queue.lock();
        queue.push_back(Arc::downgrade(task));
        self.avail.notify_one();
    }

    /// One worker round: pop a task and run it to completion.
    pub fn thread_loop(&self) {
        let mut queue = self.queue.lock();
        while queue.is_empty() {
            self.avail.wait(&mut queue);
        }

        let weak = queue.pop_front().expect("queue non-empty");
        drop(queue);

        let task = match weak.upgrade() {
            Some(task) => task,
            // The owner has abandoned the task.
            None => return,
        };

        task.state().store(AsyncState::Running);
        run_callback("asynchronous task", || task.execute());
        task.state().store(AsyncState::Finished);
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::AtomicAsyncState;
    use static_assertions::assert_impl_all;
    use std::sync::atomic::{AtomicUsize, Ordering};

    assert_impl_all!(TaskExecutor: Send, Sync);

    struct CountingTask {
        state: AtomicAsyncState,
        runs: AtomicUsize,
        panics: bool,
    }

    impl CountingTask {
        fn new(panics: bool) -> Arc<Self> {
            Arc::new(Self {
                state: AtomicAsyncState::new(),
                runs: AtomicUsize::new(0),
                panics,
            })
        }
    }

    impl AsyncTask for CountingTask {
        fn state(&self) -> &AtomicAsyncState {
            &self.state
        }

        fn execute(&self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.panics {
                panic!("task failure");
            }
        }
    }

    #[test]
    fn test_tasks_run_in_fifo_order() {
        let executor = TaskExecutor::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        struct Ordered {
            state: AtomicAsyncState,
            order: Arc<Mutex<Vec<usize>>>,
            id: usize,
        }
        impl AsyncTask for Ordered {
            fn state(&self) -> &AtomicAsyncState {
                &self.state
            }
            fn execute(&self) {
                self.order.lock().push(self.id);
            }
        }

        let tasks: Vec<Arc<dyn AsyncTask>> = (0..4)
            .map(|id| {
                Arc::new(Ordered {
                    state: AtomicAsyncState::new(),
                    order: order.clone(),
                    id,
                }) as Arc<dyn AsyncTask>
            })
            .collect();

        for task in &tasks {
            executor.enqueue(task);
        }
        for _ in 0..4 {
            executor.thread_loop();
        }

        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
        assert!(tasks
            .iter()
            .all(|t| t.state().load() == AsyncState::Finished));
    }

    #[test]
    fn test_dropped_task_is_discarded() {
        let executor = TaskExecutor::new();
        let task = CountingTask::new(false);
        executor.enqueue(&(task.clone() as Arc<dyn AsyncTask>));
        drop(task);

        executor.thread_loop();
        assert_eq!(executor.pending(), 0);
    }

    #[test]
    fn test_panicking_task_still_finishes() {
        let executor = TaskExecutor::new();
        let task = CountingTask::new(true);
        executor.enqueue(&(task.clone() as Arc<dyn AsyncTask>));

        executor.thread_loop();
        assert_eq!(task.runs.load(Ordering::SeqCst), 1);
        assert_eq!(task.state.load(), AsyncState::Finished);
    }
}
