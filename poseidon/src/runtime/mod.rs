//! Process bootstrap: the runtime context owning every driver.
//!
//! Replaces ad-hoc singletons: components receive the parts of the
//! runtime they need, and unit tests can build private runtimes without
//! process-wide side effects (only `install`ing the logger and the
//! signal handlers is global).

pub mod signal;
pub use signal::{exit_signal, install_signal_handlers};

use crate::config::{ConfigStore, MAIN_CONFIG_PATH};
use crate::fiber::FiberScheduler;
use crate::logger::AsyncLogger;
use crate::net::NetworkDriver;
use crate::task::TaskExecutor;
use crate::time::TimerDriver;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Number of identical task executor threads.
const TASK_EXECUTOR_THREADS: usize = 4;

/// The co-operating set of long-running drivers, plus the fiber
/// scheduler run by the main thread.
pub struct Runtime {
    logger: Arc<AsyncLogger>,
    config: Arc<ConfigStore>,
    timer_driver: Arc<TimerDriver>,
    task_executor: Arc<TaskExecutor>,
    network_driver: Arc<NetworkDriver>,
    fiber_scheduler: Arc<FiberScheduler>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Creates all components without starting any thread.
    pub fn new() -> Result<Self> {
        Self::with_config_path(MAIN_CONFIG_PATH)
    }

    pub fn with_config_path(config_path: &str) -> Result<Self> {
        Ok(Self {
            logger: Arc::new(AsyncLogger::new()),
            config: Arc::new(ConfigStore::new(config_path)),
            timer_driver: Arc::new(TimerDriver::new()),
            task_executor: Arc::new(TaskExecutor::new()),
            network_driver: Arc::new(NetworkDriver::new().context("network driver")?),
            fiber_scheduler: Arc::new(FiberScheduler::new()),
            threads: Mutex::new(Vec::new()),
        })
    }

    pub fn logger(&self) -> &Arc<AsyncLogger> {
        &self.logger
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn timer_driver(&self) -> &Arc<TimerDriver> {
        &self.timer_driver
    }

    pub fn task_executor(&self) -> &Arc<TaskExecutor> {
        &self.task_executor
    }

    pub fn network_driver(&self) -> &Arc<NetworkDriver> {
        &self.network_driver
    }

    pub fn fiber_scheduler(&self) -> &Arc<FiberScheduler> {
        &self.fiber_scheduler
    }

    /// Re-reads the main configuration file and pushes the new snapshot
    /// into every component. On failure the previous configuration
    /// stays in effect everywhere.
    pub fn reload(&self) -> Result<()> {
        let file = self.config.reload()?;
        self.logger.reload(&file).context("logger configuration")?;
        self.network_driver
            .reload(&file)
            .context("network configuration")?;
        self.fiber_scheduler
            .reload(&file)
            .context("fiber configuration")?;
        Ok(())
    }

    /// Spawns and names one thread per driver. The calling thread
    /// becomes the fiber thread and must run [`Self::fiber_loop`].
    pub fn start_threads(self: &Arc<Self>) {
        let mut threads = self.threads.lock();
        if !threads.is_empty() {
            return;
        }

        threads.push(self.spawn_driver("poseidon/log", {
            let logger = self.logger.clone();
            move || logger.thread_loop()
        }));

        threads.push(self.spawn_driver("poseidon/timer", {
            let driver = self.timer_driver.clone();
            move || driver.thread_loop()
        }));

        for i in 0..TASK_EXECUTOR_THREADS {
            threads.push(self.spawn_driver(&format!("poseidon/task/{}", i), {
                let executor = self.task_executor.clone();
                move || executor.thread_loop()
            }));
        }

        threads.push(self.spawn_driver("poseidon/net", {
            let driver = self.network_driver.clone();
            move || driver.thread_loop()
        }));
    }

    fn spawn_driver(
        &self,
        name: &str,
        mut round: impl FnMut() + Send + 'static,
    ) -> JoinHandle<()> {
        let thread_name = name.to_string();
        std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                crate::utils::thread::set_current_thread_name(&thread_name);
                signal::block_exit_signals();
                loop {
                    round();
                }
            })
            .expect("could not spawn driver thread")
    }

    /// Runs the fiber scheduler on the calling thread until the exit
    /// flag is set and the scheduler has drained.
    pub fn fiber_loop(&self) {
        crate::utils::thread::set_current_thread_name("poseidon/main");
        loop {
            if signal::exit_signal() != 0 && self.fiber_scheduler.size() == 0 {
                return;
            }
            self.fiber_scheduler.thread_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Runtime: Send, Sync);

    #[test]
    fn test_private_runtime_construction() -> Result<()> {
        let runtime = Runtime::new()?;
        assert_eq!(runtime.fiber_scheduler().size(), 0);
        assert_eq!(runtime.network_driver().size(), 0);
        Ok(())
    }

    #[test]
    fn test_reload_from_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("poseidon.json");
        std::fs::write(
            &path,
            r#"{
                "network": { "poll": { "event_buffer_size": 64, "throttle_size": 4096 } },
                "fiber": { "stack_vm_size": 131072, "warn_timeout": 5, "fail_timeout": 10 },
                "logger": { "error": { "stdio": "stderr" } }
            }"#,
        )?;

        let runtime = Runtime::with_config_path(path.to_str().unwrap())?;
        runtime.reload()?;

        // A broken file leaves the previous snapshot in effect.
        std::fs::write(&path, "not json")?;
        assert!(runtime.reload().is_err());
        assert_eq!(
            runtime
                .config()
                .copy()
                .query(&["fiber", "warn_timeout"])?
                .as_i64(),
            Some(5)
        );
        Ok(())
    }

    #[test]
    fn test_fiber_loop_exits_when_drained() -> Result<()> {
        let runtime = Runtime::new()?;
        signal::simulate_exit_signal(libc::SIGTERM);
        // No fibers: the loop must return immediately.
        runtime.fiber_loop();
        Ok(())
    }
}
