//! Asynchronous logger.
//!
//! Every thread logs through the standard [`log`] macros; the installed
//! backend appends records to a queue and returns immediately. A
//! dedicated logger thread formats records and writes them to the sinks
//! configured for their level. `error` and `fatal` records flush the
//! queue before the logging call returns.

mod format;

use crate::config::ConfigFile;
use anyhow::Result;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

/// Severity levels, least severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(usize)]
pub enum Level {
    Trace = 0,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl Level {
    pub const ALL: [Level; 6] = [
        Level::Trace,
        Level::Debug,
        Level::Info,
        Level::Warn,
        Level::Error,
        Level::Fatal,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }

    fn from_log(level: log::Level) -> Level {
        match level {
            log::Level::Trace => Level::Trace,
            log::Level::Debug => Level::Debug,
            log::Level::Info => Level::Info,
            log::Level::Warn => Level::Warn,
            log::Level::Error => Level::Error,
        }
    }
}

/// Sink configuration for one level.
#[derive(Debug, Clone)]
pub(crate) struct LevelConfig {
    /// Inverse-video tag, e.g. `[TRACE]`.
    pub(crate) tag: String,

    /// ANSI color code body, e.g. `33;1`. Empty disables all coloring.
    pub(crate) color: String,

    /// Standard stream to copy records to.
    pub(crate) stdio: Option<Stdio>,

    /// Append-mode file to copy records to.
    pub(crate) file: String,

    /// Records at this level may be dropped when the queue is backlogged.
    pub(crate) trivial: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stdio {
    Out,
    Err,
}

impl LevelConfig {
    // Sinks used until the first `reload`, so early startup failures are
    // not lost.
    fn builtin(level: Level) -> Self {
        Self {
            tag: format!("[{}]", level.name().to_ascii_uppercase()),
            color: String::new(),
            stdio: match level {
                Level::Trace | Level::Debug => None,
                Level::Info | Level::Warn => Some(Stdio::Out),
                Level::Error | Level::Fatal => Some(Stdio::Err),
            },
            file: String::new(),
            trivial: false,
        }
    }
}

/// One queued log record.
pub(crate) struct Record {
    pub(crate) level: Level,
    pub(crate) time: chrono::DateTime<chrono::Local>,
    pub(crate) thrd_name: String,
    pub(crate) thrd_lwpid: u32,
    pub(crate) func: String,
    pub(crate) file: String,
    pub(crate) line: u32,
    pub(crate) text: String,
}

struct Queue {
    records: VecDeque<Record>,
    draining: bool,
}

/// Records above this backlog are dropped for `trivial` levels.
const TRIVIAL_BACKLOG_LIMIT: usize = 1024;

pub struct AsyncLogger {
    queue: Mutex<Queue>,
    avail: Condvar,
    drained: Condvar,
    conf: Mutex<Arc<[LevelConfig; 6]>>,

    /// LWP id of the logger thread; zero until the thread starts. The
    /// logger thread must never wait for itself in `synchronize`.
    logger_lwpid: AtomicU32,

    /// Verbose mode: levels whose configuration names no standard
    /// stream fall back to the built-in one.
    verbose: std::sync::atomic::AtomicBool,
}

impl Default for AsyncLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncLogger {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(Queue {
                records: VecDeque::new(),
                draining: false,
            }),
            avail: Condvar::new(),
            drained: Condvar::new(),
            conf: Mutex::new(Arc::new(Level::ALL.map(LevelConfig::builtin))),
            logger_lwpid: AtomicU32::new(0),
            verbose: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn set_verbose(&self, verbose: bool) {
        self.verbose.store(verbose, Ordering::Release);
    }

    fn write_one(&self, conf: &[LevelConfig; 6], rec: &Record) {
        let lconf = &conf[rec.level as usize];
        if lconf.stdio.is_none() && self.verbose.load(Ordering::Acquire) {
            let mut patched = lconf.clone();
            patched.stdio = LevelConfig::builtin(rec.level).stdio;
            write_record(&patched, rec);
        } else {
            write_record(lconf, rec);
        }
    }

    /// Rebuilds the per-level sink table from `logger.<level>.*`.
    ///
    /// On error the previous configuration remains in effect.
    pub fn reload(&self, file: &ConfigFile) -> Result<()> {
        let mut table = Level::ALL.map(LevelConfig::builtin);
        for (slot, level) in table.iter_mut().zip(Level::ALL) {
            *slot = load_level_config(file, level)?;
        }

        *self.conf.lock() = Arc::new(table);
        Ok(())
    }

    pub(crate) fn enqueue(&self, rec: Record) {
        let conf = self.conf.lock().clone();
        let trivial = conf[rec.level as usize].trivial;

        let mut queue = self.queue.lock();
        if trivial && rec.level < Level::Error && queue.records.len() > TRIVIAL_BACKLOG_LIMIT {
            return;
        }

        queue.records.push_back(rec);
        self.avail.notify_one();
    }

    /// Blocks until every record enqueued so far has been written.
    pub fn synchronize(&self) {
        let logger_lwpid = self.logger_lwpid.load(Ordering::Relaxed);
        if logger_lwpid == crate::utils::thread::current_thread_lwpid() {
            return;
        }

        if logger_lwpid == 0 {
            // No logger thread yet; write records on the caller.
            self.drain_inline();
            return;
        }

        let mut queue = self.queue.lock();
        self.avail.notify_one();
        while !queue.records.is_empty() || queue.draining {
            self.drained.wait(&mut queue);
        }
    }

    /// Performs one round of the logger thread: wait for records, then
    /// write a whole batch with no lock held.
    pub fn thread_loop(&self) {
        self.logger_lwpid.store(
            crate::utils::thread::current_thread_lwpid(),
            Ordering::Relaxed,
        );

        let mut queue = self.queue.lock();
        while queue.records.is_empty() {
            self.avail.wait(&mut queue);
        }

        let batch = std::mem::take(&mut queue.records);
        queue.draining = true;
        drop(queue);

        let conf = self.conf.lock().clone();
        for rec in &batch {
            self.write_one(&conf, rec);
        }

        let mut queue = self.queue.lock();
        queue.draining = false;
        if queue.records.is_empty() {
            self.drained.notify_all();
        }
    }

    fn drain_inline(&self) {
        let conf = self.conf.lock().clone();
        loop {
            let rec = match self.queue.lock().records.pop_front() {
                Some(rec) => rec,
                None => return,
            };
            self.write_one(&conf, &rec);
        }
    }

    /// Installs this logger as the process-wide `log` backend.
    pub fn install(self: &Arc<Self>) -> Result<()> {
        log::set_boxed_logger(Box::new(GlobalLogger(self.clone())))
            .map_err(|e| anyhow::anyhow!("logger already installed: {}", e))?;
        log::set_max_level(log::LevelFilter::Trace);

        let _ = INSTALLED.set(self.clone());
        Ok(())
    }
}

static INSTALLED: OnceLock<Arc<AsyncLogger>> = OnceLock::new();

/// The installed logger, if any. The bootstrap uses this for its final
/// flush before process exit.
pub fn installed() -> Option<&'static Arc<AsyncLogger>> {
    INSTALLED.get()
}

struct GlobalLogger(Arc<AsyncLogger>);

impl log::Log for GlobalLogger {
    fn enabled(&self, _metadata: &log::Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &log::Record<'_>) {
        let level = Level::from_log(record.level());
        self.0.enqueue(make_record(
            level,
            record.module_path().unwrap_or("?"),
            record.file().unwrap_or("?"),
            record.line().unwrap_or(0),
            record.args(),
        ));

        // Severe records must hit the sinks before the caller continues;
        // it may be about to terminate the process.
        if level >= Level::Error {
            self.0.synchronize();
        }
    }

    fn flush(&self) {
        self.0.synchronize();
    }
}

fn make_record(
    level: Level,
    func: &str,
    file: &str,
    line: u32,
    args: &std::fmt::Arguments<'_>,
) -> Record {
    Record {
        level,
        time: chrono::Local::now(),
        thrd_name: crate::utils::thread::current_thread_name(),
        thrd_lwpid: crate::utils::thread::current_thread_lwpid(),
        func: func.to_string(),
        file: file.to_string(),
        line,
        text: match args.as_str() {
            Some(s) => s.to_string(),
            None => args.to_string(),
        },
    }
}

/// Logs at the `fatal` level and flushes. The caller is expected to
/// terminate the process afterwards.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::logger::log_fatal(module_path!(), file!(), line!(), format_args!($($arg)*))
    };
}

#[doc(hidden)]
pub fn log_fatal(func: &str, file: &str, line: u32, args: std::fmt::Arguments<'_>) {
    match installed() {
        Some(logger) => {
            logger.enqueue(make_record(Level::Fatal, func, file, line, &args));
            logger.synchronize();
        }
        None => eprintln!("FATAL: {}", args),
    }
}

fn load_level_config(file: &ConfigFile, level: Level) -> Result<LevelConfig> {
    let mut lconf = LevelConfig::builtin(level);
    let name = level.name();

    // The built-in standard streams only serve until the first reload;
    // a loaded configuration names its sinks explicitly.
    lconf.stdio = None;

    let value = file.query(&["logger", name, "color"])?;
    if let Some(color) = value.as_str() {
        lconf.color = color.to_string();
    } else if !value.is_null() {
        log::warn!(
            "Ignoring `logger.{}.color`: expecting a `string`, got `{}`",
            name,
            value
        );
    }

    let value = file.query(&["logger", name, "stdio"])?;
    if let Some(stream) = value.as_str() {
        lconf.stdio = match stream {
            "" => None,
            "stdout" => Some(Stdio::Out),
            "stderr" => Some(Stdio::Err),
            other => {
                log::warn!(
                    "Ignoring `logger.{}.stdio`: invalid standard stream name `{}`",
                    name,
                    other
                );
                lconf.stdio
            }
        };
    } else if !value.is_null() {
        log::warn!(
            "Ignoring `logger.{}.stdio`: expecting a `string`, got `{}`",
            name,
            value
        );
    }

    let value = file.query(&["logger", name, "file"])?;
    if let Some(path) = value.as_str() {
        lconf.file = path.to_string();
    } else if !value.is_null() {
        log::warn!(
            "Ignoring `logger.{}.file`: expecting a `string`, got `{}`",
            name,
            value
        );
    }

    let value = file.query(&["logger", name, "trivial"])?;
    if let Some(trivial) = value.as_bool() {
        lconf.trivial = trivial;
    } else if !value.is_null() {
        log::warn!(
            "Ignoring `logger.{}.trivial`: expecting a `boolean`, got `{}`",
            name,
            value
        );
    }

    Ok(lconf)
}

// Sink I/O errors must not take the logger thread down; each failure
// writes one diagnostic to the default error stream.
fn write_record(lconf: &LevelConfig, rec: &Record) {
    let data = format::format_record(lconf, rec);

    match lconf.stdio {
        Some(Stdio::Out) => {
            let stdout = std::io::stdout();
            if let Err(err) = stdout.lock().write_all(data.as_bytes()) {
                eprintln!("could not write log record to stdout: {}", err);
            }
        }
        Some(Stdio::Err) => {
            let stderr = std::io::stderr();
            let _ = stderr.lock().write_all(data.as_bytes());
        }
        None => (),
    }

    if !lconf.file.is_empty() {
        let result = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&lconf.file)
            .and_then(|mut f| f.write_all(data.as_bytes()));

        if let Err(err) = result {
            eprintln!(
                "could not write log record to '{}': {}",
                lconf.file, err
            );
        }
    }
}
