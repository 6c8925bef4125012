use anyhow::{anyhow, Context, Result};
use clap::Parser;
use poseidon::runtime::{exit_signal, install_signal_handlers};
use poseidon::Runtime;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
    name = "poseidon",
    version,
    about = "Server runtime hosting long-lived network services"
)]
struct Args {
    /// Daemonize after initialisation
    #[arg(short = 'd')]
    daemonize: bool,

    /// Copy log records to the standard streams even when the
    /// configuration names no stream sinks
    #[arg(short = 'v')]
    verbose: bool,

    /// Change to this directory before further initialisation
    #[arg(value_name = "DIR")]
    dir: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();

    if let Some(dir) = &args.dir {
        if let Err(err) = std::env::set_current_dir(dir) {
            eprintln!("poseidon: could not change directory to '{}': {}", dir.display(), err);
            std::process::exit(1);
        }
    }

    if args.daemonize {
        if let Err(err) = daemonize() {
            eprintln!("poseidon: could not daemonize: {:#}", err);
            std::process::exit(1);
        }
    }

    match run(&args) {
        Ok(()) => {
            let signum = exit_signal();
            if signum != 0 {
                std::process::exit(128 + signum);
            }
        }
        Err(err) => {
            poseidon::fatal!("{:#}", err);
            std::process::exit(1);
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let runtime = Arc::new(Runtime::new()?);
    runtime.logger().install()?;
    runtime.logger().set_verbose(args.verbose);

    runtime
        .reload()
        .context("could not load initial configuration")?;

    let config = runtime.config().copy();

    // Refuse to run as root unless the configuration opts in.
    let permit_root = config
        .query(&["general", "permit_root_startup"])?
        .as_bool()
        .unwrap_or(false);
    if !permit_root && nix::unistd::geteuid().is_root() {
        return Err(anyhow!(
            "refusing to start as root; set `general.permit_root_startup` to override"
        ));
    }

    let _pid_file = match config.query(&["general", "pid_file_path"])?.as_str() {
        Some(path) if !path.is_empty() => Some(PidFile::create(path)?),
        _ => None,
    };

    // Dynamic add-on loading is not supported in this build; named
    // add-ons are reported and skipped.
    if let Some(addons) = config.query(&["addons"])?.as_array() {
        for addon in addons {
            log::warn!("Ignoring add-on `{}`: dynamic loading not supported", addon);
        }
    }

    install_signal_handlers(args.daemonize)?;
    runtime.start_threads();

    log::info!(
        "Poseidon {} started (pid {})",
        env!("CARGO_PKG_VERSION"),
        std::process::id()
    );

    // The main thread is the fiber thread; this returns once an exit
    // signal arrived and the scheduler has drained.
    runtime.fiber_loop();

    let signum = exit_signal();
    log::info!("Shutting down on signal {}", signum);
    runtime.logger().synchronize();
    Ok(())
}

/// Writes the daemon's pid; removed again on clean shutdown.
struct PidFile {
    path: PathBuf,
}

impl PidFile {
    fn create(path: &str) -> Result<Self> {
        std::fs::write(path, format!("{}\n", std::process::id()))
            .with_context(|| format!("could not write pid file '{}'", path))?;
        Ok(Self {
            path: PathBuf::from(path),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Classic double fork: the intermediate parent exits, the grandchild
/// continues with its own session and no controlling terminal.
fn daemonize() -> Result<()> {
    use nix::unistd::{fork, setsid, ForkResult};

    match unsafe { fork() }.context("first fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => (),
    }

    setsid().context("setsid failed")?;

    match unsafe { fork() }.context("second fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => (),
    }

    Ok(())
}
