use anyhow::{Context, Result};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicI32, Ordering};

static EXIT_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn handle_exit_signal(signum: libc::c_int) {
    EXIT_SIGNAL.store(signum, Ordering::Release);
}

/// The signal that requested shutdown, or zero.
pub fn exit_signal() -> i32 {
    EXIT_SIGNAL.load(Ordering::Acquire)
}

#[cfg(test)]
pub(crate) fn simulate_exit_signal(signum: i32) {
    EXIT_SIGNAL.store(signum, Ordering::Release);
}

/// Installs process-wide handlers: SIGINT/SIGTERM/SIGALRM set the exit
/// flag, SIGPIPE is ignored, and SIGHUP is ignored when daemonised.
///
/// The handlers use SA_RESTART: nothing needs the interruption, as
/// every long wait in the process is bounded (the epoll wait by its
/// 5-second timeout, the condition variables by their deadlines).
pub fn install_signal_handlers(daemonized: bool) -> Result<()> {
    let exit_action = SigAction::new(
        SigHandler::Handler(handle_exit_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGALRM] {
        unsafe { sigaction(signal, &exit_action) }
            .with_context(|| format!("could not install handler for {}", signal))?;
    }

    let ignore_action = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe { sigaction(Signal::SIGPIPE, &ignore_action) }
        .context("could not ignore SIGPIPE")?;

    if daemonized {
        unsafe { sigaction(Signal::SIGHUP, &ignore_action) }
            .context("could not ignore SIGHUP")?;
    }

    Ok(())
}

/// Blocks the exit signals on the calling thread, so they are always
/// delivered to the main thread. Called by every worker thread before
/// entering its loop.
pub(crate) fn block_exit_signals() {
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    set.add(Signal::SIGHUP);
    set.add(Signal::SIGALRM);
    // Errors are ignored; an unblocked worker merely races the main
    // thread for the flag store, which is harmless.
    let _ = set.thread_block();
}
