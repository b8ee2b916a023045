//! Signal plumbing (§2 item 1, §5).
//!
//! Two sources of external asynchrony exist: child-death (`SIGCHLD`) and a child-initiated
//! request to collapse stdio onto one socket (`SIGUSR1`, sent to the PID the worker publishes as
//! `QREXEC_AGENT_PID`, §6). Handlers only ever need to notify the event loop; spec.md §9 flags the
//! "block the signal except inside the wait" mask dance as something a re-architecture should
//! replace with a signal pipe that becomes just another pollable event source, so that is what we
//! do here, the same way `fdintercept::main` turns its own termination signals into a pipe byte
//! instead of racing a flag against a blocking wait.

use anyhow::{Context, Result};
use nix::unistd::pipe;
use signal_hook::consts::{SIGCHLD, SIGUSR1};
use signal_hook::iterator::Signals;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

static CHILD_EXITED: AtomicBool = AtomicBool::new(false);
static COLLAPSE_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Handle to the installed signal plumbing. Keeping this alive keeps the background signal
/// thread and its self-pipe write end alive; the read end is what the multiplexer polls.
pub struct SignalPlumbing {
    notify_read: OwnedFd,
    _notify_write: OwnedFd,
}

impl SignalPlumbing {
    /// The fd the multiplexer should register for readability. Each signal delivery writes one
    /// byte here; the event loop drains it and re-checks the two atomic flags.
    pub fn fd(&self) -> RawFd {
        self.notify_read.as_raw_fd()
    }

    /// Drains any bytes currently queued on the notification pipe. Called after the multiplexer
    /// observes the fd is readable, so a later `poll` doesn't immediately fire again for bytes
    /// already acted on.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            match nix::unistd::read(&self.notify_read, &mut buf) {
                Ok(0) => break,
                Ok(n) if n < buf.len() => break,
                Ok(_) => continue,
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(_) => break,
            }
        }
    }
}

/// Installs handlers for `SIGCHLD` and `SIGUSR1` and starts the background thread that forwards
/// them to a self-pipe. No I/O or allocation happens in the signal handler itself; `signal_hook`'s
/// iterator does the forwarding from a dedicated thread, matching the no-I/O-in-handler constraint
/// of spec.md §5.
///
/// # Errors
///
/// Returns an error if the signal handlers or the notification pipe cannot be installed.
pub fn install() -> Result<SignalPlumbing> {
    let mut signals =
        Signals::new([SIGCHLD, SIGUSR1]).context("Failed to register signal handlers")?;
    let (notify_read, notify_write) = pipe().context("Error creating signal notification pipe")?;
    set_nonblocking(notify_read.as_raw_fd()).context("Error setting signal pipe non-blocking")?;

    let writer = notify_write.try_clone().context("Error cloning pipe fd")?;
    std::thread::Builder::new()
        .name("signal_forwarder".to_string())
        .spawn(move || forward_signals(&mut signals, &writer))
        .context("Failed to spawn signal forwarding thread")?;

    Ok(SignalPlumbing {
        notify_read,
        _notify_write: notify_write,
    })
}

fn forward_signals(signals: &mut Signals, notify_write: &OwnedFd) {
    for signum in signals.forever() {
        match signum {
            SIGCHLD => CHILD_EXITED.store(true, Ordering::Release),
            SIGUSR1 => COLLAPSE_REQUESTED.store(true, Ordering::Release),
            _ => continue,
        }
        // Best effort: if the reader is gone the process is exiting anyway.
        let _ = nix::unistd::write(notify_write, &[1]);
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    fcntl(
        fd,
        FcntlArg::F_SETFL(OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK),
    )?;
    Ok(())
}

/// Takes and clears the child-exited flag. Idempotent: returns `false` until another `SIGCHLD`
/// arrives.
pub fn take_child_exited() -> bool {
    CHILD_EXITED.swap(false, Ordering::AcqRel)
}

/// Takes and clears the collapse-requested flag.
pub fn take_collapse_requested() -> bool {
    COLLAPSE_REQUESTED.swap(false, Ordering::AcqRel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;
    use std::time::Duration;

    #[test]
    fn sigusr1_sets_collapse_flag_and_notifies() {
        let plumbing = install().unwrap();
        // Clear any state left over from other tests sharing this process.
        take_collapse_requested();

        signal::kill(Pid::this(), Signal::SIGUSR1).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !COLLAPSE_REQUESTED.load(Ordering::Acquire) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }

        assert!(take_collapse_requested());
        plumbing.drain();
    }
}
