//! Child process management: spawning and exit-status decoding (§4.2, §4.4).
//!
//! Exit-status decoding (`WEXITSTATUS` on normal exit, `128 + signo` on signal death) is kept from
//! `fdintercept::process`. Dropped from the teacher: the `ChildGuard`/SIGTERM-grace-period Drop
//! impl, since this agent's child lifecycle is driven entirely by the remote peer and the local
//! exit (§4.3), not by the worker's own shutdown; see DESIGN.md.

use anyhow::{bail, Context, Result};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};
use non_empty_string::NonEmptyString;
use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd};

/// Maximum accepted length of a `user:command` command line (§4.2, §6).
pub const MAX_QREXEC_CMD_LEN: usize = 131072;

/// Environment variable the worker exposes to the child so it can signal back for the
/// stdio-collapse feature (§6).
pub const QREXEC_AGENT_PID_VAR: &str = "QREXEC_AGENT_PID";

/// Validates a command line against the dispatcher's preconditions for `EXEC_CMDLINE` (§4.2): it
/// must be non-empty and no longer than [`MAX_QREXEC_CMD_LEN`]. The original C contract also
/// forcibly NUL-terminates the last byte of a fixed-size wire buffer; a `&str` is already bounded
/// and can't be overread, so that defensive stomp has no counterpart here (see DESIGN.md).
///
/// # Errors
///
/// Returns an error if `cmdline` is empty or exceeds the length cap.
pub fn validate_cmdline(cmdline: &str) -> Result<()> {
    NonEmptyString::new(cmdline.to_string())
        .map_err(|_| anyhow::anyhow!("command line must not be empty"))?;
    if cmdline.len() > MAX_QREXEC_CMD_LEN {
        bail!("command line of {} bytes exceeds MAX_QREXEC_CMD_LEN ({MAX_QREXEC_CMD_LEN})", cmdline.len());
    }
    Ok(())
}

/// Converts a `waitpid` status into the exit code reported to the remote peer (§4.3(a)).
pub fn decode_exit_status(status: &WaitStatus) -> Option<i32> {
    match *status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, signal, _) => Some(128 + signal as i32),
        _ => None,
    }
}

/// Non-blocking reap of `pid`. Returns the decoded exit code if the child has exited.
///
/// # Errors
///
/// Returns an error if `waitpid` itself fails (not if there's simply nothing to reap yet).
pub fn try_reap(pid: Pid) -> Result<Option<i32>> {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
            Ok(decode_exit_status(&status))
        }
        Ok(_) => Ok(None),
        Err(nix::errno::Errno::ECHILD) => Ok(None),
        Err(e) => Err(e).context("Error reaping child process"),
    }
}

/// A child process spawned for `EXEC_CMDLINE`, with the parent's ends of its stdio pipes.
pub struct SpawnedChild {
    pub pid: Pid,
    pub stdin: OwnedFd,
    pub stdout: OwnedFd,
    pub stderr: OwnedFd,
}

/// Spawns `user:command` with piped stdio, the "external spawner" contract §4.2 describes for
/// `EXEC_CMDLINE`. The real qrexec agent delegates identity switching (`setresuid`/`setresgid` to
/// the named user) to a privileged helper that is out of scope for this crate (§1); this
/// reference implementation runs the command as the current user via `/bin/sh -c`, which is
/// sufficient to exercise the multiplexer end to end and is the seam where a privileged spawner
/// would be substituted.
///
/// # Errors
///
/// Returns an error if `cmdline` has no `:` separator, or if the underlying pipes/fork/exec fail.
pub fn spawn_cmdline(cmdline: &str) -> Result<SpawnedChild> {
    let (_user, command) = split_user_command(cmdline)?;
    let command = command.to_string();

    let (child_stdin_r, parent_stdin_w) = unistd::pipe().context("Error creating stdin pipe")?;
    let (parent_stdout_r, child_stdout_w) = unistd::pipe().context("Error creating stdout pipe")?;
    let (parent_stderr_r, child_stderr_w) = unistd::pipe().context("Error creating stderr pipe")?;

    // The child needs the *agent's* own PID, not its own, so it can signal back for
    // stdio-collapse (§6); captured here in the parent, before fork.
    let agent_pid = std::process::id();

    // SAFETY: between fork and exec the child only calls async-signal-safe functions:
    // dup2, close, execv, and _exit.
    match unsafe { unistd::fork() }.context("Error forking child process")? {
        ForkResult::Child => {
            let _ = unistd::dup2(child_stdin_r.as_raw_fd(), 0);
            let _ = unistd::dup2(child_stdout_w.as_raw_fd(), 1);
            let _ = unistd::dup2(child_stderr_w.as_raw_fd(), 2);
            drop(parent_stdin_w);
            drop(parent_stdout_r);
            drop(parent_stderr_r);
            drop(child_stdin_r);
            drop(child_stdout_w);
            drop(child_stderr_w);

            // SAFETY: single-threaded child between fork and exec.
            unsafe {
                std::env::set_var(QREXEC_AGENT_PID_VAR, agent_pid.to_string());
            }

            let shell = CString::new("/bin/sh").unwrap();
            let arg0 = CString::new("sh").unwrap();
            let flag = CString::new("-c").unwrap();
            let Ok(cmd) = CString::new(command) else {
                std::process::exit(127);
            };
            let _ = unistd::execv(&shell, &[arg0, flag, cmd]);
            std::process::exit(127);
        }
        ForkResult::Parent { child } => {
            drop(child_stdin_r);
            drop(child_stdout_w);
            drop(child_stderr_w);
            Ok(SpawnedChild {
                pid: child,
                stdin: parent_stdin_w,
                stdout: parent_stdout_r,
                stderr: parent_stderr_r,
            })
        }
    }
}

/// Splits a `user:command` line at the first `:`, per §4.4.
///
/// # Errors
///
/// Returns an error if `cmdline` contains no `:`.
pub fn split_user_command(cmdline: &str) -> Result<(&str, &str)> {
    match cmdline.split_once(':') {
        Some((user, command)) => Ok((user, command)),
        None => bail!("command line has no ':' separator"),
    }
}

/// The just-exec path (§4.4): parse `user:command`, fork a detached child with stdio attached to
/// `/dev/null`, exec, and return in the parent immediately. Fire-and-forget: the caller reports
/// success regardless of whether the exec itself ultimately succeeds.
///
/// # Errors
///
/// Returns an error (maps to a return value of `-1` at the call site) if `cmdline` has no `:`.
pub fn just_exec(cmdline: &str) -> Result<()> {
    let (_user, command) = split_user_command(cmdline)?;
    let command = command.to_string();

    // SAFETY: between fork and exec the child only calls async-signal-safe functions.
    match unsafe { unistd::fork() }.context("Error forking for just-exec")? {
        ForkResult::Child => {
            redirect_stdio_to_dev_null();
            let shell = CString::new("/bin/sh").unwrap();
            let arg0 = CString::new("sh").unwrap();
            let flag = CString::new("-c").unwrap();
            if let Ok(cmd) = CString::new(command) {
                let _ = unistd::execv(&shell, &[arg0, flag, cmd]);
            }
            std::process::exit(127);
        }
        ForkResult::Parent { .. } => Ok(()),
    }
}

fn redirect_stdio_to_dev_null() {
    use nix::fcntl::{open, OFlag};
    use nix::sys::stat::Mode;
    if let Ok(dev_null) = open("/dev/null", OFlag::O_RDWR, Mode::empty()) {
        for target in [0, 1, 2] {
            let _ = nix::unistd::dup2(dev_null.as_raw_fd(), target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_user_command_ok() {
        let (user, cmd) = split_user_command("alice:echo hi").unwrap();
        assert_eq!(user, "alice");
        assert_eq!(cmd, "echo hi");
    }

    #[test]
    fn split_user_command_rejects_missing_colon() {
        assert!(split_user_command("noColonHere").is_err());
    }

    #[test]
    fn decode_exit_status_normal_exit() {
        let status = WaitStatus::Exited(Pid::from_raw(1), 7);
        assert_eq!(decode_exit_status(&status), Some(7));
    }

    #[test]
    fn decode_exit_status_signal_death() {
        let status =
            WaitStatus::Signaled(Pid::from_raw(1), nix::sys::signal::Signal::SIGKILL, false);
        assert_eq!(decode_exit_status(&status), Some(128 + 9));
    }

    #[test]
    fn spawn_cmdline_runs_command_as_current_user() {
        let child = spawn_cmdline("anyuser:echo hello").unwrap();
        drop(child.stdin);
        let mut out = String::new();
        use std::io::Read;
        std::fs::File::from(child.stdout)
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out.trim(), "hello");

        loop {
            if try_reap(child.pid).unwrap().is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
    }

    #[test]
    fn just_exec_rejects_missing_colon() {
        assert!(just_exec("noColonHere").is_err());
    }

    #[test]
    fn validate_cmdline_rejects_empty() {
        assert!(validate_cmdline("").is_err());
    }

    #[test]
    fn validate_cmdline_rejects_oversized() {
        let too_long = "a".repeat(MAX_QREXEC_CMD_LEN + 1);
        assert!(validate_cmdline(&too_long).is_err());
    }

    #[test]
    fn validate_cmdline_accepts_exactly_at_cap() {
        let exactly = "a".repeat(MAX_QREXEC_CMD_LEN);
        assert!(validate_cmdline(&exactly).is_ok());
    }

    #[test]
    fn just_exec_spawns_detached_child() {
        just_exec("anyuser:true").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        while waitpid(None, Some(WaitPidFlag::WNOHANG)).is_ok() {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
    }
}
