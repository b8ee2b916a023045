//! Request dispatcher (§4.2): turns one inbound request into a vchan connection, a handshake, and
//! a [`Session`] that the multiplexer runs to completion.

use crate::frame::{self, FrameType, Header};
use crate::handshake;
use crate::multiplexer;
use crate::process::{self, SpawnedChild};
use crate::session::{CollapseState, DescriptorKind, ExitSlot, Session, StdioSlot, Tristate};
use crate::signals::SignalPlumbing;
use crate::vchan::{RealVchan, Transport};
use anyhow::{bail, Context, Result};
use std::os::fd::{IntoRawFd, RawFd};

/// Default vchan ring size in each direction, selected when the caller asks for 0 (§4.2).
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// What to do once the vchan is open and the handshake has completed (§4.2).
#[derive(Debug, Clone)]
pub enum DispatchKind {
    /// Detached spawn with a synthetic success report; no I/O bridge.
    JustExec { cmdline: String },
    /// Spawn the command and bridge its stdio over the vchan.
    ExecCmdline { cmdline: String },
    /// Bridge caller-supplied descriptors over the vchan; no spawn.
    ServiceConnect {
        stdin_fd: RawFd,
        stdout_fd: RawFd,
        stderr_fd: RawFd,
    },
}

/// One inbound request, already parsed from the control channel (out of scope here; see §1).
pub struct Request {
    pub kind: DispatchKind,
    pub domain: u16,
    pub port: i32,
    pub buffer_size: usize,
    pub protocol_version: u32,
}

fn resolve_buffer_size(requested: usize) -> Result<usize> {
    if requested == 0 {
        return Ok(DEFAULT_BUFFER_SIZE);
    }
    if !requested.is_power_of_two() {
        bail!("vchan buffer size {requested} is not a power of two");
    }
    Ok(requested)
}

/// An inherited descriptor is recognized by numeric value: fd 0 or fd 1, coming from the worker's
/// own parent rather than opened by this session (§3, §5).
fn is_inherited(fd: RawFd) -> bool {
    fd == 0 || fd == 1
}

fn send_exit_code(vchan: &mut impl Transport, code: i32) -> Result<()> {
    let header = Header::encode(FrameType::DataExitCode, 4);
    vchan
        .send(&header)
        .context("Error sending exit-code frame header")?;
    vchan
        .send(&frame::encode_exit_code(code))
        .context("Error sending exit-code frame payload")?;
    Ok(())
}

fn blank_session<T: Transport>(vchan: T, protocol_version: u32) -> Session<T> {
    Session {
        vchan,
        protocol_version,
        child_pid: None,
        stdin: StdioSlot::closed(),
        stdout: StdioSlot::closed(),
        stderr: StdioSlot::closed(),
        stdout_tag: FrameType::DataStdout,
        pending_stdin: Vec::new(),
        stdin_eof_pending: false,
        local_exit: ExitSlot::Unknown,
        remote_exit: ExitSlot::Unknown,
        sanitize_stdout: Tristate::Unset,
        sanitize_stderr: Tristate::Unset,
        collapse: CollapseState::Idle,
        exit_frame_sent: false,
    }
}

/// Runs one request to completion and returns the worker's own exit code (§6 "Exit semantics").
///
/// # Errors
///
/// Returns an error for any precondition violation or fatal transport/spawn failure (§7). Callers
/// should treat any `Err` as "terminate the worker with a diagnostic"; the multiplexer's own
/// teardown already runs before an error can propagate out of that stage.
pub fn dispatch(req: Request, plumbing: &SignalPlumbing) -> Result<i32> {
    match req.kind {
        DispatchKind::ServiceConnect {
            stdin_fd,
            stdout_fd,
            stderr_fd,
        } => dispatch_service_connect(req.domain, req.port, req.buffer_size, req.protocol_version, stdin_fd, stdout_fd, stderr_fd, plumbing),
        DispatchKind::JustExec { cmdline } => {
            dispatch_just_exec(req.domain, req.port, req.protocol_version, &cmdline)
        }
        DispatchKind::ExecCmdline { cmdline } => {
            process::validate_cmdline(&cmdline)?;
            dispatch_exec_cmdline(req.domain, req.port, req.protocol_version, &cmdline, plumbing)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn dispatch_service_connect(
    domain: u16,
    port: i32,
    buffer_size: usize,
    protocol_version: u32,
    stdin_fd: RawFd,
    stdout_fd: RawFd,
    stderr_fd: RawFd,
    plumbing: &SignalPlumbing,
) -> Result<i32> {
    let buffer_size = resolve_buffer_size(buffer_size)?;
    let mut vchan = RealVchan::server(domain, port, buffer_size, buffer_size)
        .context("Error creating vchan server")?;
    let negotiated = handshake::perform(&mut vchan, protocol_version)
        .map_err(|e| anyhow::anyhow!(e.to_string()))
        .context("Handshake failed")?;

    let mut session = blank_session(vchan, negotiated);
    session.stdin = StdioSlot::open(stdin_fd, DescriptorKind::detect(stdin_fd), is_inherited(stdin_fd));
    session.stdout = StdioSlot::open(stdout_fd, DescriptorKind::detect(stdout_fd), is_inherited(stdout_fd));
    session.stderr = StdioSlot::open(stderr_fd, DescriptorKind::detect(stderr_fd), is_inherited(stderr_fd));
    // Service-connect mode is oriented the other way round: what we read here is "the remote's
    // stdin", so our outbound frame tag is DATA_STDIN instead of DATA_STDOUT (§3, §4.2, §9).
    session.stdout_tag = FrameType::DataStdin;

    let code = multiplexer::run(&mut session, plumbing)?;
    Ok(code)
}

fn dispatch_just_exec(domain: u16, port: i32, protocol_version: u32, cmdline: &str) -> Result<i32> {
    let mut vchan =
        RealVchan::client(domain, port).context("Error connecting to vchan server")?;
    handshake::perform(&mut vchan, protocol_version)
        .map_err(|e| anyhow::anyhow!(e.to_string()))
        .context("Handshake failed")?;

    match process::just_exec(cmdline) {
        Ok(()) => {
            send_exit_code(&mut vchan, 0)?;
            Ok(0)
        }
        Err(_) => {
            // §4.4 / §8 scenario 6: a missing ':' is a protocol error, reported as a synthetic -1.
            send_exit_code(&mut vchan, -1)?;
            Ok(-1)
        }
    }
}

fn dispatch_exec_cmdline(
    domain: u16,
    port: i32,
    protocol_version: u32,
    cmdline: &str,
    plumbing: &SignalPlumbing,
) -> Result<i32> {
    let mut vchan =
        RealVchan::client(domain, port).context("Error connecting to vchan server")?;
    let negotiated = handshake::perform(&mut vchan, protocol_version)
        .map_err(|e| anyhow::anyhow!(e.to_string()))
        .context("Handshake failed")?;

    let SpawnedChild {
        pid,
        stdin,
        stdout,
        stderr,
    } = process::spawn_cmdline(cmdline).context("Error spawning command")?;

    let mut session = blank_session(vchan, negotiated);
    session.child_pid = Some(pid);
    let stdin_fd = stdin.into_raw_fd();
    let stdout_fd = stdout.into_raw_fd();
    let stderr_fd = stderr.into_raw_fd();
    session.stdin = StdioSlot::open(stdin_fd, DescriptorKind::detect(stdin_fd), false);
    session.stdout = StdioSlot::open(stdout_fd, DescriptorKind::detect(stdout_fd), false);
    session.stderr = StdioSlot::open(stderr_fd, DescriptorKind::detect(stderr_fd), false);

    multiplexer::run(&mut session, plumbing)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_buffer_size_zero_is_default() {
        assert_eq!(resolve_buffer_size(0).unwrap(), DEFAULT_BUFFER_SIZE);
    }

    #[test]
    fn resolve_buffer_size_rejects_non_power_of_two() {
        assert!(resolve_buffer_size(100).is_err());
    }

    #[test]
    fn resolve_buffer_size_accepts_power_of_two() {
        assert_eq!(resolve_buffer_size(4096).unwrap(), 4096);
    }

    #[test]
    fn is_inherited_recognizes_only_fd_0_and_1() {
        assert!(is_inherited(0));
        assert!(is_inherited(1));
        assert!(!is_inherited(2));
        assert!(!is_inherited(17));
    }
}
