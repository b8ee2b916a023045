//! The connection session data model (§3).
//!
//! Ambient globals the original design carries (outbound tag, replace-chars flags, child PID,
//! the two signal flags) are folded here into one explicit value threaded through every
//! operation instead, per the re-architecture note in spec.md §9.

use crate::frame::FrameType;
use crate::vchan::Transport;
use nix::sys::stat::{fstat, SFlag};
use nix::unistd::Pid;
use std::os::fd::{BorrowedFd, RawFd};

/// Whether a session's non-printable-byte sanitization flags default on, off, or are left to the
/// caller. Tri-state per §3 ("default unset").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tristate {
    Unset,
    Enabled,
    Disabled,
}

impl Tristate {
    pub fn is_enabled(self) -> bool {
        matches!(self, Self::Enabled)
    }
}

/// The kind of descriptor backing a stdio slot, recorded once at acquisition time rather than
/// probed with `shutdown()`/`ENOTSOCK` at close time (spec.md §9 re-architecture note).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    Pipe,
    Socket,
}

impl DescriptorKind {
    /// Classifies `fd` by `fstat`, once, at acquisition time.
    pub fn detect(fd: RawFd) -> Self {
        // SAFETY: `fd` is borrowed only for the duration of this call; the caller retains
        // ownership.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        match fstat(&borrowed) {
            Ok(stat) if stat.st_mode & SFlag::S_IFMT.bits() == SFlag::S_IFSOCK.bits() => {
                Self::Socket
            }
            _ => Self::Pipe,
        }
    }
}

/// One of the child's three stdio descriptors. `None` means "logically closed for this session"
/// (the `-1` sentinel of spec.md §3, made idiomatic).
#[derive(Debug)]
pub struct StdioSlot {
    fd: Option<RawFd>,
    kind: DescriptorKind,
    /// True if this fd numerically coincides with one the parent process owns (fd 0 or fd 1
    /// inherited on a just-exec-like path) and must never be fully closed.
    inherited: bool,
}

impl StdioSlot {
    pub fn open(fd: RawFd, kind: DescriptorKind, inherited: bool) -> Self {
        Self {
            fd: Some(fd),
            kind,
            inherited,
        }
    }

    pub fn closed() -> Self {
        Self {
            fd: None,
            kind: DescriptorKind::Pipe,
            inherited: false,
        }
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.fd
    }

    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    pub fn kind(&self) -> DescriptorKind {
        self.kind
    }

    pub fn is_inherited(&self) -> bool {
        self.inherited
    }

    /// Marks the slot closed, without touching the underlying fd. Callers are responsible for
    /// actually closing or half-closing it first.
    pub fn mark_closed(&mut self) {
        self.fd = None;
    }
}

/// Exit status of one side of the session: unknown until observed (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitSlot {
    Unknown,
    Known(i32),
}

impl ExitSlot {
    pub fn is_known(self) -> bool {
        matches!(self, Self::Known(_))
    }

    pub fn code(self) -> Option<i32> {
        match self {
            Self::Known(c) => Some(c),
            Self::Unknown => None,
        }
    }
}

/// Lifecycle of the collapse-stdio request (§3): idle until a signal arrives, pending until the
/// multiplexer acts on it, applied afterwards so later framing uses the single-socket tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollapseState {
    Idle,
    Pending,
    Applied,
}

/// An ephemeral value bound to one worker process, from dispatch to teardown (§3).
pub struct Session<T: Transport> {
    pub vchan: T,
    pub protocol_version: u32,
    pub child_pid: Option<Pid>,
    pub stdin: StdioSlot,
    pub stdout: StdioSlot,
    pub stderr: StdioSlot,
    /// `DATA_STDOUT` for exec mode, `DATA_STDIN` for service-connect mode.
    pub stdout_tag: FrameType,
    /// Vchan-read bytes not yet accepted by the child's stdin.
    pub pending_stdin: Vec<u8>,
    /// The remote sent a zero-length `DATA_STDIN` frame, but `pending_stdin` may still hold
    /// bytes that arrived in the same batch ahead of it; stdin is only closed once this is set
    /// AND `pending_stdin` has fully drained, preserving arrival order (§5).
    pub stdin_eof_pending: bool,
    pub local_exit: ExitSlot,
    pub remote_exit: ExitSlot,
    pub sanitize_stdout: Tristate,
    pub sanitize_stderr: Tristate,
    pub collapse: CollapseState,
    pub exit_frame_sent: bool,
}

impl<T: Transport> Session<T> {
    /// Whether the local side is fully done: no child, or the child's exit status is known.
    pub fn local_done(&self) -> bool {
        self.child_pid.is_none() || self.local_exit.is_known()
    }

    /// Whether the remote side is fully done. Mirrors `local_done`: when a local child exists
    /// (exec modes), the remote isn't expected to report a separate exit status of its own, so
    /// this is vacuously true. In service-connect mode there is no local child, so the remote's
    /// `DATA_EXIT_CODE` is the only thing that can end the session.
    pub fn remote_done(&self) -> bool {
        self.child_pid.is_some() || self.remote_exit.is_known()
    }

    pub fn all_stdio_closed(&self) -> bool {
        !self.stdin.is_open() && !self.stdout.is_open() && !self.stderr.is_open()
    }

    /// Session-end condition per §3: local done AND remote done AND all stdio closed.
    pub fn is_finished(&self) -> bool {
        self.local_done() && self.remote_done() && self.all_stdio_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vchan::LoopbackVchan;

    fn session_with(vchan: LoopbackVchan) -> Session<LoopbackVchan> {
        Session {
            vchan,
            protocol_version: 3,
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

    #[test]
    fn finished_requires_all_three_conditions_service_connect() {
        // No local child: remote-done genuinely needs the remote's own exit code.
        let (a, _b) = LoopbackVchan::pair().unwrap();
        let mut s = session_with(a);
        assert!(s.is_finished(), "no child, no stdio, no remote yet");

        s.stdin = StdioSlot::open(3, DescriptorKind::Pipe, false);
        assert!(!s.is_finished(), "stdio still open");
        s.stdin = StdioSlot::closed();

        assert!(!s.remote_done());
        s.remote_exit = ExitSlot::Known(0);
        assert!(s.is_finished());
    }

    #[test]
    fn finished_remote_done_is_vacuous_with_a_local_child() {
        // A local child exists: remote isn't expected to report its own exit status, so
        // remote_done is true as soon as a child exists, regardless of remote_exit.
        let (a, _b) = LoopbackVchan::pair().unwrap();
        let mut s = session_with(a);
        s.child_pid = Some(Pid::from_raw(42));
        assert!(s.remote_done());
        assert!(!s.is_finished(), "local exit still unknown");

        s.local_exit = ExitSlot::Known(0);
        assert!(s.is_finished());
    }

    #[test]
    fn stdio_slot_closed_has_no_fd() {
        let slot = StdioSlot::closed();
        assert!(!slot.is_open());
        assert_eq!(slot.fd(), None);
    }

    #[test]
    fn stdio_slot_mark_closed_clears_fd_only() {
        let mut slot = StdioSlot::open(5, DescriptorKind::Pipe, false);
        assert!(slot.is_open());
        slot.mark_closed();
        assert!(!slot.is_open());
    }
}
