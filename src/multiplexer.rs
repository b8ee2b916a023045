//! The I/O multiplexer (§4.3): the core event loop that bridges a vchan to a child's stdio.
//!
//! Built the way `fdintercept::fd::process_fd` builds its single-fd `mio::Poll` loop (non-blocking
//! fds registered with `mio::unix::SourceFd`, a pipe watched alongside the data fd so a signal and
//! a readable event are never missed against each other), generalized from one fd pair to the
//! four-source wait this design needs: the vchan event descriptor, up to three child fds, and the
//! signal-notification pipe (§9's suggested replacement for the mask-dance wait).

use crate::error::{DecodeOutcome, EncodeOutcome, TransportError};
use crate::frame::{self, FrameType, Header, HEADER_LEN};
use crate::process;
use crate::session::{CollapseState, DescriptorKind, ExitSlot, Session, StdioSlot, Tristate};
use crate::signals::{self, SignalPlumbing};
use crate::vchan::Transport;
use anyhow::{Context, Result};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::socket::{shutdown, Shutdown};
use std::collections::HashMap;
use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::time::Duration;

const TOKEN_SIGNAL: Token = Token(0);
const TOKEN_VCHAN: Token = Token(1);
const TOKEN_STDOUT: Token = Token(2);
const TOKEN_STDERR: Token = Token(3);
const TOKEN_STDIN: Token = Token(4);

const CHUNK_SIZE: usize = 8192;
const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    fcntl(
        fd,
        FcntlArg::F_SETFL(OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK),
    )?;
    Ok(())
}

fn set_blocking(fd: RawFd) {
    if let Ok(flags) = fcntl(fd, FcntlArg::F_GETFL) {
        let _ = fcntl(
            fd,
            FcntlArg::F_SETFL(OFlag::from_bits_truncate(flags) & !OFlag::O_NONBLOCK),
        );
    }
}

/// Closes (or half-closes) a stdio slot per §4.3's pipe-vs-socket rule, and §5's rule that an
/// inherited descriptor is never touched. `half_close` is the direction to shut down when the
/// slot holds a socket; `None` forces a full close even for a socket (used for stderr, which §4.3
/// teardown closes "unconditionally").
fn terminate_slot(slot: &mut StdioSlot, half_close: Option<Shutdown>) {
    let Some(fd) = slot.fd() else {
        return;
    };
    if slot.is_inherited() {
        // Shared with the parent process; logically closed for this session, but the real fd is
        // left alone (§5).
        slot.mark_closed();
        return;
    }
    match (slot.kind(), half_close) {
        (DescriptorKind::Socket, Some(direction)) => {
            // SAFETY: `fd` is owned by this slot until `mark_closed` below.
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            let _ = shutdown(&borrowed, direction);
        }
        _ => {
            let _ = nix::unistd::close(fd);
        }
    }
    slot.mark_closed();
}

/// Sanitizes non-printable bytes per the session's stdout/stderr flags (§3), replacing any byte
/// outside printable ASCII/common whitespace with `?`.
fn sanitize(bytes: &mut [u8]) {
    for b in bytes {
        if !(b.is_ascii_graphic() || *b == b' ' || *b == b'\n' || *b == b'\r' || *b == b'\t') {
            *b = b'?';
        }
    }
}

struct FrameAssembler {
    header_buf: Vec<u8>,
    payload: Option<(FrameType, Vec<u8>, u32)>,
}

impl FrameAssembler {
    fn new() -> Self {
        Self {
            header_buf: Vec::with_capacity(HEADER_LEN),
            payload: None,
        }
    }

    /// Feeds newly-received bytes into the assembler, invoking `on_frame` for every frame that
    /// completes. Returns the number of bytes actually consumed from `chunk` (always all of it;
    /// kept as a result type to leave room for partial-consumption semantics).
    fn feed(
        &mut self,
        chunk: &[u8],
        mut on_frame: impl FnMut(FrameType, &[u8]) -> Result<(), TransportError>,
    ) -> Result<(), TransportError> {
        let mut rest = chunk;
        while !rest.is_empty() {
            if let Some((kind, buf, want)) = &mut self.payload {
                let need = *want as usize - buf.len();
                let take = need.min(rest.len());
                buf.extend_from_slice(&rest[..take]);
                rest = &rest[take..];
                if buf.len() == *want as usize {
                    let (kind, buf, _) = self.payload.take().unwrap();
                    on_frame(kind, &buf)?;
                }
            } else {
                let need = HEADER_LEN - self.header_buf.len();
                let take = need.min(rest.len());
                self.header_buf.extend_from_slice(&rest[..take]);
                rest = &rest[take..];
                if self.header_buf.len() == HEADER_LEN {
                    let arr: [u8; HEADER_LEN] = self.header_buf.as_slice().try_into().unwrap();
                    let header = Header::decode(&arr)?;
                    self.header_buf.clear();
                    if header.len == 0 {
                        on_frame(header.kind, &[])?;
                    } else {
                        self.payload = Some((header.kind, Vec::with_capacity(header.len as usize), header.len));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Reads everything currently available on the vchan and decodes it into frames (§4.3(f)).
/// Returns the terminal outcome, if any, encountered while draining.
fn decode_vchan_input<T: Transport>(
    session: &mut Session<T>,
    assembler: &mut FrameAssembler,
) -> Result<DecodeOutcome, TransportError> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut outcome = DecodeOutcome::Ok;
    loop {
        let ready = session.vchan.data_ready();
        if ready == 0 {
            break;
        }
        let want = ready.min(buf.len());
        let n = session.vchan.recv(&mut buf[..want])?;
        let pending_stdin = &mut session.pending_stdin;
        let mut terminal = None;
        assembler.feed(&buf[..n], |kind, payload| {
            match kind {
                FrameType::DataStdin => {
                    if payload.is_empty() {
                        terminal = Some(DecodeOutcome::RemoteStdinEof);
                    } else {
                        pending_stdin.extend_from_slice(payload);
                    }
                }
                FrameType::DataExitCode => {
                    let code = frame::decode_exit_code(payload)?;
                    terminal = Some(DecodeOutcome::RemoteExited(code));
                }
                other => {
                    return Err(TransportError::new(format!(
                        "unexpected frame type {other:?} from remote"
                    )));
                }
            }
            Ok(())
        })?;
        if let Some(t) = terminal {
            outcome = t;
            break;
        }
    }
    Ok(outcome)
}

/// Reads one chunk from a child stream and queues it as a frame (§4.3(g)/(h)).
fn encode_stream_chunk<T: Transport>(
    session: &mut Session<T>,
    fd: RawFd,
    tag: FrameType,
    sanitize_flag: Tristate,
) -> Result<EncodeOutcome, TransportError> {
    let header_room = HEADER_LEN;
    let space = session.vchan.buffer_space();
    if space <= header_room {
        return Ok(EncodeOutcome::Queued);
    }
    let max_payload = (space - header_room).min(CHUNK_SIZE);
    let mut buf = vec![0u8; max_payload];
    // SAFETY: `fd` is owned by the session for the duration of this call.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    match nix::unistd::read(&borrowed, &mut buf) {
        Ok(0) => Ok(EncodeOutcome::Eof),
        Ok(n) => {
            if sanitize_flag.is_enabled() {
                sanitize(&mut buf[..n]);
            }
            let header = Header::encode(tag, n as u32);
            session.vchan.send(&header)?;
            session.vchan.send(&buf[..n])?;
            Ok(EncodeOutcome::Queued)
        }
        Err(nix::errno::Errno::EAGAIN) => Ok(EncodeOutcome::Queued),
        Err(e) => Err(TransportError::new(format!("read error: {e}"))),
    }
}

/// Attempts to drain `session.pending_stdin` into the child's stdin fd.
fn flush_pending_stdin<T: Transport>(session: &mut Session<T>) -> Result<(), TransportError> {
    let Some(fd) = session.stdin.fd() else {
        session.pending_stdin.clear();
        return Ok(());
    };
    if session.pending_stdin.is_empty() {
        return Ok(());
    }
    // SAFETY: `fd` is owned by the session for the duration of this call.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    match nix::unistd::write(&borrowed, &session.pending_stdin) {
        Ok(n) => {
            session.pending_stdin.drain(..n);
            Ok(())
        }
        Err(nix::errno::Errno::EAGAIN) => Ok(()),
        Err(nix::errno::Errno::EPIPE) => {
            terminate_slot(&mut session.stdin, Some(Shutdown::Write));
            session.pending_stdin.clear();
            Ok(())
        }
        Err(e) => Err(TransportError::new(format!("stdin write error: {e}"))),
    }
}

/// Reaps the local child if it has exited, closing stdin per §4.3(a).
fn reap<T: Transport>(session: &mut Session<T>) -> Result<()> {
    if !signals::take_child_exited() {
        return Ok(());
    }
    let Some(pid) = session.child_pid else {
        return Ok(());
    };
    if let Some(code) = process::try_reap(pid)? {
        session.local_exit = ExitSlot::Known(code);
        terminate_slot(&mut session.stdin, Some(Shutdown::Write));
    }
    Ok(())
}

/// Handles a pending stdio-collapse request per §4.3(c). Redirects stdout onto stdin's
/// descriptor if stdout is still open; otherwise dups stdin into a fresh descriptor for stdout.
fn apply_collapse_if_pending<T: Transport>(session: &mut Session<T>) -> Result<()> {
    if signals::take_collapse_requested() && session.collapse == CollapseState::Idle {
        session.collapse = CollapseState::Pending;
    }
    if session.collapse != CollapseState::Pending {
        return Ok(());
    }
    let Some(stdin_fd) = session.stdin.fd() else {
        // Nothing to unify onto; treat as applied so we stop re-checking every iteration.
        session.collapse = CollapseState::Applied;
        return Ok(());
    };
    if let Some(stdout_fd) = session.stdout.fd() {
        loop {
            match nix::unistd::dup2(stdin_fd, stdout_fd) {
                Ok(_) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    return Err(anyhow::anyhow!("Error redirecting stdout onto stdin fd: {e}"))
                }
            }
        }
    } else {
        let new_fd = nix::fcntl::fcntl(
            stdin_fd,
            nix::fcntl::FcntlArg::F_DUPFD_CLOEXEC(3),
        )
        .context("Error duplicating stdin fd for collapsed stdout")?;
        session.stdout = StdioSlot::open(new_fd, session.stdin.kind(), false);
    }
    session.collapse = CollapseState::Applied;
    Ok(())
}

struct Registrations {
    current: HashMap<Token, (RawFd, Interest)>,
}

impl Registrations {
    fn new() -> Self {
        Self {
            current: HashMap::new(),
        }
    }

    fn sync(&mut self, poll: &Poll, desired: &[(Token, RawFd, Interest)]) -> io::Result<()> {
        let desired_map: HashMap<Token, (RawFd, Interest)> =
            desired.iter().copied().map(|(t, fd, i)| (t, (fd, i))).collect();

        let to_remove: Vec<Token> = self
            .current
            .keys()
            .copied()
            .filter(|t| !desired_map.contains_key(t))
            .collect();
        for token in to_remove {
            if let Some((fd, _)) = self.current.remove(&token) {
                let _ = poll.registry().deregister(&mut SourceFd(&fd));
            }
        }

        for (token, fd, interest) in desired_map {
            match self.current.get(&token) {
                Some((old_fd, old_interest)) if *old_fd == fd && *old_interest == interest => {}
                Some((old_fd, _)) if *old_fd == fd => {
                    poll.registry()
                        .reregister(&mut SourceFd(&fd), token, interest)?;
                    self.current.insert(token, (fd, interest));
                }
                Some((old_fd, _)) => {
                    let _ = poll.registry().deregister(&mut SourceFd(old_fd));
                    poll.registry().register(&mut SourceFd(&fd), token, interest)?;
                    self.current.insert(token, (fd, interest));
                }
                None => {
                    poll.registry().register(&mut SourceFd(&fd), token, interest)?;
                    self.current.insert(token, (fd, interest));
                }
            }
        }
        Ok(())
    }
}

/// Runs the multiplexer event loop to completion and returns the exit code to report (§4.3).
///
/// # Errors
///
/// Returns an error on any fatal transport failure or unrecoverable OS error. Per §7, the caller
/// must still ensure descriptors get cleaned up; this function's own teardown runs on every exit
/// path including early returns via `?` further down the dispatcher, so callers should treat any
/// `Err` here as "the session is over, nothing more to send".
pub fn run<T: Transport>(session: &mut Session<T>, plumbing: &SignalPlumbing) -> Result<i32> {
    // Pre-loop setup (§4.3 "Pre-loop setup").
    for fd in [
        session.stdin.fd(),
        session.stdout.fd(),
        session.stderr.fd(),
    ]
    .into_iter()
    .flatten()
    {
        set_nonblocking(fd).context("Error marking child descriptor non-blocking")?;
    }
    if let (Some(in_fd), Some(out_fd)) = (session.stdin.fd(), session.stdout.fd()) {
        if in_fd == out_fd {
            let dup_fd = fcntl(in_fd, FcntlArg::F_DUPFD_CLOEXEC(3))
                .context("Error duplicating shared stdin/stdout descriptor")?;
            set_nonblocking(dup_fd).context("Error marking duplicated descriptor non-blocking")?;
            session.stdin = StdioSlot::open(dup_fd, session.stdin.kind(), false);
        }
    }

    let mut poll = Poll::new().context("Error creating poll of events")?;
    let mut registrations = Registrations::new();
    let mut events = Events::with_capacity(8);
    let mut assembler = FrameAssembler::new();

    let result = (|| -> Result<i32> {
        loop {
            reap(session)?;

            if session.is_finished() {
                break;
            }
            if !session.vchan.is_open() && session.vchan.data_ready() == 0 && session.pending_stdin.is_empty() {
                break;
            }

            apply_collapse_if_pending(session)?;

            let mut desired = vec![(TOKEN_SIGNAL, plumbing.fd(), Interest::READABLE)];
            if session.vchan.is_open() || session.vchan.data_ready() > 0 {
                desired.push((TOKEN_VCHAN, session.vchan.fd(), Interest::READABLE));
            }
            let room = session.vchan.buffer_space() > HEADER_LEN;
            if room {
                if let Some(fd) = session.stdout.fd() {
                    desired.push((TOKEN_STDOUT, fd, Interest::READABLE));
                }
                if let Some(fd) = session.stderr.fd() {
                    desired.push((TOKEN_STDERR, fd, Interest::READABLE));
                }
            }
            if !session.pending_stdin.is_empty() {
                if let Some(fd) = session.stdin.fd() {
                    desired.push((TOKEN_STDIN, fd, Interest::WRITABLE));
                }
            }
            registrations
                .sync(&poll, &desired)
                .context("Error updating poll registrations")?;

            let zero_timeout = session.vchan.data_ready() > 0 && session.pending_stdin.is_empty();
            let timeout = if zero_timeout {
                Some(Duration::ZERO)
            } else {
                Some(WAIT_TIMEOUT)
            };

            match poll.poll(&mut events, timeout) {
                Ok(()) => (),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("Error polling for events"),
            }

            let mut vchan_fired = zero_timeout;
            let mut stdout_fired = false;
            let mut stderr_fired = false;
            let mut stdin_writable = false;
            for event in &events {
                match event.token() {
                    TOKEN_SIGNAL => plumbing.drain(),
                    TOKEN_VCHAN => vchan_fired = true,
                    TOKEN_STDOUT => stdout_fired = true,
                    TOKEN_STDERR => stderr_fired = true,
                    TOKEN_STDIN => stdin_writable = true,
                    _ => {}
                }
            }

            if vchan_fired {
                session.vchan.advance();
                match decode_vchan_input(session, &mut assembler) {
                    Ok(DecodeOutcome::Ok) => {}
                    Ok(DecodeOutcome::RemoteStdinEof) => {
                        // Don't close stdin yet: `pending_stdin` may still hold bytes that
                        // arrived earlier in this same batch (§5 arrival-order guarantee).
                        // Closed below once the buffer has actually drained.
                        session.stdin_eof_pending = true;
                    }
                    Ok(DecodeOutcome::RemoteExited(code)) => {
                        session.remote_exit = ExitSlot::Known(code);
                        terminate_slot(&mut session.stdout, Some(Shutdown::Read));
                        terminate_slot(&mut session.stderr, None);
                        if session.child_pid.is_none() {
                            return Ok(code);
                        }
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            if stdin_writable {
                flush_pending_stdin(session)?;
            }

            if session.stdin_eof_pending && session.pending_stdin.is_empty() {
                terminate_slot(&mut session.stdin, Some(Shutdown::Write));
                session.stdin_eof_pending = false;
            }

            if stdout_fired {
                match encode_stream_chunk(
                    session,
                    session.stdout.fd().unwrap(),
                    session.stdout_tag,
                    session.sanitize_stdout,
                ) {
                    Ok(EncodeOutcome::Queued) => {}
                    Ok(EncodeOutcome::Eof) => terminate_slot(&mut session.stdout, None),
                    Err(e) => return Err(e.into()),
                }
            }
            if stderr_fired {
                match encode_stream_chunk(
                    session,
                    session.stderr.fd().unwrap(),
                    FrameType::DataStderr,
                    session.sanitize_stderr,
                ) {
                    Ok(EncodeOutcome::Queued) => {}
                    Ok(EncodeOutcome::Eof) => terminate_slot(&mut session.stderr, None),
                    Err(e) => return Err(e.into()),
                }
            }
        }

        Ok(session.local_exit.code().unwrap_or(0))
    })();

    // Post-loop teardown (§4.3): restore blocking mode, then close/half-close, regardless of how
    // the loop above ended.
    for (slot, half_close) in [
        (&mut session.stdin, Some(Shutdown::Write)),
        (&mut session.stdout, Some(Shutdown::Read)),
        (&mut session.stderr, None),
    ] {
        if let Some(fd) = slot.fd() {
            set_blocking(fd);
        }
        terminate_slot(slot, half_close);
    }

    if !session.exit_frame_sent {
        if let ExitSlot::Known(code) = session.local_exit {
            let header = Header::encode(FrameType::DataExitCode, 4);
            if session.vchan.send(&header).is_ok() {
                let _ = session.vchan.send(&frame::encode_exit_code(code));
            }
            session.exit_frame_sent = true;
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameType;
    use crate::vchan::LoopbackVchan;
    use std::os::fd::{AsRawFd, IntoRawFd};

    fn blank_session(vchan: LoopbackVchan) -> Session<LoopbackVchan> {
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
    fn frame_assembler_handles_split_header_and_payload() {
        let mut assembler = FrameAssembler::new();
        let mut seen = Vec::new();
        let frame = {
            let mut v = Header::encode(FrameType::DataStdin, 3).to_vec();
            v.extend_from_slice(b"abc");
            v
        };
        assembler.feed(&frame[..5], |kind, payload| {
            seen.push((kind, payload.to_vec()));
            Ok(())
        }).unwrap();
        assert!(seen.is_empty(), "frame incomplete, nothing should fire yet");
        assembler.feed(&frame[5..], |kind, payload| {
            seen.push((kind, payload.to_vec()));
            Ok(())
        }).unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, FrameType::DataStdin);
        assert_eq!(seen[0].1, b"abc");
    }

    #[test]
    fn frame_assembler_handles_zero_length_payload() {
        let mut assembler = FrameAssembler::new();
        let mut seen = Vec::new();
        let frame = Header::encode(FrameType::DataStdin, 0);
        assembler.feed(&frame, |kind, payload| {
            seen.push((kind, payload.to_vec()));
            Ok(())
        }).unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].1.is_empty());
    }

    #[test]
    fn decode_vchan_input_reports_stdin_eof() {
        let (mut a, mut b) = LoopbackVchan::pair().unwrap();
        let header = Header::encode(FrameType::DataStdin, 0);
        crate::vchan::blocking_send_all(&mut a, &header).unwrap();

        let mut session = blank_session(b);
        let mut assembler = FrameAssembler::new();
        let outcome = decode_vchan_input(&mut session, &mut assembler).unwrap();
        assert!(matches!(outcome, DecodeOutcome::RemoteStdinEof));
    }

    #[test]
    fn decode_vchan_input_reports_remote_exit() {
        let (mut a, mut b) = LoopbackVchan::pair().unwrap();
        let header = Header::encode(FrameType::DataExitCode, 4);
        crate::vchan::blocking_send_all(&mut a, &header).unwrap();
        crate::vchan::blocking_send_all(&mut a, &frame::encode_exit_code(7)).unwrap();

        let mut session = blank_session(b);
        let mut assembler = FrameAssembler::new();
        let outcome = decode_vchan_input(&mut session, &mut assembler).unwrap();
        assert!(matches!(outcome, DecodeOutcome::RemoteExited(7)));
    }

    #[test]
    fn decode_vchan_input_buffers_stdin_data() {
        let (mut a, mut b) = LoopbackVchan::pair().unwrap();
        let header = Header::encode(FrameType::DataStdin, 3);
        crate::vchan::blocking_send_all(&mut a, &header).unwrap();
        crate::vchan::blocking_send_all(&mut a, b"xyz").unwrap();

        let mut session = blank_session(b);
        let mut assembler = FrameAssembler::new();
        let outcome = decode_vchan_input(&mut session, &mut assembler).unwrap();
        assert!(matches!(outcome, DecodeOutcome::Ok));
        assert_eq!(session.pending_stdin, b"xyz");
    }

    #[test]
    fn sanitize_replaces_non_printable_bytes() {
        let mut buf = vec![0x07, b'h', b'i', b'\n', 0x1b];
        sanitize(&mut buf);
        assert_eq!(buf, vec![b'?', b'h', b'i', b'\n', b'?']);
    }

    #[test]
    fn terminate_slot_skips_inherited_descriptors() {
        let (read_fd, write_fd) = nix::unistd::pipe().unwrap();
        drop(write_fd);
        let raw = read_fd.as_raw_fd();
        std::mem::forget(read_fd); // keep the fd valid for the assertion below
        let mut slot = StdioSlot::open(raw, DescriptorKind::Pipe, true);
        terminate_slot(&mut slot, Some(Shutdown::Write));
        assert!(!slot.is_open());
        // Because it was inherited, the real fd must still be valid.
        assert!(nix::fcntl::fcntl(raw, FcntlArg::F_GETFD).is_ok());
        let _ = nix::unistd::close(raw);
    }

    fn recv_frame(t: &mut impl Transport) -> (FrameType, Vec<u8>) {
        let mut header_buf = [0u8; HEADER_LEN];
        crate::vchan::blocking_recv_exact(t, &mut header_buf).unwrap();
        let header = Header::decode(&header_buf).unwrap();
        let mut payload = vec![0u8; header.len as usize];
        if header.len > 0 {
            crate::vchan::blocking_recv_exact(t, &mut payload).unwrap();
        }
        (header.kind, payload)
    }

    fn send_frame(t: &mut impl Transport, kind: FrameType, payload: &[u8]) {
        let header = Header::encode(kind, payload.len() as u32);
        crate::vchan::blocking_send_all(t, &header).unwrap();
        if !payload.is_empty() {
            crate::vchan::blocking_send_all(t, payload).unwrap();
        }
    }

    // §8 scenario 1: echo. Spawns `cat`, feeds it three DATA_STDIN frames then a zero-length one,
    // and expects the matching DATA_STDOUT frames followed by the worker's own exit-code frame.
    #[test]
    fn scenario_echo_forwards_stdout_and_exit_code() {
        let (mut remote, local) = LoopbackVchan::pair().unwrap();
        let plumbing = signals::install().unwrap();
        let spawned = process::spawn_cmdline("anyuser:cat").unwrap();

        let mut session = blank_session(local);
        session.child_pid = Some(spawned.pid);
        let stdin_fd = spawned.stdin.into_raw_fd();
        let stdout_fd = spawned.stdout.into_raw_fd();
        let stderr_fd = spawned.stderr.into_raw_fd();
        session.stdin = StdioSlot::open(stdin_fd, DescriptorKind::Pipe, false);
        session.stdout = StdioSlot::open(stdout_fd, DescriptorKind::Pipe, false);
        session.stderr = StdioSlot::open(stderr_fd, DescriptorKind::Pipe, false);

        let worker = std::thread::spawn(move || {
            let mut session = session;
            run(&mut session, &plumbing)
        });

        for word in [b"a".as_slice(), b"b", b"c"] {
            send_frame(&mut remote, FrameType::DataStdin, word);
        }
        send_frame(&mut remote, FrameType::DataStdin, b"");

        // `pending_stdin` is a flat byte buffer (§3), so frame boundaries between the three
        // DATA_STDIN payloads aren't preserved once decoded; cat's own read/write granularity
        // decides how the echoed bytes are chunked back into DATA_STDOUT frames. What §5
        // actually guarantees is that the bytes reach stdin, and come back out, in order.
        let mut echoed = Vec::new();
        let exit_code = loop {
            let (kind, payload) = recv_frame(&mut remote);
            match kind {
                FrameType::DataStdout => echoed.extend_from_slice(&payload),
                FrameType::DataExitCode => break frame::decode_exit_code(&payload).unwrap(),
                other => panic!("unexpected frame {other:?}"),
            }
        };
        assert_eq!(echoed, b"abc");
        assert_eq!(exit_code, 0);

        let result = worker.join().unwrap().unwrap();
        assert_eq!(result, 0);
    }

    // §8 scenario 2: child signal death. A SIGKILLed child reports exit-code 137 (128+9).
    #[test]
    fn scenario_signal_death_reports_137() {
        let (mut remote, local) = LoopbackVchan::pair().unwrap();
        let plumbing = signals::install().unwrap();
        let spawned = process::spawn_cmdline("anyuser:sleep 30").unwrap();
        let pid = spawned.pid;

        let mut session = blank_session(local);
        session.child_pid = Some(pid);
        session.stdin = StdioSlot::open(spawned.stdin.into_raw_fd(), DescriptorKind::Pipe, false);
        session.stdout = StdioSlot::open(spawned.stdout.into_raw_fd(), DescriptorKind::Pipe, false);
        session.stderr = StdioSlot::open(spawned.stderr.into_raw_fd(), DescriptorKind::Pipe, false);

        let worker = std::thread::spawn(move || {
            let mut session = session;
            run(&mut session, &plumbing)
        });

        nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL).unwrap();

        let exit_code = loop {
            let (kind, payload) = recv_frame(&mut remote);
            if kind == FrameType::DataExitCode {
                break frame::decode_exit_code(&payload).unwrap();
            }
        };
        assert_eq!(exit_code, 137);

        let result = worker.join().unwrap().unwrap();
        assert_eq!(result, 137);
    }

    // §8 scenario 3 (service-connect sub-case): once the remote reports its own exit code and no
    // local child exists, the multiplexer closes stdout/stderr and returns that code immediately.
    #[test]
    fn scenario_remote_exits_first_with_no_local_child() {
        let (mut remote, local) = LoopbackVchan::pair().unwrap();
        let plumbing = signals::install().unwrap();

        let (stdin_r, stdin_w) = nix::unistd::pipe().unwrap();
        let (stdout_r, stdout_w) = nix::unistd::pipe().unwrap();
        let (stderr_r, stderr_w) = nix::unistd::pipe().unwrap();
        drop(stdin_r);
        drop(stdout_w);
        drop(stderr_w);

        let mut session = blank_session(local);
        session.stdin = StdioSlot::open(stdin_w.into_raw_fd(), DescriptorKind::Pipe, false);
        session.stdout = StdioSlot::open(stdout_r.into_raw_fd(), DescriptorKind::Pipe, false);
        session.stderr = StdioSlot::open(stderr_r.into_raw_fd(), DescriptorKind::Pipe, false);

        let worker = std::thread::spawn(move || {
            let mut session = session;
            run(&mut session, &plumbing)
        });

        send_frame(&mut remote, FrameType::DataExitCode, &frame::encode_exit_code(5));

        let result = worker.join().unwrap().unwrap();
        assert_eq!(result, 5);
    }
}
