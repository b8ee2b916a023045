//! The transport contract this crate consumes (§6, GLOSSARY).
//!
//! The vchan transport library itself is an external collaborator (spec.md §1): we depend on the
//! `vchan` crate (the Rust binding Qubes OS ships over `libvchan`, as used by `qubes-gui-rust`)
//! and specify here only the operations the rest of this crate invokes, behind a small [`Transport`]
//! trait so the handshake and multiplexer can be exercised against an in-memory double in tests.

use crate::error::TransportError;
use std::io;
use std::os::fd::RawFd;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Status of a vchan connection, mirroring `vchan::Status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Disconnected,
    Connected,
    Waiting,
}

/// Operations this crate invokes on a vchan. Implemented for the real `vchan` crate and for
/// [`LoopbackVchan`], an in-process double used by tests.
pub trait Transport {
    /// The event descriptor to watch for readability; the only valid use of this fd is `poll`/
    /// `epoll`/mio registration (per the real `vchan::Vchan::fd` contract).
    fn fd(&self) -> RawFd;

    fn status(&self) -> Status;

    fn is_open(&self) -> bool {
        matches!(self.status(), Status::Connected)
    }

    /// Bytes that can be read from the remote without blocking.
    fn data_ready(&self) -> usize;

    /// Bytes that can be written to the remote without blocking.
    fn buffer_space(&self) -> usize;

    /// Advances the vchan's internal state after its event descriptor fired, clearing the pending
    /// event flag. Safe to call even when no event is pending; never blocks in that case.
    fn advance(&self);

    /// Blocks until `buf` is fully read. Callers in this crate only invoke this with
    /// `buf.len() <= data_ready()`, so in practice it never blocks.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the underlying transport fails.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Blocks until `buf` is fully written. Callers in this crate only invoke this with
    /// `buf.len() <= buffer_space()`, so in practice it never blocks.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the underlying transport fails.
    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;
}

/// Wraps the real `vchan` crate.
pub struct RealVchan(vchan::Vchan);

impl RealVchan {
    /// Creates a vchan in server role, listening for a peer to connect on `(domain, port)`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the underlying `libvchan_server_init` call fails.
    pub fn server(domain: u16, port: i32, read_min: usize, write_min: usize) -> io::Result<Self> {
        vchan::Vchan::server(domain, port, read_min, write_min).map(Self)
    }

    /// Connects to a vchan server at `(domain, port)`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the underlying `libvchan_client_init` call fails.
    pub fn client(domain: u16, port: i32) -> io::Result<Self> {
        vchan::Vchan::client(domain, port).map(Self)
    }
}

impl Transport for RealVchan {
    fn fd(&self) -> RawFd {
        self.0.fd()
    }

    fn status(&self) -> Status {
        match self.0.status() {
            vchan::Status::Disconnected => Status::Disconnected,
            vchan::Status::Connected => Status::Connected,
            vchan::Status::Waiting => Status::Waiting,
        }
    }

    fn data_ready(&self) -> usize {
        self.0.data_ready()
    }

    fn buffer_space(&self) -> usize {
        self.0.buffer_space()
    }

    fn advance(&self) {
        self.0.wait();
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.recv(buf)
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.send(buf)
    }
}

/// Reads a header-then-payload frame off a [`Transport`], blocking until both parts have arrived.
/// Used only by the handshake (§4.1), which is intentionally blocking.
///
/// # Errors
///
/// Returns a [`TransportError`] on any short read or transport-level I/O error.
pub fn blocking_recv_exact(t: &mut impl Transport, buf: &mut [u8]) -> Result<(), TransportError> {
    loop {
        match t.recv(buf) {
            Ok(n) if n == buf.len() => return Ok(()),
            Ok(n) => {
                return Err(TransportError::new(format!(
                    "short read: expected {} bytes, got {n}",
                    buf.len()
                )))
            }
            // The real vchan's recv blocks until the full buffer arrives; a non-blocking test
            // double (LoopbackVchan) surfaces "nothing yet" as WouldBlock instead, so retry here
            // to preserve the same blocking contract for callers.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Writes a buffer to a [`Transport`] in full, blocking. Used only by the handshake.
///
/// # Errors
///
/// Returns a [`TransportError`] on any short write or transport-level I/O error.
pub fn blocking_send_all(t: &mut impl Transport, buf: &[u8]) -> Result<(), TransportError> {
    let n = t.send(buf)?;
    if n != buf.len() {
        return Err(TransportError::new(format!(
            "short write: expected {} bytes, sent {n}",
            buf.len()
        )));
    }
    Ok(())
}

const LOOPBACK_CAPACITY: usize = 64 * 1024;

struct Inbound {
    read_fd: std::os::fd::OwnedFd,
    pending: Arc<AtomicUsize>,
}

struct Outbound {
    write_fd: std::os::fd::OwnedFd,
    pending: Arc<AtomicUsize>,
}

/// An in-process double for [`Transport`], built from two real pipes so it is genuinely pollable
/// (mio registers its `fd()` directly). Used by unit/integration tests to drive the handshake and
/// multiplexer end-to-end without a real Xen/Qubes vchan.
pub struct LoopbackVchan {
    inbound: Inbound,
    outbound: Outbound,
    status: Status,
}

impl LoopbackVchan {
    /// Creates a connected pair of loopback vchans.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the underlying pipes cannot be created or set non-blocking.
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a_read, a_write) = nix::unistd::pipe()?;
        let (b_read, b_write) = nix::unistd::pipe()?;
        for fd in [a_read.as_raw_fd(), b_read.as_raw_fd()] {
            set_nonblocking(fd)?;
        }

        let a_to_b = Arc::new(AtomicUsize::new(0));
        let b_to_a = Arc::new(AtomicUsize::new(0));

        let left = Self {
            outbound: Outbound {
                write_fd: a_write,
                pending: a_to_b.clone(),
            },
            inbound: Inbound {
                read_fd: b_read,
                pending: b_to_a.clone(),
            },
            status: Status::Connected,
        };
        let right = Self {
            outbound: Outbound {
                write_fd: b_write,
                pending: b_to_a,
            },
            inbound: Inbound {
                read_fd: a_read,
                pending: a_to_b,
            },
            status: Status::Connected,
        };
        Ok((left, right))
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    fcntl(
        fd,
        FcntlArg::F_SETFL(OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK),
    )?;
    Ok(())
}

impl Transport for LoopbackVchan {
    fn fd(&self) -> RawFd {
        self.inbound.read_fd.as_raw_fd()
    }

    fn status(&self) -> Status {
        self.status
    }

    fn data_ready(&self) -> usize {
        self.inbound.pending.load(Ordering::Acquire)
    }

    fn buffer_space(&self) -> usize {
        LOOPBACK_CAPACITY.saturating_sub(self.outbound.pending.load(Ordering::Acquire))
    }

    fn advance(&self) {}

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = nix::unistd::read(&self.inbound.read_fd, buf)?;
        self.inbound.pending.fetch_sub(n, Ordering::AcqRel);
        Ok(n)
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = nix::unistd::write(&self.outbound.write_fd, buf)?;
        self.outbound.pending.fetch_add(n, Ordering::AcqRel);
        Ok(n)
    }
}
