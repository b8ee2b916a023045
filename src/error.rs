//! Crate-local error types for the I/O multiplexer's codec layer.
//!
//! Most of the crate uses `anyhow` for "do this setup step or bail with context", the same way
//! `fdintercept` does. The multiplexer's vchan-facing decode/encode step is different: its caller
//! (§4.3(f)/(g)/(h) of the design) must branch on *which kind* of outcome happened, not just on
//! success/failure, so it gets its own enum instead of an opaque `anyhow::Error`.

use std::fmt;
use std::io;

/// Outcome of decoding one batch of inbound vchan data destined for the child's stdin.
#[derive(Debug)]
pub enum DecodeOutcome {
    /// Nothing terminal happened; keep looping.
    Ok,
    /// The remote will send no more stdin data.
    RemoteStdinEof,
    /// The remote reported its own exit code.
    RemoteExited(i32),
}

/// Outcome of reading one chunk from a child stream and framing it for the vchan.
#[derive(Debug)]
pub enum EncodeOutcome {
    /// A chunk (possibly zero-length, for a stream that is exactly at EOF) was queued.
    Queued,
    /// The stream hit EOF; the caller should close its side.
    Eof,
}

/// A fatal error on the vchan side: short read/write, malformed frame header, or a transport
/// error surfaced by the underlying `vchan` crate. Promoted to "transport failure" per §7.
#[derive(Debug)]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vchan transport error: {}", self.0)
    }
}

impl std::error::Error for TransportError {}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        Self(e.to_string())
    }
}
