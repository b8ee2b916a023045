//! Protocol-version handshake (§4.1).
//!
//! Exchanges one `HELLO` in each direction and negotiates `effective = min(local, remote)`,
//! rejecting anything below a floor. Intentionally blocking: no concurrency is needed before
//! negotiation completes (§5), unlike every other vchan interaction in this crate.

use crate::error::TransportError;
use crate::frame::{self, FrameType, Header, HEADER_LEN, PEER_INFO_LEN};
use crate::vchan::{blocking_recv_exact, blocking_send_all, Transport};

/// Oldest protocol version this worker will negotiate down to.
pub const MINIMUM_SUPPORTED_VERSION: u32 = 2;

/// Performs the handshake and returns the negotiated protocol version.
///
/// # Errors
///
/// Returns a [`TransportError`] on any short read/write, a malformed `HELLO` header, or a
/// negotiated version below [`MINIMUM_SUPPORTED_VERSION`]. Per §4.1, any failure here is fatal for
/// the session: the caller must close the vchan and terminate the worker.
pub fn perform(t: &mut impl Transport, local_version: u32) -> Result<u32, TransportError> {
    let header = Header::encode(FrameType::Hello, PEER_INFO_LEN as u32);
    blocking_send_all(t, &header)?;
    blocking_send_all(t, &frame::encode_peer_info(local_version))?;

    let mut header_buf = [0u8; HEADER_LEN];
    blocking_recv_exact(t, &mut header_buf)?;
    let header = Header::decode(&header_buf)?;
    if header.kind != FrameType::Hello {
        return Err(TransportError::new(format!(
            "expected HELLO, got frame type {:?}",
            header.kind
        )));
    }
    if header.len as usize != PEER_INFO_LEN {
        return Err(TransportError::new(format!(
            "HELLO payload length {} does not match peer_info size {PEER_INFO_LEN}",
            header.len
        )));
    }

    let mut peer_info = [0u8; PEER_INFO_LEN];
    blocking_recv_exact(t, &mut peer_info)?;
    let remote_version = frame::decode_peer_info(&peer_info);

    let effective = local_version.min(remote_version);
    if effective < MINIMUM_SUPPORTED_VERSION {
        return Err(TransportError::new(format!(
            "negotiated version {effective} is below the minimum supported version {MINIMUM_SUPPORTED_VERSION}"
        )));
    }
    Ok(effective)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vchan::LoopbackVchan;

    #[test]
    fn negotiates_minimum_of_both_versions() {
        let (mut a, mut b) = LoopbackVchan::pair().unwrap();
        let handle = std::thread::spawn(move || perform(&mut b, 5));
        let a_result = perform(&mut a, 3).unwrap();
        let b_result = handle.join().unwrap().unwrap();
        assert_eq!(a_result, 3);
        assert_eq!(b_result, 3);
    }

    #[test]
    fn rejects_effective_version_below_floor() {
        let (mut a, mut b) = LoopbackVchan::pair().unwrap();
        let handle = std::thread::spawn(move || perform(&mut b, 1));
        let a_result = perform(&mut a, 5);
        assert!(a_result.is_err());
        assert!(handle.join().unwrap().is_err());
    }

    #[test]
    fn rejects_non_hello_header() {
        let (mut a, mut b) = LoopbackVchan::pair().unwrap();
        // Feed `b` a garbage header instead of running a real handshake on that side.
        let bogus = Header::encode(FrameType::DataStdout, 0);
        blocking_send_all(&mut b, &bogus).unwrap();
        assert!(perform(&mut a, 3).is_err());
    }
}
