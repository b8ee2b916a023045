//! Wire frame format used on the vchan (§6).
//!
//! Every frame is a fixed `{u32 type, u32 len}` header followed by `len` bytes of payload.
//! Payload for `DATA_*` frames is opaque bytes; `HELLO` carries a `{u32 version}` peer_info;
//! `DATA_EXIT_CODE` carries a single `i32`.

use crate::error::TransportError;
use std::mem::size_of;

pub const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FrameType {
    Hello = 0,
    DataStdin = 1,
    DataStdout = 2,
    DataStderr = 3,
    DataExitCode = 4,
}

impl FrameType {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Hello),
            1 => Some(Self::DataStdin),
            2 => Some(Self::DataStdout),
            3 => Some(Self::DataStderr),
            4 => Some(Self::DataExitCode),
            _ => None,
        }
    }
}

/// A decoded frame header, before its payload has been read.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub kind: FrameType,
    pub len: u32,
}

impl Header {
    pub fn encode(kind: FrameType, len: u32) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&(kind as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&len.to_le_bytes());
        buf
    }

    /// Decodes a header from exactly `HEADER_LEN` bytes.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the type field is not a recognized [`FrameType`].
    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self, TransportError> {
        let kind_raw = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let len = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let kind = FrameType::from_u32(kind_raw)
            .ok_or_else(|| TransportError::new(format!("unknown frame type {kind_raw}")))?;
        Ok(Self { kind, len })
    }
}

/// Payload of a `HELLO` frame: the peer's protocol version.
pub const PEER_INFO_LEN: usize = size_of::<u32>();

pub fn encode_peer_info(version: u32) -> [u8; PEER_INFO_LEN] {
    version.to_le_bytes()
}

pub fn decode_peer_info(buf: &[u8; PEER_INFO_LEN]) -> u32 {
    u32::from_le_bytes(*buf)
}

pub fn encode_exit_code(code: i32) -> [u8; 4] {
    code.to_le_bytes()
}

/// Decodes an exit-code payload.
///
/// # Errors
///
/// Returns a [`TransportError`] if `buf` is not exactly 4 bytes.
pub fn decode_exit_code(buf: &[u8]) -> Result<i32, TransportError> {
    let arr: [u8; 4] = buf
        .try_into()
        .map_err(|_| TransportError::new("DATA_EXIT_CODE payload was not 4 bytes"))?;
    Ok(i32::from_le_bytes(arr))
}
