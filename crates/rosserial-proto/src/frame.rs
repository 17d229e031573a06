use thiserror::Error;
use tracing::info;

use crate::link::{FrameRead, LinkError};

/// First byte of every frame.
pub const SYNC_FLAG: u8 = 0xFF;
/// Version byte of protocol Rev 0 (no longer spoken, still recognized).
pub const PROTOCOL_REV0: u8 = 0xFF;
/// Version byte of protocol Rev 1, the only revision this bridge speaks.
pub const PROTOCOL_REV1: u8 = 0xFE;
/// The version byte emitted on every outbound frame.
pub const PROTOCOL_VER: u8 = PROTOCOL_REV1;

/// Frame layout:
/// sync (1) + version (1) + payload len LE (2) + len checksum (1)
/// + topic id LE (2) + payload (n) + payload checksum (1).
const OVERHEAD: usize = 8;

/// Checksum over a byte range: `255 - (sum mod 256)`. A range validates when
/// the sum of its bytes plus the checksum byte is `255 mod 256`.
pub fn checksum<'a>(bytes: impl IntoIterator<Item = &'a u8>) -> u8 {
    255u8.wrapping_sub(bytes.into_iter().fold(0u8, |acc, b| acc.wrapping_add(*b)))
}

fn sums_to_255<'a>(bytes: impl IntoIterator<Item = &'a u8>) -> bool {
    bytes.into_iter().fold(0u8, |acc, b| acc.wrapping_add(*b)) == 255
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    /// Payload exceeds the negotiated device buffer (or the u16 length field).
    #[error("payload of {len} bytes exceeds limit of {limit}")]
    PayloadTooLarge { len: usize, limit: usize },
}

/// Builds one frame around `payload`. `max_payload` is the negotiated
/// subscribe-buffer size of the device; `0` means not yet negotiated and only
/// the wire format's own u16 limit applies.
pub fn encode(topic_id: u16, payload: &[u8], max_payload: u32) -> Result<Vec<u8>, EncodeError> {
    let limit =
        if max_payload > 0 { (max_payload as usize).min(u16::MAX as usize) } else { u16::MAX as usize };
    if payload.len() > limit {
        return Err(EncodeError::PayloadTooLarge { len: payload.len(), limit });
    }

    let len = (payload.len() as u16).to_le_bytes();
    let id = topic_id.to_le_bytes();

    let mut frame = Vec::with_capacity(payload.len() + OVERHEAD);
    frame.push(SYNC_FLAG);
    frame.push(PROTOCOL_VER);
    frame.extend_from_slice(&len);
    frame.push(checksum(&len));
    frame.extend_from_slice(&id);
    frame.extend_from_slice(payload);
    frame.push(checksum(id.iter().chain(payload)));
    Ok(frame)
}

/// Outcome of one [`read_frame`] call.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameEvent {
    /// A checksum-valid frame.
    Frame { topic_id: u16, payload: Vec<u8> },
    /// A sync flag followed by a version byte this bridge does not speak.
    /// Returned (rather than skipped) so the caller can raise a diagnostic
    /// before resuming the sync search.
    ProtocolMismatch { version: u8 },
}

/// Where in the frame a read failed. The session logs this verbatim.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadPhase {
    SyncFlag,
    Protocol,
    MessageLength,
    TopicId,
    Data,
    DataChecksum,
}

impl std::fmt::Display for ReadPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::SyncFlag => "syncflag",
            Self::Protocol => "protocol",
            Self::MessageLength => "message length",
            Self::TopicId => "topic id",
            Self::Data => "data",
            Self::DataChecksum => "data checksum",
        })
    }
}

#[derive(Debug, Error)]
#[error("frame read failed at {phase}: {source}")]
pub struct FrameError {
    pub phase: ReadPhase,
    pub source: LinkError,
}

/// Human-readable name for a protocol version byte, used in mismatch logs.
pub fn protocol_name(version: u8) -> &'static str {
    match version {
        PROTOCOL_REV0 => "Rev 0 (rosserial 0.4 and earlier)",
        PROTOCOL_REV1 => "Rev 1 (rosserial 0.5+)",
        _ => "unrecognized",
    }
}

/// Scans the link for the next frame.
///
/// Searches byte-by-byte for the sync flag, then validates the version byte,
/// the length header checksum and the payload checksum. Checksum failures are
/// logged and the search resumes inside this call; a foreign version byte is
/// surfaced as [`FrameEvent::ProtocolMismatch`]. A mid-frame link error
/// propagates with the phase it happened in; the caller decides whether to
/// resync or tear the session down.
pub fn read_frame<R: FrameRead + ?Sized>(link: &mut R) -> Result<FrameEvent, FrameError> {
    let at = |phase: ReadPhase| move |source: LinkError| FrameError { phase, source };

    loop {
        let mut byte = [0u8; 1];
        link.read_exact(&mut byte).map_err(at(ReadPhase::SyncFlag))?;
        if byte[0] != SYNC_FLAG {
            continue;
        }

        link.read_exact(&mut byte).map_err(at(ReadPhase::Protocol))?;
        if byte[0] != PROTOCOL_VER {
            return Ok(FrameEvent::ProtocolMismatch { version: byte[0] });
        }

        let mut len_hdr = [0u8; 3];
        link.read_exact(&mut len_hdr).map_err(at(ReadPhase::MessageLength))?;
        let len = u16::from_le_bytes([len_hdr[0], len_hdr[1]]) as usize;
        if !sums_to_255(&len_hdr) {
            info!(len, "wrong checksum for message length, dropping frame");
            continue;
        }

        let mut id = [0u8; 2];
        link.read_exact(&mut id).map_err(at(ReadPhase::TopicId))?;
        let topic_id = u16::from_le_bytes(id);

        let mut payload = vec![0u8; len];
        link.read_exact(&mut payload).map_err(at(ReadPhase::Data))?;

        let mut chk = [0u8; 1];
        link.read_exact(&mut chk).map_err(at(ReadPhase::DataChecksum))?;
        if !sums_to_255(id.iter().chain(&payload).chain(&chk)) {
            info!(topic_id, "wrong checksum for topic id and payload, dropping frame");
            continue;
        }

        return Ok(FrameEvent::Frame { topic_id, payload });
    }
}
