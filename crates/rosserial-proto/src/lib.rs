//! Wire-level pieces of the rosserial protocol: frame layout, checksum
//! arithmetic, the sync-search decoder, and the negotiation/side-channel
//! message codecs. No I/O lives here; the decoder is generic over the
//! [`FrameRead`] contract implemented by the transport layer.

mod frame;
mod link;
mod msgs;

pub mod ids;

pub use frame::{
    EncodeError, FrameError, FrameEvent, PROTOCOL_REV0, PROTOCOL_REV1, PROTOCOL_VER, ReadPhase,
    SYNC_FLAG, checksum, encode, protocol_name, read_frame,
};
pub use link::{FrameRead, LinkError};
pub use msgs::{
    LogLevel, LogMsg, RequestParamRequest, RequestParamResponse, TimeMsg, TopicInfo, WireError,
};
