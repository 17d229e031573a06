//! Codecs for the negotiation and side-channel payloads the device exchanges
//! with the bridge. Field encoding follows the middleware's message
//! serialization: integers little-endian, strings and arrays prefixed with a
//! u32 length.

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("message payload truncated")]
    Truncated,
    #[error("string field is not valid utf-8")]
    Utf8,
}

impl From<std::io::Error> for WireError {
    fn from(_: std::io::Error) -> Self {
        Self::Truncated
    }
}

fn read_string(buf: &mut &[u8]) -> Result<String, WireError> {
    let len = buf.read_u32::<LittleEndian>()? as usize;
    if buf.len() < len {
        return Err(WireError::Truncated);
    }
    let (head, tail) = buf.split_at(len);
    let s = String::from_utf8(head.to_vec()).map_err(|_| WireError::Utf8)?;
    *buf = tail;
    Ok(s)
}

fn put_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

/// Self-describing endpoint metadata the device sends to enumerate its
/// topics and services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicInfo {
    pub topic_id: u16,
    pub topic_name: String,
    pub message_type: String,
    pub md5sum: String,
    pub buffer_size: u32,
}

impl TopicInfo {
    pub fn decode(mut payload: &[u8]) -> Result<Self, WireError> {
        let buf = &mut payload;
        Ok(Self {
            topic_id: buf.read_u16::<LittleEndian>()?,
            topic_name: read_string(buf)?,
            message_type: read_string(buf)?,
            md5sum: read_string(buf)?,
            buffer_size: buf.read_u32::<LittleEndian>()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.topic_id.to_le_bytes());
        put_string(&mut out, &self.topic_name);
        put_string(&mut out, &self.message_type);
        put_string(&mut out, &self.md5sum);
        out.extend_from_slice(&self.buffer_size.to_le_bytes());
        out
    }

    /// Splits `"package/Type"` into its two halves.
    pub fn split_message_type(&self) -> Option<(&str, &str)> {
        self.message_type.split_once('/')
    }
}

/// Severity levels of device-originated log frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn from_wire(level: u8) -> Option<Self> {
        match level {
            1 => Some(Self::Debug),
            2 => Some(Self::Info),
            4 => Some(Self::Warn),
            8 => Some(Self::Error),
            16 => Some(Self::Fatal),
            _ => None,
        }
    }
}

/// A log line forwarded from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMsg {
    pub level: u8,
    pub msg: String,
}

impl LogMsg {
    pub fn decode(mut payload: &[u8]) -> Result<Self, WireError> {
        let buf = &mut payload;
        Ok(Self { level: buf.read_u8()?, msg: read_string(buf)? })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.level];
        put_string(&mut out, &self.msg);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestParamRequest {
    pub name: String,
}

impl RequestParamRequest {
    pub fn decode(mut payload: &[u8]) -> Result<Self, WireError> {
        Ok(Self { name: read_string(&mut payload)? })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_string(&mut out, &self.name);
        out
    }
}

/// Parameter values answered to the device. Exactly one of the arrays is
/// non-empty for a scalar or homogeneous-list parameter; all three stay empty
/// when the parameter is missing or unrepresentable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestParamResponse {
    pub ints: Vec<i32>,
    pub floats: Vec<f32>,
    pub strings: Vec<String>,
}

impl RequestParamResponse {
    pub fn decode(mut payload: &[u8]) -> Result<Self, WireError> {
        let buf = &mut payload;
        let mut resp = Self::default();
        for _ in 0..buf.read_u32::<LittleEndian>()? {
            resp.ints.push(buf.read_i32::<LittleEndian>()?);
        }
        for _ in 0..buf.read_u32::<LittleEndian>()? {
            resp.floats.push(buf.read_f32::<LittleEndian>()?);
        }
        for _ in 0..buf.read_u32::<LittleEndian>()? {
            resp.strings.push(read_string(buf)?);
        }
        Ok(resp)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.ints.len() as u32).to_le_bytes());
        for v in &self.ints {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&(self.floats.len() as u32).to_le_bytes());
        for v in &self.floats {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&(self.strings.len() as u32).to_le_bytes());
        for v in &self.strings {
            put_string(&mut out, v);
        }
        out
    }
}

/// Host wall-clock time answered to a time-sync request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeMsg {
    pub sec: u32,
    pub nsec: u32,
}

impl TimeMsg {
    pub fn decode(mut payload: &[u8]) -> Result<Self, WireError> {
        let buf = &mut payload;
        Ok(Self { sec: buf.read_u32::<LittleEndian>()?, nsec: buf.read_u32::<LittleEndian>()? })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        out.extend_from_slice(&self.sec.to_le_bytes());
        out.extend_from_slice(&self.nsec.to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_info_round_trip() {
        let info = TopicInfo {
            topic_id: 125,
            topic_name: "chatter".into(),
            message_type: "std_msgs/String".into(),
            md5sum: "992ce8a1687cec8c8bd883ec73ca41d1".into(),
            buffer_size: 280,
        };
        assert_eq!(TopicInfo::decode(&info.encode()).unwrap(), info);
        assert_eq!(info.split_message_type(), Some(("std_msgs", "String")));
    }

    #[test]
    fn topic_info_known_bytes() {
        let info = TopicInfo {
            topic_id: 0x0102,
            topic_name: "t".into(),
            message_type: "p/M".into(),
            md5sum: "d41d".into(),
            buffer_size: 512,
        };
        let mut expect = vec![0x02, 0x01];
        expect.extend_from_slice(&[1, 0, 0, 0, b't']);
        expect.extend_from_slice(&[3, 0, 0, 0, b'p', b'/', b'M']);
        expect.extend_from_slice(&[4, 0, 0, 0, b'd', b'4', b'1', b'd']);
        expect.extend_from_slice(&[0, 2, 0, 0]);
        assert_eq!(info.encode(), expect);
    }

    #[test]
    fn truncated_topic_info() {
        let bytes = TopicInfo {
            topic_id: 1,
            topic_name: "abc".into(),
            message_type: "p/M".into(),
            md5sum: String::new(),
            buffer_size: 0,
        }
        .encode();
        assert_eq!(TopicInfo::decode(&bytes[..5]), Err(WireError::Truncated));
    }

    #[test]
    fn log_levels() {
        assert_eq!(LogLevel::from_wire(1), Some(LogLevel::Debug));
        assert_eq!(LogLevel::from_wire(16), Some(LogLevel::Fatal));
        assert_eq!(LogLevel::from_wire(3), None);
        let msg = LogMsg { level: 4, msg: "low battery".into() };
        assert_eq!(LogMsg::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn param_response_round_trip() {
        let resp = RequestParamResponse { ints: vec![1, -2, 3], ..Default::default() };
        assert_eq!(RequestParamResponse::decode(&resp.encode()).unwrap(), resp);

        let resp = RequestParamResponse {
            strings: vec!["a".into(), "bc".into()],
            ..Default::default()
        };
        assert_eq!(RequestParamResponse::decode(&resp.encode()).unwrap(), resp);
    }

    #[test]
    fn time_round_trip() {
        let t = TimeMsg { sec: 1_700_000_000, nsec: 999 };
        assert_eq!(TimeMsg::decode(&t.encode()).unwrap(), t);
    }
}
