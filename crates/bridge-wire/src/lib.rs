//! Length-prefixed framing multiplexed over the opaque authenticated
//! session channel between the network bridge dispatcher and a remote peer.
//!
//! The wire protocol bytes of the authenticated session itself are out of
//! scope (treated as a contract-only collaborator); this crate only frames
//! what the bridge itself needs to move across that channel: structured
//! events and raw video/audio buffer chunks, tagged by the segment they
//! belong to.
//!
//! All frames are little-endian, grounded on `falco`'s
//! `CommandFrame`/`DaemonDecisionFrame` layout:
//!
//! ```text
//! [4: total_len][1: type][N: type-specific body]
//! ```

pub mod error;

pub use error::{WireError, WireResult};

use serde::{Deserialize, Serialize};

pub const FRAME_TYPE_EVENT: u8 = 0x01;
pub const FRAME_TYPE_VIDEO: u8 = 0x02;
pub const FRAME_TYPE_AUDIO: u8 = 0x03;

const TAG_FIELD_LEN: usize = 2;
const MIN_HEADER: usize = 1 + TAG_FIELD_LEN;

fn encode_tag(tag: &str) -> WireResult<Vec<u8>> {
    if tag.len() > u16::MAX as usize {
        return Err(WireError::MalformedTag(format!(
            "tag too long: {} bytes",
            tag.len()
        )));
    }
    let mut out = Vec::with_capacity(TAG_FIELD_LEN + tag.len());
    out.extend_from_slice(&(tag.len() as u16).to_le_bytes());
    out.extend_from_slice(tag.as_bytes());
    Ok(out)
}

fn decode_tag(data: &[u8]) -> WireResult<(String, usize)> {
    if data.len() < TAG_FIELD_LEN {
        return Err(WireError::TooShort {
            len: data.len(),
            min: TAG_FIELD_LEN,
        });
    }
    let tag_len = u16::from_le_bytes(data[0..2].try_into().unwrap()) as usize;
    if data.len() < TAG_FIELD_LEN + tag_len {
        return Err(WireError::TooShort {
            len: data.len(),
            min: TAG_FIELD_LEN + tag_len,
        });
    }
    let tag = String::from_utf8(data[TAG_FIELD_LEN..TAG_FIELD_LEN + tag_len].to_vec())
        .map_err(|e| WireError::MalformedTag(e.to_string()))?;
    Ok((tag, TAG_FIELD_LEN + tag_len))
}

/// A structured event crossing the bridge, JSON-encoded so either side can
/// evolve its event shapes without a wire-format bump here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventFrame {
    /// The segment this event is addressed to or originates from.
    pub segment_tag: String,
    pub body: serde_json::Value,
}

impl EventFrame {
    pub fn encode(&self) -> WireResult<Vec<u8>> {
        let json = serde_json::to_vec(&self.body)?;
        let tag = encode_tag(&self.segment_tag)?;

        let body_len = tag.len() + json.len();
        let mut buf = Vec::with_capacity(4 + 1 + body_len);
        buf.extend_from_slice(&((1 + body_len) as u32).to_le_bytes());
        buf.push(FRAME_TYPE_EVENT);
        buf.extend_from_slice(&tag);
        buf.extend_from_slice(&json);
        Ok(buf)
    }

    /// Decode from a frame body (length prefix and type byte already
    /// stripped).
    pub fn decode(data: &[u8]) -> WireResult<EventFrame> {
        let (segment_tag, consumed) = decode_tag(data)?;
        let body: serde_json::Value = serde_json::from_slice(&data[consumed..])?;
        Ok(EventFrame { segment_tag, body })
    }
}

/// Which ring the raw bytes in a [`BufferFrame`] belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Video,
    Audio,
}

/// A raw chunk of video or audio bytes crossing the bridge.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferFrame {
    pub segment_tag: String,
    pub kind: BufferKind,
    pub data: Vec<u8>,
}

impl BufferFrame {
    pub fn encode(&self) -> WireResult<Vec<u8>> {
        let frame_type = match self.kind {
            BufferKind::Video => FRAME_TYPE_VIDEO,
            BufferKind::Audio => FRAME_TYPE_AUDIO,
        };
        let tag = encode_tag(&self.segment_tag)?;

        let body_len = tag.len() + self.data.len();
        let mut buf = Vec::with_capacity(4 + 1 + body_len);
        buf.extend_from_slice(&((1 + body_len) as u32).to_le_bytes());
        buf.push(frame_type);
        buf.extend_from_slice(&tag);
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }

    pub fn decode(frame_type: u8, data: &[u8]) -> WireResult<BufferFrame> {
        let kind = match frame_type {
            FRAME_TYPE_VIDEO => BufferKind::Video,
            FRAME_TYPE_AUDIO => BufferKind::Audio,
            other => return Err(WireError::UnknownFrameType(other)),
        };
        let (segment_tag, consumed) = decode_tag(data)?;
        Ok(BufferFrame {
            segment_tag,
            kind,
            data: data[consumed..].to_vec(),
        })
    }
}

/// A frame after the type byte has been dispatched on.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event(EventFrame),
    Buffer(BufferFrame),
}

/// Decode a complete frame body (length prefix already stripped by
/// [`read_frame`]).
pub fn decode_frame(data: &[u8]) -> WireResult<Frame> {
    if data.is_empty() {
        return Err(WireError::TooShort { len: 0, min: MIN_HEADER });
    }
    let frame_type = data[0];
    let body = &data[1..];
    match frame_type {
        FRAME_TYPE_EVENT => Ok(Frame::Event(EventFrame::decode(body)?)),
        FRAME_TYPE_VIDEO | FRAME_TYPE_AUDIO => {
            Ok(Frame::Buffer(BufferFrame::decode(frame_type, body)?))
        }
        other => Err(WireError::UnknownFrameType(other)),
    }
}

/// Read one length-prefixed frame from the front of `buf`.
///
/// Returns `None` if there isn't enough data yet for a complete frame,
/// matching the incremental-parsing shape of a growing read buffer.
pub fn read_frame(buf: &[u8]) -> Option<(&[u8], usize)> {
    if buf.len() < 4 {
        return None;
    }
    let len = u32::from_le_bytes(buf[0..4].try_into().ok()?) as usize;
    if buf.len() < 4 + len {
        return None;
    }
    Some((&buf[4..4 + len], 4 + len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_frame_roundtrip() {
        let frame = EventFrame {
            segment_tag: "seg1".into(),
            body: serde_json::json!({"kind": "ping"}),
        };
        let encoded = frame.encode().unwrap();
        let (body, consumed) = read_frame(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        match decode_frame(body).unwrap() {
            Frame::Event(decoded) => assert_eq!(decoded, frame),
            other => panic!("expected Event, got {:?}", other),
        }
    }

    #[test]
    fn buffer_frame_roundtrip_video_and_audio() {
        for kind in [BufferKind::Video, BufferKind::Audio] {
            let frame = BufferFrame {
                segment_tag: "seg2".into(),
                kind,
                data: vec![1, 2, 3, 4, 5],
            };
            let encoded = frame.encode().unwrap();
            let (body, consumed) = read_frame(&encoded).unwrap();
            assert_eq!(consumed, encoded.len());
            match decode_frame(body).unwrap() {
                Frame::Buffer(decoded) => assert_eq!(decoded, frame),
                other => panic!("expected Buffer, got {:?}", other),
            }
        }
    }

    #[test]
    fn read_frame_reports_incomplete_data() {
        assert!(read_frame(&[1, 2, 3]).is_none());
        let mut buf = vec![100, 0, 0, 0];
        buf.extend_from_slice(&[0; 10]);
        assert!(read_frame(&buf).is_none());
    }

    #[test]
    fn unknown_frame_type_is_rejected() {
        let body = vec![0xFFu8, 0, 0];
        assert!(matches!(
            decode_frame(&body),
            Err(WireError::UnknownFrameType(0xFF))
        ));
    }

    #[test]
    fn empty_buffer_payload_roundtrips() {
        let frame = BufferFrame {
            segment_tag: "".into(),
            kind: BufferKind::Audio,
            data: vec![],
        };
        let encoded = frame.encode().unwrap();
        let (body, _) = read_frame(&encoded).unwrap();
        match decode_frame(body).unwrap() {
            Frame::Buffer(decoded) => assert!(decoded.data.is_empty()),
            other => panic!("expected Buffer, got {:?}", other),
        }
    }
}
