//! Binary frame envelope carried on a connection's byte stream.
//!
//! Wire layout (big-endian):
//!
//! ```text
//! +------+------------+--------------+-----------------+
//! | type | channel id | length (i32) | payload bytes   |
//! |  u8  |    u16     |              | `length` bytes  |
//! +------+------------+--------------+-----------------+
//! ```
//!
//! Frames carry no message boundaries: a channel's bytes may be split across
//! any number of `ChannelData` frames and are reassembled as a plain stream.

use std::borrow::Cow;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::LinkError;

/// Size of the fixed frame header.
pub const HEADER_SIZE: usize = 7;

/// Default upper bound for a single frame payload (512 KiB).
pub const MAX_FRAME_SIZE: usize = 512 * 1024;

/// Frame kinds. The discriminants are the wire values and must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    ChannelData = 0,
    Disconnect = 1,
    Debug = 2,
    Heartbeat = 3,
}

impl TryFrom<u8> for FrameType {
    type Error = LinkError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::ChannelData),
            1 => Ok(Self::Disconnect),
            2 => Ok(Self::Debug),
            3 => Ok(Self::Heartbeat),
            other => Err(LinkError::UnknownFrameType(other)),
        }
    }
}

/// One unit of transmission on a [`Connection`](crate::Connection).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameType,
    pub channel: u16,
    pub payload: Bytes,
}

impl Frame {
    /// A slice of channel `channel`'s byte stream.
    pub fn data(channel: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameType::ChannelData,
            channel,
            payload: payload.into(),
        }
    }

    /// Courtesy notice that the sender is going away.
    pub fn disconnect() -> Self {
        Self {
            kind: FrameType::Disconnect,
            channel: 0,
            payload: Bytes::new(),
        }
    }

    /// Free-form diagnostic text, logged by the receiver.
    pub fn debug(text: &str) -> Self {
        Self {
            kind: FrameType::Debug,
            channel: 0,
            payload: Bytes::copy_from_slice(text.as_bytes()),
        }
    }

    /// Liveness beacon advertising the sender's heartbeat period.
    pub fn heartbeat(period: Duration) -> Self {
        let millis = u32::try_from(period.as_millis()).unwrap_or(u32::MAX);
        Self {
            kind: FrameType::Heartbeat,
            channel: 0,
            payload: Bytes::copy_from_slice(&millis.to_be_bytes()),
        }
    }

    /// The period advertised by a heartbeat frame.
    pub fn heartbeat_period(&self) -> Option<Duration> {
        if self.kind != FrameType::Heartbeat {
            return None;
        }
        let raw: [u8; 4] = self.payload.as_ref().try_into().ok()?;
        Some(Duration::from_millis(u64::from(u32::from_be_bytes(raw))))
    }

    /// The text of a debug frame.
    pub fn debug_text(&self) -> Option<Cow<'_, str>> {
        (self.kind == FrameType::Debug).then(|| String::from_utf8_lossy(&self.payload))
    }

    /// Bytes this frame occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Append the encoded frame to `dst`.
    pub fn encode(&self, dst: &mut BytesMut, max_payload: usize) -> Result<(), LinkError> {
        let length = self.payload.len();
        if length > max_payload || length > i32::MAX as usize {
            return Err(LinkError::FrameTooLarge {
                length: length as i64,
                max: max_payload,
            });
        }
        dst.reserve(self.encoded_len());
        dst.put_u8(self.kind as u8);
        dst.put_u16(self.channel);
        dst.put_i32(length as i32);
        dst.put_slice(&self.payload);
        Ok(())
    }

    /// Decode one frame from the front of `src`.
    ///
    /// Returns `Ok(None)` without touching `src` when the buffer does not yet
    /// hold a complete frame. On success the frame's bytes are split off the
    /// front of `src`.
    pub fn try_decode(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>, LinkError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let kind = FrameType::try_from(src[0])?;
        let channel = u16::from_be_bytes([src[1], src[2]]);
        let length = i32::from_be_bytes([src[3], src[4], src[5], src[6]]);
        if length < 0 || length as usize > max_payload {
            return Err(LinkError::FrameTooLarge {
                length: i64::from(length),
                max: max_payload,
            });
        }

        let total = HEADER_SIZE + length as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(length as usize).freeze();
        Ok(Some(Frame {
            kind,
            channel,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(frame: &Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf, MAX_FRAME_SIZE).unwrap();
        buf
    }

    #[test]
    fn header_layout_is_big_endian() {
        let buf = encoded(&Frame::data(0x0102, vec![0xAA, 0xBB]));
        assert_eq!(&buf[..], &[0, 0x01, 0x02, 0, 0, 0, 2, 0xAA, 0xBB]);
    }

    #[test]
    fn decodes_what_was_encoded() {
        let frame = Frame::data(7, b"hello".to_vec());
        let mut buf = encoded(&frame);
        let decoded = Frame::try_decode(&mut buf, MAX_FRAME_SIZE).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn truncated_buffer_is_left_untouched() {
        let full = encoded(&Frame::data(3, vec![9u8; 100]));
        for cut in [0, 1, HEADER_SIZE - 1, HEADER_SIZE, full.len() - 1] {
            let mut partial = BytesMut::from(&full[..cut]);
            assert!(Frame::try_decode(&mut partial, MAX_FRAME_SIZE).unwrap().is_none());
            assert_eq!(&partial[..], &full[..cut], "cut at {cut} consumed bytes");
        }
    }

    #[test]
    fn fragments_reassemble_across_reads() {
        let frame = Frame::data(1, vec![5u8; 40]);
        let full = encoded(&frame);
        let mut buf = BytesMut::new();
        let mut decoded = None;
        for byte in full.iter() {
            buf.put_u8(*byte);
            if let Some(f) = Frame::try_decode(&mut buf, MAX_FRAME_SIZE).unwrap() {
                decoded = Some(f);
            }
        }
        assert_eq!(decoded, Some(frame));
    }

    #[test]
    fn decodes_back_to_back_frames_one_at_a_time() {
        let mut buf = encoded(&Frame::heartbeat(Duration::from_secs(60)));
        buf.extend_from_slice(&encoded(&Frame::data(2, b"x".to_vec())));
        buf.extend_from_slice(&encoded(&Frame::disconnect()));

        let kinds: Vec<FrameType> = std::iter::from_fn(|| {
            Frame::try_decode(&mut buf, MAX_FRAME_SIZE).unwrap().map(|f| f.kind)
        })
        .collect();
        assert_eq!(
            kinds,
            vec![FrameType::Heartbeat, FrameType::ChannelData, FrameType::Disconnect]
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn rejects_unknown_type() {
        let mut buf = BytesMut::from(&[9u8, 0, 0, 0, 0, 0, 0][..]);
        assert!(matches!(
            Frame::try_decode(&mut buf, MAX_FRAME_SIZE),
            Err(LinkError::UnknownFrameType(9))
        ));
    }

    #[test]
    fn rejects_oversized_and_negative_lengths() {
        let mut big = BytesMut::new();
        big.put_u8(0);
        big.put_u16(1);
        big.put_i32(MAX_FRAME_SIZE as i32 + 1);
        assert!(matches!(
            Frame::try_decode(&mut big, MAX_FRAME_SIZE),
            Err(LinkError::FrameTooLarge { .. })
        ));

        let mut negative = BytesMut::new();
        negative.put_u8(0);
        negative.put_u16(1);
        negative.put_i32(-4);
        assert!(Frame::try_decode(&mut negative, MAX_FRAME_SIZE).is_err());

        let frame = Frame::data(1, vec![0u8; 17]);
        assert!(frame.encode(&mut BytesMut::new(), 16).is_err());
    }

    #[test]
    fn heartbeat_carries_period() {
        let frame = Frame::heartbeat(Duration::from_millis(1500));
        let mut buf = encoded(&frame);
        let decoded = Frame::try_decode(&mut buf, MAX_FRAME_SIZE).unwrap().unwrap();
        assert_eq!(decoded.heartbeat_period(), Some(Duration::from_millis(1500)));
        assert_eq!(Frame::data(0, vec![1]).heartbeat_period(), None);
    }

    #[test]
    fn debug_text_roundtrip() {
        let frame = Frame::debug("runner warming up");
        assert_eq!(frame.debug_text().as_deref(), Some("runner warming up"));
        assert_eq!(Frame::disconnect().debug_text(), None);
    }
}
