//! Multiplexing frames for the tunnel connection
//!
//! Every frame is a fixed 9-byte big-endian header followed by the payload:
//!
//! ```text
//! +------+-----------+-----------+-----------------+
//! | type | stream_id |  length   |     payload     |
//! | (1)  |    (4)    |    (4)    |  (length bytes) |
//! +------+-----------+-----------+-----------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Stream identifier, assigned by the proxy
pub type StreamId = u32;

/// Frame types for multiplexing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Open a stream towards a local port
    New,
    /// Raw bytes for an open stream
    Data,
    /// Tear a stream down
    Close,
    /// A type tag this agent does not understand
    Unknown(u8),
}

impl FrameType {
    pub const NEW_TAG: u8 = b'N';
    pub const DATA_TAG: u8 = b'D';
    pub const CLOSE_TAG: u8 = b'C';

    pub fn as_u8(&self) -> u8 {
        match self {
            FrameType::New => Self::NEW_TAG,
            FrameType::Data => Self::DATA_TAG,
            FrameType::Close => Self::CLOSE_TAG,
            FrameType::Unknown(tag) => *tag,
        }
    }
}

impl From<u8> for FrameType {
    fn from(value: u8) -> Self {
        match value {
            Self::NEW_TAG => FrameType::New,
            Self::DATA_TAG => FrameType::Data,
            Self::CLOSE_TAG => FrameType::Close,
            other => FrameType::Unknown(other),
        }
    }
}

/// Frame errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Multiplexed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub stream_id: StreamId,
    pub payload: Bytes,
}

impl Frame {
    /// Frame header size: frame_type (1) + stream_id (4) + length (4) = 9 bytes
    pub const HEADER_SIZE: usize = 9;

    pub fn new(frame_type: FrameType, stream_id: StreamId, payload: Bytes) -> Self {
        Self {
            frame_type,
            stream_id,
            payload,
        }
    }

    /// NEW frame asking the agent to connect to `port` on the device
    pub fn open(stream_id: StreamId, port: u16) -> Self {
        Self::new(
            FrameType::New,
            stream_id,
            Bytes::copy_from_slice(&port.to_be_bytes()),
        )
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(FrameType::Data, stream_id, payload)
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self::new(FrameType::Close, stream_id, Bytes::new())
    }

    /// Local port named by a NEW frame.
    ///
    /// Returns `None` for other frame types or when the payload is not exactly
    /// two bytes.
    pub fn port(&self) -> Option<u16> {
        if self.frame_type != FrameType::New {
            return None;
        }
        let bytes: [u8; 2] = self.payload[..].try_into().ok()?;
        Some(u16::from_be_bytes(bytes))
    }

    /// Total encoded size of this frame
    pub fn encoded_len(&self) -> usize {
        Self::HEADER_SIZE + self.payload.len()
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Append the encoded frame (header + payload) to `dst`
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<(), FrameError> {
        let payload_len = self.payload.len();
        if payload_len > crate::MAX_PAYLOAD_SIZE as usize {
            return Err(FrameError::FrameTooLarge(payload_len));
        }

        dst.reserve(self.encoded_len());
        dst.put_u8(self.frame_type.as_u8());
        dst.put_u32(self.stream_id);
        dst.put_u32(payload_len as u32);
        dst.put_slice(&self.payload);

        Ok(())
    }

    /// Decode one frame from the front of `src`.
    ///
    /// Returns `Ok(None)` and leaves `src` untouched while the header or the
    /// payload is still incomplete.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, FrameError> {
        if src.len() < Self::HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &src[..Self::HEADER_SIZE];
        let frame_type = FrameType::from(header.get_u8());
        let stream_id = header.get_u32();
        let length = header.get_u32();

        if length > crate::MAX_PAYLOAD_SIZE {
            return Err(FrameError::FrameTooLarge(length as usize));
        }

        let total = Self::HEADER_SIZE + length as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(Self::HEADER_SIZE);
        let payload = src.split_to(length as usize).freeze();

        Ok(Some(Self {
            frame_type,
            stream_id,
            payload,
        }))
    }
}

/// Codec for reading and writing frames on the tunnel connection.
///
/// `FramedRead` reports a connection that closes in the middle of a frame as
/// an I/O error, so a truncated frame never reaches the caller.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Frame::decode(src)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode_into(dst)
    }
}
