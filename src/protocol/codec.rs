//! Framing: 1-byte message type + 4-byte big-endian length + payload.

use thiserror::Error;

/// Type byte plus length prefix.
pub const HEADER_LEN: usize = 5;

/// Default upper bound on a single frame's payload.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024; // 16 MiB

/// Wire message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0x01,
    Ping = 0x02,
    Pong = 0x03,
    Chat = 0x04,
    FileOffer = 0x10,
    FileAccept = 0x11,
    FileReject = 0x12,
    FileChunk = 0x13,
    FileComplete = 0x14,
    SharedListRequest = 0x20,
    SharedList = 0x21,
}

impl MessageType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x01 => MessageType::Hello,
            0x02 => MessageType::Ping,
            0x03 => MessageType::Pong,
            0x04 => MessageType::Chat,
            0x10 => MessageType::FileOffer,
            0x11 => MessageType::FileAccept,
            0x12 => MessageType::FileReject,
            0x13 => MessageType::FileChunk,
            0x14 => MessageType::FileComplete,
            0x20 => MessageType::SharedListRequest,
            0x21 => MessageType::SharedList,
            other => return Err(other),
        })
    }
}

/// One complete frame taken off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageType,
    pub payload: Vec<u8>,
}

/// Outcome of a successful `decode` call.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    Frame(Frame),
    NeedMoreData,
}

/// Corrupt frame conditions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Length prefix above the configured maximum. Nothing is consumed; the
    /// stream cannot be resynchronised.
    #[error("frame of {len} bytes exceeds maximum of {max}")]
    FrameTooLarge { len: u32, max: u32 },

    /// Unrecognised type byte. The frame has been consumed, so the stream is
    /// still aligned on the next frame boundary.
    #[error("unrecognized message type {type_byte:#04x} ({len} byte payload)")]
    UnknownType { type_byte: u8, len: u32 },
}

impl CodecError {
    /// Whether the byte stream is still aligned after this error.
    pub fn is_aligned(&self) -> bool {
        matches!(self, CodecError::UnknownType { .. })
    }
}

/// Encode a single frame.
pub fn encode_frame(
    kind: MessageType,
    payload: &[u8],
    max_frame_size: u32,
) -> Result<Vec<u8>, CodecError> {
    let len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    if len > max_frame_size {
        return Err(CodecError::FrameTooLarge {
            len,
            max: max_frame_size,
        });
    }
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(kind.as_u8());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Incremental decoder. Bytes are appended as they arrive; each `decode`
/// consumes at most one complete frame and keeps the rest buffered.
#[derive(Debug)]
pub struct FrameCodec {
    buffer: Vec<u8>,
    start: usize,
    max_frame_size: u32,
}

impl FrameCodec {
    pub fn new(max_frame_size: u32) -> Self {
        Self {
            buffer: Vec::new(),
            start: 0,
            max_frame_size,
        }
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// Encode a frame with this codec's size limit.
    pub fn encode(&self, kind: MessageType, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
        encode_frame(kind, payload, self.max_frame_size)
    }

    /// Append received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        // Reclaim consumed space before growing.
        if self.start > 0 && self.start >= self.buffer.len() / 2 {
            self.buffer.drain(..self.start);
            self.start = 0;
        }
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len() - self.start
    }

    /// Try to take one frame off the front of the buffer.
    pub fn decode(&mut self) -> Result<Decoded, CodecError> {
        let pending = &self.buffer[self.start..];
        if pending.len() < HEADER_LEN {
            return Ok(Decoded::NeedMoreData);
        }
        let type_byte = pending[0];
        let len = u32::from_be_bytes([pending[1], pending[2], pending[3], pending[4]]);
        if len > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                len,
                max: self.max_frame_size,
            });
        }
        let total = HEADER_LEN + len as usize;
        if pending.len() < total {
            return Ok(Decoded::NeedMoreData);
        }
        let payload = pending[HEADER_LEN..total].to_vec();
        self.start += total;
        if self.start == self.buffer.len() {
            self.buffer.clear();
            self.start = 0;
        }

        match MessageType::try_from(type_byte) {
            Ok(kind) => Ok(Decoded::Frame(Frame { kind, payload })),
            Err(type_byte) => Err(CodecError::UnknownType { type_byte, len }),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}
