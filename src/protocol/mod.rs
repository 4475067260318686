pub mod codec;
pub mod message;

use thiserror::Error;

pub use codec::{
    CodecError, DEFAULT_MAX_FRAME_SIZE, Decoded, Frame, FrameCodec, HEADER_LEN, MessageType,
    encode_frame,
};
pub use message::{FileChunk, FileOffer, Hello, Message};

// Protocol constants and utilities
pub const PROTOCOL_VERSION: u8 = 1;

/// Upper bound bincode may allocate while decoding a single payload.
pub const MAX_PAYLOAD_DECODE: usize = DEFAULT_MAX_FRAME_SIZE as usize;

/// Connection-fatal protocol violations
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("corrupt frame: {0}")]
    Codec(#[from] CodecError),

    #[error("payload encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("payload decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("{extra} unexpected bytes after payload")]
    TrailingBytes { extra: usize },

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("expected HELLO, got {0:?}")]
    UnexpectedFrame(MessageType),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("invalid identity {0:?}")]
    InvalidIdentity(String),

    #[error("peer {0} is already connected")]
    DuplicateIdentity(String),

    #[error("connection limit of {0} peers reached")]
    TooManyPeers(usize),

    #[error("connection closed during handshake")]
    ClosedDuringHandshake,
}
