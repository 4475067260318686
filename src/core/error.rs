use std::io;
use thiserror::Error;

use super::domain::{PeerIdentity, TransferId, TransferState};
use crate::protocol::ProtocolError;

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, ChatError>;

/// Top-level error surfaced to callers of the session
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Peer not connected: {0}")]
    PeerNotFound(PeerIdentity),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Session is shutting down")]
    ShuttingDown,
}

/// Errors that are fatal for a single transfer but not for its connection
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("unknown transfer {0}")]
    UnknownTransfer(TransferId),

    #[error("transfer {0} already exists")]
    DuplicateTransfer(TransferId),

    #[error("transfer {id} cannot go from {from:?} to {to:?}")]
    InvalidTransition {
        id: TransferId,
        from: TransferState,
        to: TransferState,
    },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("chunk {sequence} is outside the reorder window starting at {next}")]
    OutOfWindow { sequence: u64, next: u64 },

    #[error("chunk {sequence} was already applied")]
    StaleChunk { sequence: u64 },

    #[error("invalid filename {0:?}")]
    InvalidFilename(String),

    #[error("invalid chunk size {0}")]
    InvalidChunkSize(u32),

    #[error("not a regular file: {0}")]
    NotAFile(String),

    #[error("chunk {sequence} lies past the end of the file")]
    UnexpectedChunk { sequence: u64 },

    #[error("chunk {sequence} carries {actual} bytes, expected {expected}")]
    ChunkLength {
        sequence: u64,
        expected: u64,
        actual: u64,
    },

    #[error("chunk {sequence} failed its digest check")]
    ChunkDigestMismatch { sequence: u64 },

    #[error("peer already has {0} incoming transfers open")]
    TooManyTransfers(usize),

    #[error("connection to peer lost")]
    ConnectionLost,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
