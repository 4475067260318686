use std::path::PathBuf;

use crate::core::{
    ConnectionId, PeerIdentity, TransferDirection, TransferError, TransferId, TransferProgress,
    TransferState,
};

/// Inputs that drive a transfer's state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferInput {
    Accept,
    Start,
    Complete,
    Fail,
    Cancel,
}

/// Pure transition function for `TransferState`.
pub fn next_state(current: TransferState, input: TransferInput) -> Option<TransferState> {
    use TransferInput::*;
    use TransferState::*;
    match (current, input) {
        (Offered, Accept) => Some(Accepted),
        (Accepted, Start) => Some(InProgress),
        (InProgress, Complete) => Some(Completed),
        (Offered | Accepted | InProgress, Fail) => Some(Failed),
        (Offered | Accepted | InProgress, Cancel) => Some(Cancelled),
        _ => None,
    }
}

/// Bookkeeping for one transfer in either direction.
#[derive(Debug, Clone)]
pub struct FileTransfer {
    pub transfer_id: TransferId,
    pub direction: TransferDirection,
    pub peer: PeerIdentity,
    pub connection: ConnectionId,
    pub filename: String,
    pub total_size: u64,
    pub chunk_size: u32,
    pub bytes_transferred: u64,
    pub state: TransferState,
    /// Source file for sends, final destination for completed receives.
    pub path: Option<PathBuf>,
}

impl FileTransfer {
    pub fn new(
        transfer_id: TransferId,
        direction: TransferDirection,
        peer: PeerIdentity,
        connection: ConnectionId,
        filename: String,
        total_size: u64,
        chunk_size: u32,
    ) -> Self {
        Self {
            transfer_id,
            direction,
            peer,
            connection,
            filename,
            total_size,
            chunk_size,
            bytes_transferred: 0,
            state: TransferState::Offered,
            path: None,
        }
    }

    pub fn apply(&mut self, input: TransferInput) -> Result<TransferState, TransferError> {
        let target = next_state(self.state, input).ok_or_else(|| TransferError::InvalidTransition {
            id: self.transfer_id.clone(),
            from: self.state,
            to: match input {
                TransferInput::Accept => TransferState::Accepted,
                TransferInput::Start => TransferState::InProgress,
                TransferInput::Complete => TransferState::Completed,
                TransferInput::Fail => TransferState::Failed,
                TransferInput::Cancel => TransferState::Cancelled,
            },
        })?;
        self.state = target;
        Ok(target)
    }

    /// Count `len` more bytes, never exceeding `total_size`.
    pub fn record_bytes(&mut self, len: u64) -> Result<(), TransferError> {
        let updated = self.bytes_transferred + len;
        if updated > self.total_size {
            return Err(TransferError::SizeMismatch {
                expected: self.total_size,
                actual: updated,
            });
        }
        self.bytes_transferred = updated;
        Ok(())
    }

    pub fn progress(&self) -> TransferProgress {
        TransferProgress::new(self.bytes_transferred, self.total_size)
    }

    pub fn total_chunks(&self) -> u64 {
        crate::utils::calculate_chunks(self.total_size, self.chunk_size)
    }

    /// Exact length of chunk `sequence`: `chunk_size` except for a shorter
    /// final chunk. `None` when the file has no such chunk.
    pub fn expected_chunk_len(&self, sequence: u64) -> Option<u64> {
        let offset = sequence.checked_mul(self.chunk_size as u64)?;
        if offset >= self.total_size {
            return None;
        }
        Some((self.total_size - offset).min(self.chunk_size as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(total: u64) -> FileTransfer {
        FileTransfer::new(
            TransferId::from_string("t".into()),
            TransferDirection::Receive,
            PeerIdentity::new("bob"),
            ConnectionId(1),
            "a.bin".into(),
            total,
            16,
        )
    }

    #[test]
    fn happy_path() {
        let mut t = transfer(32);
        assert_eq!(t.apply(TransferInput::Accept).unwrap(), TransferState::Accepted);
        assert_eq!(t.apply(TransferInput::Start).unwrap(), TransferState::InProgress);
        t.record_bytes(16).unwrap();
        t.record_bytes(16).unwrap();
        assert_eq!(t.apply(TransferInput::Complete).unwrap(), TransferState::Completed);
        assert_eq!(t.total_chunks(), 2);
        assert!(t.progress().is_complete());
    }

    #[test]
    fn chunk_lengths_follow_the_offer() {
        let t = transfer(40);
        assert_eq!(t.expected_chunk_len(0), Some(16));
        assert_eq!(t.expected_chunk_len(1), Some(16));
        assert_eq!(t.expected_chunk_len(2), Some(8));
        assert_eq!(t.expected_chunk_len(3), None);
        assert_eq!(t.expected_chunk_len(u64::MAX), None);
        assert_eq!(transfer(0).expected_chunk_len(0), None);
    }

    #[test]
    fn terminal_states_are_final() {
        for terminal in [
            TransferState::Completed,
            TransferState::Failed,
            TransferState::Cancelled,
        ] {
            for input in [
                TransferInput::Accept,
                TransferInput::Start,
                TransferInput::Complete,
                TransferInput::Fail,
                TransferInput::Cancel,
            ] {
                assert_eq!(next_state(terminal, input), None);
            }
        }
    }

    #[test]
    fn cannot_complete_before_start() {
        let mut t = transfer(10);
        assert!(matches!(
            t.apply(TransferInput::Complete),
            Err(TransferError::InvalidTransition { .. })
        ));
        assert_eq!(t.state, TransferState::Offered);
        t.apply(TransferInput::Accept).unwrap();
        assert!(t.apply(TransferInput::Complete).is_err());
    }

    #[test]
    fn bytes_never_exceed_total() {
        let mut t = transfer(20);
        t.record_bytes(16).unwrap();
        assert!(matches!(
            t.record_bytes(16),
            Err(TransferError::SizeMismatch { expected: 20, actual: 32 })
        ));
        assert_eq!(t.bytes_transferred, 16);
    }
}
