//! Bounded out-of-order buffer for incoming chunks.

use std::collections::BTreeMap;

use crate::core::TransferError;

/// Holds chunks that arrived ahead of the next expected sequence number and
/// releases them strictly in order. Sequences at or beyond
/// `next + window` are refused.
#[derive(Debug)]
pub struct ReorderBuffer {
    next: u64,
    window: u64,
    pending: BTreeMap<u64, Vec<u8>>,
}

impl ReorderBuffer {
    pub fn new(window: u64) -> Self {
        Self {
            next: 0,
            window: window.max(1),
            pending: BTreeMap::new(),
        }
    }

    /// Next sequence number that will be released.
    pub fn next_sequence(&self) -> u64 {
        self.next
    }

    /// Chunks held back waiting for a gap to fill.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Offer one chunk. Returns the chunks that became contiguous, in order.
    pub fn insert(&mut self, sequence: u64, data: Vec<u8>) -> Result<Vec<Vec<u8>>, TransferError> {
        if sequence < self.next || self.pending.contains_key(&sequence) {
            return Err(TransferError::StaleChunk { sequence });
        }
        if sequence - self.next >= self.window {
            return Err(TransferError::OutOfWindow {
                sequence,
                next: self.next,
            });
        }
        self.pending.insert(sequence, data);

        let mut ready = Vec::new();
        while let Some(data) = self.pending.remove(&self.next) {
            ready.push(data);
            self.next += 1;
        }
        Ok(ready)
    }
}
