//! Fixed-capacity token batch
//!
//! Parallel arrays (token, position, sequence-id count, sequence ids, logits
//! flag) allocated once at creation. The batch is cleared and rewritten in
//! place between decodes and never grows: a write past capacity is rejected.

use thiserror::Error;
use tracing::warn;

use crate::inference::runtime::TokenId;

/// Default number of token slots, matching the context's `n_batch`
pub const DEFAULT_BATCH_CAPACITY: usize = 512;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BatchError {
    #[error("Batch capacity exceeded ({capacity} tokens)")]
    CapacityExceeded { capacity: usize },
}

/// One occupied row of a [`TokenBatch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry<'a> {
    pub token: TokenId,
    pub pos: i32,
    pub seq_ids: &'a [i32],
    pub logits: bool,
}

#[derive(Debug)]
pub struct TokenBatch {
    tokens: Vec<TokenId>,
    positions: Vec<i32>,
    n_seq_id: Vec<usize>,
    /// `capacity * n_seq_max` slots, row-major
    seq_ids: Vec<i32>,
    logits: Vec<bool>,
    n_seq_max: usize,
    n_tokens: usize,
}

/// Sequence ids per slot and total seq-id slots for a batch of `capacity`.
/// Falls back to one id per slot when `capacity * n_seq_max` overflows.
fn seq_id_layout(capacity: usize, n_seq_max: usize) -> (usize, usize) {
    let n_seq_max = n_seq_max.max(1);
    match capacity.checked_mul(n_seq_max) {
        Some(slots) => (n_seq_max, slots),
        None => {
            warn!(
                "Batch of {} slots cannot hold {} sequence ids each, using 1",
                capacity, n_seq_max
            );
            (1, capacity)
        }
    }
}

impl TokenBatch {
    /// Allocates a batch with `capacity` slots and room for `n_seq_max`
    /// sequence ids per slot (at least one).
    pub fn new(capacity: usize, n_seq_max: usize) -> Self {
        let (n_seq_max, seq_slots) = seq_id_layout(capacity, n_seq_max);
        Self {
            tokens: vec![0; capacity],
            positions: vec![0; capacity],
            n_seq_id: vec![0; capacity],
            seq_ids: vec![0; seq_slots],
            logits: vec![false; capacity],
            n_seq_max,
            n_tokens: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.tokens.len()
    }

    pub fn n_seq_max(&self) -> usize {
        self.n_seq_max
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.n_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.n_tokens == 0
    }

    /// Resets occupancy. Backing storage is kept.
    pub fn clear(&mut self) {
        self.n_tokens = 0;
    }

    /// Writes a token into slot `len()`.
    ///
    /// Sequence ids beyond `n_seq_max` are ignored.
    pub fn push(
        &mut self,
        token: TokenId,
        pos: i32,
        seq_ids: &[i32],
        logits: bool,
    ) -> Result<(), BatchError> {
        let index = self.n_tokens;
        if index >= self.capacity() {
            tracing::warn!("Batch capacity exceeded! {} >= {}", index, self.capacity());
            return Err(BatchError::CapacityExceeded {
                capacity: self.capacity(),
            });
        }

        let n_seq = seq_ids.len().min(self.n_seq_max);
        let row = index * self.n_seq_max;

        self.tokens[index] = token;
        self.positions[index] = pos;
        self.n_seq_id[index] = n_seq;
        self.seq_ids[row..row + n_seq].copy_from_slice(&seq_ids[..n_seq]);
        self.logits[index] = logits;

        self.n_tokens += 1;
        Ok(())
    }

    /// Returns the occupied slot at `index`
    pub fn get(&self, index: usize) -> Option<BatchEntry<'_>> {
        if index >= self.n_tokens {
            return None;
        }
        let row = index * self.n_seq_max;
        Some(BatchEntry {
            token: self.tokens[index],
            pos: self.positions[index],
            seq_ids: &self.seq_ids[row..row + self.n_seq_id[index]],
            logits: self.logits[index],
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = BatchEntry<'_>> + '_ {
        (0..self.n_tokens).filter_map(move |i| self.get(i))
    }
}
