//! The shared work cursor.
//!
//! All channels of one run pull batches from a single [`SharedOffset`].
//! Faster workers simply claim more often, which balances load without a
//! scheduler. The cursor lives inside the orchestrator's job lock; a claim is
//! one uninterrupted read-and-advance.

use serde_json::Value;
use std::sync::Arc;

/// A contiguous slice of the work items handed to one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Index of the first item in the full sequence.
    pub start: usize,
    pub items: Vec<Value>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

/// Cursor over the ordered work items.
#[derive(Debug)]
pub struct SharedOffset {
    items: Arc<[Value]>,
    batch_size: usize,
    position: usize,
    claims: usize,
}

impl SharedOffset {
    /// `batch_size` is clamped to at least one item.
    pub fn new(items: Arc<[Value]>, batch_size: usize) -> Self {
        Self {
            items,
            batch_size: batch_size.max(1),
            position: 0,
            claims: 0,
        }
    }

    /// Claim the next batch and advance the cursor past it.
    ///
    /// Once every item has been claimed this returns an empty batch, which
    /// does not count as a claim.
    pub fn claim_next(&mut self) -> Batch {
        let start = self.position;
        let end = (start + self.batch_size).min(self.items.len());
        let items = self.items[start..end].to_vec();
        if !items.is_empty() {
            self.position = end;
            self.claims += 1;
        }
        Batch { start, items }
    }

    /// Number of non-empty batches claimed so far.
    pub fn claims(&self) -> usize {
        self.claims
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.items.len() - self.position
    }

    pub fn total(&self) -> usize {
        self.items.len()
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }
}
