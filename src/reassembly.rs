//! Ordering of sequence-numbered buffer blocks
//!
//! Buffer blocks may arrive out of order. The reassembler holds early blocks
//! in a sparse window keyed by `sequence - expected` and releases contiguous
//! runs as soon as the gap at the front closes. Every accepted submission is
//! acknowledged, including duplicates, so the publisher's retransmission
//! timer resets. Blocks further than [`MAX_PENDING_BLOCKS`] ahead of the
//! expected sequence are rejected unacknowledged and left for retransmission.

use parking_lot::Mutex;

use crate::types::BufferBlock;
use crate::{Result, SubscriberError};

/// Widest gap the window will hold open ahead of the expected sequence.
pub const MAX_PENDING_BLOCKS: usize = 4096;

/// What happened to a submitted block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDisposition {
    /// Released along with any contiguous successors.
    Delivered,
    /// Held until the preceding gap closes.
    Cached,
    /// Already waiting in the window.
    Duplicate,
    /// Sequence number already delivered.
    Stale,
}

/// Result of one submission.
#[derive(Debug)]
pub struct ReassemblyOutcome {
    pub disposition: BlockDisposition,
    /// Blocks released by this submission, in sequence order.
    pub delivered: Vec<BufferBlock>,
}

impl ReassemblyOutcome {
    fn ignored(disposition: BlockDisposition) -> Self {
        Self { disposition, delivered: Vec::new() }
    }
}

#[derive(Debug, Default)]
struct Window {
    expected: u32,
    slots: Vec<Option<BufferBlock>>,
}

/// Sparse reordering window guarded by a single lock.
#[derive(Debug, Default)]
pub struct BufferBlockReassembler {
    window: Mutex<Window>,
}

impl BufferBlockReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expected_sequence(&self) -> u32 {
        self.window.lock().expected
    }

    /// Number of blocks waiting for a gap to close.
    pub fn pending(&self) -> usize {
        self.window.lock().slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Submits block `sequence_number`.
    ///
    /// `build` runs only for blocks that are neither stale nor duplicate; its
    /// error aborts the submission without touching the window. A sequence
    /// number at or beyond `expected + MAX_PENDING_BLOCKS` is a decode error.
    pub fn submit<F>(&self, sequence_number: u32, build: F) -> Result<ReassemblyOutcome>
    where
        F: FnOnce() -> Result<BufferBlock>,
    {
        let mut window = self.window.lock();

        let offset = i64::from(sequence_number) - i64::from(window.expected);
        if offset < 0 {
            return Ok(ReassemblyOutcome::ignored(BlockDisposition::Stale));
        }
        let index = offset as usize;
        if index >= MAX_PENDING_BLOCKS {
            return Err(SubscriberError::decode_error(
                "buffer block",
                format!(
                    "sequence {sequence_number} is {index} blocks ahead of expected {}",
                    window.expected
                ),
            ));
        }
        if window.slots.get(index).is_some_and(Option::is_some) {
            return Ok(ReassemblyOutcome::ignored(BlockDisposition::Duplicate));
        }

        let block = build()?;
        if window.slots.len() <= index {
            window.slots.resize_with(index + 1, || None);
        }
        window.slots[index] = Some(block);

        let run = window.slots.iter().take_while(|slot| slot.is_some()).count();
        let delivered: Vec<BufferBlock> = window.slots.drain(..run).flatten().collect();
        window.expected = window.expected.wrapping_add(run as u32);

        let disposition = if run > 0 {
            BlockDisposition::Delivered
        } else {
            BlockDisposition::Cached
        };
        Ok(ReassemblyOutcome { disposition, delivered })
    }

    /// Clears the window and restarts at sequence zero.
    pub fn reset(&self) {
        let mut window = self.window.lock();
        window.expected = 0;
        window.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SubscriberError;
    use crate::types::Ticks;
    use bytes::Bytes;
    use proptest::prelude::*;
    use std::sync::Arc;
    use uuid::Uuid;

    fn block(sequence_number: u32) -> BufferBlock {
        BufferBlock {
            signal_id: Uuid::from_u128(7),
            source: Arc::from("PPA"),
            point_id: 7,
            timestamp: Ticks(0),
            payload: Bytes::from(sequence_number.to_be_bytes().to_vec()),
            sequence_number,
        }
    }

    fn submit(reassembler: &BufferBlockReassembler, sequence: u32) -> ReassemblyOutcome {
        reassembler.submit(sequence, || Ok(block(sequence))).unwrap()
    }

    fn sequences(outcome: &ReassemblyOutcome) -> Vec<u32> {
        outcome.delivered.iter().map(|b| b.sequence_number).collect()
    }

    #[test]
    fn out_of_order_arrivals_deliver_in_sequence() {
        let reassembler = BufferBlockReassembler::new();
        let mut delivered = Vec::new();
        for sequence in [2, 0, 1, 3] {
            delivered.extend(sequences(&submit(&reassembler, sequence)));
        }
        assert_eq!(delivered, vec![0, 1, 2, 3]);
        assert_eq!(reassembler.expected_sequence(), 4);
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn delivered_sequence_is_acknowledged_but_not_redelivered() {
        let reassembler = BufferBlockReassembler::new();
        assert_eq!(sequences(&submit(&reassembler, 0)), vec![0]);

        let again = submit(&reassembler, 0);
        assert_eq!(again.disposition, BlockDisposition::Stale);
        assert!(again.delivered.is_empty());
    }

    #[test]
    fn cached_duplicate_is_ignored() {
        let reassembler = BufferBlockReassembler::new();
        assert_eq!(submit(&reassembler, 2).disposition, BlockDisposition::Cached);
        let duplicate = submit(&reassembler, 2);
        assert_eq!(duplicate.disposition, BlockDisposition::Duplicate);
        assert!(duplicate.delivered.is_empty());
        assert_eq!(reassembler.pending(), 1);
    }

    #[test]
    fn gap_withholds_successors_until_filled() {
        let reassembler = BufferBlockReassembler::new();
        assert_eq!(sequences(&submit(&reassembler, 0)), vec![0]);
        assert!(submit(&reassembler, 2).delivered.is_empty());
        assert!(submit(&reassembler, 3).delivered.is_empty());

        let filled = submit(&reassembler, 1);
        assert_eq!(filled.disposition, BlockDisposition::Delivered);
        assert_eq!(sequences(&filled), vec![1, 2, 3]);
    }

    #[test]
    fn build_failure_leaves_window_untouched() {
        let reassembler = BufferBlockReassembler::new();
        let failure = || -> Result<BufferBlock> {
            Err(SubscriberError::decode_error("buffer block", "no cache"))
        };
        assert!(reassembler.submit(0, failure).is_err());
        assert_eq!(reassembler.expected_sequence(), 0);
        assert_eq!(sequences(&submit(&reassembler, 0)), vec![0]);
    }

    #[test]
    fn sequence_beyond_window_is_rejected_without_growing() {
        let reassembler = BufferBlockReassembler::new();
        let mut built = false;
        let result = reassembler.submit(u32::MAX, || {
            built = true;
            Ok(block(u32::MAX))
        });
        assert!(matches!(result, Err(SubscriberError::Decode { .. })));
        assert!(!built);
        assert_eq!(reassembler.pending(), 0);

        let edge = MAX_PENDING_BLOCKS as u32;
        assert!(reassembler.submit(edge, || Ok(block(edge))).is_err());
        assert_eq!(submit(&reassembler, edge - 1).disposition, BlockDisposition::Cached);
        assert_eq!(reassembler.pending(), 1);
        assert_eq!(reassembler.expected_sequence(), 0);
    }

    #[test]
    fn window_bound_follows_the_expected_sequence() {
        let reassembler = BufferBlockReassembler::new();
        submit(&reassembler, 0);
        let edge = MAX_PENDING_BLOCKS as u32;
        assert_eq!(submit(&reassembler, edge).disposition, BlockDisposition::Cached);
    }

    #[test]
    fn reset_restarts_at_zero() {
        let reassembler = BufferBlockReassembler::new();
        submit(&reassembler, 0);
        submit(&reassembler, 5);
        reassembler.reset();
        assert_eq!(reassembler.expected_sequence(), 0);
        assert_eq!(reassembler.pending(), 0);
    }

    proptest! {
        #[test]
        fn any_arrival_order_delivers_each_block_once_in_order(
            order in Just((0u32..24).collect::<Vec<_>>()).prop_shuffle(),
            duplicates in prop::collection::vec(0u32..24, 0..10),
        ) {
            let reassembler = BufferBlockReassembler::new();
            let mut delivered = Vec::new();
            for (i, sequence) in order.iter().enumerate() {
                delivered.extend(sequences(&submit(&reassembler, *sequence)));
                if let Some(dup) = duplicates.get(i) {
                    delivered.extend(sequences(&submit(&reassembler, *dup)));
                }
            }
            prop_assert_eq!(delivered, (0u32..24).collect::<Vec<_>>());
        }
    }
}
