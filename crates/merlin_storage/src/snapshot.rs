//! Snapshot streamer seam. A streamer iterates live tuples for snapshotting
//! or recovery while the table keeps mutating; the table reports every event
//! that could disturb the iteration.

use crate::block::{BlockId, TupleAddress};

/// External collaborator notified of storage events during an active scan.
pub trait TableStreamer: Send {
    /// A tuple became visible. Returns true when the streamer took charge of
    /// the dirty bit; otherwise the table clears it.
    fn notify_tuple_insert(&mut self, addr: TupleAddress) -> bool {
        let _ = addr;
        false
    }

    /// A tuple is being reclaimed. Returns false to defer physical
    /// reclamation until the scan has passed the tuple; the table then marks
    /// it pending-delete and the streamer reclaims it later.
    fn notify_tuple_delete(&mut self, addr: TupleAddress) -> bool {
        let _ = addr;
        true
    }

    fn notify_tuple_update(&mut self, addr: TupleAddress) {
        let _ = addr;
    }

    /// Compaction moved a tuple between blocks.
    fn notify_tuple_movement(&mut self, from: TupleAddress, to: TupleAddress) {
        let _ = (from, to);
    }

    /// Compaction emptied and released a block the scan had claim to.
    fn notify_block_compacted_away(&mut self, block: BlockId) {
        let _ = block;
    }

    /// Forced compaction defers entirely while a recovery stream is active.
    fn has_recovery_stream(&self) -> bool {
        false
    }
}
