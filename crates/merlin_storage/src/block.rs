//! Tuple blocks: fixed-capacity slabs of tuple slots with a freelist and an
//! occupancy bucket derived from block state.

use std::fmt;

use crate::tuple::Tuple;

/// Number of occupancy buckets partitioning blocks by load factor.
pub const TUPLE_BLOCK_NUM_BUCKETS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block:{}", self.0)
    }
}

/// Stable tuple reference: block plus slot. Compaction frees whole blocks
/// and rewrites index entries, so an address in an index is always live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TupleAddress {
    pub block: BlockId,
    pub slot: u16,
}

/// A slab of tuple slots. `occupied` counts allocated slots, including
/// tuples hidden by a pending-delete flag.
pub struct TupleBlock {
    id: BlockId,
    capacity: usize,
    slots: Vec<Tuple>,
    freelist: Vec<u16>,
    occupied: usize,
    last_compaction_offset: usize,
    /// Bucket this block currently sits in, None while parked (claimed by an
    /// active scan or full).
    pub(crate) bucket: Option<usize>,
}

impl TupleBlock {
    pub fn new(id: BlockId, capacity: usize) -> TupleBlock {
        assert!(capacity >= 2, "a tuple block must hold at least two slots");
        assert!(capacity <= u16::MAX as usize);
        TupleBlock {
            id,
            capacity,
            slots: Vec::new(),
            freelist: Vec::new(),
            occupied: 0,
            last_compaction_offset: 0,
            bucket: None,
        }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn occupied_tuples(&self) -> usize {
        self.occupied
    }

    pub fn has_free_slots(&self) -> bool {
        self.occupied < self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    pub fn load_factor(&self) -> f64 {
        self.occupied as f64 / self.capacity as f64
    }

    pub fn last_compaction_offset(&self) -> usize {
        self.last_compaction_offset
    }

    pub fn set_last_compaction_offset(&mut self, offset: usize) {
        self.last_compaction_offset = offset;
    }

    /// The occupancy bucket this block belongs in, derived from state alone.
    pub fn bucket_index(&self) -> usize {
        (self.occupied * TUPLE_BLOCK_NUM_BUCKETS / self.capacity).min(TUPLE_BLOCK_NUM_BUCKETS - 1)
    }

    /// Grab a free slot: freelist first, then the untouched tail.
    pub fn allocate(&mut self) -> Option<u16> {
        let slot = if let Some(slot) = self.freelist.pop() {
            slot
        } else if self.slots.len() < self.capacity {
            self.slots.push(Tuple::default());
            (self.slots.len() - 1) as u16
        } else {
            return None;
        };
        self.occupied += 1;
        Some(slot)
    }

    /// Return a slot to the freelist. The tuple must already be cleared.
    pub fn free_slot(&mut self, slot: u16) {
        debug_assert!(!self.slots[slot as usize].is_active());
        self.freelist.push(slot);
        self.occupied -= 1;
    }

    pub fn tuple(&self, slot: u16) -> &Tuple {
        &self.slots[slot as usize]
    }

    pub fn tuple_mut(&mut self, slot: u16) -> &mut Tuple {
        &mut self.slots[slot as usize]
    }

    /// Slots that currently hold an allocated tuple, in slot order.
    pub fn occupied_slots(&self) -> Vec<u16> {
        (0..self.slots.len() as u16)
            .filter(|&s| self.slots[s as usize].is_active())
            .collect()
    }
}
