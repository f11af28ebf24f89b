//! Table indexes: hash and ordered maps from encoded key bytes to tuple
//! addresses. Uniqueness is a declared property enforced on add.

use std::collections::{BTreeMap, HashMap};

use merlin_common::datum::{encode_key, OwnedRow};
use merlin_common::schema::{IndexDef, IndexKind};

use crate::block::TupleAddress;

enum KeyMap {
    Hash(HashMap<Vec<u8>, Vec<TupleAddress>>),
    Ordered(BTreeMap<Vec<u8>, Vec<TupleAddress>>),
}

impl KeyMap {
    fn get(&self, key: &[u8]) -> Option<&Vec<TupleAddress>> {
        match self {
            KeyMap::Hash(m) => m.get(key),
            KeyMap::Ordered(m) => m.get(key),
        }
    }

    fn get_mut(&mut self, key: &[u8]) -> Option<&mut Vec<TupleAddress>> {
        match self {
            KeyMap::Hash(m) => m.get_mut(key),
            KeyMap::Ordered(m) => m.get_mut(key),
        }
    }

    fn entry_push(&mut self, key: Vec<u8>, addr: TupleAddress) {
        match self {
            KeyMap::Hash(m) => m.entry(key).or_default().push(addr),
            KeyMap::Ordered(m) => m.entry(key).or_default().push(addr),
        }
    }

    fn remove(&mut self, key: &[u8]) {
        match self {
            KeyMap::Hash(m) => {
                m.remove(key);
            }
            KeyMap::Ordered(m) => {
                m.remove(key);
            }
        }
    }
}

pub struct TableIndex {
    def: IndexDef,
    map: KeyMap,
}

impl TableIndex {
    pub fn new(def: IndexDef) -> TableIndex {
        let map = match def.kind {
            IndexKind::Hash => KeyMap::Hash(HashMap::new()),
            IndexKind::Ordered => KeyMap::Ordered(BTreeMap::new()),
        };
        TableIndex { def, map }
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn columns(&self) -> &[usize] {
        &self.def.columns
    }

    pub fn is_unique(&self) -> bool {
        self.def.unique
    }

    pub fn is_partial(&self) -> bool {
        self.def.partial
    }

    pub fn def(&self) -> &IndexDef {
        &self.def
    }

    /// Encode the index key projection of a full row image.
    pub fn key_for(&self, row: &OwnedRow) -> Vec<u8> {
        encode_key(row, &self.def.columns)
    }

    /// Add an entry. On a uniqueness violation nothing is inserted and the
    /// address already holding the key is returned.
    pub fn add(&mut self, row: &OwnedRow, addr: TupleAddress) -> Result<(), TupleAddress> {
        let key = self.key_for(row);
        if self.def.unique {
            if let Some(existing) = self.map.get(&key) {
                if let Some(&other) = existing.iter().find(|&&a| a != addr) {
                    return Err(other);
                }
            }
        }
        self.map.entry_push(key, addr);
        Ok(())
    }

    /// Remove the entry for `addr` under this row's key. Returns whether an
    /// entry was removed.
    pub fn delete_entry(&mut self, row: &OwnedRow, addr: TupleAddress) -> bool {
        let key = self.key_for(row);
        if let Some(addrs) = self.map.get_mut(&key) {
            let before = addrs.len();
            addrs.retain(|&a| a != addr);
            let removed = addrs.len() < before;
            if addrs.is_empty() {
                self.map.remove(&key);
            }
            return removed;
        }
        false
    }

    pub fn exists(&self, row: &OwnedRow) -> bool {
        self.map.get(&self.key_for(row)).is_some()
    }

    /// The single address holding this key, for unique indexes.
    pub fn unique_matching_tuple(&self, row: &OwnedRow) -> Option<TupleAddress> {
        debug_assert!(self.def.unique);
        self.map.get(&self.key_for(row)).and_then(|v| v.first().copied())
    }

    pub fn matching_tuples(&self, row: &OwnedRow) -> Vec<TupleAddress> {
        self.map.get(&self.key_for(row)).cloned().unwrap_or_default()
    }

    /// Probe with a row that is already the key projection, in key-column
    /// order. Used when applying a keyed delete from the replication wire.
    pub fn lookup_key_row(&self, key_row: &OwnedRow) -> Option<TupleAddress> {
        let columns: Vec<usize> = (0..key_row.len()).collect();
        let key = encode_key(key_row, &columns);
        self.map.get(&key).and_then(|v| v.first().copied())
    }

    /// True iff the indexed columns differ between the two images.
    pub fn check_for_index_change(&self, old: &OwnedRow, new: &OwnedRow) -> bool {
        self.def
            .columns
            .iter()
            .any(|&c| old.get(c) != new.get(c))
    }

    /// Repoint the entry for an unchanged key from `old_addr` to `new_addr`.
    /// Used by compaction when a tuple moves between blocks.
    pub fn replace_entry_no_key_change(
        &mut self,
        row: &OwnedRow,
        old_addr: TupleAddress,
        new_addr: TupleAddress,
    ) -> bool {
        let key = self.key_for(row);
        if let Some(addrs) = self.map.get_mut(&key) {
            for a in addrs.iter_mut() {
                if *a == old_addr {
                    *a = new_addr;
                    return true;
                }
            }
        }
        false
    }

    /// Addresses in key order. Ordered indexes only.
    pub fn iter_ordered(&self) -> impl Iterator<Item = TupleAddress> + '_ {
        match &self.map {
            KeyMap::Ordered(m) => m.values().flatten().copied(),
            KeyMap::Hash(_) => panic!("iteration in key order requires an ordered index"),
        }
    }

    /// Whether any key column may hold out-of-line storage. Such indexes are
    /// always torn down and re-added on update, matching the engine's
    /// conservative treatment of non-inlined keys.
    pub fn key_uses_out_of_line_memory(&self, column_types: &[merlin_common::types::DataType]) -> bool {
        self.def
            .columns
            .iter()
            .any(|&c| column_types.get(c).is_some_and(|t| t.uses_out_of_line_storage()))
    }

    /// Estimated key width, the ranking criterion for the DR unique index.
    pub fn key_width(&self, column_types: &[merlin_common::types::DataType]) -> usize {
        self.def
            .columns
            .iter()
            .map(|&c| column_types.get(c).map_or(0, |t| t.storage_width()))
            .sum()
    }

    /// CRC32C over the column-index array, identifying this index across
    /// clusters independently of its name.
    pub fn column_crc(&self) -> u32 {
        let mut bytes = Vec::with_capacity(4 * self.def.columns.len());
        for &c in &self.def.columns {
            bytes.extend_from_slice(&(c as u32).to_le_bytes());
        }
        crc32c::crc32c(&bytes)
    }
}
