//! # Module Status: PRODUCTION
//! Block-paged persistent tables — the primary storage for MerlinDB OLTP.
//!
//! ## Golden Path (OLTP write)
//! ```text
//! Executor DML (single thread per partition)
//!   → PersistentTable.insert / update / delete
//!     → DR stream append (mark captured)      [before any mutation]
//!     → tuple storage + index maintenance
//!     → view + snapshot-streamer notification
//!     → undo action registered with the mark
//! abort  → undo actions reversed, DR rolled back to each mark
//! commit → undo released, DR transaction sealed
//! ```
//!
//! ## Prohibited Patterns
//! - Mutating storage before the DR append → a failed append strands bytes
//! - Freeing a slot with a pending flag set → undo/snapshot lose the tuple
//! - Moving a tuple pinned by undo → the undo action's address goes stale

use std::collections::{BTreeMap, BTreeSet, HashSet};

use merlin_common::config::StorageConfig;
use merlin_common::datum::{Datum, OwnedRow};
use merlin_common::error::{MerlinResult, StorageError};
use merlin_common::schema::{IndexDef, TableSchema};
use merlin_common::types::DataType;
use merlin_dr::{DrRecordType, INVALID_DR_MARK};

use crate::block::{BlockId, TupleAddress, TupleBlock, TUPLE_BLOCK_NUM_BUCKETS};
use crate::context::ExecContext;
use crate::hash::hash_partition_value;
use crate::index::TableIndex;
use crate::snapshot::TableStreamer;
use crate::tuple::Tuple;
use crate::undo::{DrMark, UndoAction};
use crate::view::ViewHandle;

/// How a lookup compares the probe row against stored tuples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupMode {
    /// Visible columns only; hidden columns never participate.
    ByValues,
    /// Hidden columns participate when the probe carries them.
    ForDr,
    /// Exact storage-image equality, for relocating a slot during undo.
    ForUndo,
}

pub struct PersistentTable {
    schema: TableSchema,
    allow_nulls: Vec<bool>,
    column_types: Vec<DataType>,
    slots_per_block: usize,
    compaction_load_threshold: f64,

    blocks: BTreeMap<BlockId, TupleBlock>,
    next_block_id: u32,
    blocks_with_space: BTreeSet<BlockId>,
    blocks_not_pending_snapshot: HashSet<BlockId>,
    blocks_pending_snapshot: HashSet<BlockId>,
    buckets_not_pending: Vec<BTreeSet<BlockId>>,
    buckets_pending: Vec<BTreeSet<BlockId>>,
    /// Blocks claimed by an active scan; excluded from bucketing until the
    /// scan returns them.
    scan_parked: HashSet<BlockId>,

    indexes: Vec<TableIndex>,
    primary_key: Option<usize>,
    views: Vec<ViewHandle>,
    streamer: Option<Box<dyn TableStreamer>>,

    /// Occupied tuples, including ones hidden by a pending-delete flag.
    tuple_count: usize,
    tuples_pinned_by_undo: usize,
    invisible_pending_delete_count: usize,
    failed_compaction_count: u64,

    /// Cached DR key index: outer None = not computed since the last catalog
    /// change, inner None = no eligible unique index.
    smallest_unique_index: Option<Option<(Vec<usize>, u32)>>,
}

impl PersistentTable {
    pub fn new(schema: TableSchema, config: &StorageConfig) -> PersistentTable {
        let slots_per_block = (config.table_block_size / schema.estimated_tuple_width())
            .clamp(2, u16::MAX as usize);
        let allow_nulls = schema.allow_nulls();
        let column_types: Vec<DataType> = schema.columns.iter().map(|c| c.data_type).collect();
        let indexes: Vec<TableIndex> = schema.indexes.iter().cloned().map(TableIndex::new).collect();
        let primary_key = schema.primary_key;
        if let Some(pk) = primary_key {
            assert!(pk < indexes.len(), "primary key references a missing index");
            assert!(indexes[pk].is_unique(), "primary key index must be unique");
        }
        PersistentTable {
            schema,
            allow_nulls,
            column_types,
            slots_per_block,
            compaction_load_threshold: config.compaction_load_threshold,
            blocks: BTreeMap::new(),
            next_block_id: 0,
            blocks_with_space: BTreeSet::new(),
            blocks_not_pending_snapshot: HashSet::new(),
            blocks_pending_snapshot: HashSet::new(),
            buckets_not_pending: (0..TUPLE_BLOCK_NUM_BUCKETS).map(|_| BTreeSet::new()).collect(),
            buckets_pending: (0..TUPLE_BLOCK_NUM_BUCKETS).map(|_| BTreeSet::new()).collect(),
            scan_parked: HashSet::new(),
            indexes,
            primary_key,
            views: Vec::new(),
            streamer: None,
            tuple_count: 0,
            tuples_pinned_by_undo: 0,
            invisible_pending_delete_count: 0,
            failed_compaction_count: 0,
            smallest_unique_index: None,
        }
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn dr_handle(&self) -> i64 {
        self.schema.signature.dr_handle()
    }

    pub fn active_tuple_count(&self) -> usize {
        self.tuple_count
    }

    pub fn visible_tuple_count(&self) -> usize {
        self.tuple_count - self.invisible_pending_delete_count
    }

    pub fn tuples_pinned_by_undo(&self) -> usize {
        self.tuples_pinned_by_undo
    }

    pub fn allocated_slot_count(&self) -> usize {
        self.blocks.len() * self.slots_per_block
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn slots_per_block(&self) -> usize {
        self.slots_per_block
    }

    pub fn failed_compaction_count(&self) -> u64 {
        self.failed_compaction_count
    }

    pub fn is_empty_table(&self) -> bool {
        self.tuple_count == 0
    }

    /// Load factor of the only block, for the truncate cutoff heuristic.
    pub fn single_block_load_factor(&self) -> Option<f64> {
        if self.blocks.len() == 1 {
            self.blocks.values().next().map(|b| b.load_factor())
        } else {
            None
        }
    }

    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    pub fn add_view(&mut self, view: ViewHandle) {
        self.views.push(view);
    }

    /// Detach all views, for transfer onto a fresh table during truncate.
    pub fn take_views(&mut self) -> Vec<ViewHandle> {
        std::mem::take(&mut self.views)
    }

    pub fn set_streamer(&mut self, streamer: Box<dyn TableStreamer>) {
        self.streamer = Some(streamer);
    }

    pub fn clear_streamer(&mut self) {
        self.streamer = None;
    }

    pub fn has_streamer(&self) -> bool {
        self.streamer.is_some()
    }

    pub fn index_count(&self) -> usize {
        self.indexes.len()
    }

    pub fn index(&self, i: usize) -> &TableIndex {
        &self.indexes[i]
    }

    pub fn primary_key_index(&self) -> Option<&TableIndex> {
        self.primary_key.map(|i| &self.indexes[i])
    }

    pub fn tuple(&self, addr: TupleAddress) -> &Tuple {
        self.blocks[&addr.block].tuple(addr.slot)
    }

    /// Whether this address still refers to a slot of this table. False for
    /// addresses into a table swapped out by truncate.
    pub fn has_address(&self, addr: TupleAddress) -> bool {
        self.blocks.contains_key(&addr.block)
    }

    /// Add an index and backfill it from the current rows. Invalidates the
    /// cached DR key index.
    pub fn add_index(&mut self, def: IndexDef, primary_key: bool) -> MerlinResult<()> {
        let mut index = TableIndex::new(def);
        for (addr, tuple) in self.collect_visible() {
            if let Err(conflict) = index.add(&tuple, addr) {
                let conflict_row = self.tuple(conflict).image();
                return Err(StorageError::UniqueViolation {
                    table: self.schema.name.clone(),
                    index: index.name().to_string(),
                    conflict: Box::new(conflict_row),
                }
                .into());
            }
        }
        self.indexes.push(index);
        if primary_key {
            self.primary_key = Some(self.indexes.len() - 1);
        }
        self.smallest_unique_index = None;
        Ok(())
    }

    /// Visible tuples as (address, full image) pairs, in storage order.
    pub fn collect_visible(&self) -> Vec<(TupleAddress, OwnedRow)> {
        let mut out = Vec::with_capacity(self.visible_tuple_count());
        for (&bid, block) in &self.blocks {
            for slot in block.occupied_slots() {
                let t = block.tuple(slot);
                if t.is_visible() {
                    out.push((TupleAddress { block: bid, slot }, t.image()));
                }
            }
        }
        out
    }

    // ── DR key selection ─────────────────────────────────────────────────

    /// The unique index DR keys delete/update before-images on: smallest
    /// key width among unique non-partial indexes, name as tiebreaker, with
    /// its column-identity CRC. Active-active always streams full rows, so
    /// the answer there is None.
    pub fn get_unique_index_for_dr(&mut self, active_active: bool) -> Option<(Vec<usize>, u32)> {
        if active_active {
            return None;
        }
        if self.smallest_unique_index.is_none() {
            self.compute_smallest_unique_index();
        }
        self.smallest_unique_index.clone().unwrap_or(None)
    }

    fn compute_smallest_unique_index(&mut self) {
        let mut best: Option<usize> = None;
        let mut best_width = usize::MAX;
        let mut best_name = String::new();
        for (i, index) in self.indexes.iter().enumerate() {
            if !index.is_unique() || index.is_partial() {
                continue;
            }
            let width = index.key_width(&self.column_types);
            let better = match best {
                None => true,
                Some(b) => {
                    let current = &self.indexes[b];
                    (current.key_uses_out_of_line_memory(&self.column_types)
                        && !index.key_uses_out_of_line_memory(&self.column_types))
                        || width < best_width
                        || (width == best_width && index.name() < best_name.as_str())
                }
            };
            if better {
                best = Some(i);
                best_width = width;
                best_name = index.name().to_string();
            }
        }
        self.smallest_unique_index = Some(best.map(|i| {
            let index = &self.indexes[i];
            (index.columns().to_vec(), index.column_crc())
        }));
    }

    /// The unique index whose column-identity CRC matches, for applying a
    /// keyed delete from the wire.
    pub fn index_by_column_crc(&self, crc: u32) -> Option<&TableIndex> {
        self.indexes
            .iter()
            .find(|i| i.is_unique() && !i.is_partial() && i.column_crc() == crc)
    }

    // ── Insert ───────────────────────────────────────────────────────────

    /// Regular insert: constraint checks, DR emission, undo registration.
    pub fn insert_tuple(&mut self, ctx: &mut ExecContext, source: &OwnedRow) -> MerlinResult<TupleAddress> {
        self.insert_persistent_tuple(ctx, source, true)
    }

    /// `fallible = false` bypasses constraints, DR and undo; reserved for
    /// tuple migration and recovery loads.
    pub fn insert_persistent_tuple(
        &mut self,
        ctx: &mut ExecContext,
        source: &OwnedRow,
        fallible: bool,
    ) -> MerlinResult<TupleAddress> {
        if fallible && self.visible_tuple_count() as i64 >= self.schema.tuple_limit {
            return Err(StorageError::RowLimitExceeded {
                table: self.schema.name.clone(),
                limit: self.schema.tuple_limit,
            }
            .into());
        }

        let addr = self.next_free_tuple();
        let mut image = self.full_image_from_source(source);

        if fallible {
            if let Some(violated) = self.first_null_violation(&image) {
                self.abandon_slot(addr);
                return Err(StorageError::NotNullViolation {
                    table: self.schema.name.clone(),
                    column: self.schema.columns[violated].name.clone(),
                }
                .into());
            }
        }

        if let Some(ts_col) = self.schema.dr_timestamp_column_index() {
            // Inserts only stamp a timestamp the source did not carry.
            if image[ts_col].is_null() {
                image[ts_col] = Datum::BigInt(ctx.current_dr_timestamp().0);
            }
        }

        // Write to the DR stream before everything else so nothing is left
        // in the indexes if the append fails.
        let image_row = OwnedRow::new(image);
        let dr_mark = if fallible {
            match self.emit_dr_tuple(ctx, &image_row, DrRecordType::Insert) {
                Ok(mark) => mark,
                Err(e) => {
                    self.abandon_slot(addr);
                    return Err(e);
                }
            }
        } else {
            None
        };

        {
            let tuple = self.tuple_mut(addr);
            tuple.set_values(image_row.values.clone());
            tuple.set_active(true);
            tuple.set_pending_delete(false);
            tuple.set_pending_delete_on_undo_release(false);
        }

        // Inserts never dirty a tuple, but a scan over the freelist area may
        // still need the dirty bit; the streamer decides.
        let streamer_managed = match &mut self.streamer {
            Some(s) => s.notify_tuple_insert(addr),
            None => false,
        };
        if !streamer_managed {
            self.tuple_mut(addr).set_dirty(false);
        }

        if let Err((inserted, conflict)) = self.try_insert_on_all_indexes(&image_row, addr) {
            for i in 0..inserted {
                self.indexes[i].delete_entry(&image_row, addr);
            }
            let conflict_row = self.tuple(conflict).image();
            let index_name = self.indexes[inserted].name().to_string();
            self.rollback_dr(ctx, dr_mark);
            self.tuple_mut(addr).set_active(false);
            self.abandon_slot(addr);
            return Err(StorageError::UniqueViolation {
                table: self.schema.name.clone(),
                index: index_name,
                conflict: Box::new(conflict_row),
            }
            .into());
        }

        if fallible && ctx.undo.has_active_quantum() {
            ctx.undo.register(UndoAction::Insert {
                table_handle: self.dr_handle(),
                image: image_row.clone(),
                dr_mark,
            });
        }

        let visible = image_row.prefix(self.schema.column_count());
        for view in &self.views {
            view.lock().on_tuple_insert(&visible);
        }
        Ok(addr)
    }

    // ── Update ───────────────────────────────────────────────────────────

    /// Update through every index.
    pub fn update_tuple(
        &mut self,
        ctx: &mut ExecContext,
        target: TupleAddress,
        source: &OwnedRow,
    ) -> MerlinResult<()> {
        let all: Vec<usize> = (0..self.indexes.len()).collect();
        self.update_tuple_with_specific_indexes(ctx, target, source, &all, true, true)
    }

    /// Update with the subset of indexes whose keys might change, the
    /// optimization for callers that already know.
    pub fn update_tuple_with_specific_indexes(
        &mut self,
        ctx: &mut ExecContext,
        target: TupleAddress,
        source: &OwnedRow,
        indexes_to_update: &[usize],
        fallible: bool,
        update_dr_timestamp: bool,
    ) -> MerlinResult<()> {
        let old_image = self.tuple(target).image();
        let mut new_values = self.full_image_from_source(source);
        // Hidden columns the caller did not set carry over from the target.
        for i in self.schema.column_count()..new_values.len() {
            if new_values[i].is_null() {
                new_values[i] = old_image.values[i].clone();
            }
        }
        if update_dr_timestamp {
            if let Some(ts_col) = self.schema.dr_timestamp_column_index() {
                new_values[ts_col] = Datum::BigInt(ctx.current_dr_timestamp().0);
            }
        }
        let new_image = OwnedRow::new(new_values);

        if fallible {
            for &i in indexes_to_update {
                let index = &self.indexes[i];
                if !index.is_unique() || !index.check_for_index_change(&old_image, &new_image) {
                    continue;
                }
                if let Some(existing) = index
                    .matching_tuples(&new_image)
                    .into_iter()
                    .find(|&a| a != target)
                {
                    let conflict_row = self.tuple(existing).image();
                    return Err(StorageError::UniqueViolation {
                        table: self.schema.name.clone(),
                        index: index.name().to_string(),
                        conflict: Box::new(conflict_row),
                    }
                    .into());
                }
            }
            if let Some(violated) = self.first_null_violation(&new_image.values) {
                return Err(StorageError::NotNullViolation {
                    table: self.schema.name.clone(),
                    column: self.schema.columns[violated].name.clone(),
                }
                .into());
            }
        }

        // DR before any mutation so a failed append leaves no half-updated
        // tuple behind.
        let dr_mark = if fallible {
            self.emit_dr_update(ctx, &old_image, &new_image)?
        } else {
            None
        };

        if let Some(s) = &mut self.streamer {
            s.notify_tuple_update(target);
        }

        let mut some_index_updated = false;
        let mut index_reverted = vec![false; self.indexes.len()];
        for &i in indexes_to_update {
            let index = &self.indexes[i];
            if !index.key_uses_out_of_line_memory(&self.column_types)
                && !index.check_for_index_change(&old_image, &new_image)
            {
                continue;
            }
            some_index_updated = true;
            index_reverted[i] = true;
            if !self.indexes[i].delete_entry(&old_image, target) {
                panic!(
                    "failed to remove tuple from index {} of table {} during update",
                    self.indexes[i].name(),
                    self.schema.name
                );
            }
        }

        // Views observe the update as delete-then-insert; the tuple is hidden
        // from view scans while the delete is processed.
        let old_visible = old_image.prefix(self.schema.column_count());
        self.tuple_mut(target).set_pending_delete(true);
        for view in &self.views {
            view.lock().on_tuple_delete(&old_visible);
        }
        self.tuple_mut(target).set_pending_delete(false);

        // The in-place write. The dirty bit survives the copy.
        {
            let tuple = self.tuple_mut(target);
            let dirty = tuple.is_dirty();
            tuple.set_values(new_image.values.clone());
            tuple.set_dirty(dirty);
        }

        if fallible && ctx.undo.has_active_quantum() {
            ctx.undo.register(UndoAction::Update {
                table_handle: self.dr_handle(),
                before: old_image.clone(),
                after: new_image.clone(),
                indexes_updated: some_index_updated,
                dr_mark,
            });
        }

        for (i, reverted) in index_reverted.iter().enumerate() {
            if !reverted {
                continue;
            }
            if self.indexes[i].add(&new_image, target).is_err() {
                panic!(
                    "failed to insert updated tuple into index {} of table {}",
                    self.indexes[i].name(),
                    self.schema.name
                );
            }
        }

        let new_visible = new_image.prefix(self.schema.column_count());
        for view in &self.views {
            view.lock().on_tuple_insert(&new_visible);
        }
        Ok(())
    }

    // ── Delete ───────────────────────────────────────────────────────────

    pub fn delete_tuple(
        &mut self,
        ctx: &mut ExecContext,
        target: TupleAddress,
        fallible: bool,
    ) -> MerlinResult<()> {
        assert!(self.tuple(target).is_active(), "cannot delete an inactive tuple");
        let image = self.tuple(target).image();

        // DR first so nothing is forgotten if the append fails.
        let dr_mark = if fallible {
            self.emit_dr_tuple(ctx, &image, DrRecordType::Delete)?
        } else {
            None
        };

        for index in &mut self.indexes {
            if !index.delete_entry(&image, target) {
                panic!(
                    "failed to delete tuple from index {} of table {}",
                    index.name(),
                    self.schema.name
                );
            }
        }

        let visible = image.prefix(self.schema.column_count());
        self.tuple_mut(target).set_pending_delete(true);
        for view in &self.views {
            view.lock().on_tuple_delete(&visible);
        }
        self.tuple_mut(target).set_pending_delete(false);

        if fallible && ctx.undo.has_active_quantum() {
            self.tuple_mut(target).set_pending_delete_on_undo_release(true);
            self.tuples_pinned_by_undo += 1;
            self.invisible_pending_delete_count += 1;
            ctx.undo.register(UndoAction::Delete {
                table_handle: self.dr_handle(),
                addr: target,
                dr_mark,
            });
            return Ok(());
        }

        // Infallibility or no active undo: there is no undo, there is only do.
        self.delete_tuple_finalize(target);
        Ok(())
    }

    /// Common tail of a physical delete: a background scan may defer the
    /// reclaim, otherwise the slot is freed.
    fn delete_tuple_finalize(&mut self, target: TupleAddress) {
        let deferred = match &mut self.streamer {
            Some(s) => !s.notify_tuple_delete(target),
            None => false,
        };
        if deferred {
            if self.tuple(target).is_pending_delete() {
                return;
            }
            self.invisible_pending_delete_count += 1;
            self.tuple_mut(target).set_pending_delete(true);
            return;
        }
        self.free_tuple_storage(target);
    }

    /// The snapshot scan passed a deferred tuple; physically reclaim it.
    pub fn reclaim_pending_delete(&mut self, target: TupleAddress) {
        assert!(self.tuple(target).is_pending_delete());
        self.tuple_mut(target).set_pending_delete(false);
        self.invisible_pending_delete_count -= 1;
        self.free_tuple_storage(target);
    }

    /// Delete every visible tuple through the regular path.
    pub fn delete_all_tuples(&mut self, ctx: &mut ExecContext, fallible: bool) -> MerlinResult<()> {
        let addrs: Vec<TupleAddress> = self.collect_visible().into_iter().map(|(a, _)| a).collect();
        for addr in addrs {
            self.delete_tuple(ctx, addr, fallible)?;
        }
        Ok(())
    }

    // ── Undo entry points ────────────────────────────────────────────────

    /// Reverse an insert: the pooled image relocates the exact slot, which
    /// is removed from the indexes and freed.
    pub fn delete_tuple_for_undo(&mut self, image: &OwnedRow) {
        let target = match self.lookup_tuple(image, LookupMode::ForUndo) {
            Some(addr) => addr,
            None => panic!(
                "failed to delete tuple from table {} for undo: tuple does not exist",
                self.schema.name
            ),
        };
        for index in &mut self.indexes {
            if !index.delete_entry(image, target) {
                panic!(
                    "failed to delete tuple from index {} of table {} during undo",
                    index.name(),
                    self.schema.name
                );
            }
        }
        self.delete_tuple_finalize(target);
    }

    /// Reverse a delete: the tuple never moved, it was only unlinked; put it
    /// back into every index. An index conflict here means state is already
    /// corrupt, which is not survivable.
    pub fn insert_tuple_for_undo(&mut self, target: TupleAddress) {
        self.tuple_mut(target).set_pending_delete_on_undo_release(false);
        self.tuples_pinned_by_undo -= 1;
        self.invisible_pending_delete_count -= 1;
        let image = self.tuple(target).image();
        if let Err((_, _)) = self.try_insert_on_all_indexes(&image, target) {
            panic!(
                "failed to insert tuple into table {} for undo: unique constraint violation",
                self.schema.name
            );
        }
    }

    /// Reverse an update: relocate the slot by its unwanted (after) values,
    /// restore the before image, and revert the indexes if they were touched.
    pub fn update_tuple_for_undo(&mut self, before: &OwnedRow, after: &OwnedRow, revert_indexes: bool) {
        let target = match self.lookup_tuple(after, LookupMode::ForUndo) {
            Some(addr) => addr,
            None => panic!(
                "failed to relocate updated tuple in table {} for undo",
                self.schema.name
            ),
        };

        if revert_indexes {
            for index in &mut self.indexes {
                if !index.delete_entry(after, target) {
                    panic!(
                        "failed to revert index {} of table {} during update undo",
                        index.name(),
                        self.schema.name
                    );
                }
            }
        }

        {
            let tuple = self.tuple_mut(target);
            let dirty = tuple.is_dirty();
            tuple.set_values(before.values.clone());
            tuple.set_dirty(dirty);
        }

        if revert_indexes {
            for index in &mut self.indexes {
                if index.add(before, target).is_err() {
                    panic!(
                        "failed to restore index {} of table {} during update undo",
                        index.name(),
                        self.schema.name
                    );
                }
            }
        }
    }

    /// The undo-delete action released: follow through with the deferred
    /// physical delete.
    pub fn delete_tuple_release(&mut self, target: TupleAddress) {
        self.tuple_mut(target).set_pending_delete_on_undo_release(false);
        self.tuples_pinned_by_undo -= 1;
        self.invisible_pending_delete_count -= 1;
        self.delete_tuple_finalize(target);
    }

    // ── Lookup ───────────────────────────────────────────────────────────

    pub fn lookup_tuple(&self, probe: &OwnedRow, mode: LookupMode) -> Option<TupleAddress> {
        if let Some(pk) = self.primary_key_index() {
            return pk.unique_matching_tuple(probe);
        }
        let ncols = self.schema.column_count();
        for (&bid, block) in &self.blocks {
            for slot in block.occupied_slots() {
                let tuple = block.tuple(slot);
                let matched = match mode {
                    LookupMode::ByValues => tuple.is_visible() && tuple.equals_by_values(probe, ncols),
                    LookupMode::ForDr => {
                        tuple.is_visible() && tuple.equals_by_values(probe, probe.len())
                    }
                    LookupMode::ForUndo => {
                        tuple.is_active()
                            && !tuple.is_pending_delete()
                            && tuple.equals_including_hidden(probe)
                    }
                };
                if matched {
                    return Some(TupleAddress { block: bid, slot });
                }
            }
        }
        None
    }

    pub fn lookup_tuple_by_values(&self, probe: &OwnedRow) -> Option<TupleAddress> {
        self.lookup_tuple(probe, LookupMode::ByValues)
    }

    pub fn lookup_tuple_for_dr(&self, probe: &OwnedRow) -> Option<TupleAddress> {
        self.lookup_tuple(probe, LookupMode::ForDr)
    }

    // ── Snapshot bookkeeping ─────────────────────────────────────────────

    /// Every current block becomes pending-snapshot; new blocks arrive in
    /// the not-pending set.
    pub fn activate_snapshot(&mut self) {
        std::mem::swap(&mut self.blocks_pending_snapshot, &mut self.blocks_not_pending_snapshot);
        std::mem::swap(&mut self.buckets_pending, &mut self.buckets_not_pending);
        debug_assert!(self.blocks_not_pending_snapshot.is_empty());
    }

    /// The scan finished with a block; it rejoins normal bucketing.
    pub fn notify_snapshot_block_finished(&mut self, bid: BlockId) {
        if self.blocks_pending_snapshot.remove(&bid) {
            if let Some(block) = self.blocks.get_mut(&bid) {
                if let Some(old) = block.bucket.take() {
                    self.buckets_pending[old].remove(&bid);
                }
            }
            self.blocks_not_pending_snapshot.insert(bid);
            self.rebucket(bid);
        }
    }

    /// Exclude a block from bucketing while a scan owns it.
    pub fn park_block_for_scan(&mut self, bid: BlockId) {
        self.scan_parked.insert(bid);
        self.rebucket(bid);
    }

    pub fn unpark_block(&mut self, bid: BlockId) {
        self.scan_parked.remove(&bid);
        self.rebucket(bid);
    }

    // ── Compaction ───────────────────────────────────────────────────────

    /// More than a block's worth of reclaimable slots and a load ratio under
    /// the threshold.
    pub fn compaction_predicate(&self) -> bool {
        let allocated = self.allocated_slot_count();
        if self.blocks.len() <= 1 {
            return false;
        }
        allocated - self.tuple_count >= self.slots_per_block
            && (self.tuple_count as f64) < allocated as f64 * self.compaction_load_threshold
    }

    pub fn do_idle_compaction(&mut self) {
        if !self.blocks_not_pending_snapshot.is_empty() {
            self.compact_within_subset(false);
        }
        if !self.blocks_pending_snapshot.is_empty() {
            self.compact_within_subset(true);
        }
    }

    pub fn do_forced_compaction(&mut self) -> bool {
        if self.streamer.as_ref().is_some_and(|s| s.has_recovery_stream()) {
            tracing::info!(table = %self.schema.name, "deferring compaction until recovery is complete");
            return false;
        }
        tracing::info!(
            table = %self.schema.name,
            allocated = self.allocated_slot_count(),
            "doing forced compaction"
        );
        let mut had_work_not_pending = true;
        let mut had_work_pending = true;
        let mut compactions: u64 = 0;
        let failed_before = self.failed_compaction_count;
        while self.compaction_predicate() {
            if !had_work_not_pending && !had_work_pending {
                // The predicate says blocks should be mergeable but no
                // eligible candidates were found in the buckets; every
                // remaining candidate is parked by a scan. Bookkeeping for
                // free-space and empty-block release is independent of the
                // buckets, so this is not fatal.
                if self.failed_compaction_count % 5000 == 0 {
                    tracing::error!(
                        table = %self.schema.name,
                        failed = self.failed_compaction_count,
                        "compaction predicate says there should be blocks to \
                         compact but none were eligible"
                    );
                }
                self.failed_compaction_count += 1;
                break;
            }
            if self.blocks_not_pending_snapshot.is_empty() {
                had_work_not_pending = false;
            } else if had_work_not_pending {
                had_work_not_pending = self.compact_within_subset(false);
                compactions += 1;
            }
            if self.blocks_pending_snapshot.is_empty() {
                had_work_pending = false;
            } else if had_work_pending {
                had_work_pending = self.compact_within_subset(true);
                compactions += 1;
            }
        }
        if failed_before > 0 && failed_before == self.failed_compaction_count {
            tracing::error!(
                table = %self.schema.name,
                attempts = failed_before,
                "recovered from a failed compaction scenario"
            );
            self.failed_compaction_count = 0;
        }
        tracing::info!(
            table = %self.schema.name,
            compactions,
            allocated = self.allocated_slot_count(),
            "finished forced compaction"
        );
        compactions > 0
    }

    /// Merge the lightest blocks of one bucket set into the fullest.
    fn compact_within_subset(&mut self, pending: bool) -> bool {
        let fullest = match self.find_fullest(pending) {
            Some(b) => b,
            None => return false,
        };
        let mut merged_any = false;
        while self.blocks[&fullest].has_free_slots() {
            let lightest = match self.find_lightest(pending, fullest) {
                Some(b) => b,
                None => break,
            };
            self.merge_blocks(fullest, lightest);
            merged_any = true;
            if self.blocks.get(&lightest).is_some_and(|b| b.is_empty()) {
                self.release_block(lightest);
            } else if self.blocks.contains_key(&lightest) {
                self.blocks_with_space.insert(lightest);
                self.rebucket(lightest);
            }
        }
        if !self.blocks[&fullest].has_free_slots() {
            self.blocks_with_space.remove(&fullest);
        }
        self.rebucket(fullest);
        merged_any
    }

    fn find_fullest(&self, pending: bool) -> Option<BlockId> {
        let buckets = if pending { &self.buckets_pending } else { &self.buckets_not_pending };
        buckets
            .iter()
            .rev()
            .flat_map(|b| b.iter())
            .find(|&&bid| self.blocks[&bid].has_free_slots())
            .copied()
    }

    fn find_lightest(&self, pending: bool, excluding: BlockId) -> Option<BlockId> {
        let buckets = if pending { &self.buckets_pending } else { &self.buckets_not_pending };
        buckets
            .iter()
            .flat_map(|b| b.iter())
            .find(|&&bid| bid != excluding)
            .copied()
    }

    /// Move tuples from `source` into the free slots of `target`, rewriting
    /// index entries as each tuple lands.
    fn merge_blocks(&mut self, target: BlockId, source: BlockId) {
        let slots = self.blocks[&source].occupied_slots();
        for slot in slots {
            if !self.blocks[&target].has_free_slots() {
                break;
            }
            let from = TupleAddress { block: source, slot };
            assert!(
                !self.tuple(from).is_pending_delete_on_undo_release(),
                "compaction may not move a tuple pinned by undo"
            );
            let to_slot = self.blocks.get_mut(&target).expect("target block").allocate()
                .expect("target block reported free slots");
            let to = TupleAddress { block: target, slot: to_slot };
            self.swap_tuples(from, to);
            if let Some(s) = &mut self.streamer {
                s.notify_tuple_movement(from, to);
            }
            let src_block = self.blocks.get_mut(&source).expect("source block");
            src_block.free_slot(slot);
        }
        self.rebucket(target);
    }

    /// Relocate one tuple. A tuple hidden by pending-delete is absent from
    /// the indexes, so only visible tuples get their entries rewritten.
    fn swap_tuples(&mut self, from: TupleAddress, to: TupleAddress) {
        let (values, dirty, pending_delete) = {
            let src = self.tuple(from);
            (src.values().to_vec(), src.is_dirty(), src.is_pending_delete())
        };
        let image = OwnedRow::new(values.clone());
        {
            let dst = self.tuple_mut(to);
            dst.set_values(values);
            dst.set_active(true);
            dst.set_dirty(dirty);
            dst.set_pending_delete(pending_delete);
        }
        {
            let src = self.tuple_mut(from);
            src.set_active(false);
            src.set_pending_delete(false);
            src.clear();
        }
        if !pending_delete {
            for index in &mut self.indexes {
                if !index.replace_entry_no_key_change(&image, from, to) {
                    panic!(
                        "failed to move index entry in {} of table {} during compaction",
                        index.name(),
                        self.schema.name
                    );
                }
            }
        }
    }

    /// Rows whose partition-column hash does not route to this partition.
    pub fn validate_partitioning(&self, num_partitions: i32, partition: i32) -> i64 {
        let pcol = match self.schema.partition_column {
            Some(c) => c,
            None => return 0,
        };
        self.collect_visible()
            .iter()
            .filter(|(_, row)| {
                crate::hash::partition_for_value(&row.values[pcol], num_partitions) != partition
            })
            .count() as i64
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn tuple_mut(&mut self, addr: TupleAddress) -> &mut Tuple {
        self.blocks.get_mut(&addr.block).expect("block exists").tuple_mut(addr.slot)
    }

    /// Extend a visible-column source with Null hidden columns as needed.
    fn full_image_from_source(&self, source: &OwnedRow) -> Vec<Datum> {
        let total = self.schema.total_column_count();
        assert!(
            source.len() == total || source.len() == self.schema.column_count(),
            "source row has {} values, table {} stores {} visible + {} hidden",
            source.len(),
            self.schema.name,
            self.schema.column_count(),
            self.schema.hidden_column_count()
        );
        let mut values = source.values.clone();
        values.resize(total, Datum::Null);
        values
    }

    fn first_null_violation(&self, image: &[Datum]) -> Option<usize> {
        (0..self.schema.column_count())
            .rev()
            .find(|&i| !self.allow_nulls[i] && image[i].is_null())
    }

    /// Grab a free slot: a block with space, else a freshly allocated block.
    fn next_free_tuple(&mut self) -> TupleAddress {
        let bid = match self.blocks_with_space.iter().next().copied() {
            Some(bid) => bid,
            None => self.allocate_next_block(),
        };
        let block = self.blocks.get_mut(&bid).expect("block with space");
        let slot = block.allocate().expect("block advertised free slots");
        if !block.has_free_slots() {
            self.blocks_with_space.remove(&bid);
        }
        self.tuple_count += 1;
        self.rebucket(bid);
        TupleAddress { block: bid, slot }
    }

    fn allocate_next_block(&mut self) -> BlockId {
        let bid = BlockId(self.next_block_id);
        self.next_block_id += 1;
        self.blocks.insert(bid, TupleBlock::new(bid, self.slots_per_block));
        self.blocks_with_space.insert(bid);
        self.blocks_not_pending_snapshot.insert(bid);
        self.rebucket(bid);
        bid
    }

    /// Roll back a slot grabbed by an insert that subsequently failed.
    fn abandon_slot(&mut self, addr: TupleAddress) {
        let tuple = self.tuple_mut(addr);
        tuple.set_pending_delete(false);
        tuple.set_pending_delete_on_undo_release(false);
        tuple.set_active(false);
        tuple.clear();
        self.release_slot(addr);
    }

    fn free_tuple_storage(&mut self, addr: TupleAddress) {
        let tuple = self.tuple_mut(addr);
        debug_assert!(!tuple.is_pending_delete());
        debug_assert!(!tuple.is_pending_delete_on_undo_release());
        tuple.set_active(false);
        tuple.clear();
        self.release_slot(addr);
    }

    fn release_slot(&mut self, addr: TupleAddress) {
        let block = self.blocks.get_mut(&addr.block).expect("block exists");
        block.free_slot(addr.slot);
        self.tuple_count -= 1;
        if block.is_empty() {
            self.release_block(addr.block);
        } else {
            self.blocks_with_space.insert(addr.block);
            self.rebucket(addr.block);
        }
    }

    /// Return an empty block to the allocator.
    fn release_block(&mut self, bid: BlockId) {
        let was_pending = self.blocks_pending_snapshot.remove(&bid);
        self.blocks_not_pending_snapshot.remove(&bid);
        self.blocks_with_space.remove(&bid);
        self.scan_parked.remove(&bid);
        if let Some(block) = self.blocks.remove(&bid) {
            if let Some(old) = block.bucket {
                self.buckets_pending[old].remove(&bid);
                self.buckets_not_pending[old].remove(&bid);
            }
        }
        if was_pending {
            if let Some(s) = &mut self.streamer {
                s.notify_block_compacted_away(bid);
            }
        }
    }

    /// Re-derive bucket membership from block state. Bucketing is a pure
    /// function of occupancy, so membership cannot drift; parked blocks stay
    /// outside until the scan returns them.
    fn rebucket(&mut self, bid: BlockId) {
        let pending = self.blocks_pending_snapshot.contains(&bid);
        let parked = self.scan_parked.contains(&bid);
        let block = match self.blocks.get_mut(&bid) {
            Some(b) => b,
            None => return,
        };
        let new_bucket = if parked { None } else { Some(block.bucket_index()) };
        if block.bucket == new_bucket {
            return;
        }
        if let Some(old) = block.bucket.take() {
            self.buckets_pending[old].remove(&bid);
            self.buckets_not_pending[old].remove(&bid);
        }
        if let Some(new) = new_bucket {
            block.bucket = Some(new);
            if pending {
                self.buckets_pending[new].insert(bid);
            } else {
                self.buckets_not_pending[new].insert(bid);
            }
        }
    }

    fn try_insert_on_all_indexes(
        &mut self,
        image: &OwnedRow,
        addr: TupleAddress,
    ) -> Result<(), (usize, TupleAddress)> {
        for i in 0..self.indexes.len() {
            if let Err(conflict) = self.indexes[i].add(image, addr) {
                return Err((i, conflict));
            }
        }
        Ok(())
    }

    // ── DR emission ──────────────────────────────────────────────────────

    fn dr_applies(&self) -> bool {
        self.schema.dr_enabled && !self.schema.is_materialized
    }

    fn partition_hash_for(&self, image: &OwnedRow) -> i32 {
        match self.schema.partition_column {
            Some(c) => hash_partition_value(&image.values[c]),
            None => 0,
        }
    }

    fn emit_dr_tuple(
        &mut self,
        ctx: &mut ExecContext,
        image: &OwnedRow,
        record_type: DrRecordType,
    ) -> MerlinResult<Option<DrMark>> {
        if !self.dr_applies() {
            return Ok(None);
        }
        let replicated = self.schema.is_replicated();
        let stream = match ctx.stream_for(replicated) {
            Some(s) => s,
            None => return Ok(None),
        };
        let unique_index = self.get_unique_index_for_dr(ctx.active_active_dr);
        let par_hash = self.partition_hash_for(image);
        let mark = stream.lock().append_tuple(
            ctx.last_committed_sp_handle,
            self.dr_handle(),
            ctx.current_txn_id,
            ctx.current_sp_handle,
            ctx.current_unique_id,
            image,
            record_type,
            unique_index.as_ref().map(|(cols, crc)| (cols.as_slice(), *crc)),
            par_hash,
        )?;
        if mark == INVALID_DR_MARK {
            return Ok(None);
        }
        Ok(Some(DrMark {
            mark,
            row_cost: record_type.row_cost(),
            replicated,
        }))
    }

    fn emit_dr_update(
        &mut self,
        ctx: &mut ExecContext,
        before: &OwnedRow,
        after: &OwnedRow,
    ) -> MerlinResult<Option<DrMark>> {
        if !self.dr_applies() {
            return Ok(None);
        }
        let replicated = self.schema.is_replicated();
        let stream = match ctx.stream_for(replicated) {
            Some(s) => s,
            None => return Ok(None),
        };
        let unique_index = self.get_unique_index_for_dr(ctx.active_active_dr);
        let par_hash = self.partition_hash_for(after);
        let mark = stream.lock().append_update_record(
            ctx.last_committed_sp_handle,
            self.dr_handle(),
            ctx.current_txn_id,
            ctx.current_sp_handle,
            ctx.current_unique_id,
            before,
            after,
            unique_index.as_ref().map(|(cols, crc)| (cols.as_slice(), *crc)),
            par_hash,
        )?;
        if mark == INVALID_DR_MARK {
            return Ok(None);
        }
        Ok(Some(DrMark {
            mark,
            row_cost: DrRecordType::Update.row_cost(),
            replicated,
        }))
    }

    pub(crate) fn rollback_dr(&self, ctx: &ExecContext, mark: Option<DrMark>) {
        if let Some(m) = mark {
            if let Some(stream) = ctx.stream_for(m.replicated) {
                stream.lock().rollback_to(m.mark, m.row_cost);
            }
        }
    }
}
