//! Per-partition engine façade: owns the tables of one partition keyed by DR
//! handle, performs the truncate table-swap, and dispatches undo and release
//! against the right table.

use std::collections::HashMap;

use merlin_common::config::StorageConfig;
use merlin_common::error::{MerlinResult, StorageError};
use merlin_common::schema::TableSchema;
use merlin_dr::INVALID_DR_MARK;

use crate::context::ExecContext;
use crate::table::PersistentTable;
use crate::undo::{DrMark, UndoAction};

// Single-block load factors under which truncate degrades to tuple-by-tuple
// delete, cheaper than the table-swap machinery's fixed cost. Obtained from
// benchmarks over varying schemas, view counts and index counts.
const TABLE_LF_CUTOFF_FOR_TRUNCATE: f64 = 0.105666;
const TABLE_WITH_VIEWS_LF_CUTOFF_FOR_TRUNCATE: f64 = 0.015416;

pub struct Engine {
    config: StorageConfig,
    tables: HashMap<i64, PersistentTable>,
}

impl Engine {
    pub fn new(config: StorageConfig) -> Engine {
        Engine {
            config,
            tables: HashMap::new(),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Register a table built from its catalog schema. Returns the DR handle
    /// records route by.
    pub fn add_table(&mut self, schema: TableSchema) -> i64 {
        let table = PersistentTable::new(schema, &self.config);
        let handle = table.dr_handle();
        self.tables.insert(handle, table);
        handle
    }

    pub fn table(&self, handle: i64) -> Option<&PersistentTable> {
        self.tables.get(&handle)
    }

    pub fn table_mut(&mut self, handle: i64) -> Option<&mut PersistentTable> {
        self.tables.get_mut(&handle)
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Truncate: swap in a fresh empty table built from the catalog schema,
    /// transferring the views, and pin the old table until undo resolves it.
    /// A near-empty single-block table is cheaper to clear row by row.
    pub fn truncate_table(
        &mut self,
        ctx: &mut ExecContext,
        handle: i64,
        fallible: bool,
    ) -> MerlinResult<()> {
        let table = self
            .tables
            .get_mut(&handle)
            .ok_or(StorageError::TableNotFound(handle))?;
        if table.is_empty_table() {
            return Ok(());
        }

        if let Some(load_factor) = table.single_block_load_factor() {
            let cutoff = if table.view_count() > 0 {
                TABLE_WITH_VIEWS_LF_CUTOFF_FOR_TRUNCATE
            } else {
                TABLE_LF_CUTOFF_FOR_TRUNCATE
            };
            if load_factor <= cutoff {
                return table.delete_all_tuples(ctx, fallible);
            }
        }

        // DR before the swap so a failed append leaves the table untouched.
        let replicated = table.schema().is_replicated();
        let dr_mark = if fallible && table.schema().dr_enabled && !table.schema().is_materialized {
            match ctx.stream_for(replicated) {
                Some(stream) => {
                    let mark = stream.lock().append_truncate_record(
                        ctx.last_committed_sp_handle,
                        handle,
                        &table.schema().signature,
                        table.name(),
                        ctx.current_txn_id,
                        ctx.current_sp_handle,
                        ctx.current_unique_id,
                    )?;
                    if mark == INVALID_DR_MARK {
                        None
                    } else {
                        Some(DrMark {
                            mark,
                            row_cost: 1,
                            replicated,
                        })
                    }
                }
                None => None,
            }
        } else {
            None
        };

        let mut old = self.tables.remove(&handle).expect("checked above");
        let mut fresh = PersistentTable::new(old.schema().clone(), &self.config);
        for view in old.take_views() {
            view.lock().on_source_truncated();
            fresh.add_view(view);
        }
        tracing::info!(table = %fresh.name(), "truncated table, fresh storage swapped in");

        if ctx.undo.has_active_quantum() {
            assert!(
                fallible,
                "attempted to truncate table {} infallibly inside an active undo quantum",
                fresh.name()
            );
            ctx.undo.register(UndoAction::Truncate {
                table_handle: handle,
                old_table: Box::new(old),
                dr_mark,
            });
        } else {
            assert!(
                !fallible,
                "attempted to truncate table {} with no active undo quantum",
                fresh.name()
            );
            // No undo: commit immediately by dropping the old table.
            tracing::info!(table = %old.name(), "releasing pre-truncate storage");
            drop(old);
        }
        self.tables.insert(handle, fresh);
        Ok(())
    }

    /// Abort: run every action registered at or after `token` in reverse,
    /// rolling the DR stream back to each action's mark.
    pub fn undo(&mut self, ctx: &mut ExecContext, token: i64) {
        let actions = ctx.undo.take_for_undo(token);
        for action in actions {
            let mark = action.dr_mark();
            match action {
                UndoAction::Insert {
                    table_handle, image, ..
                } => {
                    self.expect_table(table_handle).delete_tuple_for_undo(&image);
                }
                UndoAction::Delete {
                    table_handle, addr, ..
                } => {
                    self.expect_table(table_handle).insert_tuple_for_undo(addr);
                }
                UndoAction::Update {
                    table_handle,
                    before,
                    after,
                    indexes_updated,
                    ..
                } => {
                    self.expect_table(table_handle)
                        .update_tuple_for_undo(&before, &after, indexes_updated);
                }
                UndoAction::Truncate {
                    table_handle,
                    old_table,
                    ..
                } => {
                    let mut old = *old_table;
                    let mut fresh = self
                        .tables
                        .remove(&table_handle)
                        .expect("truncated table must still be registered");
                    for view in fresh.take_views() {
                        view.lock().on_source_truncated();
                        old.add_view(view);
                    }
                    tracing::debug!(table = %old.name(), "truncate table undo");
                    self.tables.insert(table_handle, old);
                }
            }
            if let Some(m) = mark {
                if let Some(stream) = ctx.stream_for(m.replicated) {
                    stream.lock().rollback_to(m.mark, m.row_cost);
                }
            }
        }
    }

    /// Commit: release every action registered at or before `token`,
    /// finalizing deferred deletes and dropping pinned pre-truncate tables.
    pub fn release(&mut self, ctx: &mut ExecContext, token: i64) {
        for action in ctx.undo.take_for_release(token) {
            match action {
                UndoAction::Insert { .. } | UndoAction::Update { .. } => {}
                UndoAction::Delete {
                    table_handle, addr, ..
                } => {
                    let table = self.expect_table(table_handle);
                    // A truncate later in the batch already swapped the slot's
                    // table out; the pinned tuple goes down with it.
                    if table.has_address(addr) {
                        table.delete_tuple_release(addr);
                    }
                }
                UndoAction::Truncate { old_table, .. } => {
                    tracing::info!(
                        table = %old_table.name(),
                        "truncate table release, dropping pre-truncate storage"
                    );
                    drop(old_table);
                }
            }
        }
    }

    fn expect_table(&mut self, handle: i64) -> &mut PersistentTable {
        self.tables
            .get_mut(&handle)
            .unwrap_or_else(|| panic!("undo references unknown table handle {}", handle))
    }
}
