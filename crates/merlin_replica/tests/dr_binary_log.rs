//! End-to-end DR suite: a primary and a replica engine, each with its own
//! DR streams, wired through in-memory topends. Primary transactions flush
//! binary-log buffers that the sink applies on the replica; the scenarios
//! check convergence, rollback transparency, and the active-active conflict
//! taxonomy.

use std::sync::Arc;

use parking_lot::Mutex;

use merlin_common::config::{DrConfig, StorageConfig};
use merlin_common::datum::{Datum, OwnedRow};
use merlin_common::error::{DrError, MerlinError};
use merlin_common::schema::{ColumnDef, IndexDef, TableSchema};
use merlin_common::types::{
    ClusterId, DataType, DrTimestamp, PartitionId, SpHandle, TableSignature, TxnId, UniqueId,
    REPLICATED_PARTITION_ID,
};
use merlin_dr::{BufferingTopend, DrTupleStream};
use merlin_replica::{
    ApplyOutcome, BinaryLogSink, BufferingConflictExport, ConflictDecision, DrConflictType,
    HigherClusterWins,
};
use merlin_storage::{Engine, ExecContext};

const PARTITION: PartitionId = PartitionId(42);
const TABLE_HANDLE: i64 = 42;
const REPLICATED_TABLE_HANDLE: i64 = 24;
const CLUSTER_ID: u8 = 1;
const CLUSTER_ID_REPLICA: u8 = 2;
const BUFFER_SIZE: usize = 4096;
const LARGE_BUFFER_SIZE: usize = 32768;

fn partitioned_schema() -> TableSchema {
    let mut schema = TableSchema::new(
        "p_table",
        TableSignature::from_handle(TABLE_HANDLE),
        vec![
            ColumnDef::new("c_tinyint", DataType::TinyInt, false),
            ColumnDef::new("c_bigint", DataType::BigInt, true),
            ColumnDef::new("c_decimal", DataType::Decimal, true),
            ColumnDef::new("c_inline_varchar", DataType::VarChar, true),
            ColumnDef::new("c_outline_varchar", DataType::VarChar, true),
            ColumnDef::new("c_timestamp", DataType::Timestamp, true),
            ColumnDef::new("c_outline_varbinary", DataType::VarBinary, true),
        ],
    );
    schema.hidden_columns.push(ColumnDef::new("dr_ts", DataType::BigInt, true));
    schema.partition_column = Some(0);
    schema.dr_enabled = true;
    schema.indexes.push(IndexDef::hash("pk_tinyint", vec![0], true));
    schema.indexes.push(IndexDef::hash("unique_bigint", vec![1], true));
    schema.primary_key = Some(0);
    schema
}

fn replicated_schema() -> TableSchema {
    let mut schema = TableSchema::new(
        "r_table",
        TableSignature::from_handle(REPLICATED_TABLE_HANDLE),
        vec![
            ColumnDef::new("c_tinyint", DataType::TinyInt, false),
            ColumnDef::new("c_bigint", DataType::BigInt, true),
        ],
    );
    schema.hidden_columns.push(ColumnDef::new("dr_ts", DataType::BigInt, true));
    schema.dr_enabled = true;
    schema.indexes.push(IndexDef::hash("pk_tinyint", vec![0], true));
    schema.primary_key = Some(0);
    schema
}

fn sample_row(tiny: i8, big: i64) -> OwnedRow {
    OwnedRow::new(vec![
        Datum::TinyInt(tiny),
        Datum::BigInt(big),
        Datum::parse_decimal("349508345.34583").unwrap(),
        Datum::VarChar("a thing".into()),
        Datum::VarChar(
            "this is a rather long string of text that is used to force the \
             underlying storage out of line. It should be longer than 64 bytes."
                .into(),
        ),
        Datum::Timestamp(5433),
        Datum::VarBinary(vec![0x74, 0x68, 0x69, 0x73, 0x20, 0x69, 0x73]),
    ])
}

struct Cluster {
    engine: Engine,
    ctx: ExecContext,
    topend: BufferingTopend,
    token: i64,
}

impl Cluster {
    fn new(cluster_id: u8, streams_enabled: bool, active_active: bool) -> Cluster {
        Cluster::with_storage(cluster_id, streams_enabled, active_active, StorageConfig::default())
    }

    fn with_storage(
        cluster_id: u8,
        streams_enabled: bool,
        active_active: bool,
        storage: StorageConfig,
    ) -> Cluster {
        let dr_config = DrConfig {
            buffer_capacity: BUFFER_SIZE,
            secondary_capacity: LARGE_BUFFER_SIZE,
            row_budget: 10_000,
        };
        let stream = Arc::new(Mutex::new(DrTupleStream::new(PARTITION, &dr_config)));
        stream.lock().enabled = streams_enabled;
        let replicated = Arc::new(Mutex::new(DrTupleStream::new(REPLICATED_PARTITION_ID, &dr_config)));
        replicated.lock().enabled = streams_enabled;

        let mut ctx = ExecContext::new(ClusterId(cluster_id), stream, Some(replicated));
        ctx.active_active_dr = active_active;

        let mut engine = Engine::new(storage);
        engine.add_table(partitioned_schema());
        engine.add_table(replicated_schema());

        Cluster {
            engine,
            ctx,
            topend: BufferingTopend::new(),
            token: 0,
        }
    }

    fn begin(&mut self, n: i64) {
        self.token = n;
        self.ctx.setup_for_txn(
            TxnId(n),
            SpHandle(n),
            SpHandle(n - 1),
            UniqueId::new(n, PARTITION),
            n,
        );
    }

    fn end(&mut self, success: bool) {
        if success {
            let token = self.token;
            self.engine.release(&mut self.ctx, token);
            let uid = self.ctx.current_unique_id;
            self.ctx.dr_stream.lock().end_transaction(uid).unwrap();
            if let Some(r) = &self.ctx.dr_replicated_stream {
                r.lock().end_transaction(uid).unwrap();
            }
        } else {
            let token = self.token;
            self.engine.undo(&mut self.ctx, token);
        }
    }

    fn flush(&mut self) -> bool {
        let sp = self.ctx.last_committed_sp_handle;
        let mut pushed = self.ctx.dr_stream.lock().periodic_flush(sp, &mut self.topend);
        if let Some(r) = &self.ctx.dr_replicated_stream {
            pushed |= r.lock().periodic_flush(sp, &mut self.topend);
        }
        pushed
    }

    fn insert(&mut self, handle: i64, row: &OwnedRow) {
        self.engine
            .table_mut(handle)
            .unwrap()
            .insert_tuple(&mut self.ctx, row)
            .unwrap();
    }

    fn update_by_values(&mut self, handle: i64, old: &OwnedRow, new: &OwnedRow) {
        let table = self.engine.table_mut(handle).unwrap();
        let addr = table.lookup_tuple_by_values(old).expect("row to update exists");
        table.update_tuple(&mut self.ctx, addr, new).unwrap();
    }

    fn delete_by_values(&mut self, handle: i64, row: &OwnedRow) {
        let table = self.engine.table_mut(handle).unwrap();
        let addr = table.lookup_tuple_by_values(row).expect("row to delete exists");
        table.delete_tuple(&mut self.ctx, addr, true).unwrap();
    }

    fn visible_count(&self, handle: i64) -> usize {
        self.engine.table(handle).unwrap().visible_tuple_count()
    }

    fn hidden_ts(&self, handle: i64, row: &OwnedRow) -> i64 {
        let table = self.engine.table(handle).unwrap();
        let addr = table.lookup_tuple_by_values(row).expect("row exists");
        let ts_col = table.schema().dr_timestamp_column_index().unwrap();
        match table.tuple(addr).value(ts_col) {
            Datum::BigInt(v) => *v,
            other => panic!("hidden column holds {:?}", other),
        }
    }
}

/// Ship every flushed primary buffer to the replica inside one replica-side
/// transaction, the way the wire consumer drives the sink.
fn flush_and_apply(
    primary: &mut Cluster,
    replica: &mut Cluster,
    replica_txn: i64,
) -> (ApplyOutcome, BufferingConflictExport) {
    assert!(primary.flush(), "expected committed DR bytes to flush");
    replica.begin(replica_txn);
    let mut merged = ApplyOutcome::default();
    let mut export = BufferingConflictExport::new();
    while let Some((_, block)) = primary.topend.blocks.pop_front() {
        let outcome = BinaryLogSink::apply(
            &block.data,
            &mut replica.engine,
            &mut replica.ctx,
            ClusterId(CLUSTER_ID),
            &HigherClusterWins,
            &mut export,
        )
        .unwrap();
        merged.transactions_applied += outcome.transactions_applied;
        merged.records_applied += outcome.records_applied;
        merged.conflicts.extend(outcome.conflicts);
    }
    replica.end(true);
    (merged, export)
}

fn make_pair() -> (Cluster, Cluster) {
    (
        Cluster::new(CLUSTER_ID, true, true),
        Cluster::new(CLUSTER_ID_REPLICA, false, true),
    )
}

#[test]
fn test_simple_insert_then_delete() {
    let (mut primary, mut replica) = make_pair();

    primary.begin(70);
    primary.insert(TABLE_HANDLE, &sample_row(42, 55555));
    primary.end(true);
    flush_and_apply(&mut primary, &mut replica, 1);
    assert_eq!(replica.visible_count(TABLE_HANDLE), 1);

    primary.begin(71);
    primary.delete_by_values(TABLE_HANDLE, &sample_row(42, 55555));
    primary.end(true);
    let (outcome, export) = flush_and_apply(&mut primary, &mut replica, 2);
    assert!(outcome.conflicts.is_empty());
    assert!(export.rows.is_empty());
    assert_eq!(replica.visible_count(TABLE_HANDLE), 0);
}

#[test]
fn test_update_index_column_converges() {
    let (mut primary, mut replica) = make_pair();

    primary.begin(70);
    primary.insert(TABLE_HANDLE, &sample_row(42, 55555));
    primary.end(true);
    flush_and_apply(&mut primary, &mut replica, 1);

    primary.begin(71);
    primary.update_by_values(TABLE_HANDLE, &sample_row(42, 55555), &sample_row(99, 55555));
    primary.end(true);
    flush_and_apply(&mut primary, &mut replica, 2);

    let table = replica.engine.table(TABLE_HANDLE).unwrap();
    assert!(table.lookup_tuple_by_values(&sample_row(99, 55555)).is_some());
    assert!(table.lookup_tuple_by_values(&sample_row(42, 55555)).is_none());

    // The hidden DR timestamp shipped with the update, byte for byte.
    assert_eq!(
        replica.hidden_ts(TABLE_HANDLE, &sample_row(99, 55555)),
        primary.hidden_ts(TABLE_HANDLE, &sample_row(99, 55555)),
    );
}

#[test]
fn test_hidden_timestamp_carries_cluster_and_unique_id() {
    let (mut primary, mut replica) = make_pair();

    primary.begin(70);
    primary.insert(TABLE_HANDLE, &sample_row(42, 55555));
    primary.end(true);
    flush_and_apply(&mut primary, &mut replica, 1);

    let expected = DrTimestamp::new(ClusterId(CLUSTER_ID), UniqueId::new(70, PARTITION)).0;
    assert_eq!(replica.hidden_ts(TABLE_HANDLE, &sample_row(42, 55555)), expected);
}

#[test]
fn test_rollback_produces_no_dr_bytes() {
    let (mut primary, _replica) = make_pair();
    let committed_before = primary.ctx.dr_stream.lock().last_committed().sequence;

    primary.begin(70);
    primary.insert(TABLE_HANDLE, &sample_row(42, 55555));
    primary.end(false);

    assert!(!primary.flush());
    assert!(!primary.topend.received_any());
    assert_eq!(
        primary.ctx.dr_stream.lock().last_committed().sequence,
        committed_before
    );
    assert_eq!(primary.visible_count(TABLE_HANDLE), 0);
}

#[test]
fn test_replicated_table_round_trip() {
    let (mut primary, mut replica) = make_pair();

    primary.begin(70);
    let row = OwnedRow::new(vec![Datum::TinyInt(7), Datum::BigInt(123)]);
    primary.insert(REPLICATED_TABLE_HANDLE, &row);
    primary.end(true);
    flush_and_apply(&mut primary, &mut replica, 1);

    assert_eq!(replica.visible_count(REPLICATED_TABLE_HANDLE), 1);
    assert!(replica
        .engine
        .table(REPLICATED_TABLE_HANDLE)
        .unwrap()
        .lookup_tuple_by_values(&row)
        .is_some());
}

#[test]
fn test_truncate_replicates() {
    // Small blocks so both sides take the table-swap path and the wire
    // carries a single truncate record instead of per-row deletes.
    let small = StorageConfig {
        table_block_size: partitioned_schema().estimated_tuple_width() * 4,
        ..StorageConfig::default()
    };
    let mut primary = Cluster::with_storage(CLUSTER_ID, true, true, small.clone());
    let mut replica = Cluster::with_storage(CLUSTER_ID_REPLICA, false, true, small);

    primary.begin(70);
    for i in 0..60 {
        primary.insert(TABLE_HANDLE, &sample_row(i, i as i64));
    }
    primary.end(true);
    flush_and_apply(&mut primary, &mut replica, 1);
    assert_eq!(replica.visible_count(TABLE_HANDLE), 60);

    primary.begin(71);
    primary
        .engine
        .truncate_table(&mut primary.ctx, TABLE_HANDLE, true)
        .unwrap();
    primary.end(true);
    let (outcome, _) = flush_and_apply(&mut primary, &mut replica, 2);
    assert_eq!(outcome.records_applied, 1);
    assert_eq!(replica.visible_count(TABLE_HANDLE), 0);
}

#[test]
fn test_insert_constraint_violation_active_active() {
    let (mut primary, mut replica) = make_pair();

    // Replica committed its own rows at T71.
    replica.begin(71);
    replica.insert(TABLE_HANDLE, &sample_row(99, 55555));
    replica.insert(TABLE_HANDLE, &sample_row(42, 34523));
    replica.end(true);

    // Primary commits the clashing row at T72 and ships it.
    primary.begin(72);
    primary.insert(TABLE_HANDLE, &sample_row(42, 34523));
    primary.end(true);
    let (outcome, export) = flush_and_apply(&mut primary, &mut replica, 72);

    assert_eq!(outcome.conflicts.len(), 1);
    let conflict = &outcome.conflicts[0];
    assert_eq!(conflict.delete_conflict, DrConflictType::NoConflict);
    assert_eq!(conflict.insert_conflict, DrConflictType::ConstraintViolation);
    assert!(conflict.conflicts_on_primary_key);
    assert_eq!(conflict.existing_for_insert.len(), 1);
    assert_eq!(conflict.new_for_insert.len(), 1);
    assert_eq!(export.rows.len(), 2);
    assert_eq!(export.rows[0].row_type, "EXT");
    assert_eq!(export.rows[0].cluster_id, CLUSTER_ID_REPLICA);
    assert_eq!(export.rows[1].row_type, "NEW");
    assert_eq!(export.rows[1].cluster_id, CLUSTER_ID);

    // Default policy: lower remote cluster loses, replica keeps its rows.
    assert_eq!(conflict.decision, ConflictDecision::RejectRemoteChange);
    assert_eq!(replica.visible_count(TABLE_HANDLE), 2);
}

#[test]
fn test_delete_missing_row() {
    let (mut primary, mut replica) = make_pair();

    primary.begin(70);
    primary.insert(TABLE_HANDLE, &sample_row(42, 55555));
    primary.end(true);
    flush_and_apply(&mut primary, &mut replica, 1);

    // Replica deletes the row locally at T71.
    replica.begin(71);
    replica.delete_by_values(TABLE_HANDLE, &sample_row(42, 55555));
    replica.end(true);

    // Primary deletes at T72 and ships; the expected row is gone.
    primary.begin(72);
    primary.delete_by_values(TABLE_HANDLE, &sample_row(42, 55555));
    primary.end(true);
    let (outcome, export) = flush_and_apply(&mut primary, &mut replica, 72);

    assert_eq!(outcome.conflicts.len(), 1);
    let conflict = &outcome.conflicts[0];
    assert_eq!(conflict.delete_conflict, DrConflictType::ExpectedRowMissing);
    assert_eq!(conflict.insert_conflict, DrConflictType::NoConflict);
    assert_eq!(conflict.existing_for_delete.len(), 0);
    assert_eq!(conflict.expected_for_delete.len(), 1);
    assert_eq!(export.rows.len(), 1);
    assert_eq!(export.rows[0].row_type, "EXP");
    assert_eq!(export.rows[0].action_type, "D");
    assert_eq!(export.rows[0].conflict_type, "MISS");
    assert_eq!(export.rows[0].divergence, "C");
}

#[test]
fn test_update_timestamp_mismatch_with_new_row_constraint() {
    let (mut primary, mut replica) = make_pair();

    primary.begin(70);
    primary.insert(TABLE_HANDLE, &sample_row(42, 55555));
    primary.insert(TABLE_HANDLE, &sample_row(24, 2321));
    primary.end(true);
    flush_and_apply(&mut primary, &mut replica, 1);

    // Replica diverges: rewrites row 42 and adds a row that will collide
    // with the primary's upcoming update image.
    replica.begin(71);
    replica.update_by_values(TABLE_HANDLE, &sample_row(42, 55555), &sample_row(42, 12345));
    replica.insert(TABLE_HANDLE, &sample_row(72, 345));
    replica.end(true);

    // Primary updates row 42 to a value colliding with (72, 345).
    primary.begin(72);
    primary.update_by_values(TABLE_HANDLE, &sample_row(42, 55555), &sample_row(42, 345));
    primary.end(true);
    let (outcome, export) = flush_and_apply(&mut primary, &mut replica, 72);

    assert_eq!(outcome.conflicts.len(), 1);
    let conflict = &outcome.conflicts[0];
    assert_eq!(conflict.delete_conflict, DrConflictType::ExpectedRowMismatch);
    assert_eq!(conflict.insert_conflict, DrConflictType::ConstraintViolation);
    assert_eq!(conflict.existing_for_delete.len(), 1);
    assert_eq!(conflict.expected_for_delete.len(), 1);
    assert_eq!(conflict.existing_for_insert.len(), 1);
    assert_eq!(conflict.new_for_insert.len(), 1);
    assert_eq!(export.rows.len(), 4);
    assert!(export.rows.iter().all(|r| r.action_type == "U"));
    assert!(export.rows.iter().all(|r| r.divergence == "D"));

    // Rejected: the replica's divergent state stands.
    assert!(replica
        .engine
        .table(TABLE_HANDLE)
        .unwrap()
        .lookup_tuple_by_values(&sample_row(42, 12345))
        .is_some());
}

#[test]
fn test_delete_timestamp_mismatch() {
    let (mut primary, mut replica) = make_pair();

    primary.begin(70);
    primary.insert(TABLE_HANDLE, &sample_row(42, 55555));
    primary.end(true);
    flush_and_apply(&mut primary, &mut replica, 1);

    // Replica rewrites the row, so its image no longer matches the delete's
    // expected image.
    replica.begin(71);
    replica.update_by_values(TABLE_HANDLE, &sample_row(42, 55555), &sample_row(42, 777));
    replica.end(true);

    primary.begin(72);
    primary.delete_by_values(TABLE_HANDLE, &sample_row(42, 55555));
    primary.end(true);
    let (outcome, export) = flush_and_apply(&mut primary, &mut replica, 72);

    let conflict = &outcome.conflicts[0];
    assert_eq!(conflict.delete_conflict, DrConflictType::ExpectedRowMismatch);
    assert_eq!(conflict.existing_for_delete.len(), 1);
    assert_eq!(conflict.expected_for_delete.len(), 1);
    assert_eq!(export.rows.len(), 2);
}

#[test]
fn test_row_budget_overflow_aborts_cleanly() {
    let (mut primary, mut replica) = make_pair();
    primary.ctx.dr_stream.lock().set_row_budget(2);

    primary.begin(70);
    primary.insert(TABLE_HANDLE, &sample_row(1, 1));
    primary.insert(TABLE_HANDLE, &sample_row(2, 2));
    let err = primary
        .engine
        .table_mut(TABLE_HANDLE)
        .unwrap()
        .insert_tuple(&mut primary.ctx, &sample_row(3, 3))
        .unwrap_err();
    assert!(matches!(
        err,
        MerlinError::Dr(DrError::RowBudgetExceeded { budget: 2 })
    ));
    assert_eq!(err.sql_state(), "V0001");

    // Transaction-fatal: the caller aborts the whole transaction.
    primary.end(false);
    assert_eq!(primary.visible_count(TABLE_HANDLE), 0);
    assert!(!primary.flush());
    assert_eq!(replica.visible_count(TABLE_HANDLE), 0);
}

#[test]
fn test_non_active_active_delete_ships_index_key() {
    let mut primary = Cluster::new(CLUSTER_ID, true, false);
    let mut replica = Cluster::new(CLUSTER_ID_REPLICA, false, false);

    // Both sides agree on the DR key index identity.
    let primary_key = primary
        .engine
        .table_mut(TABLE_HANDLE)
        .unwrap()
        .get_unique_index_for_dr(false)
        .unwrap();
    let replica_key = replica
        .engine
        .table_mut(TABLE_HANDLE)
        .unwrap()
        .get_unique_index_for_dr(false)
        .unwrap();
    assert_eq!(primary_key.1, replica_key.1);

    primary.begin(70);
    primary.insert(TABLE_HANDLE, &sample_row(42, 55555));
    primary.insert(TABLE_HANDLE, &sample_row(24, 2321));
    primary.end(true);
    flush_and_apply(&mut primary, &mut replica, 1);
    assert_eq!(replica.visible_count(TABLE_HANDLE), 2);

    primary.begin(71);
    primary.delete_by_values(TABLE_HANDLE, &sample_row(42, 55555));
    primary.end(true);
    let (outcome, export) = flush_and_apply(&mut primary, &mut replica, 2);
    assert!(outcome.conflicts.is_empty());
    assert!(export.rows.is_empty());
    assert_eq!(replica.visible_count(TABLE_HANDLE), 1);
    assert!(replica
        .engine
        .table(TABLE_HANDLE)
        .unwrap()
        .lookup_tuple_by_values(&sample_row(24, 2321))
        .is_some());
}

#[test]
fn test_multi_transaction_buffer_applies_in_order() {
    let (mut primary, mut replica) = make_pair();

    for (n, tiny) in [(70i64, 1i8), (71, 2), (72, 3)] {
        primary.begin(n);
        primary.insert(TABLE_HANDLE, &sample_row(tiny, tiny as i64 * 100));
        primary.end(true);
    }
    let (outcome, _) = flush_and_apply(&mut primary, &mut replica, 1);
    assert_eq!(outcome.transactions_applied, 3);
    assert_eq!(replica.visible_count(TABLE_HANDLE), 3);

    let info = primary.ctx.dr_stream.lock().last_committed();
    assert_eq!(info.sequence.0, 3);
    assert_eq!(info.sp_unique_id, UniqueId::new(72, PARTITION));
}

#[test]
fn test_missing_table_on_replica_aborts_apply() {
    let (mut primary, mut replica) = make_pair();

    // A table only the primary knows about.
    let mut extra = partitioned_schema();
    extra.name = "p_single".into();
    extra.signature = TableSignature::from_handle(43);
    primary.engine.add_table(extra);

    primary.begin(70);
    primary.insert(43, &sample_row(1, 1));
    primary.end(true);

    assert!(primary.flush());
    replica.begin(1);
    let (_, block) = primary.topend.blocks.pop_front().unwrap();
    let mut export = BufferingConflictExport::new();
    let err = BinaryLogSink::apply(
        &block.data,
        &mut replica.engine,
        &mut replica.ctx,
        ClusterId(CLUSTER_ID),
        &HigherClusterWins,
        &mut export,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        MerlinError::Storage(merlin_common::error::StorageError::TableNotFound(43))
    ));
    // Recoverable: the containing replica transaction aborts, nothing more.
    replica.end(false);
    assert_eq!(replica.visible_count(TABLE_HANDLE), 0);

    // The disable guard restored the replica's stream enablement.
    assert!(!replica.ctx.dr_stream.lock().enabled);
}

#[test]
fn test_sink_does_not_loop_back_into_local_stream() {
    let (mut primary, mut replica) = make_pair();
    // Replica streams enabled, as on a live active-active peer.
    replica.ctx.dr_stream.lock().enabled = true;

    primary.begin(70);
    primary.insert(TABLE_HANDLE, &sample_row(42, 55555));
    primary.end(true);
    flush_and_apply(&mut primary, &mut replica, 1);

    assert_eq!(replica.visible_count(TABLE_HANDLE), 1);
    assert!(replica.ctx.dr_stream.lock().enabled);
    // Nothing was emitted for the applied writes.
    assert_eq!(replica.ctx.dr_stream.lock().pending_bytes(), 0);
}
