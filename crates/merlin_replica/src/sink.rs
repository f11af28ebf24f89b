//! The binary log sink: decodes a flushed DR buffer and drives the decoded
//! records against local tables, classifying every disagreement with local
//! state through the conflict taxonomy.
//!
//! Local DR streams are disabled for the duration of an apply so the applied
//! writes do not loop back to the remote cluster.

use merlin_common::datum::OwnedRow;
use merlin_common::error::{DrError, MerlinError, MerlinResult, StorageError};
use merlin_common::types::ClusterId;
use merlin_dr::{decode_log, DrRecord, DrRecordType};
use merlin_storage::table::LookupMode;
use merlin_storage::{DrStreamDisableGuard, Engine, ExecContext, PersistentTable, TupleAddress};

use crate::conflict::{
    emit_conflict_rows, ConflictDecision, ConflictExportSink, ConflictReport,
    ConflictResolutionPolicy, DrConflictType,
};

/// What one apply call did: applied record count plus every conflict it
/// classified, in order.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    pub transactions_applied: usize,
    pub records_applied: usize,
    pub conflicts: Vec<ConflictReport>,
}

pub struct BinaryLogSink;

impl BinaryLogSink {
    /// Apply a flushed DR buffer against the local engine. The caller wraps
    /// the apply in its own replica transaction (undo quantum and all); a
    /// returned error means that transaction must be aborted.
    pub fn apply(
        log: &[u8],
        engine: &mut Engine,
        ctx: &mut ExecContext,
        remote_cluster: ClusterId,
        policy: &dyn ConflictResolutionPolicy,
        export: &mut dyn ConflictExportSink,
    ) -> MerlinResult<ApplyOutcome> {
        let transactions = decode_log(log)?;
        let _guard = DrStreamDisableGuard::new(ctx);
        let mut outcome = ApplyOutcome::default();

        for txn in transactions {
            tracing::trace!(
                sequence = txn.sequence,
                records = txn.records.len(),
                "applying DR transaction"
            );
            for record in txn.records {
                match record {
                    DrRecord::HashDelimiter { .. } => continue,
                    DrRecord::Insert { table_handle, row } => {
                        apply_insert(engine, ctx, table_handle, row, remote_cluster, policy, export, &mut outcome)?;
                    }
                    DrRecord::Delete { table_handle, row } => {
                        apply_delete(engine, ctx, table_handle, row, remote_cluster, policy, export, &mut outcome)?;
                    }
                    DrRecord::DeleteByIndex { table_handle, index_crc, key } => {
                        apply_delete_by_index(engine, ctx, table_handle, index_crc, key, remote_cluster, policy, export, &mut outcome)?;
                    }
                    DrRecord::Update { table_handle, before, after } => {
                        apply_update(engine, ctx, table_handle, before, after, remote_cluster, policy, export, &mut outcome)?;
                    }
                    DrRecord::UpdateByIndex { table_handle, index_crc, key, after } => {
                        apply_update_by_index(engine, ctx, table_handle, index_crc, key, after, remote_cluster, policy, export, &mut outcome)?;
                    }
                    DrRecord::Truncate { table_handle, name, .. } => {
                        tracing::debug!(table = %name, "applying replicated truncate");
                        engine.truncate_table(ctx, table_handle, true)?;
                    }
                }
                outcome.records_applied += 1;
            }
            outcome.transactions_applied += 1;
        }
        Ok(outcome)
    }
}

fn table_for<'a>(engine: &'a mut Engine, handle: i64) -> MerlinResult<&'a mut PersistentTable> {
    engine
        .table_mut(handle)
        .ok_or_else(|| StorageError::TableNotFound(handle).into())
}

/// The local row a delete/update record targets: by primary key when the
/// table has one, else by visible-column equality. Image comparison against
/// the expected row happens at the caller.
fn find_candidate(table: &PersistentTable, expected: &OwnedRow) -> Option<TupleAddress> {
    match table.primary_key_index() {
        Some(pk) => pk.unique_matching_tuple(expected),
        None => table.lookup_tuple(expected, LookupMode::ByValues),
    }
}

/// Rows whose unique-index keys collide with `incoming`, deduplicated, plus
/// whether the primary key is among the colliding indexes.
fn conflicting_rows(
    table: &PersistentTable,
    incoming: &OwnedRow,
    exclude: Option<TupleAddress>,
) -> (Vec<(TupleAddress, OwnedRow)>, bool) {
    let pk_name = table.primary_key_index().map(|i| i.name().to_string());
    let mut found: Vec<(TupleAddress, OwnedRow)> = Vec::new();
    let mut on_primary_key = false;
    for i in 0..table.index_count() {
        let index = table.index(i);
        if !index.is_unique() {
            continue;
        }
        for addr in index.matching_tuples(incoming) {
            if Some(addr) == exclude || found.iter().any(|(a, _)| *a == addr) {
                continue;
            }
            if pk_name.as_deref() == Some(index.name()) {
                on_primary_key = true;
            }
            found.push((addr, table.tuple(addr).image()));
        }
    }
    (found, on_primary_key)
}

#[allow(clippy::too_many_arguments)]
fn apply_insert(
    engine: &mut Engine,
    ctx: &mut ExecContext,
    handle: i64,
    row: OwnedRow,
    remote_cluster: ClusterId,
    policy: &dyn ConflictResolutionPolicy,
    export: &mut dyn ConflictExportSink,
    outcome: &mut ApplyOutcome,
) -> MerlinResult<()> {
    let active_active = ctx.active_active_dr;
    let table = table_for(engine, handle)?;
    match table.insert_tuple(ctx, &row) {
        Ok(_) => Ok(()),
        Err(MerlinError::Storage(StorageError::UniqueViolation { .. })) if active_active => {
            let (conflicting, on_pk) = conflicting_rows(table, &row, None);
            let mut report = ConflictReport {
                table_name: table.name().to_string(),
                action_type: DrRecordType::Insert,
                delete_conflict: DrConflictType::NoConflict,
                insert_conflict: DrConflictType::ConstraintViolation,
                conflicts_on_primary_key: on_pk,
                decision: ConflictDecision::RejectRemoteChange,
                remote_cluster,
                existing_for_delete: vec![],
                expected_for_delete: vec![],
                existing_for_insert: conflicting.iter().map(|(_, r)| r.clone()).collect(),
                new_for_insert: vec![row.clone()],
            };
            report.decision = policy.decide(&report, ctx.cluster_id, remote_cluster);
            if report.decision == ConflictDecision::AcceptRemoteChange {
                for (addr, _) in &conflicting {
                    table.delete_tuple(ctx, *addr, true)?;
                }
                table.insert_tuple(ctx, &row)?;
            }
            finish_report(table, report, export, outcome);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[allow(clippy::too_many_arguments)]
fn apply_delete(
    engine: &mut Engine,
    ctx: &mut ExecContext,
    handle: i64,
    expected: OwnedRow,
    remote_cluster: ClusterId,
    policy: &dyn ConflictResolutionPolicy,
    export: &mut dyn ConflictExportSink,
    outcome: &mut ApplyOutcome,
) -> MerlinResult<()> {
    let table = table_for(engine, handle)?;
    let candidate = find_candidate(table, &expected);

    if let Some(addr) = candidate {
        if table.tuple(addr).equals_including_hidden(&expected) {
            return table.delete_tuple(ctx, addr, true);
        }
    }

    let (delete_conflict, existing) = match candidate {
        Some(addr) => (
            DrConflictType::ExpectedRowMismatch,
            vec![table.tuple(addr).image()],
        ),
        None => (DrConflictType::ExpectedRowMissing, vec![]),
    };
    let mut report = ConflictReport {
        table_name: table.name().to_string(),
        action_type: DrRecordType::Delete,
        delete_conflict,
        insert_conflict: DrConflictType::NoConflict,
        conflicts_on_primary_key: false,
        decision: ConflictDecision::RejectRemoteChange,
        remote_cluster,
        existing_for_delete: existing,
        expected_for_delete: vec![expected],
        existing_for_insert: vec![],
        new_for_insert: vec![],
    };
    report.decision = policy.decide(&report, ctx.cluster_id, remote_cluster);
    if report.decision == ConflictDecision::AcceptRemoteChange {
        if let Some(addr) = candidate {
            table.delete_tuple(ctx, addr, true)?;
        }
    }
    finish_report(table, report, export, outcome);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn apply_delete_by_index(
    engine: &mut Engine,
    ctx: &mut ExecContext,
    handle: i64,
    index_crc: u32,
    key: OwnedRow,
    remote_cluster: ClusterId,
    policy: &dyn ConflictResolutionPolicy,
    export: &mut dyn ConflictExportSink,
    outcome: &mut ApplyOutcome,
) -> MerlinResult<()> {
    let table = table_for(engine, handle)?;
    let addr = match table.index_by_column_crc(index_crc) {
        Some(index) => index.lookup_key_row(&key),
        None => {
            return Err(DrError::UnknownIndexIdentity {
                crc: index_crc,
                table: table.name().to_string(),
            }
            .into())
        }
    };
    match addr {
        Some(addr) => table.delete_tuple(ctx, addr, true),
        None => {
            let mut report = ConflictReport {
                table_name: table.name().to_string(),
                action_type: DrRecordType::Delete,
                delete_conflict: DrConflictType::ExpectedRowMissing,
                insert_conflict: DrConflictType::NoConflict,
                conflicts_on_primary_key: false,
                decision: ConflictDecision::RejectRemoteChange,
                remote_cluster,
                existing_for_delete: vec![],
                expected_for_delete: vec![key],
                existing_for_insert: vec![],
                new_for_insert: vec![],
            };
            report.decision = policy.decide(&report, ctx.cluster_id, remote_cluster);
            finish_report(table, report, export, outcome);
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn apply_update(
    engine: &mut Engine,
    ctx: &mut ExecContext,
    handle: i64,
    before: OwnedRow,
    after: OwnedRow,
    remote_cluster: ClusterId,
    policy: &dyn ConflictResolutionPolicy,
    export: &mut dyn ConflictExportSink,
    outcome: &mut ApplyOutcome,
) -> MerlinResult<()> {
    let table = table_for(engine, handle)?;
    let candidate = find_candidate(table, &before);

    let delete_conflict = match candidate {
        Some(addr) if table.tuple(addr).equals_including_hidden(&before) => DrConflictType::NoConflict,
        Some(_) => DrConflictType::ExpectedRowMismatch,
        None => DrConflictType::ExpectedRowMissing,
    };
    let (conflicting, on_pk) = conflicting_rows(table, &after, candidate);
    let insert_conflict = if conflicting.is_empty() {
        DrConflictType::NoConflict
    } else {
        DrConflictType::ConstraintViolation
    };

    if delete_conflict == DrConflictType::NoConflict && insert_conflict == DrConflictType::NoConflict {
        let addr = candidate.expect("clean delete side implies a candidate");
        table.delete_tuple(ctx, addr, true)?;
        table.insert_tuple(ctx, &after)?;
        return Ok(());
    }

    let mut report = ConflictReport {
        table_name: table.name().to_string(),
        action_type: DrRecordType::Update,
        delete_conflict,
        insert_conflict,
        conflicts_on_primary_key: on_pk,
        decision: ConflictDecision::RejectRemoteChange,
        remote_cluster,
        existing_for_delete: match (delete_conflict, candidate) {
            (DrConflictType::ExpectedRowMismatch, Some(addr)) => vec![table.tuple(addr).image()],
            _ => vec![],
        },
        expected_for_delete: if delete_conflict != DrConflictType::NoConflict {
            vec![before.clone()]
        } else {
            vec![]
        },
        existing_for_insert: conflicting.iter().map(|(_, r)| r.clone()).collect(),
        new_for_insert: if insert_conflict != DrConflictType::NoConflict {
            vec![after.clone()]
        } else {
            vec![]
        },
    };
    report.decision = policy.decide(&report, ctx.cluster_id, remote_cluster);
    if report.decision == ConflictDecision::AcceptRemoteChange {
        if let Some(addr) = candidate {
            table.delete_tuple(ctx, addr, true)?;
        }
        for (addr, _) in &conflicting {
            table.delete_tuple(ctx, *addr, true)?;
        }
        table.insert_tuple(ctx, &after)?;
    }
    finish_report(table, report, export, outcome);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn apply_update_by_index(
    engine: &mut Engine,
    ctx: &mut ExecContext,
    handle: i64,
    index_crc: u32,
    key: OwnedRow,
    after: OwnedRow,
    remote_cluster: ClusterId,
    policy: &dyn ConflictResolutionPolicy,
    export: &mut dyn ConflictExportSink,
    outcome: &mut ApplyOutcome,
) -> MerlinResult<()> {
    let table = table_for(engine, handle)?;
    let addr = match table.index_by_column_crc(index_crc) {
        Some(index) => index.lookup_key_row(&key),
        None => {
            return Err(DrError::UnknownIndexIdentity {
                crc: index_crc,
                table: table.name().to_string(),
            }
            .into())
        }
    };
    match addr {
        Some(addr) => {
            table.delete_tuple(ctx, addr, true)?;
            table.insert_tuple(ctx, &after)?;
            Ok(())
        }
        None => {
            let mut report = ConflictReport {
                table_name: table.name().to_string(),
                action_type: DrRecordType::Update,
                delete_conflict: DrConflictType::ExpectedRowMissing,
                insert_conflict: DrConflictType::NoConflict,
                conflicts_on_primary_key: false,
                decision: ConflictDecision::RejectRemoteChange,
                remote_cluster,
                existing_for_delete: vec![],
                expected_for_delete: vec![key],
                existing_for_insert: vec![],
                new_for_insert: vec![],
            };
            report.decision = policy.decide(&report, ctx.cluster_id, remote_cluster);
            finish_report(table, report, export, outcome);
            Ok(())
        }
    }
}

fn finish_report(
    table: &PersistentTable,
    report: ConflictReport,
    export: &mut dyn ConflictExportSink,
    outcome: &mut ApplyOutcome,
) {
    tracing::warn!(
        table = %report.table_name,
        action = ?report.action_type,
        delete_conflict = ?report.delete_conflict,
        insert_conflict = ?report.insert_conflict,
        decision = ?report.decision,
        "replication conflict detected"
    );
    emit_conflict_rows(&report, table.schema().dr_timestamp_column_index(), export);
    outcome.conflicts.push(report);
}
