//! Conflict taxonomy and export emission for active-active replication.
//!
//! Every apply of a remote change classifies exactly one delete-side and one
//! insert-side outcome. A conflict populates up to four tuple carriers
//! (existing/expected for the delete side, existing/new for the insert side)
//! and emits one export row per populated carrier for downstream resolution.

use merlin_common::datum::{Datum, OwnedRow};
use merlin_common::types::ClusterId;
use merlin_dr::DrRecordType;

/// Delete-side: NoConflict | ExpectedRowMissing | ExpectedRowMismatch.
/// Insert-side: NoConflict | ConstraintViolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrConflictType {
    NoConflict,
    ExpectedRowMissing,
    ExpectedRowMismatch,
    ConstraintViolation,
}

impl DrConflictType {
    /// Four-character export code.
    pub fn export_code(self) -> &'static str {
        match self {
            DrConflictType::NoConflict => "NONE",
            DrConflictType::ExpectedRowMissing => "MISS",
            DrConflictType::ExpectedRowMismatch => "MSMT",
            DrConflictType::ConstraintViolation => "CNST",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictDecision {
    AcceptRemoteChange,
    RejectRemoteChange,
}

impl ConflictDecision {
    pub fn export_code(self) -> &'static str {
        match self {
            ConflictDecision::AcceptRemoteChange => "A",
            ConflictDecision::RejectRemoteChange => "R",
        }
    }
}

/// Which role an exported tuple plays in the conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictRowType {
    ExistingRow,
    ExpectedRow,
    NewRow,
}

impl ConflictRowType {
    pub fn export_code(self) -> &'static str {
        match self {
            ConflictRowType::ExistingRow => "EXT",
            ConflictRowType::ExpectedRow => "EXP",
            ConflictRowType::NewRow => "NEW",
        }
    }
}

/// One classified conflict, with the tuple carriers the reporter chose to
/// include. The resolution policy reads this; the export stream receives one
/// row per carrier tuple.
#[derive(Debug, Clone)]
pub struct ConflictReport {
    pub table_name: String,
    pub action_type: DrRecordType,
    pub delete_conflict: DrConflictType,
    pub insert_conflict: DrConflictType,
    pub conflicts_on_primary_key: bool,
    pub decision: ConflictDecision,
    pub remote_cluster: ClusterId,
    pub existing_for_delete: Vec<OwnedRow>,
    pub expected_for_delete: Vec<OwnedRow>,
    pub existing_for_insert: Vec<OwnedRow>,
    pub new_for_insert: Vec<OwnedRow>,
}

impl ConflictReport {
    pub fn has_conflict(&self) -> bool {
        self.delete_conflict != DrConflictType::NoConflict
            || self.insert_conflict != DrConflictType::NoConflict
    }

    /// Clusters hold divergent data for mismatch and constraint conflicts; a
    /// missing expected row means they already agree on the absence.
    pub fn diverges(&self) -> bool {
        self.delete_conflict == DrConflictType::ExpectedRowMismatch
            || self.insert_conflict == DrConflictType::ConstraintViolation
    }

    fn action_code(&self) -> &'static str {
        match self.action_type {
            DrRecordType::Insert => "I",
            DrRecordType::Update | DrRecordType::UpdateByIndex => "U",
            _ => "D",
        }
    }
}

/// Pluggable resolution: the core mandates reporting, not a winner.
pub trait ConflictResolutionPolicy {
    fn decide(
        &self,
        report: &ConflictReport,
        local_cluster: ClusterId,
        remote_cluster: ClusterId,
    ) -> ConflictDecision;
}

/// Default convention: the cluster with the higher id wins.
pub struct HigherClusterWins;

impl ConflictResolutionPolicy for HigherClusterWins {
    fn decide(
        &self,
        _report: &ConflictReport,
        local_cluster: ClusterId,
        remote_cluster: ClusterId,
    ) -> ConflictDecision {
        if remote_cluster > local_cluster {
            ConflictDecision::AcceptRemoteChange
        } else {
            ConflictDecision::RejectRemoteChange
        }
    }
}

/// One row of the conflict export table.
#[derive(Debug, Clone)]
pub struct ConflictExportRow {
    pub row_type: &'static str,
    pub action_type: &'static str,
    pub conflict_type: &'static str,
    pub conflicts_on_primary_key: bool,
    pub decision: &'static str,
    /// Originating cluster of this tuple, read from its hidden timestamp.
    pub cluster_id: u8,
    pub timestamp: i64,
    pub divergence: &'static str,
    pub table_name: String,
    /// JSON image of the tuple for operator consumption.
    pub tuple: String,
}

/// Receiver of conflict export rows (the export table's stream).
pub trait ConflictExportSink {
    fn export_row(&mut self, row: ConflictExportRow);
}

/// Export sink retaining rows in memory for inspection.
#[derive(Debug, Default)]
pub struct BufferingConflictExport {
    pub rows: Vec<ConflictExportRow>,
}

impl BufferingConflictExport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConflictExportSink for BufferingConflictExport {
    fn export_row(&mut self, row: ConflictExportRow) {
        self.rows.push(row);
    }
}

/// Emit one export row per populated carrier, delete-side carriers first.
pub fn emit_conflict_rows(
    report: &ConflictReport,
    dr_timestamp_column: Option<usize>,
    export: &mut dyn ConflictExportSink,
) {
    let divergence = if report.diverges() { "D" } else { "C" };
    let mut emit = |rows: &[OwnedRow], row_type: ConflictRowType, conflict: DrConflictType| {
        for row in rows {
            let (cluster_id, timestamp) = row_origin(row, dr_timestamp_column);
            export.export_row(ConflictExportRow {
                row_type: row_type.export_code(),
                action_type: report.action_code(),
                conflict_type: conflict.export_code(),
                conflicts_on_primary_key: report.conflicts_on_primary_key,
                decision: report.decision.export_code(),
                cluster_id,
                timestamp,
                divergence,
                table_name: report.table_name.clone(),
                tuple: serde_json::to_string(&row.values).unwrap_or_default(),
            });
        }
    };
    emit(&report.existing_for_delete, ConflictRowType::ExistingRow, report.delete_conflict);
    emit(&report.expected_for_delete, ConflictRowType::ExpectedRow, report.delete_conflict);
    emit(&report.existing_for_insert, ConflictRowType::ExistingRow, report.insert_conflict);
    emit(&report.new_for_insert, ConflictRowType::NewRow, report.insert_conflict);
}

/// Cluster id and timestamp a tuple was written with, from its hidden DR
/// timestamp column.
fn row_origin(row: &OwnedRow, dr_timestamp_column: Option<usize>) -> (u8, i64) {
    if let Some(col) = dr_timestamp_column {
        if let Some(Datum::BigInt(ts)) = row.get(col) {
            return (merlin_common::types::DrTimestamp(*ts).cluster_id().0, *ts);
        }
    }
    (0, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(delete: DrConflictType, insert: DrConflictType) -> ConflictReport {
        ConflictReport {
            table_name: "p_table".into(),
            action_type: DrRecordType::Update,
            delete_conflict: delete,
            insert_conflict: insert,
            conflicts_on_primary_key: false,
            decision: ConflictDecision::RejectRemoteChange,
            remote_cluster: ClusterId(1),
            existing_for_delete: vec![],
            expected_for_delete: vec![],
            existing_for_insert: vec![],
            new_for_insert: vec![],
        }
    }

    #[test]
    fn test_one_export_row_per_carrier() {
        let mut r = report(
            DrConflictType::ExpectedRowMismatch,
            DrConflictType::ConstraintViolation,
        );
        let row = OwnedRow::new(vec![Datum::TinyInt(42)]);
        r.existing_for_delete.push(row.clone());
        r.expected_for_delete.push(row.clone());
        r.existing_for_insert.push(row.clone());
        r.new_for_insert.push(row);

        let mut export = BufferingConflictExport::new();
        emit_conflict_rows(&r, None, &mut export);
        assert_eq!(export.rows.len(), 4);
        assert_eq!(export.rows[0].row_type, "EXT");
        assert_eq!(export.rows[0].conflict_type, "MSMT");
        assert_eq!(export.rows[1].row_type, "EXP");
        assert_eq!(export.rows[2].conflict_type, "CNST");
        assert_eq!(export.rows[3].row_type, "NEW");
        assert!(export.rows.iter().all(|r| r.divergence == "D"));
    }

    #[test]
    fn test_missing_row_does_not_diverge() {
        let mut r = report(DrConflictType::ExpectedRowMissing, DrConflictType::NoConflict);
        r.expected_for_delete.push(OwnedRow::new(vec![Datum::TinyInt(1)]));
        let mut export = BufferingConflictExport::new();
        emit_conflict_rows(&r, None, &mut export);
        assert_eq!(export.rows.len(), 1);
        assert_eq!(export.rows[0].divergence, "C");
        assert_eq!(export.rows[0].conflict_type, "MISS");
    }

    #[test]
    fn test_row_origin_from_hidden_timestamp() {
        use merlin_common::types::{DrTimestamp, UniqueId};
        let ts = DrTimestamp::new(ClusterId(3), UniqueId(70));
        let row = OwnedRow::new(vec![Datum::TinyInt(1), Datum::BigInt(ts.0)]);
        assert_eq!(row_origin(&row, Some(1)), (3, ts.0));
        assert_eq!(row_origin(&row, None), (0, 0));
    }

    #[test]
    fn test_higher_cluster_wins() {
        let r = report(DrConflictType::NoConflict, DrConflictType::ConstraintViolation);
        let policy = HigherClusterWins;
        assert_eq!(
            policy.decide(&r, ClusterId(2), ClusterId(1)),
            ConflictDecision::RejectRemoteChange
        );
        assert_eq!(
            policy.decide(&r, ClusterId(1), ClusterId(2)),
            ConflictDecision::AcceptRemoteChange
        );
    }
}
