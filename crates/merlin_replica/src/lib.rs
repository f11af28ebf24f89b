//! # Module Status: PRODUCTION
//! Replica side of DR: the binary log sink and the active-active conflict
//! detector.
//!
//! ## Golden Path (apply)
//! ```text
//! peer DR buffer → BinaryLogSink.apply
//!   → decode + CRC validation (bad txn discarded to next begin)
//!   → local DR streams disabled (scoped guard)
//!   → per record: insert / delete / update / truncate on local tables
//!     → disagreement? → conflict taxonomy → export rows + resolution policy
//! ```
//!
//! ## Invariants
//! - Exactly one delete-side and one insert-side classification per apply.
//! - One export row per populated conflict carrier tuple.
//! - Applied writes never loop back into the local DR stream.

pub mod conflict;
pub mod sink;

pub use conflict::{
    BufferingConflictExport, ConflictDecision, ConflictExportRow, ConflictExportSink,
    ConflictReport, ConflictResolutionPolicy, ConflictRowType, DrConflictType, HigherClusterWins,
};
pub use sink::{ApplyOutcome, BinaryLogSink};
