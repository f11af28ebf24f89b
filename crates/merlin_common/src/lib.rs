//! Shared foundation for the MerlinDB storage-and-replication core: scalar
//! values and rows, schemas, typed identifiers, error types and SQLSTATE
//! mapping, and configuration knobs.
//!
//! Nothing here owns storage or performs I/O; the interesting machinery
//! lives in `merlin_storage` (tables, blocks, indexes, undo) and
//! `merlin_dr` / `merlin_replica` (the binary replication log).

pub mod config;
pub mod datum;
pub mod error;
pub mod schema;
pub mod types;
