use thiserror::Error;

use crate::datum::OwnedRow;

/// Convenience alias for `Result<T, MerlinError>`.
pub type MerlinResult<T> = Result<T, MerlinError>;

// SQLSTATE codes surfaced to the frontend. Names and codes are standardized
// where a standard code exists; V-codes are engine specific.
pub const SQLSTATE_INVALID_PARAMETER: &str = "22023";
pub const SQLSTATE_CONSTRAINT_VIOLATION: &str = "23000";
pub const SQLSTATE_OUTPUT_BUFFER_OVERFLOW: &str = "V0001";
pub const SQLSTATE_TEMP_MEMORY_OVERFLOW: &str = "V0002";
/// Non-standard sentinel reserved for errors forced by user invocation.
pub const SQLSTATE_USER_FORCED: &str = "99999";

/// Top-level error type that layer-specific errors convert into.
#[derive(Error, Debug)]
pub enum MerlinError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Replication error: {0}")]
    Dr(#[from] DrError),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MerlinError {
    /// The 5-character SQLSTATE reported with this error.
    pub fn sql_state(&self) -> &'static str {
        match self {
            MerlinError::Storage(e) => e.sql_state(),
            MerlinError::Dr(e) => e.sql_state(),
            MerlinError::InvalidParameter(_) => SQLSTATE_INVALID_PARAMETER,
            MerlinError::Internal(_) => SQLSTATE_USER_FORCED,
        }
    }
}

/// Storage layer errors. Constraint failures carry the conflicting image so
/// the caller can feed conflict reporting.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("NOT NULL constraint failed on column {column} of table {table}")]
    NotNullViolation { table: String, column: String },

    #[error("unique constraint violated on index {index} of table {table}")]
    UniqueViolation {
        table: String,
        index: String,
        /// The row already in the table that owns the conflicting key.
        conflict: Box<OwnedRow>,
    },

    #[error("table {table} exceeds maximum row count {limit}")]
    RowLimitExceeded { table: String, limit: i64 },

    #[error("tuple not found in table {table}")]
    TupleNotFound { table: String },

    #[error("no table registered for DR handle {0}")]
    TableNotFound(i64),
}

impl StorageError {
    pub fn sql_state(&self) -> &'static str {
        match self {
            StorageError::NotNullViolation { .. }
            | StorageError::UniqueViolation { .. }
            | StorageError::RowLimitExceeded { .. } => SQLSTATE_CONSTRAINT_VIOLATION,
            StorageError::TupleNotFound { .. } | StorageError::TableNotFound(_) => {
                SQLSTATE_INVALID_PARAMETER
            }
        }
    }
}

/// DR stream and binary-log errors.
#[derive(Error, Debug)]
pub enum DrError {
    /// Transaction-fatal: the caller must abort the whole transaction.
    #[error("DR buffer overflow: transaction needs {needed} bytes, capacity {capacity}")]
    BufferOverflow { needed: usize, capacity: usize },

    /// Transaction-fatal, reported as a buffer overflow to the frontend.
    #[error("DR transaction exceeded its row budget of {budget} rows")]
    RowBudgetExceeded { budget: i64 },

    #[error("DR protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersionMismatch { expected: u8, actual: u8 },

    #[error("truncated DR record: need {expected} bytes, have {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("unknown DR record type {0}")]
    UnknownRecordType(u8),

    #[error("DR end record checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("malformed DR row image: {0}")]
    MalformedRow(String),

    #[error("DR sequence {got} out of order, expected {expected}")]
    SequenceGap { expected: i64, got: i64 },

    #[error("no unique index with identity crc {crc:#010x} on table {table}")]
    UnknownIndexIdentity { crc: u32, table: String },
}

impl DrError {
    pub fn sql_state(&self) -> &'static str {
        match self {
            DrError::BufferOverflow { .. } | DrError::RowBudgetExceeded { .. } => {
                SQLSTATE_OUTPUT_BUFFER_OVERFLOW
            }
            _ => SQLSTATE_INVALID_PARAMETER,
        }
    }
}
