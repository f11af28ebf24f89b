//! # Module Status: PRODUCTION
//! The DR binary log — replication producer side.
//!
//! ## Golden Path (write replication)
//! ```text
//! PersistentTable DML
//!   → DrTupleStream.append_tuple / append_update_record   [mark captured]
//!   → storage + index mutation
//!     → failure? DrTupleStream.rollback_to(mark)          [no partial bytes]
//!   → undo action registered with the mark
//! commit → DrTupleStream.end_transaction                  [CRC32C sealed]
//! flush  → DrTopend.push_dr_buffer                        [ships to peer]
//! ```
//!
//! ## Prohibited Patterns
//! - Mutating storage before the stream append → a failed append would leave
//!   indexes and the log disagreeing
//! - Flushing bytes of an open transaction → the peer would replay an abort

pub mod stream;
pub mod wire;

pub use stream::{
    BufferingTopend, DrCommittedInfo, DrTopend, DrTupleStream, StreamBlock, INVALID_DR_MARK,
};
pub use wire::{decode_log, DrHashFlag, DrRecord, DrRecordType, DrTransaction, PROTOCOL_VERSION};
