//! The DR tuple stream: per-partition producer of the binary replication log.
//!
//! One stream instance exists per partition, plus one for replicated tables,
//! both driven single-threaded by the partition's executor. A transaction
//! opens lazily on its first append, accumulates framed records, and is
//! sealed by `end_transaction` with a length backfill and a CRC32C trailer.
//! Appends return a byte mark; `rollback_to` truncates the open transaction
//! back to a mark so an aborted operation leaves no bytes behind.
//!
//! ## Invariants
//! - Committed sequence numbers are strictly monotonic per stream.
//! - No bytes of an aborted transaction ever reach the topend.
//! - A transaction that never appended anything is never begun on the wire;
//!   `end_transaction` for it is a no-op.

use std::collections::VecDeque;

use bytes::{BufMut, BytesMut};

use merlin_common::config::{DrConfig, MAGIC_DR_TRANSACTION_PADDING};
use merlin_common::datum::OwnedRow;
use merlin_common::error::DrError;
use merlin_common::types::{PartitionId, SequenceNumber, SpHandle, TableSignature, UniqueId};

use crate::wire::{
    self, DrHashFlag, DrRecordType, BEGIN_HASH_FLAG_OFFSET, BEGIN_RECORD_SIZE,
    BEGIN_TXN_LENGTH_OFFSET, END_RECORD_SIZE, HASH_DELIMITER_SIZE, PROTOCOL_VERSION,
    TXN_RECORD_HEADER_SIZE,
};

/// Mark returned by appends on a disabled stream; `rollback_to` ignores it.
pub const INVALID_DR_MARK: u64 = u64::MAX;

/// Sentinel partition hash carried by truncate records.
pub const TRUNCATE_PAR_HASH: i32 = 0;

/// A chunk of committed log bytes handed to the topend on flush.
#[derive(Debug, Clone)]
pub struct StreamBlock {
    /// Absolute stream offset of the first byte.
    pub uso: u64,
    pub data: Vec<u8>,
}

/// Receiver for flushed DR buffers (the wire to the peer cluster).
pub trait DrTopend {
    fn push_dr_buffer(&mut self, partition: PartitionId, block: StreamBlock);
}

/// Topend that retains pushed buffers in memory. The test harnesses on both
/// sides of the apply path drain it; a networked deployment would forward
/// the bytes instead.
#[derive(Debug, Default)]
pub struct BufferingTopend {
    pub blocks: VecDeque<(PartitionId, StreamBlock)>,
}

impl BufferingTopend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received_any(&self) -> bool {
        !self.blocks.is_empty()
    }
}

impl DrTopend for BufferingTopend {
    fn push_dr_buffer(&mut self, partition: PartitionId, block: StreamBlock) {
        self.blocks.push_back((partition, block));
    }
}

/// Committed high-water mark of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrCommittedInfo {
    pub sequence: SequenceNumber,
    pub sp_unique_id: UniqueId,
    pub mp_unique_id: UniqueId,
}

pub struct DrTupleStream {
    /// Appends on a disabled stream write nothing and return no mark. The
    /// sink disables local streams while applying a remote log.
    pub enabled: bool,

    partition_id: PartitionId,
    capacity: usize,
    secondary_capacity: usize,
    row_budget: i64,

    /// Committed-but-unflushed bytes followed by the open transaction.
    buf: Vec<u8>,
    /// Absolute stream offset of `buf[0]`.
    uso: u64,
    /// Length of the committed prefix of `buf`.
    committed_len: usize,

    opened: bool,
    /// Sequence/unique id staged by an explicit `begin_transaction`.
    pending: Option<(SequenceNumber, UniqueId)>,
    begin_txn_uso: u64,
    open_sequence: SequenceNumber,
    open_unique_id: UniqueId,
    txn_row_count: i64,

    hash_flag: DrHashFlag,
    first_par_hash: i32,
    last_par_hash: i32,

    next_sequence: SequenceNumber,
    committed_sequence: SequenceNumber,
    last_committed_sp_unique_id: UniqueId,
    last_committed_mp_unique_id: UniqueId,
}

impl DrTupleStream {
    pub fn new(partition_id: PartitionId, config: &DrConfig) -> DrTupleStream {
        DrTupleStream {
            enabled: true,
            partition_id,
            capacity: config.buffer_capacity,
            secondary_capacity: config.secondary_capacity,
            row_budget: config.row_budget,
            buf: Vec::with_capacity(config.buffer_capacity.min(64 * 1024)),
            uso: 0,
            committed_len: 0,
            opened: false,
            pending: None,
            begin_txn_uso: 0,
            open_sequence: SequenceNumber(0),
            open_unique_id: UniqueId(0),
            txn_row_count: 0,
            hash_flag: DrHashFlag::None,
            first_par_hash: 0,
            last_par_hash: 0,
            next_sequence: SequenceNumber(1),
            committed_sequence: SequenceNumber(0),
            last_committed_sp_unique_id: UniqueId(0),
            last_committed_mp_unique_id: UniqueId(0),
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn is_replicated_stream(&self) -> bool {
        self.partition_id.is_replicated()
    }

    pub fn set_default_capacity(&mut self, capacity: usize) {
        assert!(!self.opened, "cannot resize a stream with an open transaction");
        self.capacity = capacity;
    }

    pub fn set_secondary_capacity(&mut self, capacity: usize) {
        assert!(!self.opened, "cannot resize a stream with an open transaction");
        self.secondary_capacity = capacity;
    }

    pub fn set_row_budget(&mut self, budget: i64) {
        self.row_budget = budget;
    }

    pub fn last_committed(&self) -> DrCommittedInfo {
        DrCommittedInfo {
            sequence: self.committed_sequence,
            sp_unique_id: self.last_committed_sp_unique_id,
            mp_unique_id: self.last_committed_mp_unique_id,
        }
    }

    /// Stage the sequence number and unique id for the next transaction.
    /// The begin record itself is only written when the first append
    /// arrives, so a transaction with no appends leaves no bytes behind.
    pub fn begin_transaction(
        &mut self,
        sequence: SequenceNumber,
        unique_id: UniqueId,
    ) -> Result<(), DrError> {
        assert!(!self.opened, "begin_transaction with a transaction already open");
        if sequence != self.next_sequence {
            return Err(DrError::SequenceGap {
                expected: self.next_sequence.0,
                got: sequence.0,
            });
        }
        self.pending = Some((sequence, unique_id));
        Ok(())
    }

    /// Write an insert or delete record. For active-active conflict
    /// detection delete records carry the full row image; when a DR unique
    /// index is supplied the delete ships only the key projection.
    ///
    /// Returns the byte mark to pass to `rollback_to` if the storage
    /// mutation this record describes subsequently fails.
    #[allow(clippy::too_many_arguments)]
    pub fn append_tuple(
        &mut self,
        last_committed_sp: SpHandle,
        table_handle: i64,
        _txn_id: merlin_common::types::TxnId,
        sp_handle: SpHandle,
        unique_id: UniqueId,
        row: &OwnedRow,
        record_type: DrRecordType,
        unique_index: Option<(&[usize], u32)>,
        par_hash: i32,
    ) -> Result<u64, DrError> {
        if !self.enabled {
            return Ok(INVALID_DR_MARK);
        }
        debug_assert!(sp_handle >= last_committed_sp);

        let mut body = BytesMut::new();
        match (record_type, unique_index) {
            (DrRecordType::Insert, _) => {
                body.put_u8(DrRecordType::Insert as u8);
                body.put_i64(table_handle);
                wire::write_row(&mut body, row);
            }
            (DrRecordType::Delete, None) => {
                body.put_u8(DrRecordType::Delete as u8);
                body.put_i64(table_handle);
                wire::write_row(&mut body, row);
            }
            (DrRecordType::Delete, Some((columns, crc))) => {
                body.put_u8(DrRecordType::DeleteByIndex as u8);
                body.put_i64(table_handle);
                body.put_u32(crc);
                wire::write_row(&mut body, &row.project(columns));
            }
            (other, _) => panic!("append_tuple cannot write a {:?} record", other),
        }

        self.append_record(&body, record_type.row_cost(), unique_id, par_hash, false)
    }

    /// Write an update record: full before image for active-active conflict
    /// detection, or the key projection when a DR unique index is supplied.
    #[allow(clippy::too_many_arguments)]
    pub fn append_update_record(
        &mut self,
        last_committed_sp: SpHandle,
        table_handle: i64,
        _txn_id: merlin_common::types::TxnId,
        sp_handle: SpHandle,
        unique_id: UniqueId,
        before: &OwnedRow,
        after: &OwnedRow,
        unique_index: Option<(&[usize], u32)>,
        par_hash: i32,
    ) -> Result<u64, DrError> {
        if !self.enabled {
            return Ok(INVALID_DR_MARK);
        }
        debug_assert!(sp_handle >= last_committed_sp);

        let mut body = BytesMut::new();
        match unique_index {
            None => {
                body.put_u8(DrRecordType::Update as u8);
                body.put_i64(table_handle);
                wire::write_row(&mut body, before);
                wire::write_row(&mut body, after);
            }
            Some((columns, crc)) => {
                body.put_u8(DrRecordType::UpdateByIndex as u8);
                body.put_i64(table_handle);
                body.put_u32(crc);
                wire::write_row(&mut body, &before.project(columns));
                wire::write_row(&mut body, after);
            }
        }

        self.append_record(&body, DrRecordType::Update.row_cost(), unique_id, par_hash, false)
    }

    /// Write a truncate record carrying the table signature and name.
    #[allow(clippy::too_many_arguments)]
    pub fn append_truncate_record(
        &mut self,
        last_committed_sp: SpHandle,
        table_handle: i64,
        signature: &TableSignature,
        name: &str,
        _txn_id: merlin_common::types::TxnId,
        sp_handle: SpHandle,
        unique_id: UniqueId,
    ) -> Result<u64, DrError> {
        if !self.enabled {
            return Ok(INVALID_DR_MARK);
        }
        debug_assert!(sp_handle >= last_committed_sp);

        let mut body = BytesMut::with_capacity(TXN_RECORD_HEADER_SIZE + 24 + name.len());
        body.put_u8(DrRecordType::Truncate as u8);
        body.put_i64(table_handle);
        body.put_slice(&signature.0);
        body.put_u32(name.len() as u32);
        body.put_slice(name.as_bytes());

        self.append_record(
            &body,
            DrRecordType::Truncate.row_cost(),
            unique_id,
            TRUNCATE_PAR_HASH,
            true,
        )
    }

    /// Seal the open transaction: end record, CRC32C trailer, length
    /// backfill, committed watermark. A transaction that never appended is
    /// a no-op.
    pub fn end_transaction(&mut self, unique_id: UniqueId) -> Result<(), DrError> {
        if !self.opened {
            self.pending = None;
            return Ok(());
        }
        assert_eq!(
            unique_id, self.open_unique_id,
            "end_transaction unique id does not match the open transaction"
        );

        let begin_rel = (self.begin_txn_uso - self.uso) as usize;
        self.buf.push(DrRecordType::End as u8);
        self.buf.extend_from_slice(&self.open_sequence.0.to_be_bytes());

        // Backfill flag and length so the CRC covers their final values.
        let txn_length = (self.buf.len() + 4 - begin_rel) as u32;
        self.buf[begin_rel + BEGIN_HASH_FLAG_OFFSET] = self.hash_flag as u8;
        self.buf[begin_rel + BEGIN_TXN_LENGTH_OFFSET..begin_rel + BEGIN_TXN_LENGTH_OFFSET + 4]
            .copy_from_slice(&txn_length.to_be_bytes());

        let crc = crc32c::crc32c(&self.buf[begin_rel..]);
        self.buf.extend_from_slice(&crc.to_be_bytes());

        self.committed_len = self.buf.len();
        self.committed_sequence = self.open_sequence;
        if unique_id.is_multi_partition() {
            self.last_committed_mp_unique_id = unique_id;
        } else {
            self.last_committed_sp_unique_id = unique_id;
        }
        self.next_sequence = self.open_sequence.next();
        self.opened = false;
        self.txn_row_count = 0;
        Ok(())
    }

    /// Truncate the open transaction back to `mark` and credit the rows it
    /// had appended. Erasing every byte of the transaction un-opens it.
    pub fn rollback_to(&mut self, mark: u64, row_cost: i64) {
        if mark == INVALID_DR_MARK {
            return;
        }
        assert!(
            mark >= self.uso + self.committed_len as u64,
            "rollback mark {} reaches into committed bytes",
            mark
        );
        let rel = (mark - self.uso) as usize;
        assert!(rel <= self.buf.len());
        self.buf.truncate(rel);
        self.txn_row_count = (self.txn_row_count - row_cost).max(0);
        if self.opened && mark <= self.begin_txn_uso {
            self.opened = false;
            self.pending = None;
        }
    }

    /// Push committed bytes to the topend. Open-transaction bytes are never
    /// flushed. Returns whether a buffer was pushed.
    pub fn periodic_flush(
        &mut self,
        last_committed_sp: SpHandle,
        topend: &mut dyn DrTopend,
    ) -> bool {
        if self.committed_len == 0 {
            return false;
        }
        tracing::trace!(
            partition = self.partition_id.0,
            bytes = self.committed_len,
            sp_handle = last_committed_sp.0,
            "flushing DR buffer"
        );
        let block = StreamBlock {
            uso: self.uso,
            data: self.buf[..self.committed_len].to_vec(),
        };
        self.buf.drain(..self.committed_len);
        self.uso += self.committed_len as u64;
        self.committed_len = 0;
        topend.push_dr_buffer(self.partition_id, block);
        true
    }

    /// Bytes currently queued (committed and open).
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    // ── internals ────────────────────────────────────────────────────────

    fn append_record(
        &mut self,
        body: &[u8],
        row_cost: i64,
        unique_id: UniqueId,
        par_hash: i32,
        special_hash: bool,
    ) -> Result<u64, DrError> {
        if self.txn_row_count + row_cost > self.row_budget {
            return Err(DrError::RowBudgetExceeded {
                budget: self.row_budget,
            });
        }

        let mark = self.uso + self.buf.len() as u64;
        if !self.opened {
            let (sequence, staged_uid) = match self.pending.take() {
                Some((seq, uid)) => {
                    debug_assert_eq!(uid, unique_id);
                    (seq, uid)
                }
                None => (self.next_sequence, unique_id),
            };
            self.ensure_capacity(BEGIN_RECORD_SIZE + body.len())?;
            self.write_begin_record(sequence, staged_uid, par_hash, special_hash);
        } else {
            debug_assert_eq!(unique_id, self.open_unique_id);
            let delimiter = self.needs_hash_delimiter(par_hash);
            let extra = if delimiter { HASH_DELIMITER_SIZE } else { 0 };
            self.ensure_capacity(extra + body.len())?;
            if delimiter {
                self.write_hash_delimiter(par_hash);
            }
        }

        self.buf.extend_from_slice(body);
        self.txn_row_count += row_cost;
        Ok(mark)
    }

    fn write_begin_record(
        &mut self,
        sequence: SequenceNumber,
        unique_id: UniqueId,
        par_hash: i32,
        special_hash: bool,
    ) {
        self.begin_txn_uso = self.uso + self.buf.len() as u64;
        self.open_sequence = sequence;
        self.open_unique_id = unique_id;
        self.opened = true;
        self.first_par_hash = par_hash;
        self.last_par_hash = par_hash;
        self.hash_flag = if self.is_replicated_stream() {
            DrHashFlag::Replicated
        } else if special_hash {
            DrHashFlag::Special
        } else {
            DrHashFlag::Single
        };

        self.buf.push(PROTOCOL_VERSION);
        self.buf.push(DrRecordType::Begin as u8);
        self.buf.extend_from_slice(&sequence.0.to_be_bytes());
        self.buf.extend_from_slice(&unique_id.0.to_be_bytes());
        self.buf.push(self.hash_flag as u8);
        self.buf.extend_from_slice(&0u32.to_be_bytes()); // txnLength, backfilled
        self.buf.extend_from_slice(&self.first_par_hash.to_be_bytes());
    }

    /// On the transition from one distinct partition hash to two, the stream
    /// interleaves a delimiter so the consumer can segment rows by hash.
    fn needs_hash_delimiter(&mut self, par_hash: i32) -> bool {
        if self.is_replicated_stream() || par_hash == self.last_par_hash {
            return false;
        }
        self.last_par_hash = par_hash;
        if self.hash_flag == DrHashFlag::Single {
            self.hash_flag = DrHashFlag::Multi;
        }
        true
    }

    fn write_hash_delimiter(&mut self, par_hash: i32) {
        self.buf.push(DrRecordType::HashDelimiter as u8);
        self.buf.extend_from_slice(&par_hash.to_be_bytes());
    }

    /// Admit `additional` bytes plus room for the end record, rolling over
    /// to the secondary capacity for an oversized transaction.
    fn ensure_capacity(&mut self, additional: usize) -> Result<(), DrError> {
        let needed =
            self.buf.len() + additional + END_RECORD_SIZE + MAGIC_DR_TRANSACTION_PADDING;
        if needed <= self.capacity {
            return Ok(());
        }
        if self.secondary_capacity > self.capacity && needed <= self.secondary_capacity {
            tracing::debug!(
                partition = self.partition_id.0,
                needed,
                "DR transaction rolled over to the secondary buffer"
            );
            return Ok(());
        }
        Err(DrError::BufferOverflow {
            needed,
            capacity: self.capacity.max(self.secondary_capacity),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use merlin_common::datum::Datum;
    use merlin_common::types::TxnId;
    use crate::wire::{decode_log, DrRecord};

    fn row(a: i64) -> OwnedRow {
        OwnedRow::new(vec![Datum::TinyInt(a as i8), Datum::BigInt(a)])
    }

    fn stream() -> DrTupleStream {
        DrTupleStream::new(PartitionId(42), &DrConfig {
            buffer_capacity: 4096,
            secondary_capacity: 32768,
            row_budget: 1000,
        })
    }

    fn append_insert(s: &mut DrTupleStream, uid: UniqueId, r: &OwnedRow, par_hash: i32) -> u64 {
        s.append_tuple(
            SpHandle(0),
            42,
            TxnId(1),
            SpHandle(1),
            uid,
            r,
            DrRecordType::Insert,
            None,
            par_hash,
        )
        .unwrap()
    }

    #[test]
    fn test_empty_transaction_is_noop() {
        let mut s = stream();
        let mut topend = BufferingTopend::new();
        s.end_transaction(UniqueId(7)).unwrap();
        assert!(!s.periodic_flush(SpHandle(0), &mut topend));
        assert_eq!(s.last_committed().sequence, SequenceNumber(0));
    }

    #[test]
    fn test_single_txn_round_trip() {
        let mut s = stream();
        let uid = UniqueId::new(70, PartitionId(42));
        append_insert(&mut s, uid, &row(1), 17);
        append_insert(&mut s, uid, &row(2), 17);
        s.end_transaction(uid).unwrap();

        let mut topend = BufferingTopend::new();
        assert!(s.periodic_flush(SpHandle(1), &mut topend));
        let (_, block) = topend.blocks.pop_front().unwrap();
        let txns = decode_log(&block.data).unwrap();
        assert_eq!(txns.len(), 1);
        assert_eq!(txns[0].sequence, 1);
        assert_eq!(txns[0].unique_id, uid.0);
        assert_eq!(txns[0].hash_flag, DrHashFlag::Single);
        assert_eq!(txns[0].par_hash, 17);
        assert_eq!(txns[0].records.len(), 2);
        assert_eq!(s.last_committed().sequence, SequenceNumber(1));
        assert_eq!(s.last_committed().sp_unique_id, uid);
    }

    #[test]
    fn test_rollback_erases_whole_transaction() {
        let mut s = stream();
        let uid = UniqueId(70);
        let mark = append_insert(&mut s, uid, &row(1), 5);
        s.rollback_to(mark, 1);
        s.end_transaction(uid).unwrap();

        let mut topend = BufferingTopend::new();
        assert!(!s.periodic_flush(SpHandle(1), &mut topend));
        assert_eq!(s.last_committed().sequence, SequenceNumber(0));

        // The next transaction reuses the sequence number.
        let uid2 = UniqueId(71);
        append_insert(&mut s, uid2, &row(2), 5);
        s.end_transaction(uid2).unwrap();
        assert!(s.periodic_flush(SpHandle(2), &mut topend));
        let (_, block) = topend.blocks.pop_front().unwrap();
        let txns = decode_log(&block.data).unwrap();
        assert_eq!(txns[0].sequence, 1);
    }

    #[test]
    fn test_partial_rollback_keeps_earlier_rows() {
        let mut s = stream();
        let uid = UniqueId(70);
        append_insert(&mut s, uid, &row(1), 5);
        let mark = append_insert(&mut s, uid, &row(2), 5);
        s.rollback_to(mark, 1);
        s.end_transaction(uid).unwrap();

        let mut topend = BufferingTopend::new();
        assert!(s.periodic_flush(SpHandle(1), &mut topend));
        let (_, block) = topend.blocks.pop_front().unwrap();
        let txns = decode_log(&block.data).unwrap();
        assert_eq!(txns[0].records.len(), 1);
    }

    #[test]
    fn test_hash_delimiter_on_second_distinct_hash() {
        let mut s = stream();
        let uid = UniqueId(70);
        append_insert(&mut s, uid, &row(1), 5);
        append_insert(&mut s, uid, &row(2), 5);
        append_insert(&mut s, uid, &row(3), 9);
        s.end_transaction(uid).unwrap();

        let mut topend = BufferingTopend::new();
        s.periodic_flush(SpHandle(1), &mut topend);
        let (_, block) = topend.blocks.pop_front().unwrap();
        let txns = decode_log(&block.data).unwrap();
        assert_eq!(txns[0].hash_flag, DrHashFlag::Multi);
        let delimiters: Vec<_> = txns[0]
            .records
            .iter()
            .filter(|r| matches!(r, DrRecord::HashDelimiter { .. }))
            .collect();
        assert_eq!(delimiters.len(), 1);
        assert_eq!(delimiters[0], &DrRecord::HashDelimiter { par_hash: 9 });
    }

    #[test]
    fn test_replicated_stream_flag() {
        let mut s = DrTupleStream::new(
            merlin_common::types::REPLICATED_PARTITION_ID,
            &DrConfig::default(),
        );
        let uid = UniqueId::new(70, merlin_common::types::REPLICATED_PARTITION_ID);
        append_insert(&mut s, uid, &row(1), 0);
        s.end_transaction(uid).unwrap();

        let mut topend = BufferingTopend::new();
        s.periodic_flush(SpHandle(1), &mut topend);
        let (_, block) = topend.blocks.pop_front().unwrap();
        let txns = decode_log(&block.data).unwrap();
        assert_eq!(txns[0].hash_flag, DrHashFlag::Replicated);
        assert_eq!(s.last_committed().mp_unique_id, uid);
        assert_eq!(s.last_committed().sp_unique_id, UniqueId(0));
    }

    #[test]
    fn test_row_budget_exceeded() {
        let mut s = stream();
        s.set_row_budget(2);
        let uid = UniqueId(70);
        append_insert(&mut s, uid, &row(1), 5);
        append_insert(&mut s, uid, &row(2), 5);
        let err = s.append_tuple(
            SpHandle(0),
            42,
            TxnId(1),
            SpHandle(1),
            uid,
            &row(3),
            DrRecordType::Insert,
            None,
            5,
        );
        assert!(matches!(err, Err(DrError::RowBudgetExceeded { budget: 2 })));
    }

    #[test]
    fn test_buffer_overflow_without_secondary() {
        let mut s = DrTupleStream::new(PartitionId(42), &DrConfig {
            buffer_capacity: 256,
            secondary_capacity: 0,
            row_budget: 1000,
        });
        let uid = UniqueId(70);
        let big = OwnedRow::new(vec![Datum::VarChar("x".repeat(400))]);
        let err = s.append_tuple(
            SpHandle(0),
            42,
            TxnId(1),
            SpHandle(1),
            uid,
            &big,
            DrRecordType::Insert,
            None,
            5,
        );
        assert!(matches!(err, Err(DrError::BufferOverflow { .. })));
    }

    #[test]
    fn test_secondary_rollover_admits_large_txn() {
        let mut s = DrTupleStream::new(PartitionId(42), &DrConfig {
            buffer_capacity: 256,
            secondary_capacity: 8192,
            row_budget: 1000,
        });
        let uid = UniqueId(70);
        let big = OwnedRow::new(vec![Datum::VarChar("x".repeat(400))]);
        s.append_tuple(
            SpHandle(0),
            42,
            TxnId(1),
            SpHandle(1),
            uid,
            &big,
            DrRecordType::Insert,
            None,
            5,
        )
        .unwrap();
        s.end_transaction(uid).unwrap();
        let mut topend = BufferingTopend::new();
        assert!(s.periodic_flush(SpHandle(1), &mut topend));
    }

    #[test]
    fn test_disabled_stream_returns_invalid_mark() {
        let mut s = stream();
        s.enabled = false;
        let mark = append_insert(&mut s, UniqueId(70), &row(1), 5);
        assert_eq!(mark, INVALID_DR_MARK);
        s.rollback_to(mark, 1); // no-op
        s.end_transaction(UniqueId(70)).unwrap();
        let mut topend = BufferingTopend::new();
        assert!(!s.periodic_flush(SpHandle(1), &mut topend));
    }

    #[test]
    fn test_explicit_begin_validates_sequence() {
        let mut s = stream();
        assert!(matches!(
            s.begin_transaction(SequenceNumber(5), UniqueId(70)),
            Err(DrError::SequenceGap { expected: 1, got: 5 })
        ));
        s.begin_transaction(SequenceNumber(1), UniqueId(70)).unwrap();
        append_insert(&mut s, UniqueId(70), &row(1), 5);
        s.end_transaction(UniqueId(70)).unwrap();
        assert_eq!(s.last_committed().sequence, SequenceNumber(1));
    }

    #[test]
    fn test_sequences_monotonic_across_flushes() {
        let mut s = stream();
        let mut topend = BufferingTopend::new();
        for i in 0..3 {
            let uid = UniqueId(70 + i);
            append_insert(&mut s, uid, &row(i), 5);
            s.end_transaction(uid).unwrap();
            s.periodic_flush(SpHandle(i), &mut topend);
        }
        let mut sequences = Vec::new();
        for (_, block) in topend.blocks {
            for txn in decode_log(&block.data).unwrap() {
                sequences.push(txn.sequence);
            }
        }
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[test]
    fn test_truncate_record_round_trip() {
        let mut s = stream();
        let uid = UniqueId(70);
        let sig = TableSignature::from_handle(42);
        s.append_truncate_record(SpHandle(0), 42, &sig, "P_TABLE", TxnId(1), SpHandle(1), uid)
            .unwrap();
        s.end_transaction(uid).unwrap();

        let mut topend = BufferingTopend::new();
        s.periodic_flush(SpHandle(1), &mut topend);
        let (_, block) = topend.blocks.pop_front().unwrap();
        let txns = decode_log(&block.data).unwrap();
        assert_eq!(txns[0].hash_flag, DrHashFlag::Special);
        assert_eq!(
            txns[0].records[0],
            DrRecord::Truncate {
                table_handle: 42,
                signature: sig,
                name: "P_TABLE".into()
            }
        );
    }

    #[test]
    fn test_corrupt_crc_discards_txn() {
        let mut s = stream();
        let uid1 = UniqueId(70);
        append_insert(&mut s, uid1, &row(1), 5);
        s.end_transaction(uid1).unwrap();
        let uid2 = UniqueId(71);
        append_insert(&mut s, uid2, &row(2), 5);
        s.end_transaction(uid2).unwrap();

        let mut topend = BufferingTopend::new();
        s.periodic_flush(SpHandle(2), &mut topend);
        let (_, block) = topend.blocks.pop_front().unwrap();
        let mut data = block.data;
        // Flip a byte inside the first transaction's body.
        data[BEGIN_RECORD_SIZE + 2] ^= 0xFF;
        let txns = decode_log(&data).unwrap();
        assert_eq!(txns.len(), 1);
        assert_eq!(txns[0].sequence, 2);
    }
}
