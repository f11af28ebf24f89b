//! Encode/decode for the DR binary log.
//!
//! All multi-byte integers are big-endian. A transaction is framed as:
//! `[begin record][row records and hash delimiters…][end record]`
//! where the begin record carries the total transaction length and the end
//! record carries a CRC32C over every transaction byte preceding the
//! checksum field itself.

use bytes::{BufMut, BytesMut};

use merlin_common::datum::{Datum, OwnedRow};
use merlin_common::error::DrError;
use merlin_common::types::TableSignature;

type Result<T> = std::result::Result<T, DrError>;

/// Bumped on any incompatible change to the framing below.
pub const PROTOCOL_VERSION: u8 = 4;

// version(1) type(1) sequence(8) uniqueId(8) hashFlag(1) txnLength(4) parHash(4)
pub const BEGIN_RECORD_SIZE: usize = 1 + 1 + 8 + 8 + 1 + 4 + 4;
// version(1) type(1) sequence(8) uniqueId(8)
pub const BEGIN_RECORD_HEADER_SIZE: usize = 1 + 1 + 8 + 8;
// type(1) sequence(8) checksum(4)
pub const END_RECORD_SIZE: usize = 1 + 8 + 4;
// type(1) table handle(8)
pub const TXN_RECORD_HEADER_SIZE: usize = 1 + 8;
// type(1) parHash(4)
pub const HASH_DELIMITER_SIZE: usize = 1 + 4;

/// Byte offset of the hashFlag field within a begin record.
pub const BEGIN_HASH_FLAG_OFFSET: usize = 18;
/// Byte offset of the txnLength field within a begin record.
pub const BEGIN_TXN_LENGTH_OFFSET: usize = 19;
/// Byte offset of the parHash field within a begin record.
pub const BEGIN_PAR_HASH_OFFSET: usize = 23;

/// Record type codes. Stable within a major protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DrRecordType {
    Insert = 1,
    Delete = 2,
    Update = 3,
    Begin = 4,
    End = 5,
    Truncate = 6,
    HashDelimiter = 7,
    DeleteByIndex = 8,
    UpdateByIndex = 9,
}

impl DrRecordType {
    pub fn from_u8(v: u8) -> Result<DrRecordType> {
        Ok(match v {
            1 => DrRecordType::Insert,
            2 => DrRecordType::Delete,
            3 => DrRecordType::Update,
            4 => DrRecordType::Begin,
            5 => DrRecordType::End,
            6 => DrRecordType::Truncate,
            7 => DrRecordType::HashDelimiter,
            8 => DrRecordType::DeleteByIndex,
            9 => DrRecordType::UpdateByIndex,
            other => return Err(DrError::UnknownRecordType(other)),
        })
    }

    /// Cost of one record against the per-transaction row budget. Updates
    /// carry two row images; rollback credits the same amount.
    pub fn row_cost(self) -> i64 {
        match self {
            DrRecordType::Update | DrRecordType::UpdateByIndex => 2,
            _ => 1,
        }
    }
}

/// Per-transaction partition-hash tag on the begin record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DrHashFlag {
    None = 0,
    Replicated = 1,
    Single = 2,
    Multi = 4,
    Special = 8,
}

impl DrHashFlag {
    pub fn from_u8(v: u8) -> Result<DrHashFlag> {
        Ok(match v {
            0 => DrHashFlag::None,
            1 => DrHashFlag::Replicated,
            2 => DrHashFlag::Single,
            4 => DrHashFlag::Multi,
            8 => DrHashFlag::Special,
            other => return Err(DrError::MalformedRow(format!("bad hash flag {}", other))),
        })
    }
}

// ── Cursor read helpers ──────────────────────────────────────────────────

fn ensure(buf: &[u8], need: usize) -> Result<()> {
    if buf.len() < need {
        return Err(DrError::Truncated {
            expected: need,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn read_u8(buf: &mut &[u8]) -> Result<u8> {
    ensure(buf, 1)?;
    let v = buf[0];
    *buf = &buf[1..];
    Ok(v)
}

fn read_u16(buf: &mut &[u8]) -> Result<u16> {
    ensure(buf, 2)?;
    let v = u16::from_be_bytes([buf[0], buf[1]]);
    *buf = &buf[2..];
    Ok(v)
}

fn read_u32(buf: &mut &[u8]) -> Result<u32> {
    ensure(buf, 4)?;
    let v = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    *buf = &buf[4..];
    Ok(v)
}

fn read_i32(buf: &mut &[u8]) -> Result<i32> {
    ensure(buf, 4)?;
    let v = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    *buf = &buf[4..];
    Ok(v)
}

fn read_i64(buf: &mut &[u8]) -> Result<i64> {
    ensure(buf, 8)?;
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&buf[..8]);
    *buf = &buf[8..];
    Ok(i64::from_be_bytes(arr))
}

fn read_i128(buf: &mut &[u8]) -> Result<i128> {
    ensure(buf, 16)?;
    let mut arr = [0u8; 16];
    arr.copy_from_slice(&buf[..16]);
    *buf = &buf[16..];
    Ok(i128::from_be_bytes(arr))
}

fn read_bytes(buf: &mut &[u8], n: usize) -> Result<Vec<u8>> {
    ensure(buf, n)?;
    let v = buf[..n].to_vec();
    *buf = &buf[n..];
    Ok(v)
}

// ── Row image codec ──────────────────────────────────────────────────────

// Wire tags for datums inside row images. Distinct from the order-preserving
// index key encoding in merlin_common.
const TAG_NULL: u8 = 0;
const TAG_TINYINT: u8 = 1;
const TAG_SMALLINT: u8 = 2;
const TAG_INTEGER: u8 = 3;
const TAG_BIGINT: u8 = 4;
const TAG_DOUBLE: u8 = 5;
const TAG_DECIMAL: u8 = 6;
const TAG_VARCHAR: u8 = 7;
const TAG_TIMESTAMP: u8 = 8;
const TAG_VARBINARY: u8 = 9;

fn write_datum(out: &mut BytesMut, datum: &Datum) {
    match datum {
        Datum::Null => out.put_u8(TAG_NULL),
        Datum::TinyInt(v) => {
            out.put_u8(TAG_TINYINT);
            out.put_i8(*v);
        }
        Datum::SmallInt(v) => {
            out.put_u8(TAG_SMALLINT);
            out.put_i16(*v);
        }
        Datum::Integer(v) => {
            out.put_u8(TAG_INTEGER);
            out.put_i32(*v);
        }
        Datum::BigInt(v) => {
            out.put_u8(TAG_BIGINT);
            out.put_i64(*v);
        }
        Datum::Double(v) => {
            out.put_u8(TAG_DOUBLE);
            out.put_f64(*v);
        }
        Datum::Decimal(m, s) => {
            out.put_u8(TAG_DECIMAL);
            out.put_u8(*s);
            out.put_slice(&m.to_be_bytes());
        }
        Datum::VarChar(s) => {
            out.put_u8(TAG_VARCHAR);
            out.put_u32(s.len() as u32);
            out.put_slice(s.as_bytes());
        }
        Datum::Timestamp(v) => {
            out.put_u8(TAG_TIMESTAMP);
            out.put_i64(*v);
        }
        Datum::VarBinary(b) => {
            out.put_u8(TAG_VARBINARY);
            out.put_u32(b.len() as u32);
            out.put_slice(b);
        }
    }
}

fn read_datum(buf: &mut &[u8]) -> Result<Datum> {
    let tag = read_u8(buf)?;
    Ok(match tag {
        TAG_NULL => Datum::Null,
        TAG_TINYINT => Datum::TinyInt(read_u8(buf)? as i8),
        TAG_SMALLINT => Datum::SmallInt(read_u16(buf)? as i16),
        TAG_INTEGER => Datum::Integer(read_i32(buf)?),
        TAG_BIGINT => Datum::BigInt(read_i64(buf)?),
        TAG_DOUBLE => {
            let bits = read_i64(buf)? as u64;
            Datum::Double(f64::from_bits(bits))
        }
        TAG_DECIMAL => {
            let scale = read_u8(buf)?;
            Datum::Decimal(read_i128(buf)?, scale)
        }
        TAG_VARCHAR => {
            let len = read_u32(buf)? as usize;
            let bytes = read_bytes(buf, len)?;
            Datum::VarChar(
                String::from_utf8(bytes)
                    .map_err(|e| DrError::MalformedRow(format!("invalid utf8: {}", e)))?,
            )
        }
        TAG_TIMESTAMP => Datum::Timestamp(read_i64(buf)?),
        TAG_VARBINARY => {
            let len = read_u32(buf)? as usize;
            Datum::VarBinary(read_bytes(buf, len)?)
        }
        other => return Err(DrError::MalformedRow(format!("unknown datum tag {}", other))),
    })
}

/// Serialize a full row image: `[length u32][column count u16][datums…]`.
/// Hidden columns ride at the tail of the row like any other column.
pub fn write_row(out: &mut BytesMut, row: &OwnedRow) {
    let mut body = BytesMut::with_capacity(16 + 16 * row.len());
    body.put_u16(row.len() as u16);
    for datum in &row.values {
        write_datum(&mut body, datum);
    }
    out.put_u32(body.len() as u32);
    out.put_slice(&body);
}

pub fn read_row(buf: &mut &[u8]) -> Result<OwnedRow> {
    let len = read_u32(buf)? as usize;
    ensure(buf, len)?;
    let mut body = &buf[..len];
    *buf = &buf[len..];
    let ncols = read_u16(&mut body)? as usize;
    let mut values = Vec::with_capacity(ncols);
    for _ in 0..ncols {
        values.push(read_datum(&mut body)?);
    }
    if !body.is_empty() {
        return Err(DrError::MalformedRow(format!("{} trailing bytes after row", body.len())));
    }
    Ok(OwnedRow::new(values))
}

/// Serialized byte size of a row image, for capacity accounting.
pub fn row_wire_size(row: &OwnedRow) -> usize {
    let mut sz = 4 + 2;
    for datum in &row.values {
        sz += match datum {
            Datum::Null => 1,
            Datum::TinyInt(_) => 2,
            Datum::SmallInt(_) => 3,
            Datum::Integer(_) => 5,
            Datum::BigInt(_) | Datum::Double(_) | Datum::Timestamp(_) => 9,
            Datum::Decimal(_, _) => 18,
            Datum::VarChar(s) => 5 + s.len(),
            Datum::VarBinary(b) => 5 + b.len(),
        };
    }
    sz
}

// ── Decoded records ──────────────────────────────────────────────────────

/// One decoded data record of a DR transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum DrRecord {
    Insert {
        table_handle: i64,
        row: OwnedRow,
    },
    /// Full-image delete (active-active mode).
    Delete {
        table_handle: i64,
        row: OwnedRow,
    },
    /// Compact delete keyed by a unique index; `index_crc` identifies the
    /// index by a CRC32C over its column-index array.
    DeleteByIndex {
        table_handle: i64,
        index_crc: u32,
        key: OwnedRow,
    },
    Update {
        table_handle: i64,
        before: OwnedRow,
        after: OwnedRow,
    },
    UpdateByIndex {
        table_handle: i64,
        index_crc: u32,
        key: OwnedRow,
        after: OwnedRow,
    },
    Truncate {
        table_handle: i64,
        signature: TableSignature,
        name: String,
    },
    HashDelimiter {
        par_hash: i32,
    },
}

/// One decoded, checksum-valid DR transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct DrTransaction {
    pub sequence: i64,
    pub unique_id: i64,
    pub hash_flag: DrHashFlag,
    pub par_hash: i32,
    pub records: Vec<DrRecord>,
}

/// Decode a flushed DR buffer into its transactions.
///
/// A transaction whose end-record CRC does not match is discarded and
/// decoding resumes at the next begin record (navigated by the begin
/// record's transaction length). A protocol version mismatch is fatal.
pub fn decode_log(data: &[u8]) -> Result<Vec<DrTransaction>> {
    let mut txns = Vec::new();
    let mut offset = 0usize;
    while offset < data.len() {
        let remaining = &data[offset..];
        ensure(remaining, BEGIN_RECORD_SIZE)?;

        let mut cursor = remaining;
        let version = read_u8(&mut cursor)?;
        if version != PROTOCOL_VERSION {
            return Err(DrError::ProtocolVersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: version,
            });
        }
        let rec_type = DrRecordType::from_u8(read_u8(&mut cursor)?)?;
        if rec_type != DrRecordType::Begin {
            return Err(DrError::MalformedRow(format!(
                "expected begin record at offset {}, found {:?}",
                offset, rec_type
            )));
        }
        let sequence = read_i64(&mut cursor)?;
        let unique_id = read_i64(&mut cursor)?;
        let hash_flag = DrHashFlag::from_u8(read_u8(&mut cursor)?)?;
        let txn_length = read_u32(&mut cursor)? as usize;
        let par_hash = read_i32(&mut cursor)?;

        if txn_length < BEGIN_RECORD_SIZE + END_RECORD_SIZE || txn_length > remaining.len() {
            return Err(DrError::Truncated {
                expected: txn_length,
                actual: remaining.len(),
            });
        }
        let txn_bytes = &remaining[..txn_length];

        // End record trailer: type, sequence, crc.
        let mut trailer = &txn_bytes[txn_length - END_RECORD_SIZE..];
        let end_type = DrRecordType::from_u8(read_u8(&mut trailer)?)?;
        let end_sequence = read_i64(&mut trailer)?;
        let stored_crc = read_u32(&mut trailer)?;
        let computed_crc = crc32c::crc32c(&txn_bytes[..txn_length - 4]);

        if end_type != DrRecordType::End || end_sequence != sequence || stored_crc != computed_crc {
            tracing::warn!(
                sequence,
                stored_crc,
                computed_crc,
                "discarding DR transaction with invalid end record"
            );
            offset += txn_length;
            continue;
        }

        let mut body = &txn_bytes[BEGIN_RECORD_SIZE..txn_length - END_RECORD_SIZE];
        let mut records = Vec::new();
        while !body.is_empty() {
            records.push(read_data_record(&mut body)?);
        }

        txns.push(DrTransaction {
            sequence,
            unique_id,
            hash_flag,
            par_hash,
            records,
        });
        offset += txn_length;
    }
    Ok(txns)
}

fn read_data_record(buf: &mut &[u8]) -> Result<DrRecord> {
    let rec_type = DrRecordType::from_u8(read_u8(buf)?)?;
    if rec_type == DrRecordType::HashDelimiter {
        return Ok(DrRecord::HashDelimiter {
            par_hash: read_i32(buf)?,
        });
    }
    let table_handle = read_i64(buf)?;
    Ok(match rec_type {
        DrRecordType::Insert => DrRecord::Insert {
            table_handle,
            row: read_row(buf)?,
        },
        DrRecordType::Delete => DrRecord::Delete {
            table_handle,
            row: read_row(buf)?,
        },
        DrRecordType::DeleteByIndex => DrRecord::DeleteByIndex {
            table_handle,
            index_crc: read_u32(buf)?,
            key: read_row(buf)?,
        },
        DrRecordType::Update => DrRecord::Update {
            table_handle,
            before: read_row(buf)?,
            after: read_row(buf)?,
        },
        DrRecordType::UpdateByIndex => DrRecord::UpdateByIndex {
            table_handle,
            index_crc: read_u32(buf)?,
            key: read_row(buf)?,
            after: read_row(buf)?,
        },
        DrRecordType::Truncate => {
            let mut sig = [0u8; 20];
            sig.copy_from_slice(&read_bytes(buf, 20)?);
            let name_len = read_u32(buf)? as usize;
            let name = String::from_utf8(read_bytes(buf, name_len)?)
                .map_err(|e| DrError::MalformedRow(format!("invalid table name: {}", e)))?;
            DrRecord::Truncate {
                table_handle,
                signature: TableSignature(sig),
                name,
            }
        }
        DrRecordType::Begin | DrRecordType::End | DrRecordType::HashDelimiter => {
            return Err(DrError::MalformedRow(format!(
                "{:?} record inside transaction body",
                rec_type
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use merlin_common::datum::Datum;

    fn sample_row() -> OwnedRow {
        OwnedRow::new(vec![
            Datum::TinyInt(42),
            Datum::BigInt(55555),
            Datum::Decimal(34950834534583, 5),
            Datum::VarChar("a thing".into()),
            Datum::Null,
            Datum::Timestamp(5433),
            Datum::VarBinary(vec![0xde, 0xad, 0xbe, 0xef]),
        ])
    }

    #[test]
    fn test_row_round_trip() {
        let row = sample_row();
        let mut out = BytesMut::new();
        write_row(&mut out, &row);
        assert_eq!(out.len(), row_wire_size(&row));
        let mut cursor = &out[..];
        let decoded = read_row(&mut cursor).unwrap();
        assert!(cursor.is_empty());
        assert_eq!(decoded, row);
    }

    #[test]
    fn test_truncated_row_rejected() {
        let mut out = BytesMut::new();
        write_row(&mut out, &sample_row());
        let short = &out[..out.len() - 1];
        let mut cursor = short;
        assert!(matches!(read_row(&mut cursor), Err(DrError::Truncated { .. })));
    }

    #[test]
    fn test_record_sizes() {
        assert_eq!(BEGIN_RECORD_SIZE, 27);
        assert_eq!(BEGIN_RECORD_HEADER_SIZE, 18);
        assert_eq!(END_RECORD_SIZE, 13);
        assert_eq!(TXN_RECORD_HEADER_SIZE, 9);
        assert_eq!(HASH_DELIMITER_SIZE, 5);
    }

    #[test]
    fn test_decode_rejects_version_mismatch() {
        let mut buf = vec![0u8; BEGIN_RECORD_SIZE];
        buf[0] = PROTOCOL_VERSION + 1;
        buf[1] = DrRecordType::Begin as u8;
        assert!(matches!(
            decode_log(&buf),
            Err(DrError::ProtocolVersionMismatch { .. })
        ));
    }

    #[test]
    fn test_unknown_record_type() {
        assert!(matches!(DrRecordType::from_u8(0), Err(DrError::UnknownRecordType(0))));
        assert!(matches!(DrRecordType::from_u8(200), Err(DrError::UnknownRecordType(200))));
    }

    #[test]
    fn test_update_row_cost_is_two() {
        assert_eq!(DrRecordType::Insert.row_cost(), 1);
        assert_eq!(DrRecordType::Delete.row_cost(), 1);
        assert_eq!(DrRecordType::Update.row_cost(), 2);
        assert_eq!(DrRecordType::UpdateByIndex.row_cost(), 2);
    }
}
