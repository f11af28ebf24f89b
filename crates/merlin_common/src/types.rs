use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of one execution partition (site). Partition 16383 is the
/// pseudo-partition that hosts replicated tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionId(pub i32);

/// The pseudo-partition id carried by the replicated-table stream.
pub const REPLICATED_PARTITION_ID: PartitionId = PartitionId(16383);

impl PartitionId {
    pub fn is_replicated(self) -> bool {
        self == REPLICATED_PARTITION_ID
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition:{}", self.0)
    }
}

/// Identifier of one cluster in an active-active replication mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterId(pub u8);

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cluster:{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxnId(pub i64);

/// Single-partition handle: the per-partition serialization order of a txn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SpHandle(pub i64);

/// Per-stream replication sequence number. Strictly monotonic across the
/// committed transactions of one DR stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequenceNumber(pub i64);

impl SequenceNumber {
    pub fn next(self) -> SequenceNumber {
        SequenceNumber(self.0 + 1)
    }
}

/// Cluster-wide unique transaction id. The low 14 bits carry the partition
/// that initiated the transaction; a multi-partition txn is initiated from
/// the replicated pseudo-partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UniqueId(pub i64);

const UNIQUE_ID_PARTITION_BITS: i64 = 14;
const UNIQUE_ID_PARTITION_MASK: i64 = (1 << UNIQUE_ID_PARTITION_BITS) - 1;

impl UniqueId {
    /// Compose a unique id from a counter value and its initiating partition.
    pub fn new(counter: i64, partition: PartitionId) -> UniqueId {
        UniqueId((counter << UNIQUE_ID_PARTITION_BITS) | (partition.0 as i64 & UNIQUE_ID_PARTITION_MASK))
    }

    pub fn partition_id(self) -> PartitionId {
        PartitionId((self.0 & UNIQUE_ID_PARTITION_MASK) as i32)
    }

    pub fn is_multi_partition(self) -> bool {
        self.partition_id().is_replicated()
    }
}

/// 20-byte opaque table identity assigned by the catalog. DR records route by
/// the handle derived from the first eight bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableSignature(pub [u8; 20]);

impl TableSignature {
    /// The i64 routing handle shipped in DR row headers.
    pub fn dr_handle(&self) -> i64 {
        let mut head = [0u8; 8];
        head.copy_from_slice(&self.0[..8]);
        i64::from_be_bytes(head)
    }

    /// Build a signature whose routing handle is `handle` (tail bytes zero).
    /// Test and catalog bootstrap helper.
    pub fn from_handle(handle: i64) -> TableSignature {
        let mut sig = [0u8; 20];
        sig[..8].copy_from_slice(&handle.to_be_bytes());
        TableSignature(sig)
    }
}

impl fmt::Debug for TableSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sig:")?;
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Hidden-column replication timestamp.
///
/// Layout is stable across protocol versions: the high 8 bits are the
/// originating cluster id, the low 56 bits are the originating unique id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DrTimestamp(pub i64);

const DR_TIMESTAMP_UNIQUE_MASK: i64 = 0x00FF_FFFF_FFFF_FFFF;

impl DrTimestamp {
    pub fn new(cluster: ClusterId, unique_id: UniqueId) -> DrTimestamp {
        DrTimestamp(((cluster.0 as i64) << 56) | (unique_id.0 & DR_TIMESTAMP_UNIQUE_MASK))
    }

    pub fn cluster_id(self) -> ClusterId {
        ClusterId(((self.0 >> 56) & 0xFF) as u8)
    }

    pub fn unique_id_bits(self) -> i64 {
        self.0 & DR_TIMESTAMP_UNIQUE_MASK
    }
}

/// Column data types supported by the row store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    Double,
    Decimal,
    VarChar,
    Timestamp,
    VarBinary,
}

impl DataType {
    /// Estimated storage width of one value of this type, used for block
    /// slot sizing and for ranking index key widths. Variable-width types
    /// count their inline allowance.
    pub fn storage_width(self) -> usize {
        match self {
            DataType::TinyInt => 1,
            DataType::SmallInt => 2,
            DataType::Integer => 4,
            DataType::BigInt | DataType::Double | DataType::Timestamp => 8,
            DataType::Decimal => 16,
            DataType::VarChar | DataType::VarBinary => 64,
        }
    }

    /// Whether values of this type may carry out-of-line (heap) storage.
    pub fn uses_out_of_line_storage(self) -> bool {
        matches!(self, DataType::VarChar | DataType::VarBinary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_id_partition_field() {
        let uid = UniqueId::new(70, PartitionId(42));
        assert_eq!(uid.partition_id(), PartitionId(42));
        assert!(!uid.is_multi_partition());

        let mp = UniqueId::new(70, REPLICATED_PARTITION_ID);
        assert!(mp.is_multi_partition());
    }

    #[test]
    fn test_table_signature_handle_round_trip() {
        let sig = TableSignature::from_handle(42);
        assert_eq!(sig.dr_handle(), 42);
        let sig = TableSignature::from_handle(-7);
        assert_eq!(sig.dr_handle(), -7);
    }

    #[test]
    fn test_dr_timestamp_layout() {
        let ts = DrTimestamp::new(ClusterId(1), UniqueId::new(70, PartitionId(42)));
        assert_eq!(ts.cluster_id(), ClusterId(1));
        assert_eq!(ts.unique_id_bits(), UniqueId::new(70, PartitionId(42)).0);

        // Cluster id occupies the top byte only.
        let hi = DrTimestamp::new(ClusterId(0xFF), UniqueId(0));
        assert_eq!(hi.cluster_id(), ClusterId(0xFF));
        assert_eq!(hi.unique_id_bits(), 0);
    }
}
