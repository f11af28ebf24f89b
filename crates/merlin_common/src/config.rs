use serde::{Deserialize, Serialize};

/// Default tuple-storage block size: 2 MiB.
pub const DEFAULT_TABLE_BLOCK_SIZE: usize = 2 * 1024 * 1024;

/// Default primary DR buffer capacity.
pub const DEFAULT_DR_BUFFER_CAPACITY: usize = 2 * 1024 * 1024;

/// Default secondary (large-transaction) DR buffer capacity.
pub const DEFAULT_DR_SECONDARY_CAPACITY: usize = 45 * 1024 * 1024 + 4096;

/// Headroom reserved at the front of every DR buffer so the consumer can
/// prepend an invocation wrapper without copying.
pub const MAGIC_DR_TRANSACTION_PADDING: usize = 78;

/// Tuning knobs for block-paged tuple storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Byte size of one tuple block.
    pub table_block_size: usize,
    /// Compaction runs while the active/allocated slot ratio is below this.
    pub compaction_load_threshold: f64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            table_block_size: DEFAULT_TABLE_BLOCK_SIZE,
            compaction_load_threshold: 0.95,
        }
    }
}

/// Tuning knobs for the DR tuple stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrConfig {
    /// Primary buffer capacity in bytes.
    pub buffer_capacity: usize,
    /// Secondary capacity a single oversized transaction may roll over into.
    /// Zero disables rollover.
    pub secondary_capacity: usize,
    /// Maximum rows a single transaction may append.
    pub row_budget: i64,
}

impl Default for DrConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_DR_BUFFER_CAPACITY,
            secondary_capacity: DEFAULT_DR_SECONDARY_CAPACITY,
            row_budget: 1_000_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = StorageConfig::default();
        assert_eq!(s.table_block_size, 2 * 1024 * 1024);
        let d = DrConfig::default();
        assert_eq!(d.secondary_capacity, 45 * 1024 * 1024 + 4096);
        assert!(d.secondary_capacity > d.buffer_capacity);
    }
}
