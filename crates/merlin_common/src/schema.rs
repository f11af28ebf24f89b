use serde::{Deserialize, Serialize};

use crate::types::{DataType, TableSignature};

/// Column definition in a table schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl ColumnDef {
    pub fn new(name: &str, data_type: DataType, nullable: bool) -> ColumnDef {
        ColumnDef {
            name: name.to_string(),
            data_type,
            nullable,
        }
    }
}

/// Physical layout of one table index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum IndexKind {
    /// Hash map keyed by the encoded key bytes. Point lookups only.
    #[default]
    Hash,
    /// Ordered map; supports iteration in key order.
    Ordered,
}

/// Catalog definition of one index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    /// Indices into the table's visible columns, in key order.
    pub columns: Vec<usize>,
    pub unique: bool,
    /// Predicated index. Recognized for catalog fidelity and excluded from
    /// DR key selection; predicate evaluation belongs to the executor.
    pub partial: bool,
    pub kind: IndexKind,
}

impl IndexDef {
    pub fn hash(name: &str, columns: Vec<usize>, unique: bool) -> IndexDef {
        IndexDef {
            name: name.to_string(),
            columns,
            unique,
            partial: false,
            kind: IndexKind::Hash,
        }
    }

    pub fn ordered(name: &str, columns: Vec<usize>, unique: bool) -> IndexDef {
        IndexDef {
            name: name.to_string(),
            columns,
            unique,
            partial: false,
            kind: IndexKind::Ordered,
        }
    }
}

/// Table schema metadata: the catalog's view of one table, and the recipe
/// truncate uses to build a fresh empty table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub signature: TableSignature,
    pub columns: Vec<ColumnDef>,
    /// Hidden columns are appended after the visible columns in storage and
    /// in DR row images. A table with exactly one hidden column treats it as
    /// the DR timestamp column.
    #[serde(default)]
    pub hidden_columns: Vec<ColumnDef>,
    /// Index into `columns` of the partitioning column. None = replicated.
    pub partition_column: Option<usize>,
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
    /// Index into `indexes` of the primary key, if one is designated.
    pub primary_key: Option<usize>,
    #[serde(default)]
    pub dr_enabled: bool,
    #[serde(default)]
    pub is_materialized: bool,
    /// Maximum visible row count; inserts beyond it fail.
    pub tuple_limit: i64,
}

impl TableSchema {
    pub fn new(name: &str, signature: TableSignature, columns: Vec<ColumnDef>) -> TableSchema {
        TableSchema {
            name: name.to_string(),
            signature,
            columns,
            hidden_columns: Vec::new(),
            partition_column: None,
            indexes: Vec::new(),
            primary_key: None,
            dr_enabled: false,
            is_materialized: false,
            tuple_limit: i64::MAX,
        }
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn hidden_column_count(&self) -> usize {
        self.hidden_columns.len()
    }

    /// Total stored width: visible plus hidden columns.
    pub fn total_column_count(&self) -> usize {
        self.columns.len() + self.hidden_columns.len()
    }

    /// Offset of the DR timestamp within the full storage image, when the
    /// table carries one. With a single hidden column it is that column.
    pub fn dr_timestamp_column_index(&self) -> Option<usize> {
        if self.hidden_columns.len() == 1 {
            Some(self.columns.len())
        } else {
            None
        }
    }

    pub fn is_replicated(&self) -> bool {
        self.partition_column.is_none()
    }

    pub fn find_column(&self, name: &str) -> Option<usize> {
        let lower = name.to_lowercase();
        self.columns.iter().position(|c| c.name.to_lowercase() == lower)
    }

    /// NOT NULL bitmap over the visible columns.
    pub fn allow_nulls(&self) -> Vec<bool> {
        self.columns.iter().map(|c| c.nullable).collect()
    }

    /// Estimated storage width of one full tuple, used for block slot sizing.
    pub fn estimated_tuple_width(&self) -> usize {
        1 + self
            .columns
            .iter()
            .chain(self.hidden_columns.iter())
            .map(|c| c.data_type.storage_width())
            .sum::<usize>()
    }

    /// Whether any visible column may carry out-of-line storage.
    pub fn has_out_of_line_columns(&self) -> bool {
        self.columns.iter().any(|c| c.data_type.uses_out_of_line_storage())
    }
}
