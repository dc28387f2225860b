// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::error::{TableError, TableResult};
use std::collections::HashSet;
use std::fmt;

/// Disk block assumed by the rows-per-chunk hint.
const DISK_BLOCK_SIZE: usize = 4096;
/// Disk blocks per chunk assumed by the rows-per-chunk hint.
const BLOCKS_PER_CHUNK: usize = 64;

/// Logical column type. `FixedLen` carries its declared byte width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Boolean,
    Byte,
    Int32,
    Int64,
    Float,
    Double,
    Utf8,
    FixedLen(u32),
}

impl ColumnType {
    pub fn to_tag(self) -> u8 {
        match self {
            Self::Boolean => 0,
            Self::Byte => 1,
            Self::Int32 => 2,
            Self::Int64 => 3,
            Self::Float => 4,
            Self::Double => 5,
            Self::Utf8 => 6,
            Self::FixedLen(_) => 7,
        }
    }

    /// The wire `size` field. Only `FixedLen` uses it.
    pub fn wire_size(self) -> i32 {
        match self {
            Self::FixedLen(size) => size as i32,
            _ => 0,
        }
    }

    /// Rebuilds a type from its wire tag and size field. The size is ignored
    /// unless the tag is `FixedLen`, where it must be positive.
    pub fn from_wire(tag: u8, size: i32) -> Option<Self> {
        match tag {
            0 => Some(Self::Boolean),
            1 => Some(Self::Byte),
            2 => Some(Self::Int32),
            3 => Some(Self::Int64),
            4 => Some(Self::Float),
            5 => Some(Self::Double),
            6 => Some(Self::Utf8),
            7 if size > 0 => Some(Self::FixedLen(size as u32)),
            _ => None,
        }
    }

    /// Width in bytes of one packed value, for byte-aligned fixed-width types.
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            Self::Byte => Some(1),
            Self::Int32 | Self::Float => Some(4),
            Self::Int64 | Self::Double => Some(8),
            Self::FixedLen(size) => Some(size as usize),
            Self::Boolean | Self::Utf8 => None,
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            Self::Byte | Self::Int32 | Self::Int64 | Self::Float | Self::Double
        )
    }

    /// Types eligible for delta encoding.
    pub fn is_delta_capable(self) -> bool {
        matches!(self, Self::Int32 | Self::Int64)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Boolean => write!(f, "Boolean"),
            Self::Byte => write!(f, "Byte"),
            Self::Int32 => write!(f, "Int32"),
            Self::Int64 => write!(f, "Int64"),
            Self::Float => write!(f, "Float"),
            Self::Double => write!(f, "Double"),
            Self::Utf8 => write!(f, "Utf8"),
            Self::FixedLen(size) => write!(f, "FixedLen({})", size),
        }
    }
}

/// Free-form key / opaque value pair. Keys are unique per owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub key: String,
    pub value: Vec<u8>,
}

impl Metadata {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub primary_key: bool,
    pub indexed: bool,
    pub metadata: Vec<Metadata>,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
            primary_key: false,
            indexed: false,
            metadata: Vec::new(),
        }
    }

    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    #[must_use]
    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.metadata.push(Metadata::new(key, value));
        self
    }

    /// True when the Indexer may build a lookup structure for this column.
    pub fn is_lookup_column(&self) -> bool {
        self.indexed || self.primary_key
    }
}

/// Global ordering directive, held as an index into the column list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortColumn {
    pub column_idx: usize,
    pub ascending: bool,
}

/// Everything a writer needs to know before the first row: columns, sort
/// order and table-level metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub columns: Vec<Column>,
    pub sort_column: Option<SortColumn>,
    pub metadata: Vec<Metadata>,
}

impl TableSchema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self {
            columns,
            sort_column: None,
            metadata: Vec::new(),
        }
    }

    /// Declares the sort column by name.
    pub fn sorted_by(mut self, name: &str, ascending: bool) -> TableResult<Self> {
        let column_idx = self.column_index(name).ok_or_else(|| TableError::ColumnNotFound {
            name: name.to_string(),
        })?;
        self.sort_column = Some(SortColumn {
            column_idx,
            ascending,
        });
        Ok(self)
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.metadata.push(Metadata::new(key, value));
        self
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_by_name(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_key_indices(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.primary_key)
            .map(|(i, _)| i)
            .collect()
    }

    /// How many rows should fit in a chunk when the writer is given no
    /// explicit row threshold: 64 disk blocks divided by the widest numeric
    /// value (1 byte if there are no numeric columns).
    pub fn rows_per_chunk_hint(&self) -> usize {
        let max_size = self
            .columns
            .iter()
            .filter(|c| c.column_type.is_numeric())
            .filter_map(|c| c.column_type.fixed_width())
            .max()
            .unwrap_or(1);
        (BLOCKS_PER_CHUNK * DISK_BLOCK_SIZE) / max_size
    }

    pub fn validate(&self) -> TableResult<()> {
        validate_columns(&self.columns, self.sort_column)?;
        check_unique_keys(&self.metadata, "table")
    }
}

pub(crate) fn validate_columns(
    columns: &[Column],
    sort_column: Option<SortColumn>,
) -> TableResult<()> {
    if columns.is_empty() {
        return Err(TableError::invalid_schema("table must have at least 1 column"));
    }
    let mut names: HashSet<&str> = HashSet::with_capacity(columns.len());
    for col in columns {
        if col.name.is_empty() {
            return Err(TableError::invalid_schema("column name must not be empty"));
        }
        if col.name.len() > u16::MAX as usize {
            return Err(TableError::invalid_schema("column name too long"));
        }
        if !names.insert(col.name.as_str()) {
            return Err(TableError::invalid_schema(format!(
                "column '{}' is specified more than once",
                col.name
            )));
        }
        match col.column_type {
            ColumnType::FixedLen(0) => {
                return Err(TableError::invalid_schema(format!(
                    "fixed-length column '{}' must declare a size > 0",
                    col.name
                )));
            }
            ColumnType::FixedLen(size) if size > i32::MAX as u32 => {
                return Err(TableError::invalid_schema(format!(
                    "fixed-length column '{}' is too wide",
                    col.name
                )));
            }
            _ => {}
        }
        if col.primary_key && col.nullable {
            return Err(TableError::invalid_schema(format!(
                "primary-key column '{}' cannot be nullable",
                col.name
            )));
        }
        check_unique_keys(&col.metadata, &col.name)?;
    }
    if let Some(sort) = sort_column {
        if sort.column_idx >= columns.len() {
            return Err(TableError::invalid_schema(format!(
                "sort column index {} out of range ({} columns)",
                sort.column_idx,
                columns.len()
            )));
        }
    }
    Ok(())
}

fn check_unique_keys(metadata: &[Metadata], owner: &str) -> TableResult<()> {
    let mut keys: HashSet<&str> = HashSet::with_capacity(metadata.len());
    for m in metadata {
        if m.key.len() > u16::MAX as usize {
            return Err(TableError::invalid_schema("metadata key too long"));
        }
        if !keys.insert(m.key.as_str()) {
            return Err(TableError::invalid_schema(format!(
                "metadata key '{}' repeated on {}",
                m.key, owner
            )));
        }
    }
    Ok(())
}
