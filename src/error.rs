// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error taxonomy for writing and reading chunked tables.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for table operations.
pub type TableResult<T> = Result<T, TableError>;

/// Errors that can occur while encoding, writing, reading or indexing a table.
#[derive(Debug, Error)]
pub enum TableError {
    /// I/O error from the underlying sink or file.
    #[error("table I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// Column count, type or order disagrees with what was expected.
    #[error("schema mismatch: {reason}")]
    SchemaMismatch { reason: String },

    /// The schema itself violates a structural rule.
    #[error("invalid schema: {reason}")]
    InvalidSchema { reason: String },

    /// Declared vs. actual byte length mismatch, or decompression failure.
    #[error("corrupt chunk: {reason}")]
    CorruptChunk { reason: String },

    /// Codec-level decode failure for one column of a chunk.
    #[error("corrupt column chunk for column `{column}`: {reason}")]
    CorruptColumnChunk { column: String, reason: String },

    /// The table header or file framing cannot be parsed.
    #[error("corrupt table header: {reason}")]
    CorruptHeader { reason: String },

    /// A batch offered to the writer is not ordered by the sort column.
    #[error("unsorted input at row {row}: column `{column}` breaks the declared order")]
    UnsortedInput { row: u64, column: String },

    /// Sort order is broken across a chunk boundary.
    #[error("sort violation at chunk {chunk}: column `{column}` breaks the declared order")]
    SortViolation { chunk: usize, column: String },

    /// Primary-key uniqueness violated.
    #[error("duplicate primary key at row {row} (columns: {columns})")]
    DuplicateKey { row: u64, columns: String },

    /// A null was offered to a non-nullable column.
    #[error("null value at row {row} for non-nullable column `{column}`")]
    NullViolation { row: u64, column: String },

    /// Header version newer (or older) than this decoder understands.
    #[error("unsupported table format version {found} (supported: {supported})")]
    UnsupportedVersion { found: i16, supported: i16 },

    #[error("chunk index {index} out of range ({count} chunks)")]
    ChunkOutOfRange { index: usize, count: usize },

    #[error("row {row} out of range ({num_rows} rows)")]
    RowOutOfRange { row: u64, num_rows: u64 },

    #[error("column not found: {name}")]
    ColumnNotFound { name: String },

    /// Lookup structures are only built for indexed or primary-key columns.
    #[error("column `{name}` is neither indexed nor a primary key")]
    NotIndexed { name: String },

    /// The writer session was aborted by an earlier failure or already closed.
    #[error("table writer is no longer usable: {reason}")]
    WriterAborted { reason: String },

    #[error("file already exists: {path}")]
    FileAlreadyExists { path: PathBuf },

    #[error("invalid path: {path}")]
    InvalidPath { path: PathBuf },
}

impl TableError {
    pub fn schema_mismatch(reason: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            reason: reason.into(),
        }
    }

    pub fn invalid_schema(reason: impl Into<String>) -> Self {
        Self::InvalidSchema {
            reason: reason.into(),
        }
    }

    pub fn corrupt_chunk(reason: impl Into<String>) -> Self {
        Self::CorruptChunk {
            reason: reason.into(),
        }
    }

    pub fn corrupt_column(column: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CorruptColumnChunk {
            column: column.into(),
            reason: reason.into(),
        }
    }

    pub fn corrupt_header(reason: impl Into<String>) -> Self {
        Self::CorruptHeader {
            reason: reason.into(),
        }
    }

    pub fn writer_aborted(reason: impl Into<String>) -> Self {
        Self::WriterAborted {
            reason: reason.into(),
        }
    }

    /// Returns true if the error reports damaged bytes rather than bad input.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::CorruptChunk { .. } | Self::CorruptColumnChunk { .. } | Self::CorruptHeader { .. }
        )
    }

    /// Returns true if the error is a writer-time invariant violation.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Self::UnsortedInput { .. }
                | Self::SortViolation { .. }
                | Self::DuplicateKey { .. }
                | Self::NullViolation { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = TableError::corrupt_chunk("size mismatch");
        assert!(err.is_corruption());
        assert!(!err.is_invariant_violation());

        let err = TableError::DuplicateKey {
            row: 7,
            columns: "id".to_string(),
        };
        assert!(err.is_invariant_violation());
        assert!(!err.is_corruption());
    }

    #[test]
    fn test_error_display() {
        let err = TableError::UnsupportedVersion {
            found: 9,
            supported: 1,
        };
        let msg = err.to_string();
        assert!(msg.contains('9'));
        assert!(msg.contains('1'));

        let err = TableError::corrupt_column("price", "truncated varint");
        assert!(err.to_string().contains("price"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "missing");
        let err: TableError = io_err.into();
        assert!(matches!(err, TableError::Io { .. }));
    }
}
