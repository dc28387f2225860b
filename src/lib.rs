// SPDX-License-Identifier: AGPL-3.0-or-later
//
// chunked-table
// A chunked, columnar table container: per-column raw/delta encoding,
// optional snappy compression, sort-order and primary-key enforcement.

pub mod chunk;
pub mod codec;
pub mod compression;
pub mod error;
pub mod file;
pub mod header;
pub mod index;
pub mod reader;
pub mod schema;
pub mod value;
pub mod writer;

pub use crate::chunk::{Chunk, ChunkDecoder, ChunkEncoder, ColumnChunk, DeltaPolicy, EncodedChunk};
pub use crate::codec::Encoding;
pub use crate::compression::Compression;
pub use crate::error::{TableError, TableResult};
pub use crate::header::{Table, FORMAT_VERSION};
pub use crate::index::{ColumnIndex, Indexer, RowLocation};
pub use crate::reader::{ChunkIter, ColumnStats, DecodedChunk, TableReader, TableStats};
pub use crate::schema::{Column, ColumnType, Metadata, SortColumn, TableSchema};
pub use crate::value::{ColumnData, Value};
pub use crate::writer::{TableWriter, WriterOptions, WriterState};
