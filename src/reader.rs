// SPDX-License-Identifier: AGPL-3.0-or-later

use std::fs::File;
use std::ops::{Deref, Range};
use std::path::Path;

use memmap2::{Mmap, MmapOptions};
use rayon::prelude::*;
use tracing::{debug, info};

use crate::chunk::{split_frames, Chunk, ChunkDecoder};
use crate::error::{TableError, TableResult};
use crate::file::parse_container;
use crate::header::Table;
use crate::schema::{Column, Metadata, SortColumn};
use crate::value::{ColumnData, Value};

#[derive(Debug)]
enum Source {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Deref for Source {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Source::Mapped(m) => &m[..],
            Source::Owned(v) => v.as_slice(),
        }
    }
}

/// Decoded columns of one chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedChunk {
    pub index: usize,
    /// Global row number of the chunk's first row.
    pub first_row: u64,
    pub columns: Vec<ColumnData>,
}

impl DecodedChunk {
    pub fn num_rows(&self) -> usize {
        self.columns.first().map_or(0, ColumnData::len)
    }

    pub fn row(&self, offset: usize) -> Option<Vec<Value>> {
        if offset >= self.num_rows() {
            return None;
        }
        self.columns.iter().map(|c| c.get(offset)).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnStats {
    pub name: String,
    pub raw_bytes: u64,
    pub stored_bytes: u64,
}

impl ColumnStats {
    /// Stored size over raw size; 1.0 for an empty column.
    pub fn compression_rate(&self) -> f64 {
        compression_rate(self.raw_bytes, self.stored_bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableStats {
    pub rows: u64,
    pub chunks: u64,
    pub columns: Vec<ColumnStats>,

    pub raw_bytes: u64,
    pub stored_bytes: u64,

    pub header_bytes: u64,
    pub file_bytes: u64,
}

impl TableStats {
    pub fn compression_rate(&self) -> f64 {
        compression_rate(self.raw_bytes, self.stored_bytes)
    }
}

fn compression_rate(raw: u64, stored: u64) -> f64 {
    if raw == 0 {
        1.0
    } else {
        stored as f64 / raw as f64
    }
}

/// Read access to a finalized table. Chunks decode independently, so a
/// shared reader can serve many threads.
#[derive(Debug)]
pub struct TableReader {
    source: Source,
    table: Table,
    chunk_ranges: Vec<Range<usize>>,
    /// First global row of every chunk.
    chunk_starts: Vec<u64>,
    header_len: usize,
}

impl TableReader {
    pub fn open(path: impl AsRef<Path>) -> TableResult<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        // Zero-length files cannot be mapped on every platform.
        let source = if len == 0 {
            Source::Owned(Vec::new())
        } else {
            Source::Mapped(unsafe { MmapOptions::new().map(&file)? })
        };
        let reader = Self::from_source(source)?;
        info!(
            path = %path.display(),
            rows = reader.table.num_rows(),
            chunks = reader.table.chunks().len(),
            "opened table"
        );
        Ok(reader)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> TableResult<Self> {
        Self::from_source(Source::Owned(bytes))
    }

    fn from_source(source: Source) -> TableResult<Self> {
        let container = parse_container(&source)?;
        let mut chunk_starts = Vec::with_capacity(container.table.chunks().len());
        let mut next = 0u64;
        for chunk in container.table.chunks() {
            chunk_starts.push(next);
            next += chunk.num_rows;
        }
        Ok(Self {
            source,
            table: container.table,
            chunk_ranges: container.chunk_ranges,
            chunk_starts,
            header_len: container.header_len,
        })
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn columns(&self) -> &[Column] {
        self.table.columns()
    }

    pub fn sort_column(&self) -> Option<SortColumn> {
        self.table.sort_column()
    }

    pub fn metadata(&self) -> &[Metadata] {
        self.table.metadata()
    }

    pub fn num_rows(&self) -> u64 {
        self.table.num_rows()
    }

    pub fn chunk_count(&self) -> usize {
        self.table.chunks().len()
    }

    /// Decodes every column of chunk `index`.
    pub fn chunk(&self, index: usize) -> TableResult<DecodedChunk> {
        let (chunk, payload) = self.chunk_bytes(index)?;
        let columns = ChunkDecoder::new(self.columns()).decode(chunk, payload)?;
        debug!(chunk = index, rows = chunk.num_rows, "decoded chunk");
        Ok(DecodedChunk {
            index,
            first_row: self.chunk_starts[index],
            columns,
        })
    }

    /// Decodes one column of chunk `index` without touching the others.
    pub fn chunk_column(&self, index: usize, column_idx: usize) -> TableResult<ColumnData> {
        let (chunk, payload) = self.chunk_bytes(index)?;
        ChunkDecoder::new(self.columns()).decode_column(chunk, payload, column_idx)
    }

    pub fn chunk_column_by_name(&self, index: usize, name: &str) -> TableResult<ColumnData> {
        let column_idx = self
            .table
            .column_index(name)
            .ok_or_else(|| TableError::ColumnNotFound { name: name.to_string() })?;
        self.chunk_column(index, column_idx)
    }

    /// Maps a global row number to (chunk index, offset within chunk).
    pub fn locate_row(&self, row: u64) -> TableResult<(usize, usize)> {
        if row >= self.num_rows() {
            return Err(TableError::RowOutOfRange {
                row,
                num_rows: self.num_rows(),
            });
        }
        let chunk = self.chunk_starts.partition_point(|&start| start <= row) - 1;
        Ok((chunk, (row - self.chunk_starts[chunk]) as usize))
    }

    pub fn row(&self, row: u64) -> TableResult<Vec<Value>> {
        let (chunk, offset) = self.locate_row(row)?;
        let decoded = self.chunk(chunk)?;
        decoded.row(offset).ok_or_else(|| {
            TableError::corrupt_chunk(format!("chunk {chunk} is missing row offset {offset}"))
        })
    }

    /// Streams chunks in order, holding one decoded chunk at a time.
    pub fn chunks(&self) -> ChunkIter<'_> {
        ChunkIter {
            reader: self,
            next: 0,
        }
    }

    pub fn read_all(&self) -> TableResult<Vec<DecodedChunk>> {
        self.chunks().collect()
    }

    pub fn read_all_par(&self) -> TableResult<Vec<DecodedChunk>> {
        (0..self.chunk_count())
            .into_par_iter()
            .map(|i| self.chunk(i))
            .collect()
    }

    pub fn stats(&self) -> TableResult<TableStats> {
        let mut columns: Vec<ColumnStats> = self
            .columns()
            .iter()
            .map(|c| ColumnStats {
                name: c.name.clone(),
                raw_bytes: 0,
                stored_bytes: 0,
            })
            .collect();
        for index in 0..self.chunk_count() {
            let (chunk, payload) = self.chunk_bytes(index)?;
            for (stats, frame) in columns.iter_mut().zip(split_frames(chunk, payload)?) {
                stats.raw_bytes += frame.raw_len as u64;
                stats.stored_bytes += frame.stored.len() as u64;
            }
        }
        Ok(TableStats {
            rows: self.num_rows(),
            chunks: self.chunk_count() as u64,
            raw_bytes: columns.iter().map(|c| c.raw_bytes).sum(),
            stored_bytes: columns.iter().map(|c| c.stored_bytes).sum(),
            columns,
            header_bytes: self.header_len as u64,
            file_bytes: self.source.len() as u64,
        })
    }

    fn chunk_bytes(&self, index: usize) -> TableResult<(&Chunk, &[u8])> {
        let chunk = self.table.chunks().get(index).ok_or(TableError::ChunkOutOfRange {
            index,
            count: self.chunk_count(),
        })?;
        Ok((chunk, &self.source[self.chunk_ranges[index].clone()]))
    }
}

pub struct ChunkIter<'a> {
    reader: &'a TableReader,
    next: usize,
}

impl Iterator for ChunkIter<'_> {
    type Item = TableResult<DecodedChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.reader.chunk_count() {
            return None;
        }
        let index = self.next;
        self.next += 1;
        Some(self.reader.chunk(index))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.reader.chunk_count() - self.next;
        (left, Some(left))
    }
}

impl ExactSizeIterator for ChunkIter<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::Compression;
    use crate::schema::{ColumnType, TableSchema};
    use crate::writer::{TableWriter, WriterOptions};

    fn schema() -> TableSchema {
        TableSchema::new(vec![
            Column::new("id", ColumnType::Int32).primary_key(),
            Column::new("name", ColumnType::Utf8),
        ])
        .sorted_by("id", true)
        .unwrap()
        .with_metadata("origin", b"test".to_vec())
    }

    fn write_abc() -> Vec<u8> {
        let opts = WriterOptions::default().with_max_chunk_rows(2);
        let mut w = TableWriter::in_memory(schema(), opts).unwrap();
        w.append_rows(&[
            vec![Value::Int32(1), Value::Utf8("a".into())],
            vec![Value::Int32(2), Value::Utf8("b".into())],
            vec![Value::Int32(3), Value::Utf8("c".into())],
        ])
        .unwrap();
        w.close().unwrap();
        w.into_inner()
    }

    #[test]
    fn test_reads_back_in_order() {
        let reader = TableReader::from_bytes(write_abc()).unwrap();
        assert_eq!(reader.num_rows(), 3);
        assert_eq!(reader.chunk_count(), 2);
        assert_eq!(reader.metadata()[0].key, "origin");
        assert_eq!(reader.sort_column().map(|s| s.column_idx), Some(0));

        let rows: Vec<Vec<Value>> = reader
            .chunks()
            .map(|c| c.unwrap())
            .flat_map(|c| (0..c.num_rows()).map(move |i| c.row(i).unwrap()))
            .collect();
        let ids: Vec<Value> = rows.iter().map(|r| r[0].clone()).collect();
        assert_eq!(ids, vec![Value::Int32(1), Value::Int32(2), Value::Int32(3)]);
        assert_eq!(rows[2][1], Value::Utf8("c".into()));
    }

    #[test]
    fn test_random_row_access() {
        let reader = TableReader::from_bytes(write_abc()).unwrap();
        assert_eq!(reader.locate_row(0).unwrap(), (0, 0));
        assert_eq!(reader.locate_row(2).unwrap(), (1, 0));
        assert_eq!(reader.row(1).unwrap()[1], Value::Utf8("b".into()));
        assert!(matches!(reader.row(3), Err(TableError::RowOutOfRange { .. })));
        assert!(matches!(reader.chunk(2), Err(TableError::ChunkOutOfRange { .. })));
    }

    #[test]
    fn test_chunk_column() {
        let reader = TableReader::from_bytes(write_abc()).unwrap();
        let names = reader.chunk_column_by_name(0, "name").unwrap();
        assert_eq!(names, ColumnData::Utf8(vec![Some("a".into()), Some("b".into())]));
        assert!(matches!(
            reader.chunk_column_by_name(0, "nope"),
            Err(TableError::ColumnNotFound { .. })
        ));
    }

    #[test]
    fn test_parallel_read_matches_streaming() {
        let reader = TableReader::from_bytes(write_abc()).unwrap();
        assert_eq!(reader.read_all().unwrap(), reader.read_all_par().unwrap());
    }

    #[test]
    fn test_reader_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TableReader>();
    }

    #[test]
    fn test_corrupt_chunk_is_isolated() {
        let bytes = write_abc();
        let reader = TableReader::from_bytes(bytes.clone()).unwrap();
        let first_range = reader.chunk_ranges[0].clone();
        drop(reader);

        // damage the first chunk's first frame header: stored_len grows past the payload
        let mut damaged = bytes;
        damaged[first_range.start] = 0xFF;
        let reader = TableReader::from_bytes(damaged).unwrap();
        assert!(reader.chunk(0).unwrap_err().is_corruption());
        assert_eq!(reader.chunk(1).unwrap().num_rows(), 1);
    }

    #[test]
    fn test_open_file_and_stats() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.cktb");
        let schema = TableSchema::new(vec![Column::new("v", ColumnType::Int64)]);
        let opts = WriterOptions::default()
            .with_max_chunk_rows(1000)
            .with_compression(Compression::Snappy);
        let mut w = TableWriter::create(&path, schema, opts).unwrap();
        let rows: Vec<Vec<Value>> = (0..5000).map(|i| vec![Value::Int64(i * 10)]).collect();
        w.append_rows(&rows).unwrap();
        w.close().unwrap();
        drop(w);

        let reader = TableReader::open(&path).unwrap();
        assert_eq!(reader.num_rows(), 5000);
        assert_eq!(reader.row(4321).unwrap(), vec![Value::Int64(43210)]);

        let stats = reader.stats().unwrap();
        assert_eq!(stats.rows, 5000);
        assert_eq!(stats.chunks, 5);
        assert_eq!(stats.columns.len(), 1);
        assert!(stats.stored_bytes <= stats.raw_bytes);
        assert!(stats.compression_rate() <= 1.0);
        assert_eq!(stats.file_bytes, std::fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn test_open_rejects_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cut.cktb");
        let bytes = write_abc();
        std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();
        assert!(TableReader::open(&path).unwrap_err().is_corruption());

        let empty = dir.path().join("empty.cktb");
        std::fs::write(&empty, b"").unwrap();
        assert!(TableReader::open(&empty).unwrap_err().is_corruption());
    }
}
