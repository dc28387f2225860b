// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::{debug, info, warn};

use crate::chunk::{Chunk, ChunkEncoder, DeltaPolicy};
use crate::compression::Compression;
use crate::error::{TableError, TableResult};
use crate::file::{create_table_file, write_file_magic, write_trailer};
use crate::header::Table;
use crate::schema::TableSchema;
use crate::value::{ColumnData, Value};

/// Writer configuration. Thresholds are checked after every buffered row;
/// whichever is reached first flushes a chunk.
#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// Rows per chunk. `None` uses the schema's rows-per-chunk hint.
    pub max_chunk_rows: Option<usize>,
    /// Estimated uncompressed bytes per chunk.
    pub max_chunk_bytes: usize,
    pub compression: Compression,
    pub delta_policy: DeltaPolicy,
    /// Chunks with at least this many rows encode their columns in parallel.
    pub parallel_encode_min_rows: usize,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            max_chunk_rows: None,
            max_chunk_bytes: 8 * 1024 * 1024,
            compression: Compression::Snappy,
            delta_policy: DeltaPolicy::Opportunistic,
            parallel_encode_min_rows: 16 * 1024,
        }
    }
}

impl WriterOptions {
    #[must_use]
    pub fn with_max_chunk_rows(mut self, rows: usize) -> Self {
        self.max_chunk_rows = Some(rows);
        self
    }

    #[must_use]
    pub fn with_max_chunk_bytes(mut self, bytes: usize) -> Self {
        self.max_chunk_bytes = bytes;
        self
    }

    #[must_use]
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    #[must_use]
    pub fn with_delta_policy(mut self, policy: DeltaPolicy) -> Self {
        self.delta_policy = policy;
        self
    }

    #[must_use]
    pub fn with_parallel_encode_min_rows(mut self, rows: usize) -> Self {
        self.parallel_encode_min_rows = rows;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Open,
    Appending,
    Closed,
    Aborted,
}

/// A single write session producing one table.
///
/// Rows are validated per batch, buffered column-wise and flushed as
/// chunks. The header is written only by a successful [`close`], so an
/// aborted session never references a partial chunk.
///
/// [`close`]: TableWriter::close
pub struct TableWriter<W: Write> {
    sink: W,
    schema: TableSchema,
    options: WriterOptions,
    max_rows: usize,
    state: WriterState,
    abort_reason: Option<String>,

    buffer: Vec<ColumnData>,
    buffered_rows: usize,
    buffered_bytes: usize,

    chunks: Vec<Chunk>,
    rows_accepted: u64,
    last_sort_value: Option<Value>,
    pk_indices: Vec<usize>,
    seen_keys: HashSet<Vec<u8>>,
}

impl TableWriter<BufWriter<File>> {
    /// Creates a new table file. Fails if the file exists or its parent
    /// directory does not.
    pub fn create(path: impl AsRef<Path>, schema: TableSchema, options: WriterOptions) -> TableResult<Self> {
        schema.validate()?;
        let file = create_table_file(path.as_ref())?;
        info!(path = %path.as_ref().display(), "creating table file");
        Self::new(BufWriter::new(file), schema, options)
    }
}

impl TableWriter<Vec<u8>> {
    pub fn in_memory(schema: TableSchema, options: WriterOptions) -> TableResult<Self> {
        Self::new(Vec::new(), schema, options)
    }
}

impl<W: Write> TableWriter<W> {
    pub fn new(mut sink: W, schema: TableSchema, options: WriterOptions) -> TableResult<Self> {
        schema.validate()?;
        write_file_magic(&mut sink)?;
        let max_rows = options
            .max_chunk_rows
            .unwrap_or_else(|| schema.rows_per_chunk_hint())
            .max(1);
        let buffer = init_column_buffers(&schema, max_rows.min(64 * 1024));
        let pk_indices = schema.primary_key_indices();
        Ok(Self {
            sink,
            schema,
            options,
            max_rows,
            state: WriterState::Open,
            abort_reason: None,
            buffer,
            buffered_rows: 0,
            buffered_bytes: 0,
            chunks: Vec::new(),
            rows_accepted: 0,
            last_sort_value: None,
            pk_indices,
            seen_keys: HashSet::new(),
        })
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Rows accepted so far, flushed or buffered.
    pub fn rows_accepted(&self) -> u64 {
        self.rows_accepted
    }

    pub fn chunks_flushed(&self) -> usize {
        self.chunks.len()
    }

    pub fn append_row(&mut self, row: &[Value]) -> TableResult<()> {
        self.append_rows(&[row])
    }

    /// Appends a batch. The whole batch is validated before any row is
    /// buffered. Row-shape errors reject only the batch; ordering,
    /// nullability and key violations abort the session.
    pub fn append_rows<R: AsRef<[Value]>>(&mut self, rows: &[R]) -> TableResult<()> {
        self.check_usable()?;
        let new_keys = match self.validate_batch(rows) {
            Ok(keys) => keys,
            Err(e) => {
                if e.is_invariant_violation() {
                    self.abort(&e);
                }
                return Err(e);
            }
        };
        if rows.is_empty() {
            return Ok(());
        }
        self.state = WriterState::Appending;
        self.seen_keys.extend(new_keys);
        if let Some(sort) = self.schema.sort_column {
            if let Some(last) = rows.last() {
                self.last_sort_value = Some(last.as_ref()[sort.column_idx].clone());
            }
        }

        for row in rows {
            let row = row.as_ref();
            let pushed = self.push_row(row);
            if let Err(e) = pushed {
                self.abort(&e);
                return Err(e);
            }
            self.rows_accepted += 1;
            if self.buffered_rows >= self.max_rows || self.buffered_bytes >= self.options.max_chunk_bytes {
                self.flush()?;
            }
        }
        Ok(())
    }

    /// Encodes buffered rows into a chunk and writes it to the sink.
    pub fn flush(&mut self) -> TableResult<()> {
        self.check_usable()?;
        if self.buffered_rows == 0 {
            return Ok(());
        }
        let written = self.write_chunk();
        if let Err(e) = written {
            self.abort(&e);
            return Err(e);
        }
        Ok(())
    }

    /// Flushes remaining rows, writes the header and returns the finished
    /// table descriptor. The writer cannot be used afterwards.
    pub fn close(&mut self) -> TableResult<Table> {
        self.flush()?;
        let finished = Table::new(self.schema.clone(), self.chunks.clone()).and_then(|table| {
            let header = table.encode()?;
            write_trailer(&mut self.sink, &header)?;
            Ok(table)
        });
        match finished {
            Ok(table) => {
                self.state = WriterState::Closed;
                info!(
                    rows = table.num_rows(),
                    chunks = table.chunks().len(),
                    "table writer closed"
                );
                Ok(table)
            }
            Err(e) => {
                self.abort(&e);
                Err(e)
            }
        }
    }

    /// Returns the sink. Only a closed writer's sink holds a readable table.
    pub fn into_inner(self) -> W {
        self.sink
    }

    fn check_usable(&self) -> TableResult<()> {
        match self.state {
            WriterState::Open | WriterState::Appending => Ok(()),
            WriterState::Closed => Err(TableError::writer_aborted("writer already closed")),
            WriterState::Aborted => Err(TableError::writer_aborted(
                self.abort_reason.clone().unwrap_or_else(|| "aborted".to_string()),
            )),
        }
    }

    fn abort(&mut self, cause: &TableError) {
        warn!(error = %cause, chunks = self.chunks.len(), "table writer aborted");
        self.state = WriterState::Aborted;
        self.abort_reason = Some(cause.to_string());
        for col in &mut self.buffer {
            col.clear();
        }
        self.buffered_rows = 0;
        self.buffered_bytes = 0;
    }

    fn validate_batch<R: AsRef<[Value]>>(&self, rows: &[R]) -> TableResult<HashSet<Vec<u8>>> {
        let columns = &self.schema.columns;
        let sort = self.schema.sort_column;
        let mut prev_sort: Option<&Value> = None;
        let mut batch_keys: HashSet<Vec<u8>> = HashSet::new();

        for (i, row) in rows.iter().enumerate() {
            let row = row.as_ref();
            let global_row = self.rows_accepted + i as u64;
            if row.len() != columns.len() {
                return Err(TableError::schema_mismatch(format!(
                    "row {global_row} has {} values, table has {} columns",
                    row.len(),
                    columns.len()
                )));
            }
            for (value, col) in row.iter().zip(columns) {
                if !value.matches_type(col.column_type) {
                    return Err(TableError::schema_mismatch(format!(
                        "row {global_row}: {value} does not fit {} column '{}'",
                        col.column_type, col.name
                    )));
                }
            }
            for (value, col) in row.iter().zip(columns) {
                if value.is_null() && !col.nullable {
                    return Err(TableError::NullViolation {
                        row: global_row,
                        column: col.name.clone(),
                    });
                }
            }

            if let Some(sort) = sort {
                let value = &row[sort.column_idx];
                let column = columns[sort.column_idx].name.clone();
                let out_of_order = |before: &Value| {
                    let ord = before.sort_cmp(value);
                    if sort.ascending {
                        ord.is_gt()
                    } else {
                        ord.is_lt()
                    }
                };
                match prev_sort {
                    Some(before) if out_of_order(before) => {
                        return Err(TableError::UnsortedInput { row: global_row, column });
                    }
                    None => {
                        if let Some(before) = &self.last_sort_value {
                            if out_of_order(before) {
                                // the previous row already sits in a flushed chunk
                                if self.buffered_rows == 0 && !self.chunks.is_empty() {
                                    return Err(TableError::SortViolation {
                                        chunk: self.chunks.len(),
                                        column,
                                    });
                                }
                                return Err(TableError::UnsortedInput { row: global_row, column });
                            }
                        }
                    }
                    _ => {}
                }
                prev_sort = Some(value);
            }

            if !self.pk_indices.is_empty() {
                let mut key = Vec::new();
                for &idx in &self.pk_indices {
                    row[idx].write_key_bytes(&mut key);
                }
                if self.seen_keys.contains(&key) || !batch_keys.insert(key) {
                    return Err(TableError::DuplicateKey {
                        row: global_row,
                        columns: self.primary_key_names(),
                    });
                }
            }
        }
        Ok(batch_keys)
    }

    fn primary_key_names(&self) -> String {
        self.pk_indices
            .iter()
            .map(|&i| self.schema.columns[i].name.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }

    fn push_row(&mut self, row: &[Value]) -> TableResult<()> {
        for (col, value) in self.buffer.iter_mut().zip(row) {
            col.push(value)?;
            self.buffered_bytes += estimated_size(value);
        }
        self.buffered_rows += 1;
        Ok(())
    }

    fn write_chunk(&mut self) -> TableResult<()> {
        let encoded = ChunkEncoder::new(&self.schema.columns, self.schema.sort_column)
            .with_compression(self.options.compression)
            .with_delta_policy(self.options.delta_policy)
            .with_parallel_min_rows(self.options.parallel_encode_min_rows)
            .encode(&self.buffer)?;
        self.sink.write_all(&encoded.payload)?;
        debug!(
            chunk = self.chunks.len(),
            rows = encoded.chunk.num_rows,
            raw_bytes = encoded.raw_bytes,
            stored_bytes = encoded.chunk.size,
            "flushed chunk"
        );
        self.chunks.push(encoded.chunk);
        for col in &mut self.buffer {
            col.clear();
        }
        self.buffered_rows = 0;
        self.buffered_bytes = 0;
        Ok(())
    }
}

fn init_column_buffers(schema: &TableSchema, capacity: usize) -> Vec<ColumnData> {
    schema
        .columns
        .iter()
        .map(|col| ColumnData::with_capacity(col.column_type, capacity))
        .collect()
}

fn estimated_size(value: &Value) -> usize {
    match value {
        Value::Null => 0,
        Value::Boolean(_) | Value::Byte(_) => 1,
        Value::Int32(_) | Value::Float(_) => 4,
        Value::Int64(_) | Value::Double(_) => 8,
        Value::Utf8(s) => 4 + s.len(),
        Value::FixedLen(b) => b.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::parse_container;
    use crate::schema::{Column, ColumnType};

    fn id_name_schema() -> TableSchema {
        TableSchema::new(vec![
            Column::new("id", ColumnType::Int32).primary_key(),
            Column::new("name", ColumnType::Utf8),
        ])
        .sorted_by("id", true)
        .unwrap()
    }

    fn row(id: i32, name: &str) -> Vec<Value> {
        vec![Value::Int32(id), Value::Utf8(name.to_string())]
    }

    #[test]
    fn test_threshold_splits_chunks() {
        let opts = WriterOptions::default().with_max_chunk_rows(2);
        let mut w = TableWriter::in_memory(id_name_schema(), opts).unwrap();
        w.append_rows(&[row(1, "a"), row(2, "b"), row(3, "c")]).unwrap();
        let table = w.close().unwrap();
        assert_eq!(table.num_rows(), 3);
        let rows: Vec<u64> = table.chunks().iter().map(|c| c.num_rows).collect();
        assert_eq!(rows, vec![2, 1]);
        assert_eq!(w.state(), WriterState::Closed);

        let bytes = w.into_inner();
        let container = parse_container(&bytes).unwrap();
        assert_eq!(container.table, table);
    }

    #[test]
    fn test_unsorted_batch_rejected() {
        let mut w = TableWriter::in_memory(id_name_schema(), WriterOptions::default()).unwrap();
        let err = w.append_rows(&[row(2, "b"), row(1, "a")]).unwrap_err();
        assert!(matches!(err, TableError::UnsortedInput { row: 1, .. }));
        assert_eq!(w.state(), WriterState::Aborted);
        assert!(matches!(w.close(), Err(TableError::WriterAborted { .. })));
        // nothing past the file magic reached the sink
        assert_eq!(w.into_inner().len(), 4);
    }

    #[test]
    fn test_sort_violation_across_chunk_boundary() {
        let opts = WriterOptions::default().with_max_chunk_rows(2);
        let mut w = TableWriter::in_memory(id_name_schema(), opts).unwrap();
        w.append_rows(&[row(5, "a"), row(6, "b")]).unwrap();
        assert_eq!(w.chunks_flushed(), 1);
        let err = w.append_row(&row(4, "c")).unwrap_err();
        assert!(matches!(err, TableError::SortViolation { chunk: 1, .. }));
    }

    #[test]
    fn test_unsorted_against_buffered_row() {
        let mut w = TableWriter::in_memory(id_name_schema(), WriterOptions::default()).unwrap();
        w.append_row(&row(5, "a")).unwrap();
        let err = w.append_row(&row(4, "b")).unwrap_err();
        assert!(matches!(err, TableError::UnsortedInput { row: 1, .. }));
    }

    #[test]
    fn test_descending_sort() {
        let schema = TableSchema::new(vec![Column::new("v", ColumnType::Double)])
            .sorted_by("v", false)
            .unwrap();
        let mut w = TableWriter::in_memory(schema, WriterOptions::default()).unwrap();
        w.append_rows(&[vec![Value::Double(3.0)], vec![Value::Double(3.0)], vec![Value::Double(-1.0)]])
            .unwrap();
        assert!(w.append_row(&[Value::Double(0.5)]).is_err());
    }

    #[test]
    fn test_duplicate_key() {
        let schema = TableSchema::new(vec![
            Column::new("id", ColumnType::Int32).primary_key(),
            Column::new("name", ColumnType::Utf8),
        ]);
        let opts = WriterOptions::default().with_max_chunk_rows(1);
        let mut w = TableWriter::in_memory(schema, opts).unwrap();
        w.append_row(&row(1, "x")).unwrap();
        w.append_row(&row(2, "y")).unwrap();
        let err = w.append_row(&row(1, "z")).unwrap_err();
        match err {
            TableError::DuplicateKey { row, columns } => {
                assert_eq!(row, 2);
                assert_eq!(columns, "id");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(w.state(), WriterState::Aborted);
    }

    #[test]
    fn test_duplicate_key_within_batch() {
        let schema = TableSchema::new(vec![
            Column::new("a", ColumnType::Int32).primary_key(),
            Column::new("b", ColumnType::Utf8).primary_key(),
        ]);
        let mut w = TableWriter::in_memory(schema, WriterOptions::default()).unwrap();
        // composite keys: (1,"x") and (1,"y") differ
        w.append_rows(&[row(1, "x"), row(1, "y")]).unwrap();
        let err = w.append_rows(&[row(2, "x"), row(1, "y")]).unwrap_err();
        assert!(matches!(err, TableError::DuplicateKey { row: 3, .. }));
    }

    #[test]
    fn test_null_violation() {
        let schema = TableSchema::new(vec![
            Column::new("a", ColumnType::Int64),
            Column::new("b", ColumnType::Utf8).nullable(),
        ]);
        let mut w = TableWriter::in_memory(schema, WriterOptions::default()).unwrap();
        w.append_row(&[Value::Int64(1), Value::Null]).unwrap();
        let err = w.append_row(&[Value::Null, Value::Null]).unwrap_err();
        assert!(matches!(err, TableError::NullViolation { row: 1, .. }));
    }

    #[test]
    fn test_schema_mismatch_keeps_writer_usable() {
        let mut w = TableWriter::in_memory(id_name_schema(), WriterOptions::default()).unwrap();
        let err = w.append_row(&[Value::Int32(1)]).unwrap_err();
        assert!(matches!(err, TableError::SchemaMismatch { .. }));
        let err = w
            .append_row(&[Value::Int64(1), Value::Utf8("a".into())])
            .unwrap_err();
        assert!(matches!(err, TableError::SchemaMismatch { .. }));
        w.append_row(&row(1, "a")).unwrap();
        assert_eq!(w.close().unwrap().num_rows(), 1);
    }

    #[test]
    fn test_byte_threshold() {
        let schema = TableSchema::new(vec![Column::new("s", ColumnType::Utf8)]);
        let opts = WriterOptions::default().with_max_chunk_bytes(100);
        let mut w = TableWriter::in_memory(schema, opts).unwrap();
        for _ in 0..10 {
            w.append_row(&[Value::Utf8("x".repeat(46))]).unwrap();
        }
        let table = w.close().unwrap();
        assert_eq!(table.chunks().len(), 5);
        assert!(table.chunks().iter().all(|c| c.num_rows == 2));
    }

    #[test]
    fn test_empty_table() {
        let mut w = TableWriter::in_memory(id_name_schema(), WriterOptions::default()).unwrap();
        let table = w.close().unwrap();
        assert_eq!(table.num_rows(), 0);
        assert!(table.chunks().is_empty());
        assert!(matches!(w.append_row(&row(1, "a")), Err(TableError::WriterAborted { .. })));
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.cktb");
        let mut w = TableWriter::create(&path, id_name_schema(), WriterOptions::default()).unwrap();
        w.append_row(&row(1, "a")).unwrap();
        w.close().unwrap();
        drop(w);
        assert!(matches!(
            TableWriter::create(&path, id_name_schema(), WriterOptions::default()),
            Err(TableError::FileAlreadyExists { .. })
        ));
    }

    #[test]
    fn test_invalid_schema_rejected() {
        let schema = TableSchema::new(vec![Column::new("id", ColumnType::Int32).primary_key().nullable()]);
        assert!(matches!(
            TableWriter::in_memory(schema, WriterOptions::default()),
            Err(TableError::InvalidSchema { .. })
        ));
    }
}
