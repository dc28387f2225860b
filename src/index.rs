// SPDX-License-Identifier: AGPL-3.0-or-later

//! Point lookups on indexed and primary-key columns.
//!
//! The sort column is searched through its per-chunk value ranges; any
//! other lookup column gets an in-memory hash index built by one scan.
//! Neither structure is persisted.

use std::cmp::Ordering;
use std::collections::HashMap;

use tracing::debug;

use crate::error::{TableError, TableResult};
use crate::reader::TableReader;
use crate::value::{ColumnData, Value};

/// Position of one row: chunk, offset inside the chunk, and global row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowLocation {
    pub chunk: usize,
    pub offset: usize,
    pub row: u64,
}

#[derive(Debug)]
enum IndexKind {
    /// First and last value of every non-empty chunk, in chunk order.
    Sorted {
        ascending: bool,
        ranges: Vec<ChunkRange>,
    },
    Hashed(HashMap<Vec<u8>, Vec<RowLocation>>),
}

#[derive(Debug)]
struct ChunkRange {
    chunk: usize,
    first_row: u64,
    first: Value,
    last: Value,
}

#[derive(Debug)]
pub struct ColumnIndex {
    column_idx: usize,
    kind: IndexKind,
}

impl ColumnIndex {
    pub fn column_idx(&self) -> usize {
        self.column_idx
    }

    /// True when lookups go through the sort-order ranges.
    pub fn is_sorted(&self) -> bool {
        matches!(self.kind, IndexKind::Sorted { .. })
    }

    fn build(reader: &TableReader, column_idx: usize) -> TableResult<Self> {
        let chunk_starts = chunk_starts(reader);
        let sorted = reader
            .sort_column()
            .filter(|s| s.column_idx == column_idx)
            .map(|s| s.ascending);

        let kind = match sorted {
            Some(ascending) => {
                let mut ranges = Vec::new();
                for (chunk, &first_row) in chunk_starts.iter().enumerate() {
                    let values = reader.chunk_column(chunk, column_idx)?;
                    let n = values.len();
                    if n == 0 {
                        continue;
                    }
                    if let (Some(first), Some(last)) = (values.get(0), values.get(n - 1)) {
                        ranges.push(ChunkRange {
                            chunk,
                            first_row,
                            first,
                            last,
                        });
                    }
                }
                IndexKind::Sorted { ascending, ranges }
            }
            None => {
                let mut map: HashMap<Vec<u8>, Vec<RowLocation>> = HashMap::new();
                for (chunk, &first_row) in chunk_starts.iter().enumerate() {
                    let values = reader.chunk_column(chunk, column_idx)?;
                    for (offset, value) in values.values().enumerate() {
                        if value.is_null() {
                            continue;
                        }
                        map.entry(value.key_bytes()).or_default().push(RowLocation {
                            chunk,
                            offset,
                            row: first_row + offset as u64,
                        });
                    }
                }
                IndexKind::Hashed(map)
            }
        };
        Ok(Self { column_idx, kind })
    }

    /// All rows whose value equals `value`, in table order. Nulls are not
    /// indexed.
    pub fn lookup(&self, reader: &TableReader, value: &Value) -> TableResult<Vec<RowLocation>> {
        let column = &reader.columns()[self.column_idx];
        if !value.matches_type(column.column_type) {
            return Err(TableError::schema_mismatch(format!(
                "lookup value {value} does not fit {} column '{}'",
                column.column_type, column.name
            )));
        }
        if value.is_null() {
            return Ok(Vec::new());
        }
        match &self.kind {
            IndexKind::Hashed(map) => Ok(map.get(&value.key_bytes()).cloned().unwrap_or_default()),
            IndexKind::Sorted { ascending, ranges } => {
                let ord = |a: &Value, b: &Value| {
                    if *ascending {
                        a.sort_cmp(b)
                    } else {
                        b.sort_cmp(a)
                    }
                };
                let start = ranges.partition_point(|r| ord(&r.last, value) == Ordering::Less);
                let mut out = Vec::new();
                for range in ranges[start..]
                    .iter()
                    .take_while(|r| ord(&r.first, value) != Ordering::Greater)
                {
                    let values = reader.chunk_column(range.chunk, self.column_idx)?;
                    let (lo, hi) = equal_range(&values, value, &ord);
                    out.extend((lo..hi).map(|offset| RowLocation {
                        chunk: range.chunk,
                        offset,
                        row: range.first_row + offset as u64,
                    }));
                }
                Ok(out)
            }
        }
    }
}

/// Bounds of the run of entries equal to `target` in an ordered column.
fn equal_range(
    values: &ColumnData,
    target: &Value,
    ord: &impl Fn(&Value, &Value) -> Ordering,
) -> (usize, usize) {
    let cmp_at = |i: usize| values.get(i).map_or(Ordering::Less, |v| ord(&v, target));
    let lo = lower_bound(values.len(), |i| cmp_at(i) == Ordering::Less);
    let hi = lower_bound(values.len(), |i| cmp_at(i) != Ordering::Greater);
    (lo, hi)
}

/// First index in `0..n` for which `pred` is false; `pred` must be
/// true on a prefix and false afterwards.
fn lower_bound(n: usize, pred: impl Fn(usize) -> bool) -> usize {
    let (mut lo, mut hi) = (0usize, n);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if pred(mid) {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

fn chunk_starts(reader: &TableReader) -> Vec<u64> {
    let mut next = 0u64;
    reader
        .table()
        .chunks()
        .iter()
        .map(|c| {
            let start = next;
            next += c.num_rows;
            start
        })
        .collect()
}

/// Builds and caches lookup structures for one reader.
pub struct Indexer<'a> {
    reader: &'a TableReader,
    indexes: HashMap<usize, ColumnIndex>,
}

impl<'a> Indexer<'a> {
    pub fn new(reader: &'a TableReader) -> Self {
        Self {
            reader,
            indexes: HashMap::new(),
        }
    }

    /// Returns the index for `column`, building it on first use. Only
    /// indexed or primary-key columns can be indexed.
    pub fn index(&mut self, column: &str) -> TableResult<&ColumnIndex> {
        let column_idx = self
            .reader
            .table()
            .column_index(column)
            .ok_or_else(|| TableError::ColumnNotFound {
                name: column.to_string(),
            })?;
        if !self.reader.columns()[column_idx].is_lookup_column() {
            return Err(TableError::NotIndexed {
                name: column.to_string(),
            });
        }
        if !self.indexes.contains_key(&column_idx) {
            let index = ColumnIndex::build(self.reader, column_idx)?;
            debug!(column, sorted = index.is_sorted(), "built column index");
            self.indexes.insert(column_idx, index);
        }
        self.indexes
            .get(&column_idx)
            .ok_or_else(|| TableError::NotIndexed {
                name: column.to_string(),
            })
    }

    pub fn lookup(&mut self, column: &str, value: &Value) -> TableResult<Vec<RowLocation>> {
        let reader = self.reader;
        self.index(column)?.lookup(reader, value)
    }

    /// First matching row, if any.
    pub fn lookup_first(&mut self, column: &str, value: &Value) -> TableResult<Option<RowLocation>> {
        Ok(self.lookup(column, value)?.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, ColumnType, TableSchema};
    use crate::writer::{TableWriter, WriterOptions};

    fn build(schema: TableSchema, rows: Vec<Vec<Value>>, chunk_rows: usize) -> TableReader {
        let opts = WriterOptions::default().with_max_chunk_rows(chunk_rows);
        let mut w = TableWriter::in_memory(schema, opts).unwrap();
        w.append_rows(&rows).unwrap();
        w.close().unwrap();
        TableReader::from_bytes(w.into_inner()).unwrap()
    }

    fn events() -> TableReader {
        let schema = TableSchema::new(vec![
            Column::new("ts", ColumnType::Int64).indexed(),
            Column::new("id", ColumnType::Utf8).primary_key(),
            Column::new("note", ColumnType::Utf8).nullable(),
        ])
        .sorted_by("ts", true)
        .unwrap();
        let ts = [1i64, 3, 3, 3, 3, 7, 9, 9, 12, 15];
        let rows = ts
            .iter()
            .enumerate()
            .map(|(i, &t)| {
                vec![
                    Value::Int64(t),
                    Value::Utf8(format!("ev-{i}")),
                    Value::Null,
                ]
            })
            .collect();
        build(schema, rows, 3)
    }

    #[test]
    fn test_sorted_lookup_spans_chunks() {
        let reader = events();
        let mut indexer = Indexer::new(&reader);
        assert!(indexer.index("ts").unwrap().is_sorted());

        let hits = indexer.lookup("ts", &Value::Int64(3)).unwrap();
        let rows: Vec<u64> = hits.iter().map(|h| h.row).collect();
        assert_eq!(rows, vec![1, 2, 3, 4]);
        assert_eq!(hits[2], RowLocation { chunk: 1, offset: 0, row: 3 });

        assert_eq!(indexer.lookup_first("ts", &Value::Int64(15)).unwrap().map(|h| h.row), Some(9));
        assert!(indexer.lookup("ts", &Value::Int64(8)).unwrap().is_empty());
        assert!(indexer.lookup("ts", &Value::Int64(0)).unwrap().is_empty());
        assert!(indexer.lookup("ts", &Value::Int64(99)).unwrap().is_empty());
    }

    #[test]
    fn test_hash_lookup_on_primary_key() {
        let reader = events();
        let mut indexer = Indexer::new(&reader);
        assert!(!indexer.index("id").unwrap().is_sorted());
        let hit = indexer
            .lookup_first("id", &Value::Utf8("ev-7".into()))
            .unwrap()
            .unwrap();
        assert_eq!(hit, RowLocation { chunk: 2, offset: 1, row: 7 });
        assert_eq!(reader.row(hit.row).unwrap()[0], Value::Int64(9));
        assert!(indexer.lookup("id", &Value::Utf8("missing".into())).unwrap().is_empty());
    }

    #[test]
    fn test_not_indexed_and_unknown() {
        let reader = events();
        let mut indexer = Indexer::new(&reader);
        assert!(matches!(indexer.index("note"), Err(TableError::NotIndexed { .. })));
        assert!(matches!(indexer.index("nope"), Err(TableError::ColumnNotFound { .. })));
        assert!(matches!(
            indexer.lookup("ts", &Value::Int32(3)),
            Err(TableError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn test_descending_sort_lookup() {
        let schema = TableSchema::new(vec![Column::new("k", ColumnType::Int32).primary_key()])
            .sorted_by("k", false)
            .unwrap();
        let rows = (0..20).rev().map(|k| vec![Value::Int32(k * 2)]).collect();
        let reader = build(schema, rows, 4);
        let mut indexer = Indexer::new(&reader);
        let hit = indexer.lookup_first("k", &Value::Int32(10)).unwrap().unwrap();
        assert_eq!(hit.row, 14);
        assert!(indexer.lookup("k", &Value::Int32(11)).unwrap().is_empty());
    }

    #[test]
    fn test_lower_bound() {
        let v = [1, 2, 2, 2, 5];
        assert_eq!(lower_bound(v.len(), |i| v[i] < 2), 1);
        assert_eq!(lower_bound(v.len(), |i| v[i] <= 2), 4);
        assert_eq!(lower_bound(0, |_| true), 0);
    }
}
