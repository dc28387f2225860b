// SPDX-License-Identifier: AGPL-3.0-or-later

//! The table header: version, row count, column definitions, sort order,
//! chunk descriptors and table metadata. Serialized little endian.

use crate::chunk::{Chunk, ColumnChunk};
use crate::codec::Encoding;
use crate::compression::Compression;
use crate::error::{TableError, TableResult};
use crate::schema::{Column, ColumnType, Metadata, SortColumn, TableSchema};

/// Header format version written by this crate.
pub const FORMAT_VERSION: i16 = 1;

/// A finalized table descriptor. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    version: i16,
    num_rows: u64,
    schema: TableSchema,
    chunks: Vec<Chunk>,
}

impl Table {
    /// Builds the descriptor for a finished write session. The row count
    /// is the sum of the chunk row counts.
    pub(crate) fn new(schema: TableSchema, chunks: Vec<Chunk>) -> TableResult<Self> {
        let num_rows = sum_rows(&chunks)?;
        let table = Self {
            version: FORMAT_VERSION,
            num_rows,
            schema,
            chunks,
        };
        table.validate()?;
        Ok(table)
    }

    pub fn version(&self) -> i16 {
        self.version
    }

    pub fn num_rows(&self) -> u64 {
        self.num_rows
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn columns(&self) -> &[Column] {
        &self.schema.columns
    }

    pub fn sort_column(&self) -> Option<SortColumn> {
        self.schema.sort_column
    }

    pub fn metadata(&self) -> &[Metadata] {
        &self.schema.metadata
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.schema.column_index(name)
    }

    pub fn column_by_name(&self, name: &str) -> Option<&Column> {
        self.schema.column_by_name(name)
    }

    /// Checks the header invariants: a valid schema, one column chunk per
    /// column in every chunk, delta only on integer columns, and a row
    /// count equal to the sum of chunk row counts.
    pub fn validate(&self) -> TableResult<()> {
        self.schema.validate()?;
        for (idx, chunk) in self.chunks.iter().enumerate() {
            if chunk.columns.len() != self.schema.columns.len() {
                return Err(TableError::corrupt_header(format!(
                    "chunk {idx} has {} column chunks, table has {} columns",
                    chunk.columns.len(),
                    self.schema.columns.len()
                )));
            }
            for (column_chunk, column) in chunk.columns.iter().zip(&self.schema.columns) {
                if column_chunk.encoding == Encoding::Delta && !column.column_type.is_delta_capable() {
                    return Err(TableError::corrupt_header(format!(
                        "chunk {idx} uses delta encoding on {} column '{}'",
                        column.column_type, column.name
                    )));
                }
            }
        }
        if sum_rows(&self.chunks)? != self.num_rows {
            return Err(TableError::corrupt_header(format!(
                "numRows {} does not match the sum of chunk row counts",
                self.num_rows
            )));
        }
        Ok(())
    }

    pub fn encode(&self) -> TableResult<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&to_i64(self.num_rows, "numRows")?.to_le_bytes());

        out.extend_from_slice(&to_u32(self.schema.columns.len(), "column count")?.to_le_bytes());
        for col in &self.schema.columns {
            write_str16(&mut out, &col.name)?;
            out.push(col.column_type.to_tag());
            out.extend_from_slice(&col.column_type.wire_size().to_le_bytes());
            out.push(col.nullable as u8);
            out.push(col.primary_key as u8);
            out.push(col.indexed as u8);
            write_metadata(&mut out, &col.metadata)?;
        }

        match self.schema.sort_column {
            Some(sort) => {
                out.push(1);
                out.extend_from_slice(&to_u32(sort.column_idx, "sort column index")?.to_le_bytes());
                out.push(sort.ascending as u8);
            }
            None => out.push(0),
        }

        out.extend_from_slice(&to_u32(self.chunks.len(), "chunk count")?.to_le_bytes());
        for chunk in &self.chunks {
            out.extend_from_slice(&to_i64(chunk.size, "chunk size")?.to_le_bytes());
            out.extend_from_slice(&to_i64(chunk.num_rows, "chunk numRows")?.to_le_bytes());
            out.extend_from_slice(&to_u32(chunk.columns.len(), "column chunk count")?.to_le_bytes());
            for cc in &chunk.columns {
                out.push(cc.encoding.to_tag());
                out.push(cc.compression.to_tag());
            }
        }

        write_metadata(&mut out, &self.schema.metadata)?;
        Ok(out)
    }

    /// Parses and validates a header. Unknown tags and versions fail.
    pub fn decode(mut data: &[u8]) -> TableResult<Self> {
        let version = i16::from_le_bytes(read_array(&mut data)?);
        if version != FORMAT_VERSION {
            return Err(TableError::UnsupportedVersion {
                found: version,
                supported: FORMAT_VERSION,
            });
        }
        let num_rows = read_count64(&mut data, "numRows")?;

        let ncols = u32::from_le_bytes(read_array(&mut data)?) as usize;
        let mut columns = Vec::with_capacity(ncols.min(1024));
        for _ in 0..ncols {
            let name = read_str16(&mut data)?;
            let tag = read_exact(&mut data, 1)?[0];
            let size = i32::from_le_bytes(read_array(&mut data)?);
            let column_type = ColumnType::from_wire(tag, size).ok_or_else(|| {
                TableError::corrupt_header(format!("bad column type tag {tag} (size {size}) for '{name}'"))
            })?;
            let nullable = read_bool(&mut data)?;
            let primary_key = read_bool(&mut data)?;
            let indexed = read_bool(&mut data)?;
            let metadata = read_metadata(&mut data)?;
            columns.push(Column {
                name,
                column_type,
                nullable,
                primary_key,
                indexed,
                metadata,
            });
        }

        let sort_column = if read_bool(&mut data)? {
            let column_idx = u32::from_le_bytes(read_array(&mut data)?) as usize;
            let ascending = read_bool(&mut data)?;
            Some(SortColumn {
                column_idx,
                ascending,
            })
        } else {
            None
        };

        let nchunks = u32::from_le_bytes(read_array(&mut data)?) as usize;
        let mut chunks = Vec::with_capacity(nchunks.min(1 << 16));
        for _ in 0..nchunks {
            let size = read_count64(&mut data, "chunk size")?;
            let chunk_rows = read_count64(&mut data, "chunk numRows")?;
            let ncc = u32::from_le_bytes(read_array(&mut data)?) as usize;
            let mut ccs = Vec::with_capacity(ncc.min(1024));
            for _ in 0..ncc {
                let enc = read_exact(&mut data, 1)?[0];
                let comp = read_exact(&mut data, 1)?[0];
                ccs.push(ColumnChunk {
                    encoding: Encoding::from_tag(enc)
                        .ok_or_else(|| TableError::corrupt_header(format!("bad encoding tag {enc}")))?,
                    compression: Compression::from_tag(comp)
                        .ok_or_else(|| TableError::corrupt_header(format!("bad compression tag {comp}")))?,
                });
            }
            chunks.push(Chunk {
                size,
                num_rows: chunk_rows,
                columns: ccs,
            });
        }

        let metadata = read_metadata(&mut data)?;
        if !data.is_empty() {
            return Err(TableError::corrupt_header(format!(
                "{} trailing header bytes",
                data.len()
            )));
        }

        let table = Self {
            version,
            num_rows,
            schema: TableSchema {
                columns,
                sort_column,
                metadata,
            },
            chunks,
        };
        table.validate().map_err(|e| match e {
            TableError::InvalidSchema { reason } => TableError::corrupt_header(reason),
            other => other,
        })?;
        Ok(table)
    }
}

fn sum_rows(chunks: &[Chunk]) -> TableResult<u64> {
    chunks.iter().try_fold(0u64, |acc, c| {
        acc.checked_add(c.num_rows)
            .ok_or_else(|| TableError::corrupt_header("row count overflows"))
    })
}

fn to_u32(v: usize, what: &str) -> TableResult<u32> {
    u32::try_from(v).map_err(|_| TableError::invalid_schema(format!("{what} exceeds u32::MAX")))
}

fn to_i64(v: u64, what: &str) -> TableResult<i64> {
    i64::try_from(v).map_err(|_| TableError::invalid_schema(format!("{what} exceeds i64::MAX")))
}

fn write_str16(out: &mut Vec<u8>, s: &str) -> TableResult<()> {
    let b = s.as_bytes();
    let len = u16::try_from(b.len()).map_err(|_| TableError::invalid_schema("name too long"))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(b);
    Ok(())
}

fn write_metadata(out: &mut Vec<u8>, metadata: &[Metadata]) -> TableResult<()> {
    out.extend_from_slice(&to_u32(metadata.len(), "metadata count")?.to_le_bytes());
    for m in metadata {
        write_str16(out, &m.key)?;
        out.extend_from_slice(&to_u32(m.value.len(), "metadata value")?.to_le_bytes());
        out.extend_from_slice(&m.value);
    }
    Ok(())
}

fn read_exact<'a>(data: &mut &'a [u8], len: usize) -> TableResult<&'a [u8]> {
    if data.len() < len {
        return Err(TableError::corrupt_header("header too short"));
    }
    let (head, tail) = data.split_at(len);
    *data = tail;
    Ok(head)
}

fn read_array<const N: usize>(data: &mut &[u8]) -> TableResult<[u8; N]> {
    let mut out = [0u8; N];
    out.copy_from_slice(read_exact(data, N)?);
    Ok(out)
}

fn read_bool(data: &mut &[u8]) -> TableResult<bool> {
    match read_exact(data, 1)?[0] {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(TableError::corrupt_header(format!("bad flag byte {other}"))),
    }
}

fn read_count64(data: &mut &[u8], what: &str) -> TableResult<u64> {
    let v = i64::from_le_bytes(read_array(data)?);
    u64::try_from(v).map_err(|_| TableError::corrupt_header(format!("negative {what}: {v}")))
}

fn read_str16(data: &mut &[u8]) -> TableResult<String> {
    let len = u16::from_le_bytes(read_array(data)?) as usize;
    let bytes = read_exact(data, len)?;
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|_| TableError::corrupt_header("invalid utf-8 in name"))
}

fn read_metadata(data: &mut &[u8]) -> TableResult<Vec<Metadata>> {
    let n = u32::from_le_bytes(read_array(data)?) as usize;
    let mut out = Vec::with_capacity(n.min(1024));
    for _ in 0..n {
        let key = read_str16(data)?;
        let len = u32::from_le_bytes(read_array(data)?) as usize;
        let value = read_exact(data, len)?.to_vec();
        out.push(Metadata { key, value });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> Table {
        let schema = TableSchema::new(vec![
            Column::new("ts", ColumnType::Int64).primary_key(),
            Column::new("sym", ColumnType::Utf8)
                .indexed()
                .with_metadata("unit", b"ticker".to_vec()),
            Column::new("digest", ColumnType::FixedLen(16)).nullable(),
        ])
        .sorted_by("ts", true)
        .unwrap()
        .with_metadata("source", vec![0u8, 1, 2]);
        let cc = |encoding| ColumnChunk {
            encoding,
            compression: Compression::Snappy,
        };
        let chunks = vec![
            Chunk {
                size: 120,
                num_rows: 10,
                columns: vec![cc(Encoding::Delta), cc(Encoding::Raw), cc(Encoding::Raw)],
            },
            Chunk {
                size: 40,
                num_rows: 3,
                columns: vec![cc(Encoding::Raw), cc(Encoding::Raw), cc(Encoding::Raw)],
            },
        ];
        Table::new(schema, chunks).unwrap()
    }

    #[test]
    fn test_header_round_trip() {
        let table = sample_table();
        assert_eq!(table.num_rows(), 13);
        let bytes = table.encode().unwrap();
        let back = Table::decode(&bytes).unwrap();
        assert_eq!(back, table);
        assert_eq!(back.column_index("sym"), Some(1));
        assert_eq!(
            back.column_by_name("digest").map(|c| c.column_type),
            Some(ColumnType::FixedLen(16))
        );
    }

    #[test]
    fn test_unsupported_version() {
        let mut bytes = sample_table().encode().unwrap();
        bytes[0..2].copy_from_slice(&7i16.to_le_bytes());
        assert!(matches!(
            Table::decode(&bytes),
            Err(TableError::UnsupportedVersion { found: 7, .. })
        ));
    }

    #[test]
    fn test_num_rows_mismatch_is_corrupt() {
        let mut bytes = sample_table().encode().unwrap();
        bytes[2..10].copy_from_slice(&14i64.to_le_bytes());
        assert!(matches!(
            Table::decode(&bytes),
            Err(TableError::CorruptHeader { .. })
        ));
    }

    #[test]
    fn test_unknown_type_tag_is_corrupt() {
        let mut bytes = sample_table().encode().unwrap();
        // version(2) + numRows(8) + ncols(4) + name len(2) + "ts"(2) -> type tag
        bytes[18] = 42;
        assert!(matches!(
            Table::decode(&bytes),
            Err(TableError::CorruptHeader { .. })
        ));
    }

    #[test]
    fn test_truncated_and_trailing() {
        let bytes = sample_table().encode().unwrap();
        for cut in [0, 1, 9, bytes.len() / 2, bytes.len() - 1] {
            assert!(Table::decode(&bytes[..cut]).unwrap_err().is_corruption());
        }
        let mut long = bytes.clone();
        long.push(0);
        assert!(Table::decode(&long).unwrap_err().is_corruption());
    }

    #[test]
    fn test_delta_on_utf8_rejected() {
        let schema = TableSchema::new(vec![Column::new("s", ColumnType::Utf8)]);
        let chunks = vec![Chunk {
            size: 0,
            num_rows: 0,
            columns: vec![ColumnChunk {
                encoding: Encoding::Delta,
                compression: Compression::None,
            }],
        }];
        assert!(Table::new(schema, chunks).is_err());
    }
}
