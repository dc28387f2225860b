// SPDX-License-Identifier: AGPL-3.0-or-later
// =========================================================
// Chunk encoder / decoder
// Payload = concatenation of framed column chunks, schema order:
//   [stored_len u32][raw_len u32][stored bytes]
// =========================================================

use rayon::prelude::*;

use crate::codec::{encode_column, Encoding};
use crate::compression::{compress_if_smaller, Compression};
use crate::error::{TableError, TableResult};
use crate::schema::{Column, SortColumn};
use crate::value::ColumnData;

const FRAME_HEADER_LEN: usize = 8;

/// Encoding and compression tags for one column inside one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnChunk {
    pub encoding: Encoding,
    pub compression: Compression,
}

/// Descriptor of one physical chunk as recorded in the table header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Payload length in bytes (sum of the framed column ranges).
    pub size: u64,
    pub num_rows: u64,
    pub columns: Vec<ColumnChunk>,
}

/// Which integer columns may use delta encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeltaPolicy {
    Never,
    SortColumnOnly,
    #[default]
    Opportunistic,
}

impl DeltaPolicy {
    pub fn allows(self, column_idx: usize, sort_column: Option<SortColumn>) -> bool {
        match self {
            Self::Never => false,
            Self::SortColumnOnly => sort_column.map_or(false, |s| s.column_idx == column_idx),
            Self::Opportunistic => true,
        }
    }
}

/// A chunk descriptor together with its payload bytes.
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    pub chunk: Chunk,
    pub payload: Vec<u8>,
    /// Sum of the encoded column lengths before compression.
    pub raw_bytes: u64,
}

pub struct ChunkEncoder<'a> {
    columns: &'a [Column],
    sort_column: Option<SortColumn>,
    compression: Compression,
    delta_policy: DeltaPolicy,
    parallel_min_rows: usize,
}

impl<'a> ChunkEncoder<'a> {
    pub fn new(columns: &'a [Column], sort_column: Option<SortColumn>) -> Self {
        Self {
            columns,
            sort_column,
            compression: Compression::default(),
            delta_policy: DeltaPolicy::default(),
            parallel_min_rows: usize::MAX,
        }
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_delta_policy(mut self, policy: DeltaPolicy) -> Self {
        self.delta_policy = policy;
        self
    }

    /// Columns are encoded on the rayon pool once a chunk has at least
    /// `rows` rows.
    pub fn with_parallel_min_rows(mut self, rows: usize) -> Self {
        self.parallel_min_rows = rows;
        self
    }

    pub fn encode(&self, data: &[ColumnData]) -> TableResult<EncodedChunk> {
        if data.len() != self.columns.len() {
            return Err(TableError::schema_mismatch(format!(
                "chunk has {} columns, schema has {}",
                data.len(),
                self.columns.len()
            )));
        }
        let rows = data.first().map_or(0, ColumnData::len);
        if let Some(col) = data.iter().position(|d| d.len() != rows) {
            return Err(TableError::schema_mismatch(format!(
                "column '{}' has {} values, expected {}",
                self.columns[col].name,
                data[col].len(),
                rows
            )));
        }

        let use_parallel = rows >= self.parallel_min_rows && rayon::current_num_threads() > 1;
        let framed: Vec<(ColumnChunk, Vec<u8>, usize)> = if use_parallel {
            data.par_iter()
                .enumerate()
                .map(|(idx, values)| self.encode_one(idx, values))
                .collect::<TableResult<_>>()?
        } else {
            data.iter()
                .enumerate()
                .map(|(idx, values)| self.encode_one(idx, values))
                .collect::<TableResult<_>>()?
        };

        let total: usize = framed.iter().map(|(_, bytes, _)| bytes.len()).sum();
        let mut payload = Vec::with_capacity(total);
        let mut columns = Vec::with_capacity(framed.len());
        let mut raw_bytes = 0u64;
        for (column_chunk, bytes, raw_len) in framed {
            payload.extend_from_slice(&bytes);
            columns.push(column_chunk);
            raw_bytes += raw_len as u64;
        }

        Ok(EncodedChunk {
            chunk: Chunk {
                size: payload.len() as u64,
                num_rows: rows as u64,
                columns,
            },
            payload,
            raw_bytes,
        })
    }

    fn encode_one(&self, idx: usize, values: &ColumnData) -> TableResult<(ColumnChunk, Vec<u8>, usize)> {
        let column = &self.columns[idx];
        let allow_delta = self.delta_policy.allows(idx, self.sort_column);
        let (encoding, encoded) = encode_column(column, values, allow_delta)?;
        let raw_len = encoded.len();
        let (compression, stored) = compress_if_smaller(self.compression, encoded)?;

        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + stored.len());
        out.extend_from_slice(&checked_u32_len(stored.len(), &column.name)?.to_le_bytes());
        out.extend_from_slice(&checked_u32_len(raw_len, &column.name)?.to_le_bytes());
        out.extend_from_slice(&stored);
        Ok((ColumnChunk { encoding, compression }, out, raw_len))
    }
}

fn checked_u32_len(len: usize, column: &str) -> TableResult<u32> {
    u32::try_from(len).map_err(|_| {
        TableError::schema_mismatch(format!("column chunk for '{column}' exceeds u32::MAX bytes"))
    })
}

/// One framed column range inside a chunk payload.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ColumnFrame<'a> {
    pub stored: &'a [u8],
    pub raw_len: usize,
}

/// Walks the framing of a chunk payload. The frames must exactly cover
/// the payload and the declared chunk size.
pub(crate) fn split_frames<'a>(chunk: &Chunk, payload: &'a [u8]) -> TableResult<Vec<ColumnFrame<'a>>> {
    if payload.len() as u64 != chunk.size {
        return Err(TableError::corrupt_chunk(format!(
            "declared size {} but payload has {} bytes",
            chunk.size,
            payload.len()
        )));
    }
    let mut frames = Vec::with_capacity(chunk.columns.len());
    let mut rest = payload;
    for idx in 0..chunk.columns.len() {
        if rest.len() < FRAME_HEADER_LEN {
            return Err(TableError::corrupt_chunk(format!(
                "column chunk {idx} frame header truncated"
            )));
        }
        let stored_len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        let raw_len = u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        rest = &rest[FRAME_HEADER_LEN..];
        if rest.len() < stored_len {
            return Err(TableError::corrupt_chunk(format!(
                "column chunk {idx} declares {stored_len} bytes, {} remain",
                rest.len()
            )));
        }
        let (stored, tail) = rest.split_at(stored_len);
        frames.push(ColumnFrame { stored, raw_len });
        rest = tail;
    }
    if !rest.is_empty() {
        return Err(TableError::corrupt_chunk(format!(
            "{} trailing bytes after last column chunk",
            rest.len()
        )));
    }
    Ok(frames)
}

pub struct ChunkDecoder<'a> {
    columns: &'a [Column],
}

impl<'a> ChunkDecoder<'a> {
    pub fn new(columns: &'a [Column]) -> Self {
        Self { columns }
    }

    pub fn decode(&self, chunk: &Chunk, payload: &[u8]) -> TableResult<Vec<ColumnData>> {
        self.check_shape(chunk)?;
        let rows = row_count(chunk)?;
        split_frames(chunk, payload)?
            .into_iter()
            .zip(chunk.columns.iter())
            .zip(self.columns.iter())
            .map(|((frame, column_chunk), column)| decode_frame(column, *column_chunk, frame, rows))
            .collect()
    }

    /// Decodes a single column; the other column ranges are skipped.
    pub fn decode_column(&self, chunk: &Chunk, payload: &[u8], column_idx: usize) -> TableResult<ColumnData> {
        self.check_shape(chunk)?;
        let column = self.columns.get(column_idx).ok_or_else(|| TableError::ColumnNotFound {
            name: format!("#{column_idx}"),
        })?;
        let rows = row_count(chunk)?;
        let frames = split_frames(chunk, payload)?;
        decode_frame(column, chunk.columns[column_idx], frames[column_idx], rows)
    }

    fn check_shape(&self, chunk: &Chunk) -> TableResult<()> {
        if chunk.columns.len() != self.columns.len() {
            return Err(TableError::corrupt_chunk(format!(
                "chunk has {} column chunks, table has {} columns",
                chunk.columns.len(),
                self.columns.len()
            )));
        }
        Ok(())
    }
}

fn row_count(chunk: &Chunk) -> TableResult<usize> {
    usize::try_from(chunk.num_rows)
        .map_err(|_| TableError::corrupt_chunk(format!("row count {} too large", chunk.num_rows)))
}

fn decode_frame(column: &Column, column_chunk: ColumnChunk, frame: ColumnFrame<'_>, rows: usize) -> TableResult<ColumnData> {
    let encoded = column_chunk.compression.decompress(frame.stored, frame.raw_len)?;
    column_chunk.encoding.decode(column, &encoded, rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnType;

    fn columns() -> Vec<Column> {
        vec![
            Column::new("id", ColumnType::Int64).primary_key(),
            Column::new("name", ColumnType::Utf8).nullable(),
            Column::new("flag", ColumnType::Boolean),
        ]
    }

    fn sample(rows: usize) -> Vec<ColumnData> {
        vec![
            ColumnData::Int64((0..rows as i64).map(|i| Some(1000 + i * 3)).collect()),
            ColumnData::Utf8(
                (0..rows)
                    .map(|i| (i % 4 != 0).then(|| format!("name-{}", i % 7)))
                    .collect(),
            ),
            ColumnData::Boolean((0..rows).map(|i| Some(i % 2 == 0)).collect()),
        ]
    }

    #[test]
    fn test_round_trip() {
        let cols = columns();
        let data = sample(500);
        let encoded = ChunkEncoder::new(&cols, None).encode(&data).unwrap();
        assert_eq!(encoded.chunk.num_rows, 500);
        assert_eq!(encoded.chunk.size, encoded.payload.len() as u64);
        assert_eq!(encoded.chunk.columns[0].encoding, Encoding::Delta);

        let decoder = ChunkDecoder::new(&cols);
        let decoded = decoder.decode(&encoded.chunk, &encoded.payload).unwrap();
        assert_eq!(decoded, data);
        // idempotent
        assert_eq!(decoder.decode(&encoded.chunk, &encoded.payload).unwrap(), decoded);
    }

    #[test]
    fn test_empty_chunk_round_trips() {
        let cols = columns();
        let data: Vec<ColumnData> = cols
            .iter()
            .map(|c| ColumnData::with_capacity(c.column_type, 0))
            .collect();
        let encoded = ChunkEncoder::new(&cols, None).encode(&data).unwrap();
        assert_eq!(encoded.chunk.num_rows, 0);
        let decoded = ChunkDecoder::new(&cols).decode(&encoded.chunk, &encoded.payload).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_decode_single_column() {
        let cols = columns();
        let data = sample(64);
        let encoded = ChunkEncoder::new(&cols, None).encode(&data).unwrap();
        let name = ChunkDecoder::new(&cols)
            .decode_column(&encoded.chunk, &encoded.payload, 1)
            .unwrap();
        assert_eq!(name, data[1]);
    }

    #[test]
    fn test_parallel_matches_serial() {
        let cols = columns();
        let data = sample(2000);
        let serial = ChunkEncoder::new(&cols, None).encode(&data).unwrap();
        let parallel = ChunkEncoder::new(&cols, None)
            .with_parallel_min_rows(1)
            .encode(&data)
            .unwrap();
        assert_eq!(serial.chunk, parallel.chunk);
        assert_eq!(serial.payload, parallel.payload);
    }

    #[test]
    fn test_delta_policy() {
        let cols = columns();
        let data = sample(100);
        let never = ChunkEncoder::new(&cols, None)
            .with_delta_policy(DeltaPolicy::Never)
            .encode(&data)
            .unwrap();
        assert_eq!(never.chunk.columns[0].encoding, Encoding::Raw);

        let sort = Some(SortColumn { column_idx: 0, ascending: true });
        let sorted_only = ChunkEncoder::new(&cols, sort)
            .with_delta_policy(DeltaPolicy::SortColumnOnly)
            .encode(&data)
            .unwrap();
        assert_eq!(sorted_only.chunk.columns[0].encoding, Encoding::Delta);
        assert!(!DeltaPolicy::SortColumnOnly.allows(0, None));
    }

    #[test]
    fn test_size_mismatch_is_corrupt() {
        let cols = columns();
        let encoded = ChunkEncoder::new(&cols, None).encode(&sample(10)).unwrap();
        let mut chunk = encoded.chunk.clone();
        chunk.size += 1;
        let err = ChunkDecoder::new(&cols).decode(&chunk, &encoded.payload).unwrap_err();
        assert!(matches!(err, TableError::CorruptChunk { .. }));

        let mut payload = encoded.payload.clone();
        payload.push(0);
        let mut chunk = encoded.chunk.clone();
        chunk.size = payload.len() as u64;
        let err = ChunkDecoder::new(&cols).decode(&chunk, &payload).unwrap_err();
        assert!(matches!(err, TableError::CorruptChunk { .. }));
    }

    #[test]
    fn test_column_count_mismatch() {
        let cols = columns();
        let err = ChunkEncoder::new(&cols, None).encode(&sample(3)[..2]).unwrap_err();
        assert!(matches!(err, TableError::SchemaMismatch { .. }));

        let encoded = ChunkEncoder::new(&cols, None).encode(&sample(3)).unwrap();
        let err = ChunkDecoder::new(&cols[..2]).decode(&encoded.chunk, &encoded.payload).unwrap_err();
        assert!(matches!(err, TableError::CorruptChunk { .. }));
    }
}
