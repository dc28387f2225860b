// SPDX-License-Identifier: AGPL-3.0-or-later
// =========================================================
// Column codec
// Raw: natural-width little-endian packing, bit-packed booleans,
//      length-prefixed utf8, optional leading null bitmap.
// Delta: first value verbatim + zig-zag varint deltas (int32/int64).
// =========================================================

use crate::error::{TableError, TableResult};
use crate::schema::{Column, ColumnType};
use crate::value::ColumnData;

/// Per-column value encoding, as tagged on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    Raw,
    Delta,
}

impl Encoding {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Raw),
            1 => Some(Self::Delta),
            _ => None,
        }
    }

    pub fn to_tag(self) -> u8 {
        match self {
            Self::Raw => 0,
            Self::Delta => 1,
        }
    }

    /// Encodes one column's values. Fails with `SchemaMismatch` when the
    /// data does not fit the column definition or the encoding does not
    /// apply to the column type.
    pub fn encode(self, column: &Column, data: &ColumnData) -> TableResult<Vec<u8>> {
        check_column_data(column, data)?;
        match self {
            Self::Raw => encode_raw(column, data),
            Self::Delta => encode_delta(column, data),
        }
    }

    /// Decodes `rows` values. The whole of `bytes` must be consumed.
    pub fn decode(self, column: &Column, bytes: &[u8], rows: usize) -> TableResult<ColumnData> {
        let mut reader = ColumnReader::new(bytes, &column.name);
        let nulls = if column.nullable {
            Some(reader.take(bitmap_len(rows))?)
        } else {
            None
        };
        let data = match self {
            Self::Raw => decode_raw(column.column_type, &mut reader, nulls, rows)?,
            Self::Delta => decode_delta(column.column_type, &mut reader, nulls, rows)?,
        };
        reader.finish()?;
        Ok(data)
    }
}

/// Encodes a column with raw encoding, or with delta encoding when it is
/// allowed, applicable and strictly smaller.
pub fn encode_column(
    column: &Column,
    data: &ColumnData,
    allow_delta: bool,
) -> TableResult<(Encoding, Vec<u8>)> {
    let raw = Encoding::Raw.encode(column, data)?;
    if allow_delta && column.column_type.is_delta_capable() {
        let delta = Encoding::Delta.encode(column, data)?;
        if delta.len() < raw.len() {
            return Ok((Encoding::Delta, delta));
        }
    }
    Ok((Encoding::Raw, raw))
}

fn check_column_data(column: &Column, data: &ColumnData) -> TableResult<()> {
    if !data.matches_type(column.column_type) {
        return Err(TableError::schema_mismatch(format!(
            "column '{}' expects {} values",
            column.name, column.column_type
        )));
    }
    if !column.nullable && data.null_count() > 0 {
        return Err(TableError::schema_mismatch(format!(
            "null value in non-nullable column '{}'",
            column.name
        )));
    }
    if let (ColumnData::FixedLen(values), ColumnType::FixedLen(size)) = (data, column.column_type) {
        if values.iter().flatten().any(|v| v.len() != size as usize) {
            return Err(TableError::schema_mismatch(format!(
                "fixed-length column '{}' expects {} byte values",
                column.name, size
            )));
        }
    }
    Ok(())
}

// =========================================================
// Null bitmap (1 = null, LSB first)
// =========================================================

#[inline]
pub(crate) fn bitmap_len(rows: usize) -> usize {
    rows / 8 + usize::from(rows % 8 != 0)
}

#[inline]
fn bit_is_set(bitmap: &[u8], idx: usize) -> bool {
    (bitmap[idx / 8] >> (idx % 8)) & 1 == 1
}

fn write_null_bitmap(data: &ColumnData, out: &mut Vec<u8>) {
    let start = out.len();
    out.resize(start + bitmap_len(data.len()), 0);
    for i in 0..data.len() {
        if data.is_null(i) {
            out[start + i / 8] |= 1u8 << (i % 8);
        }
    }
}

fn pack_bools(values: &[Option<bool>], out: &mut Vec<u8>) {
    let start = out.len();
    out.resize(start + bitmap_len(values.len()), 0);
    for (i, v) in values.iter().enumerate() {
        if v.unwrap_or(false) {
            out[start + i / 8] |= 1u8 << (i % 8);
        }
    }
}

// =========================================================
// Variable Length Integer (varint) + ZigZag
// =========================================================

fn uvarint_encode_into(mut x: u64, out: &mut Vec<u8>) {
    loop {
        let b = (x & 0x7F) as u8;
        x >>= 7;
        if x != 0 {
            out.push(b | 0x80);
        } else {
            out.push(b);
            break;
        }
    }
}

fn uvarint_decode(buf: &[u8], pos: usize) -> Result<(u64, usize), &'static str> {
    let mut val = 0u64;
    let mut shift = 0u32;
    let mut pos = pos;

    loop {
        if pos >= buf.len() {
            return Err("truncated varint");
        }
        if shift >= 64 {
            return Err("varint too long");
        }
        let b = buf[pos];
        pos += 1;
        val |= ((b & 0x7F) as u64) << shift;
        if (b & 0x80) == 0 {
            return Ok((val, pos));
        }
        shift += 7;
    }
}

#[inline]
fn zz_encode(x: i64) -> u64 {
    ((x << 1) ^ (x >> 63)) as u64
}

#[inline]
fn zz_decode(u: u64) -> i64 {
    ((u >> 1) as i64) ^ -((u & 1) as i64)
}

// =========================================================
// Raw
// =========================================================

fn encode_raw(column: &Column, data: &ColumnData) -> TableResult<Vec<u8>> {
    let mut out = Vec::with_capacity(data.raw_size() + bitmap_len(data.len()));
    if column.nullable {
        write_null_bitmap(data, &mut out);
    }
    match data {
        ColumnData::Boolean(values) => pack_bools(values, &mut out),
        ColumnData::Byte(values) => {
            out.extend(values.iter().map(|v| v.unwrap_or(0) as u8));
        }
        ColumnData::Int32(values) => {
            for v in values {
                out.extend_from_slice(&v.unwrap_or(0).to_le_bytes());
            }
        }
        ColumnData::Int64(values) => {
            for v in values {
                out.extend_from_slice(&v.unwrap_or(0).to_le_bytes());
            }
        }
        ColumnData::Float(values) => {
            for v in values {
                out.extend_from_slice(&v.unwrap_or(0.0).to_bits().to_le_bytes());
            }
        }
        ColumnData::Double(values) => {
            for v in values {
                out.extend_from_slice(&v.unwrap_or(0.0).to_bits().to_le_bytes());
            }
        }
        ColumnData::Utf8(values) => {
            for v in values {
                let bytes = v.as_deref().unwrap_or("").as_bytes();
                let len = u32::try_from(bytes.len()).map_err(|_| {
                    TableError::schema_mismatch(format!(
                        "utf8 value in column '{}' exceeds u32::MAX bytes",
                        column.name
                    ))
                })?;
                out.extend_from_slice(&len.to_le_bytes());
                out.extend_from_slice(bytes);
            }
        }
        ColumnData::FixedLen(values) => {
            let width = column.column_type.fixed_width().unwrap_or(0);
            for v in values {
                match v {
                    Some(bytes) => out.extend_from_slice(bytes),
                    None => out.resize(out.len() + width, 0),
                }
            }
        }
    }
    Ok(out)
}

fn decode_raw(
    col_type: ColumnType,
    reader: &mut ColumnReader<'_>,
    nulls: Option<&[u8]>,
    rows: usize,
) -> TableResult<ColumnData> {
    let is_null = |i: usize| nulls.map_or(false, |b| bit_is_set(b, i));
    let data = match col_type {
        ColumnType::Boolean => {
            let packed = reader.take(bitmap_len(rows))?;
            ColumnData::Boolean(
                (0..rows)
                    .map(|i| (!is_null(i)).then(|| bit_is_set(packed, i)))
                    .collect(),
            )
        }
        ColumnType::Byte => {
            let raw = reader.take(rows)?;
            ColumnData::Byte(
                raw.iter()
                    .enumerate()
                    .map(|(i, &b)| (!is_null(i)).then_some(b as i8))
                    .collect(),
            )
        }
        ColumnType::Int32 => {
            let raw = reader.take_values(rows, 4)?;
            ColumnData::Int32(
                raw.chunks_exact(4)
                    .enumerate()
                    .map(|(i, c)| (!is_null(i)).then(|| i32::from_le_bytes(le4(c))))
                    .collect(),
            )
        }
        ColumnType::Int64 => {
            let raw = reader.take_values(rows, 8)?;
            ColumnData::Int64(
                raw.chunks_exact(8)
                    .enumerate()
                    .map(|(i, c)| (!is_null(i)).then(|| i64::from_le_bytes(le8(c))))
                    .collect(),
            )
        }
        ColumnType::Float => {
            let raw = reader.take_values(rows, 4)?;
            ColumnData::Float(
                raw.chunks_exact(4)
                    .enumerate()
                    .map(|(i, c)| (!is_null(i)).then(|| f32::from_bits(u32::from_le_bytes(le4(c)))))
                    .collect(),
            )
        }
        ColumnType::Double => {
            let raw = reader.take_values(rows, 8)?;
            ColumnData::Double(
                raw.chunks_exact(8)
                    .enumerate()
                    .map(|(i, c)| (!is_null(i)).then(|| f64::from_bits(u64::from_le_bytes(le8(c)))))
                    .collect(),
            )
        }
        ColumnType::Utf8 => {
            // every entry carries at least its 4-byte length
            let mut out = Vec::with_capacity(rows.min(reader.rest().len() / 4));
            for i in 0..rows {
                let len = reader.read_u32()? as usize;
                let bytes = reader.take(len)?;
                if is_null(i) {
                    out.push(None);
                    continue;
                }
                let s = std::str::from_utf8(bytes)
                    .map_err(|_| reader.corrupt("bad utf8 data"))?;
                out.push(Some(s.to_string()));
            }
            ColumnData::Utf8(out)
        }
        ColumnType::FixedLen(size) => {
            let raw = reader.take_values(rows, size as usize)?;
            ColumnData::FixedLen(
                raw.chunks_exact(size as usize)
                    .enumerate()
                    .map(|(i, c)| (!is_null(i)).then(|| c.to_vec()))
                    .collect(),
            )
        }
    };
    Ok(data)
}

// =========================================================
// Delta
// =========================================================

fn encode_delta(column: &Column, data: &ColumnData) -> TableResult<Vec<u8>> {
    // Null slots repeat the previous value so they cost one byte each.
    let ints: Vec<i64> = match data {
        ColumnData::Int32(values) => fill_nulls(values.iter().map(|v| v.map(i64::from))),
        ColumnData::Int64(values) => fill_nulls(values.iter().copied()),
        _ => {
            return Err(TableError::schema_mismatch(format!(
                "delta encoding does not apply to {} column '{}'",
                column.column_type, column.name
            )))
        }
    };

    let mut out = Vec::with_capacity(bitmap_len(ints.len()) + ints.len() * 2 + 8);
    if column.nullable {
        write_null_bitmap(data, &mut out);
    }
    let Some(&first) = ints.first() else {
        return Ok(out);
    };
    match column.column_type {
        ColumnType::Int32 => out.extend_from_slice(&(first as i32).to_le_bytes()),
        _ => out.extend_from_slice(&first.to_le_bytes()),
    }
    for w in ints.windows(2) {
        uvarint_encode_into(zz_encode(w[1].wrapping_sub(w[0])), &mut out);
    }
    Ok(out)
}

fn fill_nulls(values: impl Iterator<Item = Option<i64>>) -> Vec<i64> {
    let mut prev = 0i64;
    values
        .map(|v| {
            if let Some(v) = v {
                prev = v;
            }
            prev
        })
        .collect()
}

fn decode_delta(
    col_type: ColumnType,
    reader: &mut ColumnReader<'_>,
    nulls: Option<&[u8]>,
    rows: usize,
) -> TableResult<ColumnData> {
    let is_null = |i: usize| nulls.map_or(false, |b| bit_is_set(b, i));
    let mut ints: Vec<i64> = Vec::with_capacity(rows.min(reader.rest().len() + 1));
    if rows > 0 {
        let first = match col_type {
            ColumnType::Int32 => i32::from_le_bytes(le4(reader.take(4)?)) as i64,
            ColumnType::Int64 => i64::from_le_bytes(le8(reader.take(8)?)),
            other => {
                return Err(reader.corrupt(&format!(
                    "delta encoding declared for {} column",
                    other
                )))
            }
        };
        ints.push(first);
        let rest = reader.rest();
        let mut pos = 0usize;
        let mut prev = first;
        for _ in 1..rows {
            let (u, next) = uvarint_decode(rest, pos).map_err(|e| reader.corrupt(e))?;
            pos = next;
            let delta = zz_decode(u);
            let cur = match col_type {
                ColumnType::Int32 => prev
                    .checked_add(delta)
                    .filter(|v| i32::try_from(*v).is_ok())
                    .ok_or_else(|| reader.corrupt("delta value overflows int32"))?,
                _ => prev.wrapping_add(delta),
            };
            ints.push(cur);
            prev = cur;
        }
        reader.advance(pos)?;
    }

    let data = match col_type {
        ColumnType::Int32 => ColumnData::Int32(
            ints.iter()
                .enumerate()
                .map(|(i, &v)| (!is_null(i)).then_some(v as i32))
                .collect(),
        ),
        ColumnType::Int64 => ColumnData::Int64(
            ints.iter()
                .enumerate()
                .map(|(i, &v)| (!is_null(i)).then_some(v))
                .collect(),
        ),
        // rows == 0 for a non-integer type still declares an impossible encoding
        other => {
            return Err(reader.corrupt(&format!(
                "delta encoding declared for {} column",
                other
            )))
        }
    };
    Ok(data)
}

// =========================================================
// Byte reader
// =========================================================

struct ColumnReader<'a> {
    data: &'a [u8],
    pos: usize,
    column: &'a str,
}

impl<'a> ColumnReader<'a> {
    fn new(data: &'a [u8], column: &'a str) -> Self {
        Self {
            data,
            pos: 0,
            column,
        }
    }

    fn corrupt(&self, reason: &str) -> TableError {
        TableError::corrupt_column(self.column, reason)
    }

    fn take(&mut self, len: usize) -> TableResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| self.corrupt("column chunk too short"))?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn take_values(&mut self, rows: usize, width: usize) -> TableResult<&'a [u8]> {
        let len = rows
            .checked_mul(width)
            .ok_or_else(|| self.corrupt("value section overflows"))?;
        self.take(len)
    }

    fn read_u32(&mut self) -> TableResult<u32> {
        Ok(u32::from_le_bytes(le4(self.take(4)?)))
    }

    fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    fn advance(&mut self, len: usize) -> TableResult<()> {
        self.take(len).map(|_| ())
    }

    fn finish(self) -> TableResult<()> {
        if self.pos != self.data.len() {
            return Err(self.corrupt(&format!(
                "declared length {} but decoding consumed {} bytes",
                self.data.len(),
                self.pos
            )));
        }
        Ok(())
    }
}

#[inline]
fn le4(b: &[u8]) -> [u8; 4] {
    [b[0], b[1], b[2], b[3]]
}

#[inline]
fn le8(b: &[u8]) -> [u8; 8] {
    [b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]
}
