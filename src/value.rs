// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::error::{TableError, TableResult};
use crate::schema::ColumnType;
use std::cmp::Ordering;
use std::fmt;

/// A single logical cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Byte(i8),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    Utf8(String),
    FixedLen(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// True when the value can be stored in a column of `col_type`. Null
    /// matches every type; nullability is checked separately.
    pub fn matches_type(&self, col_type: ColumnType) -> bool {
        match (self, col_type) {
            (Value::Null, _) => true,
            (Value::Boolean(_), ColumnType::Boolean) => true,
            (Value::Byte(_), ColumnType::Byte) => true,
            (Value::Int32(_), ColumnType::Int32) => true,
            (Value::Int64(_), ColumnType::Int64) => true,
            (Value::Float(_), ColumnType::Float) => true,
            (Value::Double(_), ColumnType::Double) => true,
            (Value::Utf8(_), ColumnType::Utf8) => true,
            (Value::FixedLen(v), ColumnType::FixedLen(size)) => v.len() == size as usize,
            _ => false,
        }
    }

    /// Ordering between two non-null values of the same type. Floats use
    /// IEEE total ordering.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::Byte(a), Value::Byte(b)) => Some(a.cmp(b)),
            (Value::Int32(a), Value::Int32(b)) => Some(a.cmp(b)),
            (Value::Int64(a), Value::Int64(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => Some(a.total_cmp(b)),
            (Value::Double(a), Value::Double(b)) => Some(a.total_cmp(b)),
            (Value::Utf8(a), Value::Utf8(b)) => Some(a.cmp(b)),
            (Value::FixedLen(a), Value::FixedLen(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Ordering used for sort-column checks: nulls first, then `compare`.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        match (self.is_null(), other.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => self.compare(other).unwrap_or(Ordering::Equal),
        }
    }

    /// Appends a canonical, self-delimiting byte form of the value, used as
    /// a hash key for primary-key tracking and explicit indexes.
    pub(crate) fn write_key_bytes(&self, out: &mut Vec<u8>) {
        match self {
            Value::Null => out.push(0),
            Value::Boolean(v) => {
                out.push(1);
                out.push(*v as u8);
            }
            Value::Byte(v) => {
                out.push(2);
                out.push(*v as u8);
            }
            Value::Int32(v) => {
                out.push(3);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Value::Int64(v) => {
                out.push(4);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Value::Float(v) => {
                out.push(5);
                out.extend_from_slice(&v.to_bits().to_le_bytes());
            }
            Value::Double(v) => {
                out.push(6);
                out.extend_from_slice(&v.to_bits().to_le_bytes());
            }
            Value::Utf8(v) => {
                out.push(7);
                out.extend_from_slice(&(v.len() as u64).to_le_bytes());
                out.extend_from_slice(v.as_bytes());
            }
            Value::FixedLen(v) => {
                out.push(8);
                out.extend_from_slice(&(v.len() as u64).to_le_bytes());
                out.extend_from_slice(v);
            }
        }
    }

    pub(crate) fn key_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_key_bytes(&mut out);
        out
    }
}

fn write_bytes(f: &mut fmt::Formatter, bytes: &[u8]) -> fmt::Result {
    for b in bytes.iter().take(5) {
        write!(f, "{:02X} ", b)?;
    }
    if bytes.len() > 5 {
        write!(f, "...")?;
    }
    Ok(())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Null => write!(f, "(NULL)"),
            Value::Boolean(v) => write!(f, "Boolean({})", v),
            Value::Byte(v) => write!(f, "Byte({})", v),
            Value::Int32(v) => write!(f, "Int32({})", v),
            Value::Int64(v) => write!(f, "Int64({})", v),
            Value::Float(v) => write!(f, "Float({})", v),
            Value::Double(v) => write!(f, "Double({})", v),
            Value::Utf8(v) => write!(f, "Utf8(\"{}\")", v),
            Value::FixedLen(v) => {
                write!(f, "FixedLen(")?;
                write_bytes(f, v)?;
                write!(f, ")")
            }
        }
    }
}

/// One column's values for a run of rows. `None` marks a null.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Boolean(Vec<Option<bool>>),
    Byte(Vec<Option<i8>>),
    Int32(Vec<Option<i32>>),
    Int64(Vec<Option<i64>>),
    Float(Vec<Option<f32>>),
    Double(Vec<Option<f64>>),
    Utf8(Vec<Option<String>>),
    FixedLen(Vec<Option<Vec<u8>>>),
}

impl ColumnData {
    pub fn with_capacity(col_type: ColumnType, capacity: usize) -> Self {
        match col_type {
            ColumnType::Boolean => ColumnData::Boolean(Vec::with_capacity(capacity)),
            ColumnType::Byte => ColumnData::Byte(Vec::with_capacity(capacity)),
            ColumnType::Int32 => ColumnData::Int32(Vec::with_capacity(capacity)),
            ColumnType::Int64 => ColumnData::Int64(Vec::with_capacity(capacity)),
            ColumnType::Float => ColumnData::Float(Vec::with_capacity(capacity)),
            ColumnType::Double => ColumnData::Double(Vec::with_capacity(capacity)),
            ColumnType::Utf8 => ColumnData::Utf8(Vec::with_capacity(capacity)),
            ColumnType::FixedLen(_) => ColumnData::FixedLen(Vec::with_capacity(capacity)),
        }
    }

    /// Builds a column from row values, checking every value against `col_type`.
    pub fn from_values(col_type: ColumnType, values: &[Value]) -> TableResult<Self> {
        let mut out = Self::with_capacity(col_type, values.len());
        for v in values {
            if !v.matches_type(col_type) {
                return Err(TableError::schema_mismatch(format!(
                    "value {} does not match column type {}",
                    v, col_type
                )));
            }
            out.push(v)?;
        }
        Ok(out)
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnData::Boolean(v) => v.len(),
            ColumnData::Byte(v) => v.len(),
            ColumnData::Int32(v) => v.len(),
            ColumnData::Int64(v) => v.len(),
            ColumnData::Float(v) => v.len(),
            ColumnData::Double(v) => v.len(),
            ColumnData::Utf8(v) => v.len(),
            ColumnData::FixedLen(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when the variant can hold values of `col_type`. Fixed-length
    /// widths are checked by the codec.
    pub fn matches_type(&self, col_type: ColumnType) -> bool {
        matches!(
            (self, col_type),
            (ColumnData::Boolean(_), ColumnType::Boolean)
                | (ColumnData::Byte(_), ColumnType::Byte)
                | (ColumnData::Int32(_), ColumnType::Int32)
                | (ColumnData::Int64(_), ColumnType::Int64)
                | (ColumnData::Float(_), ColumnType::Float)
                | (ColumnData::Double(_), ColumnType::Double)
                | (ColumnData::Utf8(_), ColumnType::Utf8)
                | (ColumnData::FixedLen(_), ColumnType::FixedLen(_))
        )
    }

    pub fn is_null(&self, idx: usize) -> bool {
        match self {
            ColumnData::Boolean(v) => v[idx].is_none(),
            ColumnData::Byte(v) => v[idx].is_none(),
            ColumnData::Int32(v) => v[idx].is_none(),
            ColumnData::Int64(v) => v[idx].is_none(),
            ColumnData::Float(v) => v[idx].is_none(),
            ColumnData::Double(v) => v[idx].is_none(),
            ColumnData::Utf8(v) => v[idx].is_none(),
            ColumnData::FixedLen(v) => v[idx].is_none(),
        }
    }

    pub fn null_count(&self) -> usize {
        (0..self.len()).filter(|&i| self.is_null(i)).count()
    }

    /// The value at `idx`, or `None` when out of range.
    pub fn get(&self, idx: usize) -> Option<Value> {
        if idx >= self.len() {
            return None;
        }
        let value = match self {
            ColumnData::Boolean(v) => v[idx].map_or(Value::Null, Value::Boolean),
            ColumnData::Byte(v) => v[idx].map_or(Value::Null, Value::Byte),
            ColumnData::Int32(v) => v[idx].map_or(Value::Null, Value::Int32),
            ColumnData::Int64(v) => v[idx].map_or(Value::Null, Value::Int64),
            ColumnData::Float(v) => v[idx].map_or(Value::Null, Value::Float),
            ColumnData::Double(v) => v[idx].map_or(Value::Null, Value::Double),
            ColumnData::Utf8(v) => v[idx].clone().map_or(Value::Null, Value::Utf8),
            ColumnData::FixedLen(v) => v[idx].clone().map_or(Value::Null, Value::FixedLen),
        };
        Some(value)
    }

    pub fn values(&self) -> impl Iterator<Item = Value> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i))
    }

    /// Appends one value. The caller has already checked the type.
    pub(crate) fn push(&mut self, value: &Value) -> TableResult<()> {
        match (self, value) {
            (ColumnData::Boolean(col), Value::Boolean(v)) => col.push(Some(*v)),
            (ColumnData::Boolean(col), Value::Null) => col.push(None),
            (ColumnData::Byte(col), Value::Byte(v)) => col.push(Some(*v)),
            (ColumnData::Byte(col), Value::Null) => col.push(None),
            (ColumnData::Int32(col), Value::Int32(v)) => col.push(Some(*v)),
            (ColumnData::Int32(col), Value::Null) => col.push(None),
            (ColumnData::Int64(col), Value::Int64(v)) => col.push(Some(*v)),
            (ColumnData::Int64(col), Value::Null) => col.push(None),
            (ColumnData::Float(col), Value::Float(v)) => col.push(Some(*v)),
            (ColumnData::Float(col), Value::Null) => col.push(None),
            (ColumnData::Double(col), Value::Double(v)) => col.push(Some(*v)),
            (ColumnData::Double(col), Value::Null) => col.push(None),
            (ColumnData::Utf8(col), Value::Utf8(v)) => col.push(Some(v.clone())),
            (ColumnData::Utf8(col), Value::Null) => col.push(None),
            (ColumnData::FixedLen(col), Value::FixedLen(v)) => col.push(Some(v.clone())),
            (ColumnData::FixedLen(col), Value::Null) => col.push(None),
            _ => {
                return Err(TableError::schema_mismatch(
                    "buffer value type mismatch",
                ))
            }
        }
        Ok(())
    }

    pub(crate) fn clear(&mut self) {
        match self {
            ColumnData::Boolean(v) => v.clear(),
            ColumnData::Byte(v) => v.clear(),
            ColumnData::Int32(v) => v.clear(),
            ColumnData::Int64(v) => v.clear(),
            ColumnData::Float(v) => v.clear(),
            ColumnData::Double(v) => v.clear(),
            ColumnData::Utf8(v) => v.clear(),
            ColumnData::FixedLen(v) => v.clear(),
        }
    }

    /// Approximate uncompressed size of the buffered values, in bytes.
    pub fn raw_size(&self) -> usize {
        match self {
            ColumnData::Boolean(v) => (v.len() + 7) / 8,
            ColumnData::Byte(v) => v.len(),
            ColumnData::Int32(v) => v.len() * 4,
            ColumnData::Int64(v) => v.len() * 8,
            ColumnData::Float(v) => v.len() * 4,
            ColumnData::Double(v) => v.len() * 8,
            ColumnData::Utf8(v) => v
                .iter()
                .map(|s| 4 + s.as_ref().map_or(0, |s| s.len()))
                .sum(),
            ColumnData::FixedLen(v) => v.iter().map(|b| b.as_ref().map_or(0, |b| b.len())).sum(),
        }
    }
}
