#![no_main]

use chunked_table::{Column, ColumnType, Encoding};
use libfuzzer_sys::fuzz_target;

const TYPES: [ColumnType; 8] = [
    ColumnType::Boolean,
    ColumnType::Byte,
    ColumnType::Int32,
    ColumnType::Int64,
    ColumnType::Float,
    ColumnType::Double,
    ColumnType::Utf8,
    ColumnType::FixedLen(3),
];

fuzz_target!(|data: &[u8]| {
    if data.len() < 3 {
        return;
    }
    let column_type = TYPES[data[0] as usize % TYPES.len()];
    let mut column = Column::new("f", column_type);
    if data[1] & 1 == 1 {
        column = column.nullable();
    }
    let encoding = if data[1] & 2 == 2 { Encoding::Delta } else { Encoding::Raw };
    let rows = data[2] as usize;
    let _ = encoding.decode(&column, &data[3..], rows);
});
