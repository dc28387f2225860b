#![no_main]

use chunked_table::TableReader;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(reader) = TableReader::from_bytes(data.to_vec()) else {
        return;
    };
    for chunk in reader.chunks() {
        let _ = chunk.map(|c| c.num_rows());
    }
    let _ = reader.stats();
    if reader.num_rows() > 0 {
        let _ = reader.row(reader.num_rows() - 1);
    }
});
