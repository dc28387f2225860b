// SPDX-License-Identifier: AGPL-3.0-or-later

//! File container:
//!
//! ```text
//! [magic "CKTB"] [chunk 0 payload] .. [chunk N-1 payload]
//! [header bytes] [header_len u32] [fnv1a32(header) u32] [magic "CKTB"]
//! ```
//!
//! The header trails the chunks so a writer only needs `io::Write`.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::ops::Range;
use std::path::Path;

use crate::error::{TableError, TableResult};
use crate::header::Table;

pub const FILE_MAGIC: &[u8; 4] = b"CKTB";
const TRAILER_LEN: usize = 12;

pub(crate) fn fnv1a32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x01000193);
    }
    hash
}

/// Creates a new table file. Existing files are never overwritten and the
/// parent directory must already exist.
pub(crate) fn create_table_file(path: &Path) -> TableResult<File> {
    if path.exists() {
        return Err(TableError::FileAlreadyExists {
            path: path.to_path_buf(),
        });
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.is_dir() {
            return Err(TableError::InvalidPath {
                path: path.to_path_buf(),
            });
        }
    }
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => TableError::FileAlreadyExists {
                path: path.to_path_buf(),
            },
            _ => TableError::from(e),
        })
}

pub(crate) fn write_file_magic<W: Write>(w: &mut W) -> io::Result<()> {
    w.write_all(FILE_MAGIC)
}

pub(crate) fn write_trailer<W: Write>(w: &mut W, header: &[u8]) -> TableResult<()> {
    let header_len = u32::try_from(header.len())
        .map_err(|_| TableError::invalid_schema("table header exceeds u32::MAX bytes"))?;
    w.write_all(header)?;
    w.write_all(&header_len.to_le_bytes())?;
    w.write_all(&fnv1a32(header).to_le_bytes())?;
    w.write_all(FILE_MAGIC)?;
    w.flush()?;
    Ok(())
}

/// A parsed container: the header plus the byte range of every chunk.
#[derive(Debug)]
pub(crate) struct Container {
    pub table: Table,
    pub chunk_ranges: Vec<Range<usize>>,
    pub header_len: usize,
}

pub(crate) fn parse_container(bytes: &[u8]) -> TableResult<Container> {
    if bytes.len() < FILE_MAGIC.len() + TRAILER_LEN {
        return Err(TableError::corrupt_header("file too short"));
    }
    if &bytes[..4] != FILE_MAGIC {
        return Err(TableError::corrupt_header("bad file magic"));
    }
    let trailer = &bytes[bytes.len() - TRAILER_LEN..];
    if &trailer[8..12] != FILE_MAGIC {
        return Err(TableError::corrupt_header("bad tail magic (file truncated?)"));
    }
    let header_len = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]) as usize;
    let checksum = u32::from_le_bytes([trailer[4], trailer[5], trailer[6], trailer[7]]);

    let header_end = bytes.len() - TRAILER_LEN;
    let header_start = header_end
        .checked_sub(header_len)
        .filter(|&start| start >= FILE_MAGIC.len())
        .ok_or_else(|| TableError::corrupt_header("header length out of range"))?;
    let header = &bytes[header_start..header_end];
    if fnv1a32(header) != checksum {
        return Err(TableError::corrupt_header("header checksum mismatch"));
    }
    let table = Table::decode(header)?;

    let mut chunk_ranges = Vec::with_capacity(table.chunks().len());
    let mut offset = FILE_MAGIC.len();
    for chunk in table.chunks() {
        let end = usize::try_from(chunk.size)
            .ok()
            .and_then(|size| offset.checked_add(size))
            .filter(|&end| end <= header_start)
            .ok_or_else(|| TableError::corrupt_chunk("chunk extends past the data region"))?;
        chunk_ranges.push(offset..end);
        offset = end;
    }
    if offset != header_start {
        return Err(TableError::corrupt_chunk(format!(
            "chunk sizes cover {} bytes, data region has {}",
            offset - FILE_MAGIC.len(),
            header_start - FILE_MAGIC.len()
        )));
    }

    Ok(Container {
        table,
        chunk_ranges,
        header_len,
    })
}
