// SPDX-License-Identifier: AGPL-3.0-or-later

//! Block compression applied to each encoded column chunk.

use crate::error::{TableError, TableResult};

/// Compression tag stored per column chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Compression {
    None,
    #[default]
    Snappy,
}

impl Compression {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::None),
            1 => Some(Self::Snappy),
            _ => None,
        }
    }

    pub fn to_tag(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Snappy => 1,
        }
    }

    pub fn compress(self, data: &[u8]) -> TableResult<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Snappy => snap::raw::Encoder::new()
                .compress_vec(data)
                .map_err(|e| TableError::corrupt_chunk(format!("snappy compression failed: {e}"))),
        }
    }

    /// Reverses `compress`. The output must be exactly `expected_len` bytes.
    pub fn decompress(self, data: &[u8], expected_len: usize) -> TableResult<Vec<u8>> {
        let out = match self {
            Self::None => data.to_vec(),
            Self::Snappy => {
                let declared = snap::raw::decompress_len(data).map_err(|e| {
                    TableError::corrupt_chunk(format!("bad snappy preamble: {e}"))
                })?;
                if declared != expected_len {
                    return Err(TableError::corrupt_chunk(format!(
                        "snappy block declares {declared} bytes, expected {expected_len}"
                    )));
                }
                snap::raw::Decoder::new()
                    .decompress_vec(data)
                    .map_err(|e| TableError::corrupt_chunk(format!("snappy decompression failed: {e}")))?
            }
        };
        if out.len() != expected_len {
            return Err(TableError::corrupt_chunk(format!(
                "decompressed {} bytes, expected {}",
                out.len(),
                expected_len
            )));
        }
        Ok(out)
    }
}

/// Compresses `data` with `preferred`, keeping it uncompressed unless the
/// compressed form is strictly smaller.
pub fn compress_if_smaller(preferred: Compression, data: Vec<u8>) -> TableResult<(Compression, Vec<u8>)> {
    if preferred == Compression::None || data.is_empty() {
        return Ok((Compression::None, data));
    }
    let packed = preferred.compress(&data)?;
    if packed.len() < data.len() {
        Ok((preferred, packed))
    } else {
        Ok((Compression::None, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn incompressible(len: usize) -> Vec<u8> {
        // xorshift bytes, no repeated runs for snappy to exploit
        let mut x = 0x9E37_79B9_7F4A_7C15u64;
        (0..len)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                (x >> 24) as u8
            })
            .collect()
    }

    #[test]
    fn test_tags() {
        for c in [Compression::None, Compression::Snappy] {
            assert_eq!(Compression::from_tag(c.to_tag()), Some(c));
        }
        assert_eq!(Compression::from_tag(9), None);
    }

    #[test]
    fn test_snappy_round_trip() {
        let data: Vec<u8> = b"abcabcabcabcabcabcabcabcabcabcabcabc".repeat(20);
        let packed = Compression::Snappy.compress(&data).unwrap();
        assert!(packed.len() < data.len());
        let back = Compression::Snappy.decompress(&packed, data.len()).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_incompressible_blob_stays_uncompressed() {
        let blob = incompressible(64);
        let (compression, stored) = compress_if_smaller(Compression::Snappy, blob.clone()).unwrap();
        assert_eq!(compression, Compression::None);
        assert_eq!(stored, blob);
    }

    #[test]
    fn test_length_mismatch_is_corrupt() {
        let data = vec![7u8; 256];
        let packed = Compression::Snappy.compress(&data).unwrap();
        let err = Compression::Snappy.decompress(&packed, 255).unwrap_err();
        assert!(matches!(err, TableError::CorruptChunk { .. }));

        let err = Compression::None.decompress(&data, 10).unwrap_err();
        assert!(matches!(err, TableError::CorruptChunk { .. }));
    }

    #[test]
    fn test_garbage_snappy_is_corrupt() {
        let err = Compression::Snappy.decompress(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01], 4).unwrap_err();
        assert!(err.is_corruption());
    }
}
