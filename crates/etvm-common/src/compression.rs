// compression.rs — raw deflate for pk3 archive members
//
// Zip members with method 8 are raw deflate streams (no zlib header).

use flate2::read::{DeflateDecoder, DeflateEncoder};
use flate2::Compression;
use std::io::Read;

/// Largest member we are willing to inflate. Guards against decompression bombs.
pub const MAX_MEMBER_SIZE: usize = 256 * 1024 * 1024;

/// Compress data unconditionally using raw deflate.
pub fn compress_data(data: &[u8]) -> Result<Vec<u8>, String> {
    let mut encoder = DeflateEncoder::new(data, Compression::default());
    let mut compressed = Vec::with_capacity(data.len());

    encoder
        .read_to_end(&mut compressed)
        .map_err(|e| format!("Compression failed: {}", e))?;

    Ok(compressed)
}

/// Inflate a member whose uncompressed size is recorded in the archive.
pub fn decompress_with_size(data: &[u8], uncompressed_size: usize) -> Result<Vec<u8>, String> {
    if uncompressed_size > MAX_MEMBER_SIZE {
        return Err(format!(
            "Uncompressed size {} exceeds maximum {}",
            uncompressed_size, MAX_MEMBER_SIZE
        ));
    }

    // Read one byte past the declared size so an oversized stream is detected
    // without inflating all of it.
    let mut decoder = DeflateDecoder::new(data).take(uncompressed_size as u64 + 1);
    let mut decompressed = Vec::with_capacity(uncompressed_size);

    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| format!("Decompression failed: {}", e))?;

    if decompressed.len() != uncompressed_size {
        return Err(format!(
            "Size mismatch: expected {}, got {}",
            uncompressed_size,
            decompressed.len()
        ));
    }

    Ok(decompressed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inflate_known_size() {
        let original = vec![7u8; 10000];
        let compressed = compress_data(&original).unwrap();
        assert!(compressed.len() < original.len());
        assert_eq!(decompress_with_size(&compressed, original.len()).unwrap(), original);
    }

    #[test]
    fn test_inflate_size_mismatch() {
        let original = b"module binary contents".to_vec();
        let compressed = compress_data(&original).unwrap();
        assert!(decompress_with_size(&compressed, original.len() - 1).is_err());
        assert!(decompress_with_size(&compressed, original.len() + 1).is_err());
    }

    #[test]
    fn test_inflate_rejects_huge_declared_size() {
        assert!(decompress_with_size(&[], MAX_MEMBER_SIZE + 1).is_err());
    }
}
