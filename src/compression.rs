//! Transparent compression for stored payloads.
//!
//! Uses zstd with magic-bytes detection, so entries written before
//! compression was requested still decode.
//!
//! # Feature Flag
//!
//! Real compression requires the `compression` feature (on by default).
//! Without it [`compress_bytes`] returns its input unchanged and reports
//! that nothing was compressed; the storage layer then records the entry
//! as uncompressed.
//!
//! # Example
//!
//! ```rust,ignore
//! use offline_sync::compression::{compress_bytes, decompress_bytes};
//!
//! let (packed, compressed) = compress_bytes(b"{\"results\": [1, 2, 3]}")?;
//! assert!(compressed);
//! assert_eq!(decompress_bytes(&packed)?, b"{\"results\": [1, 2, 3]}");
//! ```

/// Zstd magic bytes (little-endian): 0xFD2FB528
#[cfg(feature = "compression")]
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Default compression level (3 is a good balance of speed/ratio)
#[cfg(feature = "compression")]
const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("compression failed: {0}")]
    CompressFailed(String),

    #[error("decompression failed: {0}")]
    DecompressFailed(String),
}

/// Check if data is zstd-compressed by checking magic bytes.
#[cfg(feature = "compression")]
#[inline]
#[must_use]
pub fn is_compressed(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == ZSTD_MAGIC
}

/// Compress bytes. Returns the output and whether it is actually compressed.
#[cfg(feature = "compression")]
pub fn compress_bytes(data: &[u8]) -> Result<(Vec<u8>, bool), CompressionError> {
    let packed = zstd::encode_all(data, DEFAULT_COMPRESSION_LEVEL)
        .map_err(|e| CompressionError::CompressFailed(e.to_string()))?;
    Ok((packed, true))
}

/// Decompress bytes. Returns original bytes if not compressed.
#[cfg(feature = "compression")]
pub fn decompress_bytes(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    if is_compressed(data) {
        zstd::decode_all(data).map_err(|e| CompressionError::DecompressFailed(e.to_string()))
    } else {
        Ok(data.to_vec())
    }
}

#[cfg(not(feature = "compression"))]
#[inline]
#[must_use]
pub fn is_compressed(_data: &[u8]) -> bool {
    false
}

#[cfg(not(feature = "compression"))]
pub fn compress_bytes(data: &[u8]) -> Result<(Vec<u8>, bool), CompressionError> {
    Ok((data.to_vec(), false))
}

#[cfg(not(feature = "compression"))]
pub fn decompress_bytes(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    Ok(data.to_vec())
}
