// src/core/protocol/compression.rs

//! Payload compression codecs.

use crate::core::DriftError;
use crate::core::protocol::commands::CompressionType;
use bytes::Bytes;

/// Compresses a payload with the requested codec. `None` is a pass-through.
pub fn compress(compression: CompressionType, data: &[u8]) -> Result<Bytes, DriftError> {
    match compression {
        CompressionType::None => Ok(Bytes::copy_from_slice(data)),
        CompressionType::Lz4 => Ok(Bytes::from(lz4_flex::block::compress_prepend_size(data))),
        CompressionType::Zstd => zstd::stream::encode_all(data, 0)
            .map(Bytes::from)
            .map_err(|e| DriftError::InvalidMessage(format!("zstd compression failed: {e}"))),
    }
}

/// Reverses [`compress`]. `uncompressed_size` from the message metadata is
/// validated against the actual output so a corrupted payload is caught
/// before delivery.
pub fn decompress(
    compression: CompressionType,
    data: &[u8],
    uncompressed_size: u32,
) -> Result<Bytes, DriftError> {
    let out = match compression {
        CompressionType::None => Bytes::copy_from_slice(data),
        CompressionType::Lz4 => lz4_flex::block::decompress_size_prepended(data)
            .map(Bytes::from)
            .map_err(|e| DriftError::InvalidMessage(format!("lz4 decompression failed: {e}")))?,
        CompressionType::Zstd => zstd::stream::decode_all(data)
            .map(Bytes::from)
            .map_err(|e| DriftError::InvalidMessage(format!("zstd decompression failed: {e}")))?,
    };
    if out.len() != uncompressed_size as usize {
        return Err(DriftError::InvalidMessage(format!(
            "decompressed size {} does not match advertised {}",
            out.len(),
            uncompressed_size
        )));
    }
    Ok(out)
}
