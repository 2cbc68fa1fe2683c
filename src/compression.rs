// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Payload compression for aged records.
//!
//! Records are compressed in place by the retention evaluator. The body is
//! serialized to JSON, compressed with the table's algorithm, then
//! decompressed again and compared byte for byte. Only a verified result
//! replaces the plaintext, so a broken codec can never lose data.
//!
//! | Algorithm | Crate      | Notes                          |
//! |-----------|------------|--------------------------------|
//! | `LZ4`     | `lz4_flex` | fastest, size-prepended frames |
//! | `ZSTD`    | `zstd`     | best ratio, level configurable |
//! | `GZIP`    | `flate2`   | interoperable                  |
//! | `NONE`    | -          | pass-through                   |
//!
//! # Example
//!
//! ```
//! use loom_store::compression::{compress_verified, CompressionAlgorithm, StandardCodec};
//!
//! let codec = StandardCodec::default();
//! let data = br#"{"latitude":51.5,"longitude":-0.12}"#.repeat(20);
//! let (bytes, stats) = compress_verified(&codec, CompressionAlgorithm::Zstd, &data).unwrap();
//! assert!(bytes.len() < data.len());
//! assert!(stats.savings > 0.0);
//! ```

use std::fmt;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::record::{Payload, PayloadKind, RecordBody};

/// Default zstd level (3 is a good balance of speed/ratio)
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompressionAlgorithm {
    #[default]
    None,
    Lz4,
    Zstd,
    Gzip,
}

impl CompressionAlgorithm {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
            Self::Gzip => "gzip",
        }
    }
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compression error types
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    /// The codec itself failed
    #[error("{algorithm} codec failed: {reason}")]
    Codec {
        algorithm: CompressionAlgorithm,
        reason: String,
    },

    /// Decompressing the output did not reproduce the input
    #[error("{algorithm} round trip mismatch ({original_len} bytes in, {decoded_len} bytes back)")]
    RoundTripMismatch {
        algorithm: CompressionAlgorithm,
        original_len: usize,
        decoded_len: usize,
    },

    /// Payload could not be (de)serialized around the codec
    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CompressionError {
    fn codec(algorithm: CompressionAlgorithm, err: impl fmt::Display) -> Self {
        Self::Codec { algorithm, reason: err.to_string() }
    }
}

/// Byte-level codec behind the store.
///
/// The store holds one shared codec; tests swap in a faulty one to
/// exercise the verification path.
pub trait PayloadCodec: Send + Sync {
    fn compress(&self, algorithm: CompressionAlgorithm, data: &[u8]) -> Result<Vec<u8>, CompressionError>;

    fn decompress(
        &self,
        algorithm: CompressionAlgorithm,
        data: &[u8],
        original_len: usize,
    ) -> Result<Vec<u8>, CompressionError>;
}

/// `lz4_flex` / `zstd` / `flate2` codec set.
#[derive(Debug, Clone, Copy)]
pub struct StandardCodec {
    pub zstd_level: i32,
}

impl StandardCodec {
    #[must_use]
    pub fn new(zstd_level: i32) -> Self {
        Self { zstd_level }
    }
}

impl Default for StandardCodec {
    fn default() -> Self {
        Self::new(DEFAULT_ZSTD_LEVEL)
    }
}

impl PayloadCodec for StandardCodec {
    fn compress(&self, algorithm: CompressionAlgorithm, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        match algorithm {
            CompressionAlgorithm::None => Ok(data.to_vec()),
            CompressionAlgorithm::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
            CompressionAlgorithm::Zstd => {
                zstd::encode_all(data, self.zstd_level).map_err(|e| CompressionError::codec(algorithm, e))
            }
            CompressionAlgorithm::Gzip => {
                let mut encoder =
                    flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder
                    .write_all(data)
                    .map_err(|e| CompressionError::codec(algorithm, e))?;
                encoder.finish().map_err(|e| CompressionError::codec(algorithm, e))
            }
        }
    }

    fn decompress(
        &self,
        algorithm: CompressionAlgorithm,
        data: &[u8],
        original_len: usize,
    ) -> Result<Vec<u8>, CompressionError> {
        match algorithm {
            CompressionAlgorithm::None => Ok(data.to_vec()),
            CompressionAlgorithm::Lz4 => {
                lz4_flex::decompress_size_prepended(data).map_err(|e| CompressionError::codec(algorithm, e))
            }
            CompressionAlgorithm::Zstd => {
                zstd::decode_all(data).map_err(|e| CompressionError::codec(algorithm, e))
            }
            CompressionAlgorithm::Gzip => {
                let mut out = Vec::with_capacity(original_len);
                flate2::read::GzDecoder::new(data)
                    .read_to_end(&mut out)
                    .map_err(|e| CompressionError::codec(algorithm, e))?;
                Ok(out)
            }
        }
    }
}

/// Compress and prove the output decodes back to `data`.
pub fn compress_verified(
    codec: &dyn PayloadCodec,
    algorithm: CompressionAlgorithm,
    data: &[u8],
) -> Result<(Vec<u8>, CompressionStats), CompressionError> {
    let compressed = codec.compress(algorithm, data)?;
    let decoded = codec.decompress(algorithm, &compressed, data.len())?;
    if decoded != data {
        return Err(CompressionError::RoundTripMismatch {
            algorithm,
            original_len: data.len(),
            decoded_len: decoded.len(),
        });
    }
    let stats = CompressionStats::new(data.len(), compressed.len());
    Ok((compressed, stats))
}

/// Plaintext inside a compressed body: one payload, or a first/last pair
/// serialized as a two-element array.
#[derive(Deserialize)]
#[serde(untagged)]
enum PlainBody {
    FirstLast(Payload, Payload),
    Typed(Payload),
}

/// Serialize a payload and compress it into a [`RecordBody::Compressed`].
pub fn compress_payload(
    codec: &dyn PayloadCodec,
    algorithm: CompressionAlgorithm,
    payload: &Payload,
) -> Result<(RecordBody, CompressionStats), CompressionError> {
    compress_plain(codec, algorithm, payload.kind(), serde_json::to_vec(payload)?)
}

/// Compress a downsampled first/last pair as one body.
pub fn compress_first_last(
    codec: &dyn PayloadCodec,
    algorithm: CompressionAlgorithm,
    first: &Payload,
    last: &Payload,
) -> Result<(RecordBody, CompressionStats), CompressionError> {
    compress_plain(codec, algorithm, first.kind(), serde_json::to_vec(&(first, last))?)
}

fn compress_plain(
    codec: &dyn PayloadCodec,
    algorithm: CompressionAlgorithm,
    kind: PayloadKind,
    plain: Vec<u8>,
) -> Result<(RecordBody, CompressionStats), CompressionError> {
    let (bytes, stats) = compress_verified(codec, algorithm, &plain)?;
    let body = RecordBody::Compressed { algorithm, kind, bytes, original_len: plain.len() };
    Ok((body, stats))
}

/// Turn a compressed body back into a plain one. Other bodies pass through.
pub fn decompress_body(codec: &dyn PayloadCodec, body: RecordBody) -> Result<RecordBody, CompressionError> {
    let RecordBody::Compressed { algorithm, kind, bytes, original_len } = body else {
        return Ok(body);
    };
    let plain = codec.decompress(algorithm, &bytes, original_len)?;
    let (decoded, kinds) = match serde_json::from_slice(&plain)? {
        PlainBody::Typed(payload) => {
            let kinds = [payload.kind(), payload.kind()];
            (RecordBody::Typed(payload), kinds)
        }
        PlainBody::FirstLast(first, last) => {
            let kinds = [first.kind(), last.kind()];
            (RecordBody::FirstLast { first, last }, kinds)
        }
    };
    if let Some(found) = kinds.into_iter().find(|k| *k != kind) {
        return Err(CompressionError::Codec {
            algorithm,
            reason: format!("decoded {found} payload, expected {kind}"),
        });
    }
    Ok(decoded)
}

/// Compression statistics for a single operation.
#[derive(Debug, Clone, Copy)]
pub struct CompressionStats {
    /// Original size in bytes
    pub original_bytes: usize,
    /// Compressed size in bytes
    pub compressed_bytes: usize,
    /// Compression ratio (original / compressed)
    pub ratio: f64,
    /// Space saved as a fraction (0.0 - 1.0, negative if output grew)
    pub savings: f64,
}

impl CompressionStats {
    /// Calculate stats from original and compressed sizes.
    #[must_use]
    pub fn new(original_bytes: usize, compressed_bytes: usize) -> Self {
        let ratio = if compressed_bytes > 0 {
            original_bytes as f64 / compressed_bytes as f64
        } else {
            0.0
        };
        let savings = if original_bytes > 0 {
            1.0 - (compressed_bytes as f64 / original_bytes as f64)
        } else {
            0.0
        };
        Self { original_bytes, compressed_bytes, ratio, savings }
    }
}

// Used only by tests that need a faulty codec; kept here so both unit and
// integration tests can reach it.
#[doc(hidden)]
pub mod testing {
    use super::*;

    /// Codec whose decompression flips one byte, so verification fails.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct CorruptingCodec;

    impl PayloadCodec for CorruptingCodec {
        fn compress(&self, algorithm: CompressionAlgorithm, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
            StandardCodec::default().compress(algorithm, data)
        }

        fn decompress(
            &self,
            algorithm: CompressionAlgorithm,
            data: &[u8],
            original_len: usize,
        ) -> Result<Vec<u8>, CompressionError> {
            let mut out = StandardCodec::default().decompress(algorithm, data, original_len)?;
            if let Some(first) = out.first_mut() {
                *first ^= 0xff;
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::sensor::GpsFix;

    fn sample() -> Vec<u8> {
        br#"{"kind":"gps","data":{"latitude":37.7749,"longitude":-122.4194}}"#.repeat(16)
    }

    #[test]
    fn test_round_trip_all_algorithms() {
        let codec = StandardCodec::default();
        let data = sample();
        for algo in [CompressionAlgorithm::Lz4, CompressionAlgorithm::Zstd, CompressionAlgorithm::Gzip] {
            let (bytes, stats) = compress_verified(&codec, algo, &data).unwrap();
            assert!(bytes.len() < data.len(), "{algo} did not shrink repetitive input");
            assert_eq!(stats.original_bytes, data.len());
            assert_eq!(codec.decompress(algo, &bytes, data.len()).unwrap(), data);
        }
    }

    #[test]
    fn test_none_is_passthrough() {
        let codec = StandardCodec::default();
        let data = sample();
        let (bytes, stats) = compress_verified(&codec, CompressionAlgorithm::None, &data).unwrap();
        assert_eq!(bytes, data);
        assert_eq!(stats.savings, 0.0);
    }

    #[test]
    fn test_empty_input() {
        let codec = StandardCodec::default();
        for algo in [CompressionAlgorithm::Lz4, CompressionAlgorithm::Zstd, CompressionAlgorithm::Gzip] {
            let (bytes, _) = compress_verified(&codec, algo, b"").unwrap();
            assert!(codec.decompress(algo, &bytes, 0).unwrap().is_empty());
        }
    }

    #[test]
    fn test_mismatch_detected() {
        let err = compress_verified(&testing::CorruptingCodec, CompressionAlgorithm::Zstd, &sample())
            .unwrap_err();
        assert!(matches!(err, CompressionError::RoundTripMismatch { .. }));
    }

    #[test]
    fn test_garbage_input_is_codec_error() {
        let codec = StandardCodec::default();
        let err = codec.decompress(CompressionAlgorithm::Zstd, b"not zstd", 8).unwrap_err();
        assert!(matches!(err, CompressionError::Codec { algorithm: CompressionAlgorithm::Zstd, .. }));
    }

    #[test]
    fn test_payload_body_round_trip() {
        let codec = StandardCodec::default();
        let payload = Payload::Gps(GpsFix::new(48.85, 2.35));
        let (body, _) = compress_payload(&codec, CompressionAlgorithm::Lz4, &payload).unwrap();
        assert!(matches!(body, RecordBody::Compressed { kind: PayloadKind::Gps, .. }));
        assert_eq!(decompress_body(&codec, body).unwrap(), RecordBody::Typed(payload));
    }

    #[test]
    fn test_first_last_body_round_trip() {
        let codec = StandardCodec::default();
        let first = Payload::Gps(GpsFix::new(48.85, 2.35));
        let last = Payload::Gps(GpsFix::new(48.86, 2.36));
        let (body, _) = compress_first_last(&codec, CompressionAlgorithm::Zstd, &first, &last).unwrap();
        assert!(matches!(body, RecordBody::Compressed { kind: PayloadKind::Gps, .. }));
        assert_eq!(decompress_body(&codec, body).unwrap(), RecordBody::FirstLast { first, last });
    }

    #[test]
    fn test_algorithm_serde_names() {
        assert_eq!(serde_json::to_string(&CompressionAlgorithm::Lz4).unwrap(), "\"LZ4\"");
        let z: CompressionAlgorithm = serde_json::from_str("\"ZSTD\"").unwrap();
        assert_eq!(z, CompressionAlgorithm::Zstd);
    }
}
