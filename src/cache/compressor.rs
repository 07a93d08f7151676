//! Compression codec for persistent-tier payloads.
//!
//! Payloads below the size threshold are stored as-is. Larger payloads are
//! zstd-compressed, and the compressed form is kept only when it actually
//! pays for itself (ratio below `max_ratio`).

use std::fmt;

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::CompressionConfig;

const FLAG_RAW: u8 = 0;
const FLAG_ZSTD: u8 = 1;
const HEADER_LEN: usize = 5;

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("Corrupt payload: {0}")]
    CorruptPayload(String),
}

/// A serialized value, possibly compressed, ready for the persistent tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedPayload {
    pub data: Vec<u8>,
    pub is_compressed: bool,
    pub original_size: usize,
    pub compressed_size: usize,
}

impl CompressedPayload {
    fn raw(data: Vec<u8>) -> Self {
        let size = data.len();
        Self {
            data,
            is_compressed: false,
            original_size: size,
            compressed_size: size,
        }
    }

    /// `compressed_size / original_size`; 1.0 for uncompressed or empty payloads.
    pub fn ratio(&self) -> f64 {
        if !self.is_compressed || self.original_size == 0 {
            return 1.0;
        }
        self.compressed_size as f64 / self.original_size as f64
    }

    /// Bytes saved by compression.
    pub fn space_saved(&self) -> usize {
        if self.is_compressed {
            self.original_size.saturating_sub(self.compressed_size)
        } else {
            0
        }
    }

    /// Frame the payload for storage: `[flag][original_size u32 LE][data]`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.data.len());
        out.push(if self.is_compressed { FLAG_ZSTD } else { FLAG_RAW });
        out.extend_from_slice(&(self.original_size as u32).to_le_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    /// Parse a stored frame produced by [`CompressedPayload::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CompressionError> {
        if bytes.len() < HEADER_LEN {
            return Err(CompressionError::CorruptPayload(format!(
                "frame too short ({} bytes)",
                bytes.len()
            )));
        }
        let is_compressed = match bytes[0] {
            FLAG_RAW => false,
            FLAG_ZSTD => true,
            other => {
                return Err(CompressionError::CorruptPayload(format!(
                    "unknown payload flag {other}"
                )))
            }
        };
        let mut size = [0u8; 4];
        size.copy_from_slice(&bytes[1..HEADER_LEN]);
        let original_size = u32::from_le_bytes(size) as usize;
        let data = bytes[HEADER_LEN..].to_vec();

        if !is_compressed && data.len() != original_size {
            return Err(CompressionError::CorruptPayload(format!(
                "raw payload length {} does not match header {original_size}",
                data.len()
            )));
        }

        Ok(Self {
            compressed_size: data.len(),
            data,
            is_compressed,
            original_size,
        })
    }
}

impl fmt::Display for CompressedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_compressed {
            write!(
                f,
                "Compressed: {} -> {} bytes ({:.1}%, saved {} bytes)",
                self.original_size,
                self.compressed_size,
                self.ratio() * 100.0,
                self.space_saved()
            )
        } else {
            write!(f, "Uncompressed: {} bytes", self.original_size)
        }
    }
}

/// The compression engine used by the persistent tier.
#[derive(Debug, Clone)]
pub struct Compressor {
    config: CompressionConfig,
}

impl Compressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    /// Whether a payload of this size is large enough to try compressing.
    pub fn should_compress(&self, len: usize) -> bool {
        len >= self.config.threshold_bytes
    }

    /// Compress a serialized value if it is large enough and compresses well.
    ///
    /// Never fails: a zstd error falls back to the raw bytes.
    pub fn compress(&self, raw: &[u8]) -> CompressedPayload {
        if !self.should_compress(raw.len()) {
            return CompressedPayload::raw(raw.to_vec());
        }

        let compressed = match zstd::encode_all(raw, self.config.zstd_level) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, size = raw.len(), "zstd compression failed, storing raw");
                return CompressedPayload::raw(raw.to_vec());
            }
        };

        let ratio = compressed.len() as f64 / raw.len() as f64;
        if ratio >= self.config.max_ratio {
            debug!(
                ratio = %format!("{:.1}%", ratio * 100.0),
                size = raw.len(),
                "Poor compression ratio, using uncompressed data"
            );
            return CompressedPayload::raw(raw.to_vec());
        }

        debug!(
            original = raw.len(),
            compressed = compressed.len(),
            "Compressed payload"
        );

        CompressedPayload {
            compressed_size: compressed.len(),
            data: compressed,
            is_compressed: true,
            original_size: raw.len(),
        }
    }

    /// Reverse [`Compressor::compress`]. Identity for uncompressed payloads.
    pub fn decompress(&self, payload: &CompressedPayload) -> Result<Vec<u8>, CompressionError> {
        if !payload.is_compressed {
            return Ok(payload.data.clone());
        }

        let out = zstd::bulk::decompress(&payload.data, payload.original_size)
            .map_err(|e| CompressionError::CorruptPayload(e.to_string()))?;

        if out.len() != payload.original_size {
            return Err(CompressionError::CorruptPayload(format!(
                "decompressed {} bytes, expected {}",
                out.len(),
                payload.original_size
            )));
        }
        Ok(out)
    }

    /// Compress and frame a value for storage.
    pub fn encode(&self, raw: &[u8]) -> Vec<u8> {
        self.compress(raw).to_bytes()
    }

    /// Parse and decompress a stored frame.
    pub fn decode(&self, stored: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let payload = CompressedPayload::from_bytes(stored)?;
        self.decompress(&payload)
    }
}
