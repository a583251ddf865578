//! Payload compression for published cluster states.
//!
//! Compressed payloads are self-describing: they start with a fixed marker,
//! so a receiver can tell compressed from plain bytes without any flag in the
//! transport envelope.

use crate::error::{Result, SyncError};
use std::borrow::Cow;

/// Marker prepended to LZ4 block-compressed payloads.
pub const LZ4_MARKER: &[u8; 4] = b"LZ4F";

/// Supported compression algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompressionAlgorithm {
    /// No compression.
    None,
    /// LZ4 block compression (fast, moderate ratio).
    #[default]
    Lz4,
}

impl CompressionAlgorithm {
    /// Get human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Lz4 => "lz4",
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for CompressionAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "lz4" => Ok(Self::Lz4),
            _ => Err(format!("Unknown compression algorithm: {}", s)),
        }
    }
}

/// A compression codec that can recognise its own output.
pub trait Compressor: Send + Sync {
    fn algorithm(&self) -> CompressionAlgorithm;

    /// Whether `bytes` were produced by this compressor.
    fn is_compressed(&self, bytes: &[u8]) -> bool;

    fn compress(&self, data: &[u8]) -> Vec<u8>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// LZ4 block compressor with a leading marker and the uncompressed size.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Lz4
    }

    fn is_compressed(&self, bytes: &[u8]) -> bool {
        bytes.len() >= LZ4_MARKER.len() && &bytes[..LZ4_MARKER.len()] == LZ4_MARKER
    }

    fn compress(&self, data: &[u8]) -> Vec<u8> {
        let body = lz4_flex::compress_prepend_size(data);
        let mut out = Vec::with_capacity(LZ4_MARKER.len() + body.len());
        out.extend_from_slice(LZ4_MARKER);
        out.extend_from_slice(&body);
        out
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        if !self.is_compressed(data) {
            return Err(SyncError::Compression(
                "payload does not carry the lz4 marker".to_string(),
            ));
        }
        Ok(lz4_flex::decompress_size_prepended(&data[LZ4_MARKER.len()..])?)
    }
}

static LZ4: Lz4Compressor = Lz4Compressor;

/// The compressor used for outgoing payloads.
pub fn default_compressor() -> &'static dyn Compressor {
    &LZ4
}

/// Sniff the payload and return the compressor that produced it, if any.
pub fn compressor_for(bytes: &[u8]) -> Option<&'static dyn Compressor> {
    if LZ4.is_compressed(bytes) {
        Some(&LZ4)
    } else {
        None
    }
}

/// Decompress marked payloads, pass plain ones through untouched.
pub fn decompress_if_needed(bytes: &[u8]) -> Result<Cow<'_, [u8]>> {
    match compressor_for(bytes) {
        Some(compressor) => Ok(Cow::Owned(compressor.decompress(bytes)?)),
        None => Ok(Cow::Borrowed(bytes)),
    }
}
