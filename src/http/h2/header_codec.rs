//! Header block compression
//!
//! The transport only needs `compress(metadata) -> bytes` and
//! `decompress(bytes) -> metadata`. Both sides are stateful: the decoder must
//! see every header block in arrival order, including blocks whose contents
//! are thrown away, or its dynamic table drifts from the peer's encoder.

use super::error::{ErrorCode, H2Error, Result};
use crate::http::metadata::Metadata;
use bytes::Bytes;

/// Compresses outgoing header blocks
pub trait HeaderEncoder: Send {
    fn compress(&mut self, metadata: &Metadata) -> Bytes;
}

/// Decompresses incoming header blocks
pub trait HeaderDecoder: Send {
    /// Decode a complete header block
    fn decompress(&mut self, block: &[u8]) -> Result<Metadata>;

    /// Decode a block only to advance the decoder state
    fn decompress_discard(&mut self, block: &[u8]) -> Result<()> {
        self.decompress(block).map(|_| ())
    }
}

/// HPACK encoder
pub struct HpackEncoder {
    inner: hpack::Encoder<'static>,
}

impl HpackEncoder {
    pub fn new() -> Self {
        HpackEncoder {
            inner: hpack::Encoder::new(),
        }
    }
}

impl Default for HpackEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderEncoder for HpackEncoder {
    fn compress(&mut self, metadata: &Metadata) -> Bytes {
        let block = self
            .inner
            .encode(metadata.iter().map(|(n, v)| (n.as_bytes(), v.as_ref())));
        Bytes::from(block)
    }
}

/// HPACK decoder
pub struct HpackDecoder {
    inner: hpack::Decoder<'static>,
}

impl HpackDecoder {
    pub fn new() -> Self {
        HpackDecoder {
            inner: hpack::Decoder::new(),
        }
    }
}

impl Default for HpackDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderDecoder for HpackDecoder {
    fn decompress(&mut self, block: &[u8]) -> Result<Metadata> {
        let fields = self.inner.decode(block).map_err(|e| {
            H2Error::connection(
                ErrorCode::CompressionError,
                format!("header block decode failed: {:?}", e),
            )
        })?;
        Ok(fields
            .into_iter()
            .map(|(name, value)| (String::from_utf8_lossy(&name).into_owned(), value))
            .collect())
    }
}
