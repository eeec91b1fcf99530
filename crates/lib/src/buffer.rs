//! Compressed buffers.
//!
//! A [`CompressedBuffer`] carries the identity of its uncompressed content
//! (raw hash and raw size) next to the encoded bytes, so callers can verify or
//! address data without decompressing it. The compression method is a
//! capability of the buffer; the rest of the crate never inspects the
//! encoded bytes directly.

use std::io::{Read, Write};
use std::sync::Arc;

use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::hash::{ContentHash, hash_bytes};

/// How the bytes of a buffer are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CompressionMethod {
  /// Bytes are stored as-is.
  #[default]
  None,
  /// Raw deflate stream.
  Deflate,
}

#[derive(Debug, Error)]
pub enum BufferError {
  #[error("failed to compress buffer: {0}")]
  Compress(#[source] std::io::Error),

  #[error("failed to decompress buffer: {0}")]
  Decompress(#[source] std::io::Error),

  #[error("decompressed size {actual} does not match raw size {expected}")]
  SizeMismatch { expected: u64, actual: u64 },
}

/// Immutable, cheaply clonable buffer with known raw hash and raw size.
#[derive(Clone, PartialEq, Eq)]
pub struct CompressedBuffer {
  raw_hash: ContentHash,
  raw_size: u64,
  method: CompressionMethod,
  data: Arc<[u8]>,
}

impl CompressedBuffer {
  /// Wrap raw bytes without compressing them.
  pub fn from_raw(raw: impl AsRef<[u8]>) -> Self {
    let raw = raw.as_ref();
    Self {
      raw_hash: hash_bytes(raw),
      raw_size: raw.len() as u64,
      method: CompressionMethod::None,
      data: Arc::from(raw),
    }
  }

  /// Encode raw bytes with the given method.
  pub fn compress(raw: impl AsRef<[u8]>, method: CompressionMethod) -> Result<Self, BufferError> {
    let raw = raw.as_ref();
    let data: Arc<[u8]> = match method {
      CompressionMethod::None => Arc::from(raw),
      CompressionMethod::Deflate => {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(raw).map_err(BufferError::Compress)?;
        Arc::from(encoder.finish().map_err(BufferError::Compress)?)
      }
    };
    Ok(Self {
      raw_hash: hash_bytes(raw),
      raw_size: raw.len() as u64,
      method,
      data,
    })
  }

  /// Reassemble a buffer from stored parts.
  ///
  /// The raw hash is trusted; callers that need to verify content must
  /// decompress and compare.
  pub fn from_parts(raw_hash: ContentHash, raw_size: u64, method: CompressionMethod, data: Vec<u8>) -> Self {
    Self {
      raw_hash,
      raw_size,
      method,
      data: Arc::from(data),
    }
  }

  pub fn raw_hash(&self) -> ContentHash {
    self.raw_hash
  }

  pub fn raw_size(&self) -> u64 {
    self.raw_size
  }

  pub fn method(&self) -> CompressionMethod {
    self.method
  }

  pub fn compressed_size(&self) -> u64 {
    self.data.len() as u64
  }

  /// The encoded bytes.
  pub fn compressed_bytes(&self) -> &[u8] {
    &self.data
  }

  /// Decode the buffer back to its raw bytes.
  pub fn decompress(&self) -> Result<Vec<u8>, BufferError> {
    let raw = match self.method {
      CompressionMethod::None => self.data.to_vec(),
      CompressionMethod::Deflate => {
        let mut decoder = DeflateDecoder::new(&self.data[..]);
        let mut raw = Vec::with_capacity(self.raw_size as usize);
        decoder.read_to_end(&mut raw).map_err(BufferError::Decompress)?;
        raw
      }
    };
    if raw.len() as u64 != self.raw_size {
      return Err(BufferError::SizeMismatch {
        expected: self.raw_size,
        actual: raw.len() as u64,
      });
    }
    Ok(raw)
  }
}

impl std::fmt::Debug for CompressedBuffer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CompressedBuffer")
      .field("raw_hash", &self.raw_hash)
      .field("raw_size", &self.raw_size)
      .field("method", &self.method)
      .field("compressed_size", &self.data.len())
      .finish()
  }
}
