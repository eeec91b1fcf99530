//! Hashing utilities for content-addressed records and buffers.
//!
//! This module provides:
//! - `ContentHash`: a full 32-byte SHA-256 digest, printed as 64 hex characters
//! - `Hashable`: canonical serialization plus hashing for record types
//! - `hash_bytes()`: arbitrary byte hashing

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

pub type HashError = serde_json::Error;

/// A full SHA-256 digest used as a content id.
///
/// Serialized as a lowercase hexadecimal string (64 characters).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
  pub const ZERO: ContentHash = ContentHash([0; 32]);

  pub fn is_zero(&self) -> bool {
    *self == Self::ZERO
  }

  pub fn as_bytes(&self) -> &[u8; 32] {
    &self.0
  }

  /// Short form used in log lines and directory fan-out.
  pub fn short(&self) -> String {
    hex::encode(&self.0[..6])
  }
}

impl fmt::Display for ContentHash {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", hex::encode(self.0))
  }
}

impl fmt::Debug for ContentHash {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "ContentHash({})", self)
  }
}

/// Error parsing a hex-encoded hash.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseHashError {
  #[error("invalid hex: {0}")]
  InvalidHex(String),

  #[error("expected {expected} bytes, got {actual}")]
  InvalidLength { expected: usize, actual: usize },
}

impl FromStr for ContentHash {
  type Err = ParseHashError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let bytes = hex::decode(s).map_err(|e| ParseHashError::InvalidHex(e.to_string()))?;
    let array: [u8; 32] = bytes.as_slice().try_into().map_err(|_| ParseHashError::InvalidLength {
      expected: 32,
      actual: bytes.len(),
    })?;
    Ok(ContentHash(array))
  }
}

impl Serialize for ContentHash {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.to_string())
  }
}

impl<'de> Deserialize<'de> for ContentHash {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
  }
}

/// Canonical serialization and hashing for immutable records.
///
/// The canonical form is compact JSON produced from sorted maps, so two
/// processes serializing equal records produce identical bytes.
pub trait Hashable: Serialize {
  fn canonical_bytes(&self) -> Result<Vec<u8>, HashError> {
    serde_json::to_vec(self)
  }

  fn compute_hash(&self) -> Result<ContentHash, HashError> {
    Ok(hash_bytes(&self.canonical_bytes()?))
  }
}

/// Hash arbitrary bytes.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
  let mut hasher = Sha256::new();
  hasher.update(data);
  ContentHash(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn hash_is_deterministic() {
    assert_eq!(hash_bytes(b"hello world"), hash_bytes(b"hello world"));
    assert_ne!(hash_bytes(b"hello world"), hash_bytes(b"hello world!"));
  }

  #[test]
  fn display_is_64_lowercase_hex() {
    let hash = hash_bytes(b"abc");
    let text = hash.to_string();
    assert_eq!(text.len(), 64);
    assert_eq!(text, "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
  }

  #[test]
  fn parse_roundtrips_display() {
    let hash = hash_bytes(b"abc");
    let parsed: ContentHash = hash.to_string().parse().unwrap();
    assert_eq!(parsed, hash);
  }

  #[test]
  fn parse_rejects_wrong_length() {
    let err = "abcd".parse::<ContentHash>().unwrap_err();
    assert_eq!(err, ParseHashError::InvalidLength { expected: 32, actual: 2 });
  }

  #[test]
  fn parse_rejects_non_hex() {
    assert!(matches!("zz".parse::<ContentHash>(), Err(ParseHashError::InvalidHex(_))));
  }

  #[test]
  fn serde_uses_hex_string() {
    let hash = hash_bytes(b"abc");
    let json = serde_json::to_string(&hash).unwrap();
    assert_eq!(json, format!("\"{}\"", hash));
  }

  #[test]
  fn hashable_hashes_canonical_json() {
    #[derive(Serialize)]
    struct Record {
      b: u32,
      a: u32,
    }
    impl Hashable for Record {}

    let record = Record { b: 1, a: 2 };
    assert_eq!(record.compute_hash().unwrap(), hash_bytes(br#"{"b":1,"a":2}"#));
  }
}
