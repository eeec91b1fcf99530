//! Identifiers for build records and their values.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::util::hash::{ContentHash, ParseHashError, hash_bytes};

/// Content id of a [`BuildDefinition`](super::BuildDefinition).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildKey(pub ContentHash);

/// Content id of a [`BuildAction`](super::BuildAction).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildActionKey(pub ContentHash);

impl fmt::Display for BuildKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl fmt::Display for BuildActionKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl FromStr for BuildKey {
  type Err = ParseHashError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Ok(BuildKey(s.parse()?))
  }
}

/// 12-byte id naming a value (payload) within an output or cache record.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ValueId(pub [u8; 12]);

impl ValueId {
  /// Derive an id from a human-readable name.
  pub fn from_name(name: &str) -> Self {
    let hash = hash_bytes(name.as_bytes());
    let mut id = [0u8; 12];
    id.copy_from_slice(&hash.0[..12]);
    ValueId(id)
  }
}

impl fmt::Display for ValueId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", hex::encode(self.0))
  }
}

impl fmt::Debug for ValueId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "ValueId({})", self)
  }
}

impl FromStr for ValueId {
  type Err = ParseHashError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let bytes = hex::decode(s).map_err(|e| ParseHashError::InvalidHex(e.to_string()))?;
    let id: [u8; 12] = bytes.as_slice().try_into().map_err(|_| ParseHashError::InvalidLength {
      expected: 12,
      actual: bytes.len(),
    })?;
    Ok(ValueId(id))
  }
}

impl Serialize for ValueId {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.to_string())
  }
}

impl<'de> Deserialize<'de> for ValueId {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
  }
}

/// Reference to one value of another build's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BuildValueKey {
  #[serde(rename = "Build")]
  pub build_key: BuildKey,
  #[serde(rename = "Id")]
  pub id: ValueId,
}

impl fmt::Display for BuildValueKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.build_key, self.id)
  }
}

/// Returns true if `name` is a non-empty ASCII alphanumeric string.
pub fn is_valid_function_name(name: &str) -> bool {
  !name.is_empty() && name.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Tracks the keys added to a record so that duplicates are rejected.
///
/// Keys are compared ignoring ASCII case: two keys that differ only by case
/// would collide on case-insensitive consumers, so they are treated as equal.
#[derive(Debug, Default, Clone)]
pub(crate) struct UniqueKeys {
  seen: std::collections::HashSet<String>,
}

impl UniqueKeys {
  pub(crate) fn insert(&mut self, key: &str) -> bool {
    self.seen.insert(key.to_ascii_lowercase())
  }
}
