//! Cache keys and buckets.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, OnceLock};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::consts::MAX_BUCKET_LEN;
use crate::util::hash::ContentHash;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheBucketError {
  #[error("cache bucket name must not be empty")]
  Empty,

  #[error("cache bucket name '{0}' is longer than {MAX_BUCKET_LEN} characters")]
  TooLong(String),

  #[error("cache bucket name '{0}' must be alphanumeric")]
  InvalidCharacter(String),
}

fn bucket_names() -> &'static Mutex<HashMap<String, Arc<str>>> {
  static NAMES: OnceLock<Mutex<HashMap<String, Arc<str>>>> = OnceLock::new();
  NAMES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Interned, case-insensitive name of a cache category.
///
/// The first spelling seen for a name is the one that is displayed; later
/// spellings that differ only by case resolve to the same bucket.
#[derive(Clone)]
pub struct CacheBucket(Arc<str>);

impl CacheBucket {
  pub fn new(name: &str) -> Result<Self, CacheBucketError> {
    if name.is_empty() {
      return Err(CacheBucketError::Empty);
    }
    if name.len() > MAX_BUCKET_LEN {
      return Err(CacheBucketError::TooLong(name.to_string()));
    }
    if !name.bytes().all(|b| b.is_ascii_alphanumeric()) {
      return Err(CacheBucketError::InvalidCharacter(name.to_string()));
    }
    let mut names = bucket_names().lock().unwrap_or_else(|e| e.into_inner());
    let interned = names
      .entry(name.to_ascii_lowercase())
      .or_insert_with(|| Arc::from(name))
      .clone();
    Ok(CacheBucket(interned))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl PartialEq for CacheBucket {
  fn eq(&self, other: &Self) -> bool {
    Arc::ptr_eq(&self.0, &other.0) || self.0.eq_ignore_ascii_case(&other.0)
  }
}

impl Eq for CacheBucket {}

impl Hash for CacheBucket {
  fn hash<H: Hasher>(&self, state: &mut H) {
    for byte in self.0.bytes() {
      state.write_u8(byte.to_ascii_lowercase());
    }
  }
}

impl PartialOrd for CacheBucket {
  fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for CacheBucket {
  fn cmp(&self, other: &Self) -> std::cmp::Ordering {
    let lhs = self.0.bytes().map(|b| b.to_ascii_lowercase());
    let rhs = other.0.bytes().map(|b| b.to_ascii_lowercase());
    lhs.cmp(rhs)
  }
}

impl fmt::Display for CacheBucket {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl fmt::Debug for CacheBucket {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "CacheBucket({})", self.0)
  }
}

impl Serialize for CacheBucket {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.0)
  }
}

impl<'de> Deserialize<'de> for CacheBucket {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let name = String::deserialize(deserializer)?;
    CacheBucket::new(&name).map_err(serde::de::Error::custom)
  }
}

/// Address of a cache record or value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CacheKey {
  #[serde(rename = "Bucket")]
  pub bucket: CacheBucket,
  #[serde(rename = "Hash")]
  pub hash: ContentHash,
}

impl CacheKey {
  pub fn new(bucket: CacheBucket, hash: ContentHash) -> Self {
    Self { bucket, hash }
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.bucket, self.hash)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;

  #[test]
  fn buckets_compare_case_insensitively() {
    let a = CacheBucket::new("TextureMips").unwrap();
    let b = CacheBucket::new("texturemips").unwrap();
    assert_eq!(a, b);

    let set: HashSet<CacheBucket> = [a, b].into_iter().collect();
    assert_eq!(set.len(), 1);
  }

  #[test]
  fn first_spelling_is_displayed() {
    let first = CacheBucket::new("ShaderCodeA").unwrap();
    let second = CacheBucket::new("SHADERCODEA").unwrap();
    assert_eq!(first.to_string(), "ShaderCodeA");
    assert_eq!(second.to_string(), "ShaderCodeA");
  }

  #[test]
  fn invalid_names_are_rejected() {
    assert_eq!(CacheBucket::new(""), Err(CacheBucketError::Empty));
    assert!(matches!(
      CacheBucket::new("has space"),
      Err(CacheBucketError::InvalidCharacter(_))
    ));
    assert!(matches!(
      CacheBucket::new(&"a".repeat(MAX_BUCKET_LEN + 1)),
      Err(CacheBucketError::TooLong(_))
    ));
  }

  #[test]
  fn key_display_joins_bucket_and_hash() {
    let key = CacheKey::new(CacheBucket::new("Resize").unwrap(), ContentHash::ZERO);
    assert_eq!(key.to_string(), format!("Resize/{}", ContentHash::ZERO));
  }
}
