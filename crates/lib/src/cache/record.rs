//! Cache records and values.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::key::CacheKey;
use super::policy::{CachePolicy, CacheRecordPolicy};
use crate::buffer::CompressedBuffer;
use crate::build::ValueId;
use crate::util::hash::ContentHash;

/// A value stored in the cache, optionally without its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheValue {
  pub raw_hash: ContentHash,
  pub raw_size: u64,
  pub data: Option<CompressedBuffer>,
}

impl CacheValue {
  pub fn new(data: CompressedBuffer) -> Self {
    Self {
      raw_hash: data.raw_hash(),
      raw_size: data.raw_size(),
      data: Some(data),
    }
  }

  /// A value known only by its hash and size.
  pub fn from_meta(raw_hash: ContentHash, raw_size: u64) -> Self {
    Self {
      raw_hash,
      raw_size,
      data: None,
    }
  }

  pub fn has_data(&self) -> bool {
    self.data.is_some()
  }

  pub fn without_data(&self) -> Self {
    Self {
      data: None,
      ..self.clone()
    }
  }
}

/// A value within a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheValueWithId {
  pub id: ValueId,
  pub value: CacheValue,
}

impl CacheValueWithId {
  pub fn new(id: ValueId, value: CacheValue) -> Self {
    Self { id, value }
  }

  pub fn without_data(&self) -> Self {
    Self {
      id: self.id,
      value: self.value.without_data(),
    }
  }
}

impl std::ops::Deref for CacheValueWithId {
  type Target = CacheValue;

  fn deref(&self) -> &CacheValue {
    &self.value
  }
}

/// Serializable description of a value (hash and size, no bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheValueMeta {
  #[serde(rename = "Id")]
  pub id: ValueId,
  #[serde(rename = "RawHash")]
  pub raw_hash: ContentHash,
  #[serde(rename = "RawSize")]
  pub raw_size: u64,
}

impl From<&CacheValueWithId> for CacheValueMeta {
  fn from(value: &CacheValueWithId) -> Self {
    Self {
      id: value.id,
      raw_hash: value.raw_hash,
      raw_size: value.raw_size,
    }
  }
}

/// A record: an optional meta object plus values sorted by id.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRecord {
  key: CacheKey,
  meta: Option<Value>,
  values: Vec<CacheValueWithId>,
}

impl CacheRecord {
  pub fn builder(key: CacheKey) -> CacheRecordBuilder {
    CacheRecordBuilder::new(key)
  }

  /// A record with no meta and no values, used as the payload of misses.
  pub fn empty(key: CacheKey) -> Self {
    Self {
      key,
      meta: None,
      values: Vec::new(),
    }
  }

  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  pub fn meta(&self) -> Option<&Value> {
    self.meta.as_ref()
  }

  pub fn values(&self) -> &[CacheValueWithId] {
    &self.values
  }

  pub fn find_value(&self, id: &ValueId) -> Option<&CacheValueWithId> {
    self
      .values
      .binary_search_by(|v| v.id.cmp(id))
      .ok()
      .map(|index| &self.values[index])
  }

  /// True if every value carries its data.
  pub fn has_all_data(&self) -> bool {
    self.values.iter().all(|v| v.has_data())
  }

  /// Strip the parts of the record that `policy` asks to skip.
  pub fn apply_policy(&self, policy: &CacheRecordPolicy) -> Self {
    let meta = if policy.record_policy().contains(CachePolicy::SKIP_META) {
      None
    } else {
      self.meta.clone()
    };
    let values = self
      .values
      .iter()
      .map(|value| {
        if policy.value_policy(&value.id).contains(CachePolicy::SKIP_DATA) {
          value.without_data()
        } else {
          value.clone()
        }
      })
      .collect();
    Self {
      key: self.key.clone(),
      meta,
      values,
    }
  }

  /// Total raw size of all values.
  pub fn raw_size(&self) -> u64 {
    self.values.iter().map(|v| v.raw_size).sum()
  }
}

/// Builder for [`CacheRecord`]. Later values with an existing id replace
/// earlier ones.
#[derive(Debug)]
pub struct CacheRecordBuilder {
  key: CacheKey,
  meta: Option<Value>,
  values: Vec<CacheValueWithId>,
}

impl CacheRecordBuilder {
  pub fn new(key: CacheKey) -> Self {
    Self {
      key,
      meta: None,
      values: Vec::new(),
    }
  }

  pub fn set_meta(&mut self, meta: Value) -> &mut Self {
    self.meta = Some(meta);
    self
  }

  pub fn add_value(&mut self, value: CacheValueWithId) -> &mut Self {
    match self.values.binary_search_by(|v| v.id.cmp(&value.id)) {
      Ok(index) => self.values[index] = value,
      Err(index) => self.values.insert(index, value),
    }
    self
  }

  pub fn build(self) -> CacheRecord {
    CacheRecord {
      key: self.key,
      meta: self.meta,
      values: self.values,
    }
  }
}
