//! Cache request policy and cache store capability flags.

use std::collections::BTreeMap;

use crate::build::ValueId;
use crate::util::flags::flag_set;

flag_set! {
  /// Per-request policy controlling which tiers may be queried or written
  /// and which parts of a record may be skipped.
  pub struct CachePolicy {
    const QUERY_LOCAL = 1 << 0;
    const QUERY_REMOTE = 1 << 1;
    const QUERY = (1 << 0) | (1 << 1);
    const STORE_LOCAL = 1 << 2;
    const STORE_REMOTE = 1 << 3;
    const STORE = (1 << 2) | (1 << 3);
    const LOCAL = (1 << 0) | (1 << 2);
    const REMOTE = (1 << 1) | (1 << 3);
    /// Skip the record meta object.
    const SKIP_META = 1 << 4;
    /// Skip value data; hashes and sizes are still returned.
    const SKIP_DATA = 1 << 5;
    /// Skip attachment data of values.
    const SKIP_ATTACHMENTS = 1 << 6;
    /// Do not keep a local copy of data fetched from a remote tier.
    const SKIP_LOCAL_COPY = 1 << 7;
    const DEFAULT = (1 << 0) | (1 << 1) | (1 << 2) | (1 << 3);
  }
}

impl CachePolicy {
  /// Flags that only affect how much of a response is returned.
  pub const SKIP_FLAGS: CachePolicy = CachePolicy::SKIP_META
    .union(CachePolicy::SKIP_DATA)
    .union(CachePolicy::SKIP_ATTACHMENTS);
}

flag_set! {
  /// Capabilities of one node in a cache store hierarchy.
  pub struct CacheStoreFlags {
    const LOCAL = 1 << 0;
    const REMOTE = 1 << 1;
    const QUERY = 1 << 2;
    const STORE = 1 << 3;
    /// A hit or store at this node blocks propagation to later nodes.
    const STOP_STORE = 1 << 4;
  }
}

impl CacheStoreFlags {
  /// Query flags that a node with these capabilities can serve.
  pub fn query_policy(self) -> CachePolicy {
    let mut policy = CachePolicy::NONE;
    if self.contains(CacheStoreFlags::QUERY) {
      if self.contains(CacheStoreFlags::LOCAL) {
        policy |= CachePolicy::QUERY_LOCAL;
      }
      if self.contains(CacheStoreFlags::REMOTE) {
        policy |= CachePolicy::QUERY_REMOTE;
      }
    }
    policy
  }

  /// Store flags that a node with these capabilities can serve.
  pub fn store_policy(self) -> CachePolicy {
    let mut policy = CachePolicy::NONE;
    if self.contains(CacheStoreFlags::STORE) {
      if self.contains(CacheStoreFlags::LOCAL) {
        policy |= CachePolicy::STORE_LOCAL;
      }
      if self.contains(CacheStoreFlags::REMOTE) {
        policy |= CachePolicy::STORE_REMOTE;
      }
    }
    policy
  }
}

/// Policy of a record request: one policy for the record and optional
/// overrides for individual values.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CacheRecordPolicy {
  record: CachePolicy,
  values: BTreeMap<ValueId, CachePolicy>,
}

impl CacheRecordPolicy {
  pub fn new(record: CachePolicy) -> Self {
    Self {
      record,
      values: BTreeMap::new(),
    }
  }

  pub fn with_value(mut self, id: ValueId, policy: CachePolicy) -> Self {
    self.values.insert(id, policy);
    self
  }

  pub fn record_policy(&self) -> CachePolicy {
    self.record
  }

  pub fn value_policy(&self, id: &ValueId) -> CachePolicy {
    self.values.get(id).copied().unwrap_or(self.record)
  }

  pub fn has_value_overrides(&self) -> bool {
    !self.values.is_empty()
  }

  /// Apply `f` to the record policy and every value override.
  pub fn transform(&self, f: impl Fn(CachePolicy) -> CachePolicy) -> Self {
    Self {
      record: f(self.record),
      values: self.values.iter().map(|(id, policy)| (*id, f(*policy))).collect(),
    }
  }
}

impl From<CachePolicy> for CacheRecordPolicy {
  fn from(policy: CachePolicy) -> Self {
    Self::new(policy)
  }
}
