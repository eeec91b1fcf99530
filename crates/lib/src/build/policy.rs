//! Build policy and build status flags.

use std::collections::BTreeMap;

use super::key::ValueId;
use crate::util::flags::flag_set;

flag_set! {
  /// Caller-facing flags controlling how a build may be satisfied.
  pub struct BuildPolicy {
    /// Allow executing the build function in this process.
    const BUILD_LOCAL = 1 << 0;
    /// Allow executing the build function on a remote worker.
    const BUILD_REMOTE = 1 << 1;
    const BUILD = (1 << 0) | (1 << 1);
    /// Allow looking up the output in the cache.
    const CACHE_QUERY = 1 << 2;
    /// Allow storing the output in the cache.
    const CACHE_STORE = 1 << 3;
    const CACHE = (1 << 2) | (1 << 3);
    /// Payload data is not needed; only hashes and sizes.
    const SKIP_DATA = 1 << 4;
    const DEFAULT = (1 << 0) | (1 << 1) | (1 << 2) | (1 << 3);
  }
}

flag_set! {
  /// Records which paths a job took on its way to completion.
  pub struct BuildStatusFlags {
    const CACHE_QUERY = 1 << 0;
    const CACHE_QUERY_HIT = 1 << 1;
    const BUILD_TRY_REMOTE = 1 << 2;
    const BUILD_REMOTE = 1 << 3;
    const BUILD_LOCAL = 1 << 4;
    const CACHE_STORE = 1 << 5;
    const CACHE_STORE_HIT = 1 << 6;
  }
}

/// A build policy with optional per-payload overrides.
///
/// The overrides only make sense for [`BuildPolicy::SKIP_DATA`]: a caller can
/// ask for one payload's bytes while skipping the others.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequestPolicy {
  default: BuildPolicy,
  values: BTreeMap<ValueId, BuildPolicy>,
}

impl BuildRequestPolicy {
  pub fn new(default: BuildPolicy) -> Self {
    Self {
      default,
      values: BTreeMap::new(),
    }
  }

  pub fn with_value(mut self, id: ValueId, policy: BuildPolicy) -> Self {
    self.values.insert(id, policy);
    self
  }

  pub fn default_policy(&self) -> BuildPolicy {
    self.default
  }

  pub fn value_policy(&self, id: &ValueId) -> BuildPolicy {
    self.values.get(id).copied().unwrap_or(self.default)
  }

  /// Union of the default policy and every override, except that
  /// `SKIP_DATA` is only kept when every value skips data.
  pub fn combined(&self) -> BuildPolicy {
    let mut union = self.default;
    let mut skip_all = self.default.contains(BuildPolicy::SKIP_DATA);
    for policy in self.values.values() {
      union |= *policy;
      skip_all &= policy.contains(BuildPolicy::SKIP_DATA);
    }
    if skip_all { union } else { union - BuildPolicy::SKIP_DATA }
  }

  /// Per-payload overrides in id order.
  pub fn overrides(&self) -> impl Iterator<Item = (&ValueId, BuildPolicy)> {
    self.values.iter().map(|(id, policy)| (id, *policy))
  }

  /// True if payload `id` should be delivered without data.
  pub fn skips_data(&self, id: &ValueId) -> bool {
    self.value_policy(id).contains(BuildPolicy::SKIP_DATA)
  }
}

impl Default for BuildRequestPolicy {
  fn default() -> Self {
    Self::new(BuildPolicy::DEFAULT)
  }
}

impl From<BuildPolicy> for BuildRequestPolicy {
  fn from(policy: BuildPolicy) -> Self {
    Self::new(policy)
  }
}
