//! Resolved input data for an action.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::error::BuilderError;
use super::key::UniqueKeys;
use crate::buffer::CompressedBuffer;

struct InputsInner {
  name: String,
  inputs: BTreeMap<String, CompressedBuffer>,
}

/// Immutable map of input key to resolved input bytes.
///
/// Keys match the keys of the action's declared inputs.
#[derive(Clone)]
pub struct BuildInputs {
  inner: Arc<InputsInner>,
}

impl BuildInputs {
  pub fn builder(name: impl Into<String>) -> BuildInputsBuilder {
    BuildInputsBuilder::new(name)
  }

  pub fn name(&self) -> &str {
    &self.inner.name
  }

  pub fn find_input(&self, key: &str) -> Option<&CompressedBuffer> {
    self.inner.inputs.get(key)
  }

  pub fn contains(&self, key: &str) -> bool {
    self.inner.inputs.contains_key(key)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &CompressedBuffer)> {
    self.inner.inputs.iter().map(|(k, v)| (k.as_str(), v))
  }

  pub fn len(&self) -> usize {
    self.inner.inputs.len()
  }

  pub fn is_empty(&self) -> bool {
    self.inner.inputs.is_empty()
  }

  /// Sum of the raw sizes of every input.
  pub fn raw_size(&self) -> u64 {
    self.inner.inputs.values().map(CompressedBuffer::raw_size).sum()
  }

  /// Start a builder pre-populated with these inputs.
  pub fn to_builder(&self) -> BuildInputsBuilder {
    let mut keys = UniqueKeys::default();
    for key in self.inner.inputs.keys() {
      keys.insert(key);
    }
    BuildInputsBuilder {
      name: self.inner.name.clone(),
      inputs: self.inner.inputs.clone(),
      keys,
    }
  }
}

impl fmt::Debug for BuildInputs {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BuildInputs")
      .field("name", &self.inner.name)
      .field("keys", &self.inner.inputs.keys().collect::<Vec<_>>())
      .finish()
  }
}

/// Single-use builder for [`BuildInputs`].
#[derive(Debug)]
pub struct BuildInputsBuilder {
  name: String,
  inputs: BTreeMap<String, CompressedBuffer>,
  keys: UniqueKeys,
}

impl BuildInputsBuilder {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      inputs: BTreeMap::new(),
      keys: UniqueKeys::default(),
    }
  }

  pub fn add_input(&mut self, key: impl Into<String>, buffer: CompressedBuffer) -> Result<&mut Self, BuilderError> {
    let key = key.into();
    if key.is_empty() {
      return Err(BuilderError::EmptyKey { kind: "input" });
    }
    if !self.keys.insert(&key) {
      return Err(BuilderError::DuplicateKey {
        key,
        record: format!("inputs '{}'", self.name),
      });
    }
    self.inputs.insert(key, buffer);
    Ok(self)
  }

  pub fn len(&self) -> usize {
    self.inputs.len()
  }

  pub fn is_empty(&self) -> bool {
    self.inputs.is_empty()
  }

  pub fn build(self) -> BuildInputs {
    BuildInputs {
      inner: Arc::new(InputsInner {
        name: self.name,
        inputs: self.inputs,
      }),
    }
  }
}
