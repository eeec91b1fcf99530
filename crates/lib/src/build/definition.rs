//! Build definitions.
//!
//! A definition is the declarative, unresolved form of a build request: the
//! name of a build function, inline constants, and references to inputs that
//! still need to be resolved (another build's output, bulk data, files or raw
//! content hashes). Its key is the hash of its canonical serialization.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::error::{BuilderError, RecordError};
use super::key::{BuildKey, BuildValueKey, UniqueKeys, is_valid_function_name};
use crate::util::hash::{ContentHash, Hashable, hash_bytes};

/// Input references of a definition, grouped by kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DefinitionInputs {
  #[serde(rename = "Builds", default, skip_serializing_if = "BTreeMap::is_empty")]
  pub builds: BTreeMap<String, BuildValueKey>,
  #[serde(rename = "BulkData", default, skip_serializing_if = "BTreeMap::is_empty")]
  pub bulk_data: BTreeMap<String, Uuid>,
  #[serde(rename = "Files", default, skip_serializing_if = "BTreeMap::is_empty")]
  pub files: BTreeMap<String, String>,
  #[serde(rename = "Hashes", default, skip_serializing_if = "BTreeMap::is_empty")]
  pub hashes: BTreeMap<String, ContentHash>,
}

impl DefinitionInputs {
  pub fn is_empty(&self) -> bool {
    self.builds.is_empty() && self.bulk_data.is_empty() && self.files.is_empty() && self.hashes.is_empty()
  }

  pub fn len(&self) -> usize {
    self.builds.len() + self.bulk_data.len() + self.files.len() + self.hashes.len()
  }

  /// All input keys in sorted order.
  pub fn keys(&self) -> Vec<&str> {
    let mut keys: Vec<&str> = self
      .builds
      .keys()
      .chain(self.bulk_data.keys())
      .chain(self.files.keys())
      .chain(self.hashes.keys())
      .map(String::as_str)
      .collect();
    keys.sort_unstable();
    keys
  }
}

/// The serialized body of a definition. The diagnostic name is not part of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct DefinitionObject {
  #[serde(rename = "Function")]
  function: String,
  #[serde(rename = "Constants", default, skip_serializing_if = "BTreeMap::is_empty")]
  constants: BTreeMap<String, Value>,
  #[serde(rename = "Inputs", default, skip_serializing_if = "DefinitionInputs::is_empty")]
  inputs: DefinitionInputs,
}

impl Hashable for DefinitionObject {}

impl DefinitionObject {
  fn validate(&self) -> Result<(), RecordError> {
    if !is_valid_function_name(&self.function) {
      return Err(RecordError::InvalidFunctionName(self.function.clone()));
    }
    let mut keys = UniqueKeys::default();
    let inputs = &self.inputs;
    let all = self
      .constants
      .keys()
      .chain(inputs.builds.keys())
      .chain(inputs.bulk_data.keys())
      .chain(inputs.files.keys())
      .chain(inputs.hashes.keys());
    for key in all {
      if key.is_empty() {
        return Err(RecordError::EmptyKey);
      }
      if !keys.insert(key) {
        return Err(RecordError::DuplicateKey(key.clone()));
      }
    }
    Ok(())
  }
}

struct DefinitionInner {
  name: String,
  key: BuildKey,
  object: DefinitionObject,
  bytes: Vec<u8>,
}

/// Immutable, shared build definition.
#[derive(Clone)]
pub struct BuildDefinition {
  inner: Arc<DefinitionInner>,
}

impl BuildDefinition {
  /// Start building a definition for `function`.
  pub fn builder(name: impl Into<String>, function: impl Into<String>) -> Result<BuildDefinitionBuilder, BuilderError> {
    BuildDefinitionBuilder::new(name, function)
  }

  pub fn name(&self) -> &str {
    &self.inner.name
  }

  pub fn key(&self) -> BuildKey {
    self.inner.key
  }

  pub fn function(&self) -> &str {
    &self.inner.object.function
  }

  pub fn constants(&self) -> &BTreeMap<String, Value> {
    &self.inner.object.constants
  }

  pub fn find_constant(&self, key: &str) -> Option<&Value> {
    self.inner.object.constants.get(key)
  }

  pub fn inputs(&self) -> &DefinitionInputs {
    &self.inner.object.inputs
  }

  pub fn has_inputs(&self) -> bool {
    !self.inner.object.inputs.is_empty()
  }

  /// The canonical serialized form whose hash is [`key`](Self::key).
  pub fn save(&self) -> &[u8] {
    &self.inner.bytes
  }

  /// Load a previously serialized definition.
  ///
  /// Returns `None` for anything that fails structural validation; a partially
  /// valid definition is never produced.
  pub fn load(name: impl Into<String>, bytes: &[u8]) -> Option<Self> {
    match Self::try_load(name, bytes) {
      Ok(definition) => Some(definition),
      Err(e) => {
        debug!(error = %e, "rejected serialized build definition");
        None
      }
    }
  }

  pub fn try_load(name: impl Into<String>, bytes: &[u8]) -> Result<Self, RecordError> {
    let object: DefinitionObject = serde_json::from_slice(bytes)?;
    object.validate()?;
    // Re-serialize so the key is computed over the canonical form even if the
    // stored bytes carried different whitespace.
    let bytes = object.canonical_bytes()?;
    Ok(Self::from_parts(name.into(), object, bytes))
  }

  fn from_parts(name: String, object: DefinitionObject, bytes: Vec<u8>) -> Self {
    let key = BuildKey(hash_bytes(&bytes));
    Self {
      inner: Arc::new(DefinitionInner {
        name,
        key,
        object,
        bytes,
      }),
    }
  }
}

impl PartialEq for BuildDefinition {
  fn eq(&self, other: &Self) -> bool {
    self.inner.key == other.inner.key
  }
}

impl Eq for BuildDefinition {}

impl fmt::Debug for BuildDefinition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BuildDefinition")
      .field("name", &self.inner.name)
      .field("function", &self.inner.object.function)
      .field("key", &self.inner.key)
      .finish()
  }
}

/// Single-use builder for [`BuildDefinition`].
///
/// Keys must be non-empty and unique across constants and all input kinds.
#[derive(Debug)]
pub struct BuildDefinitionBuilder {
  name: String,
  object: DefinitionObject,
  keys: UniqueKeys,
}

impl BuildDefinitionBuilder {
  pub fn new(name: impl Into<String>, function: impl Into<String>) -> Result<Self, BuilderError> {
    let function = function.into();
    if !is_valid_function_name(&function) {
      return Err(BuilderError::InvalidFunctionName(function));
    }
    Ok(Self {
      name: name.into(),
      object: DefinitionObject {
        function,
        constants: BTreeMap::new(),
        inputs: DefinitionInputs::default(),
      },
      keys: UniqueKeys::default(),
    })
  }

  fn claim(&mut self, kind: &'static str, key: &str) -> Result<(), BuilderError> {
    if key.is_empty() {
      return Err(BuilderError::EmptyKey { kind });
    }
    if !self.keys.insert(key) {
      return Err(BuilderError::DuplicateKey {
        key: key.to_string(),
        record: format!("definition '{}'", self.name),
      });
    }
    Ok(())
  }

  pub fn add_constant(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<&mut Self, BuilderError> {
    let key = key.into();
    self.claim("constant", &key)?;
    self.object.constants.insert(key, value.into());
    Ok(self)
  }

  pub fn add_input_build(&mut self, key: impl Into<String>, value_key: BuildValueKey) -> Result<&mut Self, BuilderError> {
    let key = key.into();
    self.claim("input", &key)?;
    self.object.inputs.builds.insert(key, value_key);
    Ok(self)
  }

  pub fn add_input_bulk_data(&mut self, key: impl Into<String>, bulk_data_id: Uuid) -> Result<&mut Self, BuilderError> {
    let key = key.into();
    self.claim("input", &key)?;
    self.object.inputs.bulk_data.insert(key, bulk_data_id);
    Ok(self)
  }

  pub fn add_input_file(&mut self, key: impl Into<String>, path: impl Into<String>) -> Result<&mut Self, BuilderError> {
    let key = key.into();
    self.claim("input", &key)?;
    self.object.inputs.files.insert(key, path.into());
    Ok(self)
  }

  pub fn add_input_hash(&mut self, key: impl Into<String>, raw_hash: ContentHash) -> Result<&mut Self, BuilderError> {
    let key = key.into();
    self.claim("input", &key)?;
    self.object.inputs.hashes.insert(key, raw_hash);
    Ok(self)
  }

  /// Consume the builder and produce the immutable definition.
  pub fn build(self) -> Result<BuildDefinition, BuilderError> {
    let bytes = self.object.canonical_bytes()?;
    Ok(BuildDefinition::from_parts(self.name, self.object, bytes))
  }
}
