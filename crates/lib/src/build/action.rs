//! Build actions.
//!
//! An action is the resolved form of a definition for one version of its
//! function and one version of the build system. It carries constants and the
//! raw hash and size of every input, but no input bytes. Its key is the cache
//! key material for the build's output.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::error::{BuilderError, RecordError};
use super::key::{BuildActionKey, UniqueKeys, is_valid_function_name};
use crate::util::hash::{ContentHash, Hashable, hash_bytes};

/// Metadata of one resolved input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildInputMeta {
  #[serde(rename = "RawHash")]
  pub raw_hash: ContentHash,
  #[serde(rename = "RawSize")]
  pub raw_size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ActionObject {
  #[serde(rename = "Function")]
  function: String,
  #[serde(rename = "FunctionVersion")]
  function_version: Uuid,
  #[serde(rename = "BuildSystemVersion")]
  build_system_version: Uuid,
  #[serde(rename = "Constants", default, skip_serializing_if = "BTreeMap::is_empty")]
  constants: BTreeMap<String, Value>,
  #[serde(rename = "Inputs", default, skip_serializing_if = "BTreeMap::is_empty")]
  inputs: BTreeMap<String, BuildInputMeta>,
}

impl Hashable for ActionObject {}

impl ActionObject {
  fn validate(&self) -> Result<(), RecordError> {
    if !is_valid_function_name(&self.function) {
      return Err(RecordError::InvalidFunctionName(self.function.clone()));
    }
    if self.function_version.is_nil() {
      return Err(RecordError::ZeroVersion {
        field: "FunctionVersion",
      });
    }
    if self.build_system_version.is_nil() {
      return Err(RecordError::ZeroVersion {
        field: "BuildSystemVersion",
      });
    }
    let mut keys = UniqueKeys::default();
    for key in self.constants.keys().chain(self.inputs.keys()) {
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

struct ActionInner {
  name: String,
  key: BuildActionKey,
  object: ActionObject,
  bytes: Vec<u8>,
}

/// Immutable, shared build action.
#[derive(Clone)]
pub struct BuildAction {
  inner: Arc<ActionInner>,
}

impl BuildAction {
  pub fn builder(
    name: impl Into<String>,
    function: impl Into<String>,
    function_version: Uuid,
    build_system_version: Uuid,
  ) -> Result<BuildActionBuilder, BuilderError> {
    BuildActionBuilder::new(name, function, function_version, build_system_version)
  }

  pub fn name(&self) -> &str {
    &self.inner.name
  }

  pub fn key(&self) -> BuildActionKey {
    self.inner.key
  }

  pub fn function(&self) -> &str {
    &self.inner.object.function
  }

  pub fn function_version(&self) -> Uuid {
    self.inner.object.function_version
  }

  pub fn build_system_version(&self) -> Uuid {
    self.inner.object.build_system_version
  }

  pub fn constants(&self) -> &BTreeMap<String, Value> {
    &self.inner.object.constants
  }

  pub fn find_constant(&self, key: &str) -> Option<&Value> {
    self.inner.object.constants.get(key)
  }

  /// Declared inputs, sorted by key.
  pub fn inputs(&self) -> &BTreeMap<String, BuildInputMeta> {
    &self.inner.object.inputs
  }

  pub fn find_input(&self, key: &str) -> Option<&BuildInputMeta> {
    self.inner.object.inputs.get(key)
  }

  pub fn has_inputs(&self) -> bool {
    !self.inner.object.inputs.is_empty()
  }

  /// Sum of the raw sizes of every declared input.
  pub fn total_input_size(&self) -> u64 {
    self.inner.object.inputs.values().map(|meta| meta.raw_size).sum()
  }

  pub fn save(&self) -> &[u8] {
    &self.inner.bytes
  }

  /// Load a previously serialized action, or `None` if it fails validation.
  pub fn load(name: impl Into<String>, bytes: &[u8]) -> Option<Self> {
    match Self::try_load(name, bytes) {
      Ok(action) => Some(action),
      Err(e) => {
        debug!(error = %e, "rejected serialized build action");
        None
      }
    }
  }

  pub fn try_load(name: impl Into<String>, bytes: &[u8]) -> Result<Self, RecordError> {
    let object: ActionObject = serde_json::from_slice(bytes)?;
    object.validate()?;
    let bytes = object.canonical_bytes()?;
    Ok(Self::from_parts(name.into(), object, bytes))
  }

  fn from_parts(name: String, object: ActionObject, bytes: Vec<u8>) -> Self {
    let key = BuildActionKey(hash_bytes(&bytes));
    Self {
      inner: Arc::new(ActionInner {
        name,
        key,
        object,
        bytes,
      }),
    }
  }
}

impl PartialEq for BuildAction {
  fn eq(&self, other: &Self) -> bool {
    self.inner.key == other.inner.key
  }
}

impl Eq for BuildAction {}

impl fmt::Debug for BuildAction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BuildAction")
      .field("name", &self.inner.name)
      .field("function", &self.inner.object.function)
      .field("key", &self.inner.key)
      .field("inputs", &self.inner.object.inputs.len())
      .finish()
  }
}

/// Single-use builder for [`BuildAction`].
#[derive(Debug)]
pub struct BuildActionBuilder {
  name: String,
  object: ActionObject,
  keys: UniqueKeys,
}

impl BuildActionBuilder {
  pub fn new(
    name: impl Into<String>,
    function: impl Into<String>,
    function_version: Uuid,
    build_system_version: Uuid,
  ) -> Result<Self, BuilderError> {
    let function = function.into();
    if !is_valid_function_name(&function) {
      return Err(BuilderError::InvalidFunctionName(function));
    }
    if function_version.is_nil() {
      return Err(BuilderError::ZeroVersion {
        field: "function version",
      });
    }
    if build_system_version.is_nil() {
      return Err(BuilderError::ZeroVersion {
        field: "build system version",
      });
    }
    Ok(Self {
      name: name.into(),
      object: ActionObject {
        function,
        function_version,
        build_system_version,
        constants: BTreeMap::new(),
        inputs: BTreeMap::new(),
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
        record: format!("action '{}'", self.name),
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

  pub fn add_input(&mut self, key: impl Into<String>, raw_hash: ContentHash, raw_size: u64) -> Result<&mut Self, BuilderError> {
    let key = key.into();
    self.claim("input", &key)?;
    self.object.inputs.insert(key, BuildInputMeta { raw_hash, raw_size });
    Ok(self)
  }

  pub fn build(self) -> Result<BuildAction, BuilderError> {
    let bytes = self.object.canonical_bytes()?;
    Ok(BuildAction::from_parts(self.name, self.object, bytes))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::consts::BUILD_SYSTEM_VERSION;

  const RESIZE_VERSION: Uuid = Uuid::from_u128(0x1111);

  fn resize_action(width: u32) -> BuildAction {
    let mut builder = BuildAction::builder("hero.png", "Resize", RESIZE_VERSION, BUILD_SYSTEM_VERSION).unwrap();
    builder.add_constant("w", width).unwrap();
    builder.add_input("src", hash_bytes(b"source"), 6).unwrap();
    builder.build().unwrap()
  }

  #[test]
  fn rejects_zero_versions() {
    assert!(matches!(
      BuildAction::builder("x", "Resize", Uuid::nil(), BUILD_SYSTEM_VERSION),
      Err(BuilderError::ZeroVersion { .. })
    ));
    assert!(matches!(
      BuildAction::builder("x", "Resize", RESIZE_VERSION, Uuid::nil()),
      Err(BuilderError::ZeroVersion { .. })
    ));
  }

  #[test]
  fn rejects_duplicate_and_empty_keys() {
    let mut builder = BuildAction::builder("x", "Resize", RESIZE_VERSION, BUILD_SYSTEM_VERSION).unwrap();
    builder.add_input("src", hash_bytes(b"a"), 1).unwrap();
    assert!(builder.add_input("src", hash_bytes(b"b"), 1).is_err());
    assert!(builder.add_constant("src", 1).is_err());
    assert!(builder.add_input("", hash_bytes(b"c"), 1).is_err());
  }

  #[test]
  fn key_is_deterministic() {
    assert_eq!(resize_action(256).key(), resize_action(256).key());
    assert_ne!(resize_action(256).key(), resize_action(512).key());
  }

  #[test]
  fn key_changes_with_versions() {
    let mut builder = BuildAction::builder("hero.png", "Resize", Uuid::from_u128(0x2222), BUILD_SYSTEM_VERSION).unwrap();
    builder.add_constant("w", 256).unwrap();
    builder.add_input("src", hash_bytes(b"source"), 6).unwrap();
    assert_ne!(builder.build().unwrap().key(), resize_action(256).key());
  }

  #[test]
  fn save_and_load_preserves_key() {
    let action = resize_action(256);
    let loaded = BuildAction::load("hero.png", action.save()).unwrap();
    assert_eq!(loaded.key(), action.key());
    assert_eq!(loaded.function_version(), RESIZE_VERSION);
    assert_eq!(loaded.find_input("src").unwrap().raw_size, 6);
    assert_eq!(loaded.total_input_size(), 6);
  }

  #[test]
  fn load_rejects_zero_function_version() {
    let bytes = format!(
      r#"{{"Function":"Resize","FunctionVersion":"{}","BuildSystemVersion":"{}"}}"#,
      Uuid::nil(),
      BUILD_SYSTEM_VERSION
    );
    assert!(matches!(
      BuildAction::try_load("x", bytes.as_bytes()),
      Err(RecordError::ZeroVersion { .. })
    ));
  }

  #[test]
  fn load_rejects_missing_versions() {
    assert!(BuildAction::load("x", br#"{"Function":"Resize"}"#).is_none());
  }

  #[test]
  fn inputs_serialize_as_flat_map() {
    let json: Value = serde_json::from_slice(resize_action(256).save()).unwrap();
    assert_eq!(json["Inputs"]["src"]["RawSize"], 6);
    assert_eq!(json["Function"], "Resize");
    assert_eq!(json["BuildSystemVersion"], BUILD_SYSTEM_VERSION.to_string());
  }
}
