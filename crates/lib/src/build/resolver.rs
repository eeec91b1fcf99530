//! Input resolution.
//!
//! A [`BuildInputResolver`] turns definition keys into definitions, input
//! references into `(raw hash, raw size)` metadata, and metadata into bytes.
//! Jobs only talk to the resolver through this trait.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, trace};
use uuid::Uuid;

use super::action::{BuildAction, BuildInputMeta};
use super::definition::BuildDefinition;
use super::key::{BuildKey, BuildValueKey};
use crate::buffer::CompressedBuffer;
use crate::request::RequestOwner;
use crate::util::hash::ContentHash;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
  #[error("{0}")]
  Error(String),

  #[error("resolution was canceled")]
  Canceled,
}

/// What input data is being resolved for.
#[derive(Debug, Clone, Copy)]
pub enum InputSource<'a> {
  Definition(&'a BuildDefinition),
  Action(&'a BuildAction),
}

impl InputSource<'_> {
  pub fn name(&self) -> &str {
    match self {
      InputSource::Definition(definition) => definition.name(),
      InputSource::Action(action) => action.name(),
    }
  }
}

/// Predicate selecting which input keys to resolve.
pub type InputFilter<'a> = &'a (dyn Fn(&str) -> bool + Send + Sync);

#[async_trait]
pub trait BuildInputResolver: Send + Sync {
  async fn resolve_key(&self, key: &BuildKey, owner: &RequestOwner) -> Result<BuildDefinition, ResolveError>;

  /// Hash and size of every input of `definition`, in any order.
  async fn resolve_input_meta(
    &self,
    definition: &BuildDefinition,
    owner: &RequestOwner,
  ) -> Result<Vec<(String, BuildInputMeta)>, ResolveError>;

  /// Bytes of the inputs accepted by `filter`.
  async fn resolve_input_data(
    &self,
    source: InputSource<'_>,
    filter: InputFilter<'_>,
    owner: &RequestOwner,
  ) -> Result<Vec<(String, CompressedBuffer)>, ResolveError>;
}

#[derive(Default)]
struct ResolverTables {
  definitions: HashMap<BuildKey, BuildDefinition>,
  build_values: HashMap<BuildValueKey, CompressedBuffer>,
  bulk_data: HashMap<Uuid, CompressedBuffer>,
  /// Every buffer known to the resolver, by raw hash.
  content: HashMap<ContentHash, CompressedBuffer>,
}

/// Resolver backed by in-memory tables and an optional file root.
///
/// Files are read from disk when their metadata is resolved and remembered by
/// content hash, so later action-based resolution finds them.
#[derive(Default)]
pub struct MemoryInputResolver {
  file_root: Option<PathBuf>,
  tables: RwLock<ResolverTables>,
}

impl MemoryInputResolver {
  pub fn new() -> Self {
    Self::default()
  }

  /// Resolve relative file inputs against `root`.
  pub fn with_file_root(mut self, root: impl Into<PathBuf>) -> Self {
    self.file_root = Some(root.into());
    self
  }

  fn read_tables(&self) -> std::sync::RwLockReadGuard<'_, ResolverTables> {
    self.tables.read().unwrap_or_else(|e| e.into_inner())
  }

  fn write_tables(&self) -> std::sync::RwLockWriteGuard<'_, ResolverTables> {
    self.tables.write().unwrap_or_else(|e| e.into_inner())
  }

  pub fn add_definition(&self, definition: BuildDefinition) -> BuildKey {
    let key = definition.key();
    self.write_tables().definitions.insert(key, definition);
    key
  }

  /// Register content addressable by its raw hash.
  pub fn add_content(&self, buffer: CompressedBuffer) -> ContentHash {
    let hash = buffer.raw_hash();
    self.write_tables().content.insert(hash, buffer);
    hash
  }

  pub fn add_bulk_data(&self, id: Uuid, buffer: CompressedBuffer) {
    let mut tables = self.write_tables();
    tables.content.insert(buffer.raw_hash(), buffer.clone());
    tables.bulk_data.insert(id, buffer);
  }

  pub fn add_build_value(&self, key: BuildValueKey, buffer: CompressedBuffer) {
    let mut tables = self.write_tables();
    tables.content.insert(buffer.raw_hash(), buffer.clone());
    tables.build_values.insert(key, buffer);
  }

  fn file_path(&self, path: &str) -> PathBuf {
    match &self.file_root {
      Some(root) if Path::new(path).is_relative() => root.join(path),
      _ => PathBuf::from(path),
    }
  }

  fn read_file(&self, path: &str) -> Result<CompressedBuffer, ResolveError> {
    let full = self.file_path(path);
    let bytes = std::fs::read(&full)
      .map_err(|e| ResolveError::Error(format!("failed to read file '{}': {}", full.display(), e)))?;
    let buffer = CompressedBuffer::from_raw(bytes);
    self.write_tables().content.insert(buffer.raw_hash(), buffer.clone());
    Ok(buffer)
  }

  /// Bytes of the definition input called `key`.
  fn definition_input(&self, definition: &BuildDefinition, key: &str) -> Result<CompressedBuffer, ResolveError> {
    let inputs = definition.inputs();
    let missing = |what: String| ResolveError::Error(format!("input '{}' of '{}': {} not found", key, definition.name(), what));
    if let Some(value_key) = inputs.builds.get(key) {
      return self
        .read_tables()
        .build_values
        .get(value_key)
        .cloned()
        .ok_or_else(|| missing(format!("build value {}", value_key)));
    }
    if let Some(id) = inputs.bulk_data.get(key) {
      return self
        .read_tables()
        .bulk_data
        .get(id)
        .cloned()
        .ok_or_else(|| missing(format!("bulk data {}", id)));
    }
    if let Some(path) = inputs.files.get(key) {
      return self.read_file(path);
    }
    if let Some(hash) = inputs.hashes.get(key) {
      return self
        .read_tables()
        .content
        .get(hash)
        .cloned()
        .ok_or_else(|| missing(format!("content {}", hash)));
    }
    Err(ResolveError::Error(format!(
      "'{}' has no input called '{}'",
      definition.name(),
      key
    )))
  }
}

#[async_trait]
impl BuildInputResolver for MemoryInputResolver {
  async fn resolve_key(&self, key: &BuildKey, owner: &RequestOwner) -> Result<BuildDefinition, ResolveError> {
    if owner.is_canceled() {
      return Err(ResolveError::Canceled);
    }
    let found = self.read_tables().definitions.get(key).cloned();
    found.ok_or_else(|| ResolveError::Error(format!("no definition for key {}", key)))
  }

  async fn resolve_input_meta(
    &self,
    definition: &BuildDefinition,
    owner: &RequestOwner,
  ) -> Result<Vec<(String, BuildInputMeta)>, ResolveError> {
    let mut resolved = Vec::with_capacity(definition.inputs().len());
    for key in definition.inputs().keys() {
      if owner.is_canceled() {
        return Err(ResolveError::Canceled);
      }
      let buffer = self.definition_input(definition, key)?;
      trace!(input = key, hash = %buffer.raw_hash(), "resolved input meta");
      resolved.push((
        key.to_string(),
        BuildInputMeta {
          raw_hash: buffer.raw_hash(),
          raw_size: buffer.raw_size(),
        },
      ));
    }
    Ok(resolved)
  }

  async fn resolve_input_data(
    &self,
    source: InputSource<'_>,
    filter: InputFilter<'_>,
    owner: &RequestOwner,
  ) -> Result<Vec<(String, CompressedBuffer)>, ResolveError> {
    let mut resolved = Vec::new();
    match source {
      InputSource::Definition(definition) => {
        for key in definition.inputs().keys().into_iter().filter(|key| filter(*key)) {
          if owner.is_canceled() {
            return Err(ResolveError::Canceled);
          }
          resolved.push((key.to_string(), self.definition_input(definition, key)?));
        }
      }
      InputSource::Action(action) => {
        let tables = self.read_tables();
        for (key, meta) in action.inputs().iter().filter(|(key, _)| filter(key.as_str())) {
          if owner.is_canceled() {
            return Err(ResolveError::Canceled);
          }
          let buffer = tables.content.get(&meta.raw_hash).cloned().ok_or_else(|| {
            ResolveError::Error(format!(
              "input '{}' of '{}': content {} not found",
              key,
              action.name(),
              meta.raw_hash
            ))
          })?;
          resolved.push((key.clone(), buffer));
        }
      }
    }
    debug!(source = source.name(), count = resolved.len(), "resolved input data");
    Ok(resolved)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::build::ValueId;
  use crate::consts::BUILD_SYSTEM_VERSION;
  use tempfile::TempDir;

  fn version() -> Uuid {
    Uuid::from_u128(7)
  }

  #[tokio::test]
  async fn resolves_every_input_kind() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("src.txt"), b"file bytes").unwrap();

    let resolver = MemoryInputResolver::new().with_file_root(temp.path());
    let blob = resolver.add_content(CompressedBuffer::from_raw(b"blob"));
    let bulk = Uuid::from_u128(99);
    resolver.add_bulk_data(bulk, CompressedBuffer::from_raw(b"bulk"));
    let upstream = BuildValueKey {
      build_key: BuildKey(ContentHash::ZERO),
      id: ValueId::from_name("Out"),
    };
    resolver.add_build_value(upstream, CompressedBuffer::from_raw(b"upstream"));

    let mut builder = BuildDefinition::builder("all", "Concat").unwrap();
    builder.add_input_hash("a", blob).unwrap();
    builder.add_input_bulk_data("b", bulk).unwrap();
    builder.add_input_file("c", "src.txt").unwrap();
    builder.add_input_build("d", upstream).unwrap();
    let definition = builder.build().unwrap();

    let owner = RequestOwner::default();
    let meta = resolver.resolve_input_meta(&definition, &owner).await.unwrap();
    let sizes: Vec<(String, u64)> = meta.iter().map(|(k, m)| (k.clone(), m.raw_size)).collect();
    assert_eq!(
      sizes,
      vec![
        ("a".to_string(), 4),
        ("b".to_string(), 4),
        ("c".to_string(), 10),
        ("d".to_string(), 8)
      ]
    );

    let mut action = BuildAction::builder("all", "Concat", version(), BUILD_SYSTEM_VERSION).unwrap();
    for (key, m) in &meta {
      action.add_input(key.clone(), m.raw_hash, m.raw_size).unwrap();
    }
    let action = action.build().unwrap();
    let only_c = |key: &str| key == "c";
    let data = resolver
      .resolve_input_data(InputSource::Action(&action), &only_c, &owner)
      .await
      .unwrap();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0].1.decompress().unwrap(), b"file bytes");
  }

  #[tokio::test]
  async fn unknown_key_and_missing_content_are_errors() {
    let resolver = MemoryInputResolver::new();
    let owner = RequestOwner::default();
    assert!(matches!(
      resolver.resolve_key(&BuildKey(ContentHash::ZERO), &owner).await,
      Err(ResolveError::Error(_))
    ));

    let mut builder = BuildDefinition::builder("missing", "Copy").unwrap();
    builder.add_input_hash("src", ContentHash::ZERO).unwrap();
    let definition = builder.build().unwrap();
    assert!(resolver.resolve_input_meta(&definition, &owner).await.is_err());
  }

  #[tokio::test]
  async fn canceled_owner_stops_resolution() {
    let resolver = MemoryInputResolver::new();
    let definition = BuildDefinition::builder("d", "Copy").unwrap().build().unwrap();
    let key = resolver.add_definition(definition);
    let owner = RequestOwner::default();
    owner.cancel();
    assert_eq!(resolver.resolve_key(&key, &owner).await.unwrap_err(), ResolveError::Canceled);
  }
}
