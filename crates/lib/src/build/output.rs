//! Build outputs.
//!
//! An output holds the payloads produced by a build function together with the
//! diagnostics it reported. Outputs are stored in the cache as a record: the
//! meta object and diagnostics go into the record meta, payloads become the
//! record values.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::error::{BuilderError, RecordError};
use super::key::ValueId;
use crate::buffer::CompressedBuffer;
use crate::cache::{CacheKey, CacheRecord, CacheValue, CacheValueWithId};
use crate::util::hash::ContentHash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiagnosticLevel {
  Error,
  Warning,
}

impl fmt::Display for DiagnosticLevel {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      DiagnosticLevel::Error => write!(f, "error"),
      DiagnosticLevel::Warning => write!(f, "warning"),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildDiagnostic {
  #[serde(rename = "Category")]
  pub category: String,
  #[serde(rename = "Message")]
  pub message: String,
  #[serde(rename = "Level")]
  pub level: DiagnosticLevel,
}

impl fmt::Display for BuildDiagnostic {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}: [{}] {}", self.level, self.category, self.message)
  }
}

/// One payload of an output. `data` is `None` when skipped by policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPayload {
  pub id: ValueId,
  pub raw_hash: ContentHash,
  pub raw_size: u64,
  pub data: Option<CompressedBuffer>,
}

impl BuildPayload {
  pub fn has_data(&self) -> bool {
    self.data.is_some()
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct PayloadMeta {
  #[serde(rename = "Id")]
  id: ValueId,
  #[serde(rename = "RawHash")]
  raw_hash: ContentHash,
  #[serde(rename = "RawSize")]
  raw_size: u64,
}

/// Serialized form of an output (without payload bytes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct OutputObject {
  #[serde(rename = "Meta", default, skip_serializing_if = "Option::is_none")]
  meta: Option<Value>,
  #[serde(rename = "Diagnostics", default, skip_serializing_if = "Vec::is_empty")]
  diagnostics: Vec<BuildDiagnostic>,
  #[serde(rename = "Payloads", default, skip_serializing_if = "Vec::is_empty")]
  payloads: Vec<PayloadMeta>,
}

struct OutputInner {
  name: String,
  function: String,
  meta: Option<Value>,
  diagnostics: Vec<BuildDiagnostic>,
  payloads: Vec<BuildPayload>,
  has_error: bool,
}

/// Immutable, shared build output.
#[derive(Clone)]
pub struct BuildOutput {
  inner: Arc<OutputInner>,
}

impl BuildOutput {
  pub fn builder(name: impl Into<String>, function: impl Into<String>) -> BuildOutputBuilder {
    BuildOutputBuilder::new(name, function)
  }

  pub fn name(&self) -> &str {
    &self.inner.name
  }

  pub fn function(&self) -> &str {
    &self.inner.function
  }

  pub fn meta(&self) -> Option<&Value> {
    self.inner.meta.as_ref()
  }

  pub fn has_error(&self) -> bool {
    self.inner.has_error
  }

  pub fn diagnostics(&self) -> &[BuildDiagnostic] {
    &self.inner.diagnostics
  }

  pub fn errors(&self) -> impl Iterator<Item = &BuildDiagnostic> {
    self.inner.diagnostics.iter().filter(|d| d.level == DiagnosticLevel::Error)
  }

  /// Payloads sorted by id. Empty when the output has an error.
  pub fn payloads(&self) -> &[BuildPayload] {
    &self.inner.payloads
  }

  pub fn find_payload(&self, id: &ValueId) -> Option<&BuildPayload> {
    self
      .inner
      .payloads
      .binary_search_by(|p| p.id.cmp(id))
      .ok()
      .map(|index| &self.inner.payloads[index])
  }

  /// Copy of the output with the data of every payload accepted by `skip`
  /// dropped. Returns `self` unchanged when nothing is dropped.
  pub fn without_data_where(&self, skip: impl Fn(&ValueId) -> bool) -> BuildOutput {
    if !self.inner.payloads.iter().any(|p| p.data.is_some() && skip(&p.id)) {
      return self.clone();
    }
    let payloads = self
      .inner
      .payloads
      .iter()
      .map(|p| BuildPayload {
        data: if skip(&p.id) { None } else { p.data.clone() },
        ..p.clone()
      })
      .collect();
    BuildOutput {
      inner: Arc::new(OutputInner {
        name: self.inner.name.clone(),
        function: self.inner.function.clone(),
        meta: self.inner.meta.clone(),
        diagnostics: self.inner.diagnostics.clone(),
        payloads,
        has_error: self.inner.has_error,
      }),
    }
  }

  fn object(&self) -> OutputObject {
    OutputObject {
      meta: self.inner.meta.clone(),
      diagnostics: self.inner.diagnostics.clone(),
      payloads: self
        .inner
        .payloads
        .iter()
        .map(|p| PayloadMeta {
          id: p.id,
          raw_hash: p.raw_hash,
          raw_size: p.raw_size,
        })
        .collect(),
    }
  }

  /// Serialize the output without payload bytes.
  pub fn save(&self) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&self.object())
  }

  /// Load an output saved with [`save`](Self::save). Payloads have no data.
  pub fn load(name: impl Into<String>, function: impl Into<String>, bytes: &[u8]) -> Option<Self> {
    let parsed = serde_json::from_slice::<OutputObject>(bytes)
      .map_err(RecordError::from)
      .and_then(|object| Self::from_object(name.into(), function.into(), object, |_| None));
    match parsed {
      Ok(output) => Some(output),
      Err(e) => {
        debug!(error = %e, "rejected serialized build output");
        None
      }
    }
  }

  fn from_object(
    name: String,
    function: String,
    object: OutputObject,
    mut data_for: impl FnMut(&ValueId) -> Option<CompressedBuffer>,
  ) -> Result<Self, RecordError> {
    let mut builder = BuildOutputBuilder::new(name, function);
    if let Some(meta) = object.meta {
      builder.set_meta(meta);
    }
    for diagnostic in object.diagnostics {
      if diagnostic.message.is_empty() {
        return Err(RecordError::EmptyDiagnostic);
      }
      builder.add_diagnostic(diagnostic);
    }
    for payload in object.payloads {
      let data = data_for(&payload.id);
      builder
        .add_payload_parts(payload.id, payload.raw_hash, payload.raw_size, data)
        .map_err(|_| RecordError::DuplicateKey(payload.id.to_string()))?;
    }
    Ok(builder.build())
  }

  /// Convert to a cache record stored under `key`.
  ///
  /// Outputs with errors are never cached; callers check
  /// [`has_error`](Self::has_error) first.
  pub fn to_cache_record(&self, key: CacheKey) -> Result<CacheRecord, serde_json::Error> {
    let object = self.object();
    let mut meta = serde_json::Map::new();
    if let Some(output_meta) = object.meta {
      meta.insert("Meta".to_string(), output_meta);
    }
    if !object.diagnostics.is_empty() {
      meta.insert("Diagnostics".to_string(), serde_json::to_value(&object.diagnostics)?);
    }
    let mut record = CacheRecord::builder(key);
    record.set_meta(Value::Object(meta));
    for payload in &self.inner.payloads {
      record.add_value(CacheValueWithId::new(
        payload.id,
        CacheValue {
          raw_hash: payload.raw_hash,
          raw_size: payload.raw_size,
          data: payload.data.clone(),
        },
      ));
    }
    Ok(record.build())
  }

  /// Rebuild an output from a cached record.
  pub fn from_cache_record(
    name: impl Into<String>,
    function: impl Into<String>,
    record: &CacheRecord,
  ) -> Result<Self, RecordError> {
    let mut meta = None;
    let mut diagnostics = Vec::new();
    if let Some(record_meta) = record.meta() {
      meta = record_meta.get("Meta").filter(|v| !v.is_null()).cloned();
      if let Some(value) = record_meta.get("Diagnostics") {
        diagnostics = serde_json::from_value(value.clone())?;
      }
    }
    let object = OutputObject {
      meta,
      diagnostics,
      payloads: record
        .values()
        .iter()
        .map(|v| PayloadMeta {
          id: v.id,
          raw_hash: v.raw_hash,
          raw_size: v.raw_size,
        })
        .collect(),
    };
    Self::from_object(name.into(), function.into(), object, |id| {
      record.find_value(id).and_then(|v| v.data.clone())
    })
  }
}

impl fmt::Debug for BuildOutput {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BuildOutput")
      .field("name", &self.inner.name)
      .field("function", &self.inner.function)
      .field("has_error", &self.inner.has_error)
      .field("diagnostics", &self.inner.diagnostics)
      .field("payloads", &self.inner.payloads.len())
      .finish()
  }
}

/// Output sink used by build functions and by the job when it fails.
#[derive(Debug)]
pub struct BuildOutputBuilder {
  name: String,
  function: String,
  meta: Option<Value>,
  diagnostics: Vec<BuildDiagnostic>,
  payloads: Vec<BuildPayload>,
  ids: BTreeSet<ValueId>,
  has_error: bool,
}

impl BuildOutputBuilder {
  pub fn new(name: impl Into<String>, function: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      function: function.into(),
      meta: None,
      diagnostics: Vec::new(),
      payloads: Vec::new(),
      ids: BTreeSet::new(),
      has_error: false,
    }
  }

  pub fn set_meta(&mut self, meta: Value) -> &mut Self {
    self.meta = Some(meta);
    self
  }

  pub fn add_payload(&mut self, id: ValueId, data: CompressedBuffer) -> Result<&mut Self, BuilderError> {
    self.add_payload_parts(id, data.raw_hash(), data.raw_size(), Some(data))
  }

  pub fn add_payload_parts(
    &mut self,
    id: ValueId,
    raw_hash: ContentHash,
    raw_size: u64,
    data: Option<CompressedBuffer>,
  ) -> Result<&mut Self, BuilderError> {
    if !self.ids.insert(id) {
      return Err(BuilderError::DuplicateKey {
        key: id.to_string(),
        record: format!("output '{}'", self.name),
      });
    }
    self.payloads.push(BuildPayload {
      id,
      raw_hash,
      raw_size,
      data,
    });
    Ok(self)
  }

  pub fn add_diagnostic(&mut self, diagnostic: BuildDiagnostic) -> &mut Self {
    if diagnostic.level == DiagnosticLevel::Error {
      self.has_error = true;
    }
    self.diagnostics.push(diagnostic);
    self
  }

  pub fn add_error(&mut self, category: impl Into<String>, message: impl Into<String>) -> &mut Self {
    self.add_diagnostic(BuildDiagnostic {
      category: category.into(),
      message: message.into(),
      level: DiagnosticLevel::Error,
    })
  }

  pub fn add_warning(&mut self, category: impl Into<String>, message: impl Into<String>) -> &mut Self {
    self.add_diagnostic(BuildDiagnostic {
      category: category.into(),
      message: message.into(),
      level: DiagnosticLevel::Warning,
    })
  }

  pub fn has_error(&self) -> bool {
    self.has_error
  }

  pub fn build(mut self) -> BuildOutput {
    if self.has_error {
      self.payloads.clear();
    }
    self.payloads.sort_by(|a, b| a.id.cmp(&b.id));
    BuildOutput {
      inner: Arc::new(OutputInner {
        name: self.name,
        function: self.function,
        meta: self.meta,
        diagnostics: self.diagnostics,
        payloads: self.payloads,
        has_error: self.has_error,
      }),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheBucket;
  use crate::util::hash::hash_bytes;

  fn texture_output() -> BuildOutput {
    let mut builder = BuildOutput::builder("hero.png", "Resize");
    builder.set_meta(serde_json::json!({ "width": 256 }));
    builder.add_warning("Resize", "source is not a power of two");
    builder
      .add_payload(ValueId::from_name("Texture"), CompressedBuffer::from_raw(b"texels"))
      .unwrap();
    builder.build()
  }

  #[test]
  fn error_output_drops_payloads() {
    let mut builder = BuildOutput::builder("hero.png", "Resize");
    builder
      .add_payload(ValueId::from_name("Texture"), CompressedBuffer::from_raw(b"texels"))
      .unwrap();
    builder.add_error("Resize", "decoder failed");
    let output = builder.build();
    assert!(output.has_error());
    assert!(output.payloads().is_empty());
    assert_eq!(output.errors().count(), 1);
  }

  #[test]
  fn warnings_do_not_set_error() {
    let output = texture_output();
    assert!(!output.has_error());
    assert_eq!(output.diagnostics().len(), 1);
    assert_eq!(output.payloads().len(), 1);
  }

  #[test]
  fn duplicate_payload_ids_are_rejected() {
    let mut builder = BuildOutput::builder("x", "Resize");
    let id = ValueId::from_name("Texture");
    builder.add_payload(id, CompressedBuffer::from_raw(b"a")).unwrap();
    assert!(builder.add_payload(id, CompressedBuffer::from_raw(b"b")).is_err());
  }

  #[test]
  fn find_payload_uses_sorted_ids() {
    let mut builder = BuildOutput::builder("x", "Resize");
    for name in ["c", "a", "b"] {
      builder
        .add_payload(ValueId::from_name(name), CompressedBuffer::from_raw(name))
        .unwrap();
    }
    let output = builder.build();
    let payload = output.find_payload(&ValueId::from_name("b")).unwrap();
    assert_eq!(payload.raw_hash, hash_bytes(b"b"));
  }

  #[test]
  fn save_and_load_drops_payload_data() {
    let output = texture_output();
    let loaded = BuildOutput::load("hero.png", "Resize", &output.save().unwrap()).unwrap();
    assert_eq!(loaded.diagnostics(), output.diagnostics());
    assert_eq!(loaded.meta(), output.meta());
    assert_eq!(loaded.payloads()[0].raw_hash, output.payloads()[0].raw_hash);
    assert!(!loaded.payloads()[0].has_data());
  }

  #[test]
  fn cache_record_conversion_keeps_data_and_diagnostics() {
    let output = texture_output();
    let key = CacheKey::new(CacheBucket::new("Resize").unwrap(), hash_bytes(b"action"));
    let record = output.to_cache_record(key.clone()).unwrap();
    assert_eq!(record.key(), &key);
    assert_eq!(record.values().len(), 1);

    let restored = BuildOutput::from_cache_record("hero.png", "Resize", &record).unwrap();
    assert_eq!(restored.diagnostics(), output.diagnostics());
    assert_eq!(restored.meta(), output.meta());
    assert_eq!(restored.payloads(), output.payloads());
  }
}
