//! Cache store backed by a directory tree.
//!
//! # Layout
//!
//! ```text
//! {root}/
//! ├── records/<bucket>/<hh>/<hash>.json   # record meta and value list
//! ├── values/<bucket>/<hh>/<hash>.json    # standalone value descriptors
//! └── content/<hh>/<raw_hash>.<method>    # encoded value bytes
//! ```
//!
//! `<hh>` is the first two hex digits of the hash. Content files are shared by
//! every record that references the same raw bytes. All files are written to a
//! temporary file in the destination directory and renamed into place.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

use super::key::CacheKey;
use super::policy::{CachePolicy, CacheRecordPolicy};
use super::record::{CacheRecord, CacheValue, CacheValueWithId};
use super::store::{
  CacheGetChunkRequest, CacheGetChunkResponse, CacheGetRequest, CacheGetResponse, CacheGetValueRequest,
  CacheGetValueResponse, CachePutRequest, CachePutResponse, CachePutValueRequest, CachePutValueResponse, CacheStore,
  OnComplete,
};
use crate::buffer::{CompressedBuffer, CompressionMethod};
use crate::build::ValueId;
use crate::consts::CACHE_RECORD_FORMAT_VERSION;
use crate::request::{RequestOwner, Status};
use crate::util::hash::ContentHash;

const RECORDS_DIR: &str = "records";
const VALUES_DIR: &str = "values";
const CONTENT_DIR: &str = "content";

#[derive(Debug, Error)]
pub enum FileSystemCacheError {
  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to write {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to serialize cache entry: {0}")]
  Serialize(#[from] serde_json::Error),

  #[error("unsupported cache entry version {found} in {path}")]
  UnsupportedVersion { path: PathBuf, found: u32 },

  #[error("record {key} is missing data for value {id}")]
  MissingData { key: String, id: ValueId },

  #[error("value {key} has no data")]
  MissingValueData { key: String },

  #[error("content for {raw_hash} is missing")]
  MissingContent { raw_hash: ContentHash },

  #[error("failed to walk cache directory: {0}")]
  Walk(#[from] walkdir::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredValue {
  #[serde(rename = "RawHash")]
  raw_hash: ContentHash,
  #[serde(rename = "RawSize")]
  raw_size: u64,
  #[serde(rename = "Method")]
  method: CompressionMethod,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecordValue {
  #[serde(rename = "Id")]
  id: ValueId,
  #[serde(flatten)]
  value: StoredValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
  #[serde(rename = "Version")]
  version: u32,
  #[serde(rename = "Key")]
  key: CacheKey,
  #[serde(rename = "Meta", default, skip_serializing_if = "Option::is_none")]
  meta: Option<Value>,
  #[serde(rename = "Values", default)]
  values: Vec<StoredRecordValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredStandaloneValue {
  #[serde(rename = "Version")]
  version: u32,
  #[serde(rename = "Key")]
  key: CacheKey,
  #[serde(flatten)]
  value: StoredValue,
}

/// File counts and sizes of a [`FileSystemCacheStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileSystemCacheStats {
  pub records: u64,
  pub values: u64,
  pub content_files: u64,
  pub total_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct FileSystemCacheStore {
  root: PathBuf,
}

impl FileSystemCacheStore {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn entry_path(&self, dir: &str, key: &CacheKey) -> PathBuf {
    let hash = key.hash.to_string();
    self
      .root
      .join(dir)
      .join(key.bucket.as_str().to_ascii_lowercase())
      .join(&hash[..2])
      .join(format!("{}.json", hash))
  }

  fn content_path(&self, raw_hash: &ContentHash, method: CompressionMethod) -> PathBuf {
    let hash = raw_hash.to_string();
    let extension = match method {
      CompressionMethod::None => "raw",
      CompressionMethod::Deflate => "deflate",
    };
    self
      .root
      .join(CONTENT_DIR)
      .join(&hash[..2])
      .join(format!("{}.{}", hash, extension))
  }

  /// Count entries and bytes on disk.
  pub fn stats(&self) -> Result<FileSystemCacheStats, FileSystemCacheError> {
    let mut stats = FileSystemCacheStats::default();
    if !self.root.exists() {
      return Ok(stats);
    }
    for entry in WalkDir::new(&self.root) {
      let entry = entry?;
      if !entry.file_type().is_file() {
        continue;
      }
      let relative = entry.path().strip_prefix(&self.root).unwrap_or(entry.path());
      match relative.components().next().and_then(|c| c.as_os_str().to_str()) {
        Some(RECORDS_DIR) => stats.records += 1,
        Some(VALUES_DIR) => stats.values += 1,
        Some(CONTENT_DIR) => stats.content_files += 1,
        _ => continue,
      }
      stats.total_bytes += entry.metadata()?.len();
    }
    Ok(stats)
  }

  fn write_content(&self, buffer: &CompressedBuffer) -> Result<StoredValue, FileSystemCacheError> {
    let path = self.content_path(&buffer.raw_hash(), buffer.method());
    if !path.exists() {
      write_atomic(&path, buffer.compressed_bytes())?;
    }
    Ok(StoredValue {
      raw_hash: buffer.raw_hash(),
      raw_size: buffer.raw_size(),
      method: buffer.method(),
    })
  }

  fn read_content(&self, stored: &StoredValue) -> Result<CompressedBuffer, FileSystemCacheError> {
    let path = self.content_path(&stored.raw_hash, stored.method);
    let data = match fs::read(&path) {
      Ok(data) => data,
      Err(e) if e.kind() == io::ErrorKind::NotFound => {
        return Err(FileSystemCacheError::MissingContent {
          raw_hash: stored.raw_hash,
        });
      }
      Err(source) => return Err(FileSystemCacheError::Read { path, source }),
    };
    Ok(CompressedBuffer::from_parts(stored.raw_hash, stored.raw_size, stored.method, data))
  }

  fn load_value(&self, stored: &StoredValue, skip_data: bool) -> Result<CacheValue, FileSystemCacheError> {
    if skip_data {
      return Ok(CacheValue::from_meta(stored.raw_hash, stored.raw_size));
    }
    Ok(CacheValue::new(self.read_content(stored)?))
  }

  fn put_record(&self, record: &CacheRecord) -> Result<(), FileSystemCacheError> {
    let mut values = Vec::with_capacity(record.values().len());
    for value in record.values() {
      let Some(buffer) = &value.data else {
        return Err(FileSystemCacheError::MissingData {
          key: record.key().to_string(),
          id: value.id,
        });
      };
      values.push(StoredRecordValue {
        id: value.id,
        value: self.write_content(buffer)?,
      });
    }
    let stored = StoredRecord {
      version: CACHE_RECORD_FORMAT_VERSION,
      key: record.key().clone(),
      meta: record.meta().cloned(),
      values,
    };
    let path = self.entry_path(RECORDS_DIR, record.key());
    write_atomic(&path, &serde_json::to_vec(&stored)?)
  }

  fn get_record(&self, key: &CacheKey, policy: &CacheRecordPolicy) -> Result<Option<CacheRecord>, FileSystemCacheError> {
    let path = self.entry_path(RECORDS_DIR, key);
    let Some(stored) = read_entry::<StoredRecord>(&path)? else {
      return Ok(None);
    };
    if stored.version != CACHE_RECORD_FORMAT_VERSION {
      return Err(FileSystemCacheError::UnsupportedVersion {
        path,
        found: stored.version,
      });
    }
    let mut builder = CacheRecord::builder(key.clone());
    if let Some(meta) = stored.meta.filter(|_| !policy.record_policy().contains(CachePolicy::SKIP_META)) {
      builder.set_meta(meta);
    }
    for entry in &stored.values {
      let skip_data = policy.value_policy(&entry.id).contains(CachePolicy::SKIP_DATA);
      builder.add_value(CacheValueWithId::new(entry.id, self.load_value(&entry.value, skip_data)?));
    }
    Ok(Some(builder.build()))
  }

  fn put_standalone(&self, key: &CacheKey, value: &CacheValue) -> Result<(), FileSystemCacheError> {
    let Some(buffer) = &value.data else {
      return Err(FileSystemCacheError::MissingValueData { key: key.to_string() });
    };
    let stored = StoredStandaloneValue {
      version: CACHE_RECORD_FORMAT_VERSION,
      key: key.clone(),
      value: self.write_content(buffer)?,
    };
    write_atomic(&self.entry_path(VALUES_DIR, key), &serde_json::to_vec(&stored)?)
  }

  fn get_standalone(&self, key: &CacheKey, skip_data: bool) -> Result<Option<CacheValue>, FileSystemCacheError> {
    let path = self.entry_path(VALUES_DIR, key);
    let Some(stored) = read_entry::<StoredStandaloneValue>(&path)? else {
      return Ok(None);
    };
    if stored.version != CACHE_RECORD_FORMAT_VERSION {
      return Err(FileSystemCacheError::UnsupportedVersion {
        path,
        found: stored.version,
      });
    }
    self.load_value(&stored.value, skip_data).map(Some)
  }
}

fn read_entry<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, FileSystemCacheError> {
  let content = match fs::read(path) {
    Ok(content) => content,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
    Err(source) => {
      return Err(FileSystemCacheError::Read {
        path: path.to_path_buf(),
        source,
      });
    }
  };
  serde_json::from_slice(&content)
    .map(Some)
    .map_err(|source| FileSystemCacheError::Parse {
      path: path.to_path_buf(),
      source,
    })
}

/// Write `bytes` to a temporary file next to `path` and rename it into place.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), FileSystemCacheError> {
  let write_error = |source| FileSystemCacheError::Write {
    path: path.to_path_buf(),
    source,
  };
  let dir = path.parent().unwrap_or(Path::new("."));
  fs::create_dir_all(dir).map_err(write_error)?;
  let mut file = tempfile::NamedTempFile::new_in(dir).map_err(write_error)?;
  file.write_all(bytes).map_err(write_error)?;
  file.persist(path).map_err(|e| write_error(e.error))?;
  trace!(path = %path.display(), bytes = bytes.len(), "wrote cache file");
  Ok(())
}

#[async_trait]
impl CacheStore for FileSystemCacheStore {
  async fn put(&self, requests: Vec<CachePutRequest>, _owner: &RequestOwner, on_complete: OnComplete<'_, CachePutResponse>) {
    for request in requests {
      let status = match self.put_record(&request.record) {
        Ok(()) => Status::Ok,
        Err(e) => {
          warn!(key = %request.record.key(), error = %e, "file system cache put failed");
          Status::Error
        }
      };
      on_complete(request.respond(status));
    }
  }

  async fn get(&self, requests: Vec<CacheGetRequest>, _owner: &RequestOwner, on_complete: OnComplete<'_, CacheGetResponse>) {
    for request in requests {
      match self.get_record(&request.key, &request.policy) {
        Ok(Some(record)) => on_complete(CacheGetResponse {
          name: request.name.clone(),
          record,
          user_data: request.user_data,
          status: Status::Ok,
        }),
        Ok(None) => on_complete(request.miss(Status::Error)),
        Err(e) => {
          debug!(key = %request.key, error = %e, "file system cache get failed");
          on_complete(request.miss(Status::Error));
        }
      }
    }
  }

  async fn put_value(
    &self,
    requests: Vec<CachePutValueRequest>,
    _owner: &RequestOwner,
    on_complete: OnComplete<'_, CachePutValueResponse>,
  ) {
    for request in requests {
      let status = match self.put_standalone(&request.key, &request.value) {
        Ok(()) => Status::Ok,
        Err(e) => {
          warn!(key = %request.key, error = %e, "file system cache value put failed");
          Status::Error
        }
      };
      on_complete(request.respond(status));
    }
  }

  async fn get_value(
    &self,
    requests: Vec<CacheGetValueRequest>,
    _owner: &RequestOwner,
    on_complete: OnComplete<'_, CacheGetValueResponse>,
  ) {
    for request in requests {
      let skip_data = request.policy.contains(CachePolicy::SKIP_DATA);
      match self.get_standalone(&request.key, skip_data) {
        Ok(Some(value)) => on_complete(CacheGetValueResponse {
          name: request.name.clone(),
          key: request.key.clone(),
          value: Some(value),
          user_data: request.user_data,
          status: Status::Ok,
        }),
        Ok(None) => on_complete(request.miss(Status::Error)),
        Err(e) => {
          debug!(key = %request.key, error = %e, "file system cache value get failed");
          on_complete(request.miss(Status::Error));
        }
      }
    }
  }

  async fn get_chunks(
    &self,
    requests: Vec<CacheGetChunkRequest>,
    _owner: &RequestOwner,
    on_complete: OnComplete<'_, CacheGetChunkResponse>,
  ) {
    for request in requests {
      let skip_data = request.policy.contains(CachePolicy::SKIP_DATA);
      let found = match request.id {
        Some(id) => self
          .get_record(&request.key, &CacheRecordPolicy::new(request.policy))
          .map(|record| record.and_then(|r| r.find_value(&id).map(|v| v.value.clone()))),
        None => self.get_standalone(&request.key, skip_data),
      };
      match found {
        Ok(Some(value)) => on_complete(request.read_from(&value)),
        Ok(None) => on_complete(request.miss(Status::Error)),
        Err(e) => {
          debug!(key = %request.key, error = %e, "file system cache chunk read failed");
          on_complete(request.miss(Status::Error));
        }
      }
    }
  }
}
