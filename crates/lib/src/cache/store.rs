//! The cache store interface.
//!
//! Every operation takes a batch of requests and reports through `on_complete`
//! exactly once per request, in any order. A store never fails a whole batch:
//! misses and write failures are per-request statuses.

use async_trait::async_trait;

use super::key::CacheKey;
use super::policy::{CachePolicy, CacheRecordPolicy};
use super::record::{CacheRecord, CacheValue};
use crate::build::ValueId;
use crate::request::{RequestOwner, Status};
use crate::util::hash::ContentHash;

/// Store a whole record.
#[derive(Debug, Clone)]
pub struct CachePutRequest {
  /// Diagnostic name of the thing being cached.
  pub name: String,
  pub record: CacheRecord,
  pub policy: CacheRecordPolicy,
  pub user_data: u64,
}

#[derive(Debug, Clone)]
pub struct CachePutResponse {
  pub name: String,
  pub key: CacheKey,
  pub user_data: u64,
  pub status: Status,
}

/// Fetch a whole record.
#[derive(Debug, Clone)]
pub struct CacheGetRequest {
  pub name: String,
  pub key: CacheKey,
  pub policy: CacheRecordPolicy,
  pub user_data: u64,
}

/// On anything but `Ok`, `record` is an empty record for the requested key.
#[derive(Debug, Clone)]
pub struct CacheGetResponse {
  pub name: String,
  pub record: CacheRecord,
  pub user_data: u64,
  pub status: Status,
}

/// Store a single value that is not part of a record.
#[derive(Debug, Clone)]
pub struct CachePutValueRequest {
  pub name: String,
  pub key: CacheKey,
  pub value: CacheValue,
  pub policy: CachePolicy,
  pub user_data: u64,
}

#[derive(Debug, Clone)]
pub struct CachePutValueResponse {
  pub name: String,
  pub key: CacheKey,
  pub user_data: u64,
  pub status: Status,
}

#[derive(Debug, Clone)]
pub struct CacheGetValueRequest {
  pub name: String,
  pub key: CacheKey,
  pub policy: CachePolicy,
  pub user_data: u64,
}

#[derive(Debug, Clone)]
pub struct CacheGetValueResponse {
  pub name: String,
  pub key: CacheKey,
  /// `None` unless the status is `Ok`.
  pub value: Option<CacheValue>,
  pub user_data: u64,
  pub status: Status,
}

/// Read a byte range of a value, either a standalone value (`id` is `None`)
/// or a value within a record.
#[derive(Debug, Clone)]
pub struct CacheGetChunkRequest {
  pub name: String,
  pub key: CacheKey,
  pub id: Option<ValueId>,
  /// Offset into the raw (decompressed) bytes.
  pub raw_offset: u64,
  /// Bytes to read; `u64::MAX` reads to the end.
  pub raw_size: u64,
  pub policy: CachePolicy,
  pub user_data: u64,
}

#[derive(Debug, Clone)]
pub struct CacheGetChunkResponse {
  pub name: String,
  pub key: CacheKey,
  pub id: Option<ValueId>,
  pub raw_offset: u64,
  /// Size of the chunk actually read.
  pub raw_size: u64,
  /// Hash of the whole raw value the chunk was read from.
  pub raw_hash: ContentHash,
  /// `None` when the status is not `Ok` or the policy skipped data.
  pub raw_data: Option<Vec<u8>>,
  pub user_data: u64,
  pub status: Status,
}

impl CacheGetRequest {
  pub(crate) fn miss(&self, status: Status) -> CacheGetResponse {
    CacheGetResponse {
      name: self.name.clone(),
      record: CacheRecord::empty(self.key.clone()),
      user_data: self.user_data,
      status,
    }
  }
}

impl CachePutRequest {
  pub(crate) fn respond(&self, status: Status) -> CachePutResponse {
    CachePutResponse {
      name: self.name.clone(),
      key: self.record.key().clone(),
      user_data: self.user_data,
      status,
    }
  }
}

impl CacheGetValueRequest {
  pub(crate) fn miss(&self, status: Status) -> CacheGetValueResponse {
    CacheGetValueResponse {
      name: self.name.clone(),
      key: self.key.clone(),
      value: None,
      user_data: self.user_data,
      status,
    }
  }
}

impl CachePutValueRequest {
  pub(crate) fn respond(&self, status: Status) -> CachePutValueResponse {
    CachePutValueResponse {
      name: self.name.clone(),
      key: self.key.clone(),
      user_data: self.user_data,
      status,
    }
  }
}

impl CacheGetChunkRequest {
  pub(crate) fn miss(&self, status: Status) -> CacheGetChunkResponse {
    CacheGetChunkResponse {
      name: self.name.clone(),
      key: self.key.clone(),
      id: self.id,
      raw_offset: self.raw_offset,
      raw_size: 0,
      raw_hash: ContentHash::ZERO,
      raw_data: None,
      user_data: self.user_data,
      status,
    }
  }

  /// Answer the request from a full value, honoring offset, size and
  /// `SKIP_DATA`.
  pub(crate) fn read_from(&self, value: &CacheValue) -> CacheGetChunkResponse {
    let mut response = self.miss(Status::Ok);
    response.raw_hash = value.raw_hash;
    let start = self.raw_offset.min(value.raw_size);
    let size = self.raw_size.min(value.raw_size - start);
    response.raw_size = size;
    if self.policy.contains(CachePolicy::SKIP_DATA) {
      return response;
    }
    let Some(buffer) = &value.data else {
      return self.miss(Status::Error);
    };
    match buffer.decompress() {
      Ok(raw) => {
        let start = start as usize;
        response.raw_data = Some(raw[start..start + size as usize].to_vec());
        response
      }
      Err(_) => self.miss(Status::Error),
    }
  }
}

/// Callback invoked once per request of a batch.
pub type OnComplete<'a, R> = &'a mut (dyn FnMut(R) + Send);

/// A cache backend or a composition of backends.
#[async_trait]
pub trait CacheStore: Send + Sync {
  async fn put(&self, requests: Vec<CachePutRequest>, owner: &RequestOwner, on_complete: OnComplete<'_, CachePutResponse>);

  async fn get(&self, requests: Vec<CacheGetRequest>, owner: &RequestOwner, on_complete: OnComplete<'_, CacheGetResponse>);

  async fn put_value(
    &self,
    requests: Vec<CachePutValueRequest>,
    owner: &RequestOwner,
    on_complete: OnComplete<'_, CachePutValueResponse>,
  );

  async fn get_value(
    &self,
    requests: Vec<CacheGetValueRequest>,
    owner: &RequestOwner,
    on_complete: OnComplete<'_, CacheGetValueResponse>,
  );

  async fn get_chunks(
    &self,
    requests: Vec<CacheGetChunkRequest>,
    owner: &RequestOwner,
    on_complete: OnComplete<'_, CacheGetChunkResponse>,
  );
}
