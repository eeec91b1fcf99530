//! In-process cache store.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::trace;

use super::key::CacheKey;
use super::policy::CachePolicy;
use super::record::{CacheRecord, CacheValue};
use super::store::{
  CacheGetChunkRequest, CacheGetChunkResponse, CacheGetRequest, CacheGetResponse, CacheGetValueRequest,
  CacheGetValueResponse, CachePutRequest, CachePutResponse, CachePutValueRequest, CachePutValueResponse, CacheStore,
  OnComplete,
};
use crate::request::{RequestOwner, Status};

#[derive(Default)]
struct Entries {
  records: HashMap<CacheKey, CacheRecord>,
  record_order: VecDeque<CacheKey>,
  values: HashMap<CacheKey, CacheValue>,
  value_order: VecDeque<CacheKey>,
}

/// A cache store that keeps complete records in memory.
///
/// When a capacity is set, the oldest entries are evicted first. Records and
/// standalone values are counted separately.
#[derive(Default)]
pub struct MemoryCacheStore {
  capacity: Option<usize>,
  entries: Mutex<Entries>,
}

impl MemoryCacheStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_capacity(capacity: usize) -> Self {
    Self {
      capacity: Some(capacity),
      entries: Mutex::default(),
    }
  }

  fn entries(&self) -> std::sync::MutexGuard<'_, Entries> {
    self.entries.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Number of records held.
  pub fn len(&self) -> usize {
    self.entries().records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Number of standalone values held.
  pub fn value_count(&self) -> usize {
    self.entries().values.len()
  }

  pub fn contains(&self, key: &CacheKey) -> bool {
    self.entries().records.contains_key(key)
  }

  pub fn clear(&self) {
    *self.entries() = Entries::default();
  }
}

fn insert_bounded<V>(map: &mut HashMap<CacheKey, V>, order: &mut VecDeque<CacheKey>, capacity: Option<usize>, key: CacheKey, value: V) {
  if map.insert(key.clone(), value).is_none() {
    order.push_back(key);
  }
  if let Some(capacity) = capacity {
    while map.len() > capacity {
      let Some(oldest) = order.pop_front() else { break };
      map.remove(&oldest);
    }
  }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
  async fn put(&self, requests: Vec<CachePutRequest>, _owner: &RequestOwner, on_complete: OnComplete<'_, CachePutResponse>) {
    for request in requests {
      // Only complete records are kept; a partial record could not answer
      // a later get.
      if !request.record.has_all_data() {
        trace!(key = %request.record.key(), "memory cache rejected record without data");
        on_complete(request.respond(Status::Error));
        continue;
      }
      {
        let mut guard = self.entries();
        let entries = &mut *guard;
        insert_bounded(
          &mut entries.records,
          &mut entries.record_order,
          self.capacity,
          request.record.key().clone(),
          request.record.clone(),
        );
      }
      on_complete(request.respond(Status::Ok));
    }
  }

  async fn get(&self, requests: Vec<CacheGetRequest>, _owner: &RequestOwner, on_complete: OnComplete<'_, CacheGetResponse>) {
    for request in requests {
      let found = self.entries().records.get(&request.key).cloned();
      match found {
        Some(record) => on_complete(CacheGetResponse {
          name: request.name.clone(),
          record: record.apply_policy(&request.policy),
          user_data: request.user_data,
          status: Status::Ok,
        }),
        None => on_complete(request.miss(Status::Error)),
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
      if !request.value.has_data() {
        on_complete(request.respond(Status::Error));
        continue;
      }
      {
        let mut guard = self.entries();
        let entries = &mut *guard;
        insert_bounded(
          &mut entries.values,
          &mut entries.value_order,
          self.capacity,
          request.key.clone(),
          request.value.clone(),
        );
      }
      on_complete(request.respond(Status::Ok));
    }
  }

  async fn get_value(
    &self,
    requests: Vec<CacheGetValueRequest>,
    _owner: &RequestOwner,
    on_complete: OnComplete<'_, CacheGetValueResponse>,
  ) {
    for request in requests {
      let found = self.entries().values.get(&request.key).cloned();
      match found {
        Some(value) => {
          let value = if request.policy.contains(CachePolicy::SKIP_DATA) {
            value.without_data()
          } else {
            value
          };
          on_complete(CacheGetValueResponse {
            name: request.name.clone(),
            key: request.key.clone(),
            value: Some(value),
            user_data: request.user_data,
            status: Status::Ok,
          });
        }
        None => on_complete(request.miss(Status::Error)),
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
      let found = {
        let entries = self.entries();
        match request.id {
          Some(id) => entries
            .records
            .get(&request.key)
            .and_then(|record| record.find_value(&id))
            .map(|value| value.value.clone()),
          None => entries.values.get(&request.key).cloned(),
        }
      };
      match found {
        Some(value) => on_complete(request.read_from(&value)),
        None => on_complete(request.miss(Status::Error)),
      }
    }
  }
}
