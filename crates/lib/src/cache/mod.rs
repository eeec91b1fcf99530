//! Content-addressed cache.
//!
//! Records are addressed by [`CacheKey`] (bucket + hash) and carry an optional
//! meta object plus a sorted list of values. Backends implement
//! [`CacheStore`]; [`CacheStoreHierarchy`] chains several of them with
//! per-node capability flags and writes hits back into faster nodes.

mod filesystem;
mod hierarchy;
mod key;
mod memory;
mod policy;
mod record;
mod store;

pub use filesystem::{FileSystemCacheError, FileSystemCacheStats, FileSystemCacheStore};
pub use hierarchy::{CacheNodeStats, CacheStoreHierarchy};
pub use key::{CacheBucket, CacheBucketError, CacheKey};
pub use memory::MemoryCacheStore;
pub use policy::{CachePolicy, CacheRecordPolicy, CacheStoreFlags};
pub use record::{CacheRecord, CacheRecordBuilder, CacheValue, CacheValueMeta, CacheValueWithId};
pub use store::{
  CacheGetChunkRequest, CacheGetChunkResponse, CacheGetRequest, CacheGetResponse, CacheGetValueRequest,
  CacheGetValueResponse, CachePutRequest, CachePutResponse, CachePutValueRequest, CachePutValueResponse, CacheStore,
  OnComplete,
};
