use std::sync::Arc;

use deriva_lib::buffer::CompressedBuffer;
use deriva_lib::build::{BuildPolicy, BuildStatusFlags, MemoryInputResolver, ValueId};
use deriva_lib::cache::{
  CacheBucket, CacheGetRequest, CacheKey, CachePolicy, CachePutRequest, CacheRecord, CacheRecordPolicy, CacheStore,
  CacheStoreFlags, CacheStoreHierarchy, CacheValue, CacheValueWithId, FileSystemCacheStore, MemoryCacheStore,
};
use deriva_lib::request::{RequestOwner, Status};
use deriva_lib::util::hash::hash_bytes;
use tempfile::TempDir;

use super::common::{Fixture, resize_definition};

fn local() -> CacheStoreFlags {
  CacheStoreFlags::LOCAL | CacheStoreFlags::QUERY | CacheStoreFlags::STORE
}

fn remote() -> CacheStoreFlags {
  CacheStoreFlags::REMOTE | CacheStoreFlags::QUERY | CacheStoreFlags::STORE
}

fn key(seed: &str) -> CacheKey {
  CacheKey::new(CacheBucket::new("Texture").unwrap(), hash_bytes(seed.as_bytes()))
}

fn record(seed: &str) -> CacheRecord {
  let mut builder = CacheRecord::builder(key(seed));
  builder.add_value(CacheValueWithId::new(
    ValueId::from_name("Mip0"),
    CacheValue::new(CompressedBuffer::from_raw(seed)),
  ));
  builder.build()
}

async fn put(store: &dyn CacheStore, record: CacheRecord) -> Status {
  let mut status = Status::Error;
  let request = CachePutRequest {
    name: "seed".to_string(),
    record,
    policy: CacheRecordPolicy::new(CachePolicy::DEFAULT),
    user_data: 0,
  };
  store
    .put(vec![request], &RequestOwner::default(), &mut |r| status = r.status)
    .await;
  status
}

async fn get(store: &dyn CacheStore, key: CacheKey, policy: CachePolicy) -> (Status, CacheRecord) {
  let mut result = None;
  let request = CacheGetRequest {
    name: "probe".to_string(),
    key,
    policy: CacheRecordPolicy::new(policy),
    user_data: 0,
  };
  store
    .get(vec![request], &RequestOwner::default(), &mut |r| result = Some((r.status, r.record)))
    .await;
  result.expect("get must answer every request")
}

#[tokio::test]
async fn remote_hit_is_written_back_to_fast_node() {
  let fast = Arc::new(MemoryCacheStore::new());
  let slow = Arc::new(MemoryCacheStore::new());
  assert_eq!(put(slow.as_ref(), record("hero")).await, Status::Ok);

  let hierarchy = CacheStoreHierarchy::new();
  hierarchy.add("fast", fast.clone(), local()).await;
  hierarchy.add("slow", slow.clone(), remote()).await;

  let (status, found) = get(&hierarchy, key("hero"), CachePolicy::DEFAULT).await;
  assert_eq!(status, Status::Ok);
  assert!(found.has_all_data());
  hierarchy.flush().await;
  assert!(fast.contains(&key("hero")));

  let stats = hierarchy.stats().await;
  assert_eq!((stats[0].misses, stats[1].hits), (1, 1));
  assert_eq!(stats[0].write_backs, 1);
}

#[tokio::test]
async fn stop_store_node_is_not_copied_forward() {
  let fast = Arc::new(MemoryCacheStore::new());
  let slow = Arc::new(MemoryCacheStore::new());
  put(slow.as_ref(), record("hero")).await;

  let hierarchy = CacheStoreHierarchy::new();
  hierarchy.add("fast", fast.clone(), local()).await;
  hierarchy.add("slow", slow, remote() | CacheStoreFlags::STOP_STORE).await;

  let (status, _) = get(&hierarchy, key("hero"), CachePolicy::DEFAULT).await;
  assert_eq!(status, Status::Ok);
  hierarchy.flush().await;
  assert!(!fast.contains(&key("hero")));
}

#[tokio::test]
async fn requests_in_one_batch_follow_their_own_policy() {
  let fast = Arc::new(MemoryCacheStore::new());
  let slow = Arc::new(MemoryCacheStore::new());
  put(fast.as_ref(), record("near")).await;
  put(slow.as_ref(), record("far")).await;

  let hierarchy = CacheStoreHierarchy::new();
  hierarchy.add("fast", fast, local()).await;
  hierarchy.add("slow", slow, remote()).await;

  let requests = ["near", "far"]
    .into_iter()
    .enumerate()
    .map(|(i, seed)| CacheGetRequest {
      name: seed.to_string(),
      key: key(seed),
      policy: CacheRecordPolicy::new(if i == 0 {
        CachePolicy::QUERY_REMOTE
      } else {
        CachePolicy::QUERY_REMOTE | CachePolicy::SKIP_LOCAL_COPY
      }),
      user_data: i as u64,
    })
    .collect();
  let mut statuses = Vec::new();
  hierarchy
    .get(requests, &RequestOwner::default(), &mut |r| statuses.push((r.user_data, r.status)))
    .await;
  statuses.sort_by_key(|(user_data, _)| *user_data);
  // "near" only lives in the local node, which this request may not query.
  assert_eq!(statuses, vec![(0, Status::Error), (1, Status::Ok)]);
}

#[tokio::test]
async fn filesystem_node_serves_a_fresh_process() {
  let temp = TempDir::new().unwrap();
  let fixture = Fixture::new();
  let resolver = Arc::new(MemoryInputResolver::new());
  let definition = resize_definition(&resolver, b"persisted", 5);

  let first_cache = Arc::new(CacheStoreHierarchy::new());
  first_cache.add("memory", Arc::new(MemoryCacheStore::new()), local()).await;
  first_cache
    .add("disk", Arc::new(FileSystemCacheStore::new(temp.path())), local())
    .await;
  let session = fixture
    .system
    .create_session("first")
    .with_resolver(resolver.clone())
    .with_cache(first_cache.clone());
  let built = session
    .build_definition_async(definition.clone(), None, &RequestOwner::default(), BuildPolicy::DEFAULT)
    .await
    .unwrap();
  assert!(built.flags.contains(BuildStatusFlags::CACHE_STORE_HIT));

  let memory = Arc::new(MemoryCacheStore::new());
  let second_cache = Arc::new(CacheStoreHierarchy::new());
  second_cache.add("memory", memory.clone(), local()).await;
  second_cache
    .add("disk", Arc::new(FileSystemCacheStore::new(temp.path())), local())
    .await;
  let session = fixture
    .system
    .create_session("second")
    .with_resolver(resolver)
    .with_cache(second_cache.clone());
  let cached = session
    .build_definition_async(definition, None, &RequestOwner::default(), BuildPolicy::DEFAULT)
    .await
    .unwrap();

  assert_eq!(cached.status, Status::Ok);
  assert!(cached.flags.contains(BuildStatusFlags::CACHE_QUERY_HIT));
  assert_eq!(cached.output.payloads(), built.output.payloads());
  assert_eq!(fixture.local_calls(), 1);
  second_cache.flush().await;
  assert_eq!(memory.len(), 1);
}
