use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use deriva_lib::buffer::CompressedBuffer;
use deriva_lib::build::{
  BuildDefinition, BuildInputMeta, BuildInputs, BuildJobState, BuildPolicy, BuildRequestPolicy, BuildStatusFlags,
  MemoryInputResolver, TokioScheduler,
};
use deriva_lib::cache::{CacheBucket, CacheKey, MemoryCacheStore};
use deriva_lib::request::{RequestOwner, Status};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing_test::traced_test;

use super::common::{Fixture, GatedResolver, RecordingResolver, complete, out, resize_definition};

fn payload_bytes(params: &deriva_lib::build::BuildCompleteParams) -> Vec<u8> {
  let payload = params.output.find_payload(&out()).expect("payload");
  payload.data.as_ref().expect("payload data").decompress().unwrap()
}

#[tokio::test]
async fn same_definition_yields_same_keys() {
  let fixture = Fixture::new();
  let resolver = Arc::new(MemoryInputResolver::new());
  let definition = resize_definition(&resolver, b"abcdef", 4);
  let session = fixture.system.create_session("determinism").with_resolver(resolver.clone());
  let owner = RequestOwner::default();

  let (_, first) = complete(|done| session.build_definition(definition.clone(), None, &owner, BuildPolicy::DEFAULT, done)).await;
  let reloaded = BuildDefinition::load("renamed", definition.save()).unwrap();
  assert_eq!(reloaded.key(), definition.key());
  let (_, second) = complete(|done| session.build_definition(reloaded, None, &owner, BuildPolicy::DEFAULT, done)).await;

  assert_eq!(first.status, Status::Ok);
  assert_eq!(first.action_key, second.action_key);
  assert_eq!(first.definition_key, Some(definition.key()));
  assert_eq!(payload_bytes(&first), b"abcd");
  assert_eq!(payload_bytes(&second), b"abcd");
  assert_eq!(fixture.local_calls(), 2);
}

#[tokio::test]
async fn cache_hit_skips_execution() {
  let fixture = Fixture::new();
  let resolver = Arc::new(MemoryInputResolver::new());
  let cache = Arc::new(MemoryCacheStore::new());
  let definition = resize_definition(&resolver, b"pixels", 3);
  let session = fixture
    .system
    .create_session("cache")
    .with_resolver(resolver.clone())
    .with_cache(cache.clone());
  let owner = RequestOwner::default();

  let (_, first) = complete(|done| session.build_definition(definition.clone(), None, &owner, BuildPolicy::DEFAULT, done)).await;
  assert!(first.flags.contains(BuildStatusFlags::BUILD_LOCAL | BuildStatusFlags::CACHE_STORE_HIT));
  let action_key = first.action_key.unwrap();
  assert!(cache.contains(&CacheKey::new(CacheBucket::new("Resize").unwrap(), action_key.0)));

  let (job, second) = complete(|done| session.build_definition(definition, None, &owner, BuildPolicy::DEFAULT, done)).await;
  assert_eq!(second.status, Status::Ok);
  assert!(second.flags.contains(BuildStatusFlags::CACHE_QUERY_HIT));
  assert!(!second.flags.intersects(BuildStatusFlags::BUILD_LOCAL | BuildStatusFlags::BUILD_REMOTE));
  let history = job.history();
  assert!(!history.contains(&BuildJobState::ExecuteRemote));
  assert!(!history.contains(&BuildJobState::ExecuteLocal));
  assert_eq!(payload_bytes(&second), b"pix");
  assert_eq!(fixture.local_calls(), 1);
}

#[tokio::test]
async fn build_from_key_resolves_definition() {
  let fixture = Fixture::new();
  let resolver = Arc::new(MemoryInputResolver::new());
  let key = resolver.add_definition(resize_definition(&resolver, b"xy", 4));
  let session = fixture.system.create_session("key").with_resolver(resolver);

  let params = session
    .build_key_async(key, &RequestOwner::default(), BuildPolicy::DEFAULT)
    .await
    .unwrap();
  assert_eq!(params.status, Status::Ok);
  assert_eq!(params.name, "resized-4");
  assert_eq!(payload_bytes(&params), b"xy\0\0");
}

#[tokio::test]
async fn key_without_resolver_is_a_configuration_error() {
  let fixture = Fixture::new();
  let resolver = MemoryInputResolver::new();
  let key = resolver.add_definition(resize_definition(&resolver, b"xy", 4));
  let session = fixture.system.create_session("bare");

  let params = session
    .build_key_async(key, &RequestOwner::default(), BuildPolicy::DEFAULT)
    .await
    .unwrap();
  assert_eq!(params.status, Status::Error);
  assert!(params.output.errors().any(|d| d.message.contains("input resolver")));
}

#[tokio::test]
#[traced_test]
async fn mismatched_input_size_fails_integrity_check() {
  let fixture = Fixture::new();
  let resolver = Arc::new(RecordingResolver::default());
  let definition = resize_definition(&resolver.inner, b"sixbyt", 256);
  let source = CompressedBuffer::from_raw(b"sixbyt");
  resolver.meta_overrides.lock().unwrap().insert(
    "src".to_string(),
    BuildInputMeta {
      raw_hash: source.raw_hash(),
      raw_size: 7,
    },
  );
  let session = fixture.system.create_session("integrity").with_resolver(resolver.clone());

  let params = session
    .build_definition_async(definition, None, &RequestOwner::default(), BuildPolicy::DEFAULT)
    .await
    .unwrap();
  assert_eq!(params.status, Status::Error);
  assert!(params.output.payloads().is_empty());
  assert!(params.output.errors().any(|d| d.message.contains("'src'")));
  assert_eq!(fixture.resize.calls.load(Ordering::SeqCst), 0);
  assert!(logs_contain("but the action expects"));
}

#[tokio::test]
async fn supplied_inputs_are_not_resolved_again() {
  let fixture = Fixture::new();
  let resolver = Arc::new(RecordingResolver::default());
  let a = resolver.inner.add_content(CompressedBuffer::from_raw(b"A"));
  let b = resolver.inner.add_content(CompressedBuffer::from_raw(b"B"));

  let mut action = fixture.system.create_action("ab", "Concat").unwrap();
  action.add_input("a", a, 1).unwrap();
  action.add_input("b", b, 1).unwrap();
  let action = action.build().unwrap();
  let mut partial = BuildInputs::builder("ab");
  partial.add_input("a", CompressedBuffer::from_raw(b"A")).unwrap();

  // Partial inputs on an action are completed by resolution rather than
  // rejected at construction.
  let session = fixture.system.create_session("partial").with_resolver(resolver.clone());
  let params = session
    .build_action_async(action, Some(partial.build()), &RequestOwner::default(), BuildPolicy::DEFAULT)
    .await
    .unwrap();
  assert_eq!(params.status, Status::Ok);
  assert_eq!(payload_bytes(&params), b"AB");
  assert_eq!(resolver.requested(), vec![vec!["b".to_string()]]);
}

#[tokio::test]
async fn action_with_stale_function_version_fails() {
  let fixture = Fixture::new();
  let mut builder =
    deriva_lib::build::BuildAction::builder("old", "Concat", uuid::Uuid::from_u128(1), fixture.system.version()).unwrap();
  builder.add_constant("n", 1).unwrap();
  let session = fixture.system.create_session("versions");
  let params = session
    .build_action_async(builder.build().unwrap(), None, &RequestOwner::default(), BuildPolicy::DEFAULT)
    .await
    .unwrap();
  assert_eq!(params.status, Status::Error);
  assert!(params.output.errors().any(|d| d.message.contains("version")));
  assert_eq!(fixture.local_calls(), 0);
}

#[tokio::test]
async fn skip_data_returns_hashes_only() {
  let fixture = Fixture::new();
  let resolver = Arc::new(MemoryInputResolver::new());
  let definition = resize_definition(&resolver, b"abc", 2);
  let session = fixture.system.create_session("skip").with_resolver(resolver);
  let policy = BuildRequestPolicy::new(BuildPolicy::DEFAULT | BuildPolicy::SKIP_DATA);

  let params = session
    .build_definition_async(definition, None, &RequestOwner::default(), policy)
    .await
    .unwrap();
  let payload = params.output.find_payload(&out()).unwrap();
  assert!(payload.data.is_none());
  assert_eq!(payload.raw_size, 2);
  assert_eq!(payload.raw_hash, CompressedBuffer::from_raw(b"ab").raw_hash());
}

#[tokio::test]
async fn local_build_disallowed_without_worker_fails() {
  let fixture = Fixture::new();
  let resolver = Arc::new(MemoryInputResolver::new());
  let definition = resize_definition(&resolver, b"abc", 2);
  let session = fixture.system.create_session("remote-only").with_resolver(resolver);

  let params = session
    .build_definition_async(definition, None, &RequestOwner::default(), BuildPolicy::BUILD_REMOTE)
    .await
    .unwrap();
  assert_eq!(params.status, Status::Error);
  assert!(params.output.errors().any(|d| d.message.contains("local execution is not allowed")));
}

#[tokio::test]
async fn canceled_owner_completes_once() {
  let fixture = Fixture::new();
  let resolver = Arc::new(MemoryInputResolver::new());
  let definition = resize_definition(&resolver, b"abc", 2);
  let session = fixture.system.create_session("cancel").with_resolver(resolver);
  let owner = RequestOwner::default();
  owner.cancel();

  let (job, params) = complete(|done| session.build_definition(definition, None, &owner, BuildPolicy::DEFAULT, done)).await;
  assert_eq!(params.status, Status::Canceled);
  assert_eq!(job.history(), vec![BuildJobState::Complete]);
  assert_eq!(fixture.local_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_while_resolving_ignores_late_result() {
  let fixture = Fixture::new();
  let resolver = Arc::new(GatedResolver {
    inner: MemoryInputResolver::new(),
    gate: Notify::new(),
    entered: Notify::new(),
  });
  let definition = resize_definition(&resolver.inner, b"abc", 2);
  let system = fixture
    .system
    .clone()
    .with_scheduler(Arc::new(TokioScheduler::new(Handle::current(), 2, 0)));
  let session = system.create_session("gated").with_resolver(resolver.clone());
  let owner = RequestOwner::default();

  let (job, params) = complete(|done| {
    let job = session.build_definition(definition, None, &owner, BuildPolicy::DEFAULT, done);
    let resolver = resolver.clone();
    let owner = owner.clone();
    tokio::spawn(async move {
      resolver.entered.notified().await;
      owner.cancel();
      resolver.gate.notify_one();
    });
    job
  })
  .await;
  assert_eq!(params.status, Status::Canceled);

  // The released resolution must not move the job again.
  tokio::time::sleep(Duration::from_millis(50)).await;
  assert_eq!(job.history(), vec![BuildJobState::ResolveInputMeta, BuildJobState::Complete]);
  assert_eq!(fixture.local_calls(), 0);
  owner.wait().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_jobs_enter_states_in_order() {
  let fixture = Fixture::new();
  let resolver = Arc::new(MemoryInputResolver::new());
  let cache = Arc::new(MemoryCacheStore::new());
  let system = fixture
    .system
    .clone()
    .with_scheduler(Arc::new(TokioScheduler::new(Handle::current(), 3, 0)));
  let session = system
    .create_session("stress")
    .with_resolver(resolver.clone())
    .with_cache(cache);

  let mut waits = Vec::new();
  let mut jobs = Vec::new();
  for i in 0..32u64 {
    let definition = resize_definition(&resolver, format!("input {}", i % 8).as_bytes(), 4 + i % 3);
    let owner = RequestOwner::default();
    let (tx, rx) = tokio::sync::oneshot::channel();
    let job = session.build_definition(definition, None, &owner, BuildPolicy::DEFAULT, move |params| {
      let _ = tx.send(params.status);
    });
    if i % 5 == 0 {
      owner.cancel();
    }
    jobs.push(job);
    waits.push(rx);
  }
  for status in futures::future::join_all(waits).await {
    assert!(matches!(status.unwrap(), Status::Ok | Status::Canceled));
  }
  for job in jobs {
    let history = job.history();
    assert!(history.windows(2).all(|w| w[0] < w[1]), "{:?}", history);
    assert_eq!(history.last(), Some(&BuildJobState::Complete));
  }
}
