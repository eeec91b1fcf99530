use std::sync::Arc;

use deriva_lib::buffer::CompressedBuffer;
use deriva_lib::build::{
  BuildDefinition, BuildInputs, BuildJobState, BuildPolicy, BuildScheduler, BuildStatusFlags, ScheduledStep,
  StaticWorkerRegistry,
};
use deriva_lib::request::{RequestOwner, Status};

use super::common::{CONCAT_VERSION, Fixture, RecordingResolver, ScriptedWorker, complete, out};

/// Runs every step inline but skips every step the scheduler may skip.
struct LocalOnly;

impl BuildScheduler for LocalOnly {
  fn dispatch(&self, step: ScheduledStep) {
    if let Err(step) = step.skip() {
      futures::executor::block_on(step.run());
    }
  }
}

struct Setup {
  fixture: Fixture,
  resolver: Arc<RecordingResolver>,
  definition: BuildDefinition,
}

/// A `Concat` over inputs `a`, `b` and `c`.
fn setup(worker: Arc<ScriptedWorker>) -> Setup {
  let mut fixture = Fixture::new();
  let mut workers = StaticWorkerRegistry::new();
  workers.add("Concat", CONCAT_VERSION, fixture.system.version(), worker);
  fixture.system = fixture.system.clone().with_workers(Arc::new(workers));

  let resolver = Arc::new(RecordingResolver::default());
  let mut builder = BuildDefinition::builder("abc", "Concat").unwrap();
  for (key, text) in [("a", "A"), ("b", "B"), ("c", "C")] {
    let hash = resolver.inner.add_content(CompressedBuffer::from_raw(text));
    builder.add_input_hash(key, hash).unwrap();
  }
  Setup {
    fixture,
    resolver,
    definition: builder.build().unwrap(),
  }
}

fn only_c() -> BuildInputs {
  let mut inputs = BuildInputs::builder("abc");
  inputs.add_input("c", CompressedBuffer::from_raw("C")).unwrap();
  inputs.build()
}

#[tokio::test]
async fn missing_inputs_are_resolved_then_retried() {
  let worker = Arc::new(ScriptedWorker::asking_for(&["b", "c", "a", "b"]));
  let Setup {
    fixture,
    resolver,
    definition,
  } = setup(worker.clone());
  let session = fixture.system.create_session("remote").with_resolver(resolver.clone());
  let owner = RequestOwner::default();

  let (job, params) =
    complete(|done| session.build_definition(definition, Some(only_c()), &owner, BuildPolicy::DEFAULT, done)).await;

  assert_eq!(params.status, Status::Ok);
  assert!(params.flags.contains(BuildStatusFlags::BUILD_TRY_REMOTE | BuildStatusFlags::BUILD_REMOTE));
  assert!(!params.flags.contains(BuildStatusFlags::BUILD_LOCAL));
  assert_eq!(resolver.requested(), vec![vec!["a".to_string(), "b".to_string()]]);
  assert_eq!(
    worker.attempts(),
    vec![vec!["c".to_string()], vec!["a".to_string(), "b".to_string(), "c".to_string()]]
  );
  assert_eq!(
    job.history(),
    vec![
      BuildJobState::ResolveInputMeta,
      BuildJobState::CacheQuery,
      BuildJobState::ExecuteRemote,
      BuildJobState::ResolveRemoteInputData,
      BuildJobState::ExecuteRemoteRetry,
      BuildJobState::CacheStore,
      BuildJobState::Complete,
    ]
  );
  let payload = params.output.find_payload(&out()).unwrap();
  assert_eq!(payload.data.as_ref().unwrap().decompress().unwrap(), b"ABC");
  assert_eq!(fixture.local_calls(), 0);
}

#[tokio::test]
async fn remote_failure_falls_back_to_local() {
  let worker = Arc::new(ScriptedWorker::failing());
  let Setup {
    fixture,
    resolver,
    definition,
  } = setup(worker.clone());
  let session = fixture.system.create_session("fallback").with_resolver(resolver.clone());

  let params = session
    .build_definition_async(definition, None, &RequestOwner::default(), BuildPolicy::DEFAULT)
    .await
    .unwrap();
  assert_eq!(params.status, Status::Ok);
  assert!(params.flags.contains(BuildStatusFlags::BUILD_TRY_REMOTE | BuildStatusFlags::BUILD_LOCAL));
  assert!(!params.flags.contains(BuildStatusFlags::BUILD_REMOTE));
  assert_eq!(worker.attempts().len(), 1);
  assert_eq!(fixture.local_calls(), 1);
}

#[tokio::test]
async fn remote_failure_is_terminal_without_local_builds() {
  let worker = Arc::new(ScriptedWorker::failing());
  let Setup {
    fixture,
    resolver,
    definition,
  } = setup(worker);
  let session = fixture.system.create_session("remote-only").with_resolver(resolver);

  let params = session
    .build_definition_async(definition, None, &RequestOwner::default(), BuildPolicy::BUILD_REMOTE)
    .await
    .unwrap();
  assert_eq!(params.status, Status::Error);
  assert_eq!(fixture.local_calls(), 0);
}

#[tokio::test]
async fn skipped_remote_step_builds_locally() {
  let worker = Arc::new(ScriptedWorker::asking_for(&["a"]));
  let Setup {
    fixture,
    resolver,
    definition,
  } = setup(worker.clone());
  let system = fixture.system.clone().with_scheduler(Arc::new(LocalOnly));
  let session = system.create_session("skip").with_resolver(resolver);

  let params = session
    .build_definition_async(definition, None, &RequestOwner::default(), BuildPolicy::DEFAULT)
    .await
    .unwrap();
  assert_eq!(params.status, Status::Ok);
  assert!(params.flags.contains(BuildStatusFlags::BUILD_LOCAL));
  assert!(worker.attempts().is_empty());
}
