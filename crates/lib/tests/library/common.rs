//! Shared collaborators for the library tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use deriva_lib::buffer::CompressedBuffer;
use deriva_lib::build::{
  BuildAction, BuildCompleteParams, BuildContext, BuildDefinition, BuildFunction, BuildFunctionRegistry,
  BuildInputMeta, BuildInputResolver, BuildInputs, BuildJob, BuildKey, BuildOutput, BuildRequestPolicy,
  BuildSystem, BuildWorker, InputFilter, InputSource, MemoryInputResolver, RemoteBuildResult,
  ResolveError, ValueId,
};
use deriva_lib::request::RequestOwner;
use tokio::sync::Notify;
use uuid::Uuid;

pub const RESIZE_VERSION: Uuid = Uuid::from_u128(0x5e1e_c7ed);
pub const CONCAT_VERSION: Uuid = Uuid::from_u128(0xc0_4c47);

pub fn out() -> ValueId {
  ValueId::from_name("Out")
}

/// Truncates or zero-pads input `src` to the width in constant `w`.
#[derive(Default)]
pub struct Resize {
  pub calls: AtomicUsize,
}

#[async_trait]
impl BuildFunction for Resize {
  fn name(&self) -> &str {
    "Resize"
  }

  fn version(&self) -> Uuid {
    RESIZE_VERSION
  }

  async fn build(&self, context: &mut BuildContext<'_>) {
    self.calls.fetch_add(1, Ordering::SeqCst);
    let Some(width) = context.find_constant("w").and_then(|w| w.as_u64()) else {
      context.add_error("Resize", "constant 'w' must be a number");
      return;
    };
    let mut bytes = match context.input_bytes("src") {
      Some(Ok(bytes)) => bytes,
      _ => {
        context.add_error("Resize", "input 'src' is unreadable");
        return;
      }
    };
    bytes.resize(width as usize, 0);
    context.add_payload(out(), CompressedBuffer::from_raw(bytes));
  }
}

/// Concatenates every input in key order.
#[derive(Default)]
pub struct Concat {
  pub calls: AtomicUsize,
}

#[async_trait]
impl BuildFunction for Concat {
  fn name(&self) -> &str {
    "Concat"
  }

  fn version(&self) -> Uuid {
    CONCAT_VERSION
  }

  async fn build(&self, context: &mut BuildContext<'_>) {
    self.calls.fetch_add(1, Ordering::SeqCst);
    let mut joined = Vec::new();
    let keys: Vec<String> = context.input_keys().into_iter().map(str::to_string).collect();
    for key in keys {
      match context.input_bytes(&key) {
        Some(Ok(bytes)) => joined.extend(bytes),
        _ => {
          context.add_error("Concat", format!("input '{}' is unreadable", key));
          return;
        }
      }
    }
    context.add_payload(out(), CompressedBuffer::from_raw(joined));
  }
}

pub struct Fixture {
  pub resize: Arc<Resize>,
  pub concat: Arc<Concat>,
  pub system: BuildSystem,
}

impl Fixture {
  pub fn new() -> Self {
    let resize = Arc::new(Resize::default());
    let concat = Arc::new(Concat::default());
    let mut functions = BuildFunctionRegistry::new();
    functions.register(resize.clone()).unwrap();
    functions.register(concat.clone()).unwrap();
    Self {
      resize,
      concat,
      system: BuildSystem::new(functions),
    }
  }

  pub fn local_calls(&self) -> usize {
    self.resize.calls.load(Ordering::SeqCst) + self.concat.calls.load(Ordering::SeqCst)
  }
}

/// Resolver that records every data request and can misreport metadata.
#[derive(Default)]
pub struct RecordingResolver {
  pub inner: MemoryInputResolver,
  pub data_requests: Mutex<Vec<Vec<String>>>,
  pub meta_overrides: Mutex<HashMap<String, BuildInputMeta>>,
}

impl RecordingResolver {
  pub fn requested(&self) -> Vec<Vec<String>> {
    self.data_requests.lock().unwrap().clone()
  }
}

#[async_trait]
impl BuildInputResolver for RecordingResolver {
  async fn resolve_key(&self, key: &BuildKey, owner: &RequestOwner) -> Result<BuildDefinition, ResolveError> {
    self.inner.resolve_key(key, owner).await
  }

  async fn resolve_input_meta(
    &self,
    definition: &BuildDefinition,
    owner: &RequestOwner,
  ) -> Result<Vec<(String, BuildInputMeta)>, ResolveError> {
    let mut metas = self.inner.resolve_input_meta(definition, owner).await?;
    let overrides = self.meta_overrides.lock().unwrap();
    for (key, meta) in metas.iter_mut() {
      if let Some(replacement) = overrides.get(key) {
        *meta = *replacement;
      }
    }
    Ok(metas)
  }

  async fn resolve_input_data(
    &self,
    source: InputSource<'_>,
    filter: InputFilter<'_>,
    owner: &RequestOwner,
  ) -> Result<Vec<(String, CompressedBuffer)>, ResolveError> {
    let resolved = self.inner.resolve_input_data(source, filter, owner).await?;
    let mut keys: Vec<String> = resolved.iter().map(|(key, _)| key.clone()).collect();
    keys.sort();
    self.data_requests.lock().unwrap().push(keys);
    Ok(resolved)
  }
}

/// Resolver whose metadata resolution waits until released.
pub struct GatedResolver {
  pub inner: MemoryInputResolver,
  pub gate: Notify,
  pub entered: Notify,
}

#[async_trait]
impl BuildInputResolver for GatedResolver {
  async fn resolve_key(&self, key: &BuildKey, owner: &RequestOwner) -> Result<BuildDefinition, ResolveError> {
    self.inner.resolve_key(key, owner).await
  }

  async fn resolve_input_meta(
    &self,
    definition: &BuildDefinition,
    owner: &RequestOwner,
  ) -> Result<Vec<(String, BuildInputMeta)>, ResolveError> {
    self.entered.notify_one();
    self.gate.notified().await;
    self.inner.resolve_input_meta(definition, owner).await
  }

  async fn resolve_input_data(
    &self,
    source: InputSource<'_>,
    filter: InputFilter<'_>,
    owner: &RequestOwner,
  ) -> Result<Vec<(String, CompressedBuffer)>, ResolveError> {
    self.inner.resolve_input_data(source, filter, owner).await
  }
}

/// Remote worker that asks for `wanted` on its first attempt and then
/// concatenates whatever inputs it was sent.
pub struct ScriptedWorker {
  pub wanted: Vec<String>,
  pub fail: bool,
  pub attempts: Mutex<Vec<Vec<String>>>,
}

impl ScriptedWorker {
  pub fn asking_for(wanted: &[&str]) -> Self {
    Self {
      wanted: wanted.iter().map(|k| k.to_string()).collect(),
      fail: false,
      attempts: Mutex::new(Vec::new()),
    }
  }

  pub fn failing() -> Self {
    Self {
      wanted: Vec::new(),
      fail: true,
      attempts: Mutex::new(Vec::new()),
    }
  }

  pub fn attempts(&self) -> Vec<Vec<String>> {
    self.attempts.lock().unwrap().clone()
  }
}

#[async_trait]
impl BuildWorker for ScriptedWorker {
  async fn build_action(
    &self,
    action: &BuildAction,
    inputs: Option<&BuildInputs>,
    _policy: &BuildRequestPolicy,
    _owner: &RequestOwner,
  ) -> RemoteBuildResult {
    let seen: Vec<String> = inputs
      .map(|inputs| inputs.iter().map(|(key, _)| key.to_string()).collect())
      .unwrap_or_default();
    let first = {
      let mut attempts = self.attempts.lock().unwrap();
      attempts.push(seen.clone());
      attempts.len() == 1
    };
    if self.fail {
      return RemoteBuildResult::failed();
    }
    if first && !self.wanted.is_empty() {
      return RemoteBuildResult::missing(self.wanted.clone());
    }
    let Some(inputs) = inputs.filter(|i| action.inputs().keys().all(|k| i.contains(k))) else {
      return RemoteBuildResult::failed();
    };
    let mut joined = Vec::new();
    for key in action.inputs().keys() {
      if let Some(Ok(bytes)) = inputs.find_input(key).map(CompressedBuffer::decompress) {
        joined.extend(bytes);
      }
    }
    let mut output = BuildOutput::builder(action.name(), action.function());
    output.add_payload(out(), CompressedBuffer::from_raw(joined)).unwrap();
    RemoteBuildResult::built(output.build())
  }
}

/// Run a build to completion and return the job with its single completion.
pub async fn complete(
  start: impl FnOnce(Box<dyn FnOnce(BuildCompleteParams) + Send>) -> Arc<BuildJob>,
) -> (Arc<BuildJob>, BuildCompleteParams) {
  let (tx, rx) = tokio::sync::oneshot::channel();
  let calls = Arc::new(AtomicUsize::new(0));
  let counter = calls.clone();
  let job = start(Box::new(move |params| {
    counter.fetch_add(1, Ordering::SeqCst);
    let _ = tx.send(params);
  }));
  let params = rx.await.expect("job never completed");
  assert_eq!(calls.load(Ordering::SeqCst), 1);
  (job, params)
}

/// `Resize` of `content`, registered with `resolver` by hash.
pub fn resize_definition(resolver: &MemoryInputResolver, content: &[u8], width: u64) -> BuildDefinition {
  let hash = resolver.add_content(CompressedBuffer::from_raw(content));
  let mut builder = BuildDefinition::builder(format!("resized-{}", width), "Resize").unwrap();
  builder.add_constant("w", width).unwrap();
  builder.add_input_hash("src", hash).unwrap();
  builder.build().unwrap()
}
