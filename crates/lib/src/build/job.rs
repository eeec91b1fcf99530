//! Build jobs.
//!
//! A [`BuildJob`] drives one build from whatever it was given (a key, a
//! definition or an action) to a [`BuildOutput`]. It moves through the states
//! of [`BuildJobState`] in order, never backwards, and may skip any state:
//!
//! ```text
//! ResolveKey -> ResolveInputMeta -> CacheQuery -> ExecuteRemote
//!   -> ResolveRemoteInputData -> ExecuteRemoteRetry -> ResolveInputData
//!   -> ExecuteLocal -> CacheStore -> Complete
//! ```
//!
//! Entering a state either moves straight on to a later state or hands one
//! asynchronous step to the scheduler; the step re-enters the job when it is
//! done. Transitions requested from any thread are folded into a single
//! driving loop, so each state is entered at most once.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::action::{BuildAction, BuildInputMeta};
use super::definition::BuildDefinition;
use super::function::{BuildConfigContext, BuildContext, BuildFunction, BuildFunctionRegistry};
use super::inputs::BuildInputs;
use super::key::{BuildActionKey, BuildKey};
use super::output::BuildOutput;
use super::policy::{BuildPolicy, BuildRequestPolicy, BuildStatusFlags};
use super::resolver::{BuildInputResolver, InputSource, ResolveError};
use super::scheduler::{BuildScheduler, BuildStage, ScheduledStep, SchedulerParams};
use super::worker::{BuildWorkerRegistry, RemoteBuildResult};
use crate::buffer::CompressedBuffer;
use crate::cache::{
  CacheBucket, CacheGetRequest, CacheKey, CachePolicy, CachePutRequest, CacheRecordPolicy, CacheStore,
};
use crate::consts::BUILD_LOG_CATEGORY;
use crate::request::{OwnedRequest, RequestId, RequestOwner, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum BuildJobState {
  NotStarted,
  ResolveKey,
  ResolveInputMeta,
  CacheQuery,
  ExecuteRemote,
  ResolveRemoteInputData,
  ExecuteRemoteRetry,
  ResolveInputData,
  ExecuteLocal,
  CacheStore,
  Complete,
}

impl BuildJobState {
  const ALL: [BuildJobState; 11] = [
    BuildJobState::NotStarted,
    BuildJobState::ResolveKey,
    BuildJobState::ResolveInputMeta,
    BuildJobState::CacheQuery,
    BuildJobState::ExecuteRemote,
    BuildJobState::ResolveRemoteInputData,
    BuildJobState::ExecuteRemoteRetry,
    BuildJobState::ResolveInputData,
    BuildJobState::ExecuteLocal,
    BuildJobState::CacheStore,
    BuildJobState::Complete,
  ];

  fn from_u8(value: u8) -> Self {
    Self::ALL.get(usize::from(value)).copied().unwrap_or(BuildJobState::Complete)
  }
}

impl fmt::Display for BuildJobState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Debug::fmt(self, f)
  }
}

/// Everything a job reports when it completes.
#[derive(Debug, Clone)]
pub struct BuildCompleteParams {
  pub name: String,
  pub function: String,
  pub definition_key: Option<BuildKey>,
  pub action_key: Option<BuildActionKey>,
  pub status: Status,
  pub output: BuildOutput,
  pub flags: BuildStatusFlags,
}

/// Invoked exactly once per job.
pub type BuildCompleteCallback = Box<dyn FnOnce(BuildCompleteParams) + Send>;

/// Collaborators shared by every job of a session.
#[derive(Clone)]
pub(crate) struct JobEnvironment {
  pub functions: Arc<BuildFunctionRegistry>,
  pub workers: Arc<dyn BuildWorkerRegistry>,
  pub scheduler: Arc<dyn BuildScheduler>,
  pub cache: Option<Arc<dyn CacheStore>>,
  pub resolver: Option<Arc<dyn BuildInputResolver>>,
  pub cache_policy: CachePolicy,
  pub build_system_version: Uuid,
}

/// What a job starts from. Inputs supplied with a definition or action may be
/// partial; whatever is missing is resolved later.
pub(crate) enum JobSeed {
  Key(BuildKey),
  Definition(BuildDefinition, Option<BuildInputs>),
  Action(BuildAction, Option<BuildInputs>),
}

struct JobData {
  name: String,
  function: String,
  key: Option<BuildKey>,
  definition: Option<BuildDefinition>,
  action: Option<BuildAction>,
  inputs: Option<BuildInputs>,
  output: Option<BuildOutput>,
  implementation: Option<Arc<dyn BuildFunction>>,
  missing_remote_inputs: Vec<String>,
  cache_policy: CachePolicy,
  build_policy: BuildPolicy,
  required_memory: u64,
  flags: BuildStatusFlags,
  configured: bool,
  history: Vec<BuildJobState>,
}

pub struct BuildJob {
  this: Weak<BuildJob>,
  env: JobEnvironment,
  owner: RequestOwner,
  policy: BuildRequestPolicy,
  initial_state: BuildJobState,
  state: AtomicU8,
  next_state: AtomicU8,
  advancing: AtomicBool,
  canceled: AtomicBool,
  data: Mutex<JobData>,
  request_id: Mutex<Option<RequestId>>,
  on_complete: Mutex<Option<BuildCompleteCallback>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl BuildJob {
  pub(crate) fn new(
    env: JobEnvironment,
    seed: JobSeed,
    owner: RequestOwner,
    policy: BuildRequestPolicy,
    on_complete: BuildCompleteCallback,
  ) -> Arc<Self> {
    let (name, function, key, definition, action, inputs, initial_state) = match seed {
      JobSeed::Key(key) => (
        key.to_string(),
        String::new(),
        Some(key),
        None,
        None,
        None,
        BuildJobState::ResolveKey,
      ),
      JobSeed::Definition(definition, inputs) => (
        definition.name().to_string(),
        definition.function().to_string(),
        Some(definition.key()),
        Some(definition),
        None,
        inputs,
        BuildJobState::ResolveInputMeta,
      ),
      JobSeed::Action(action, inputs) => (
        action.name().to_string(),
        action.function().to_string(),
        None,
        None,
        Some(action),
        inputs,
        BuildJobState::CacheQuery,
      ),
    };
    let build_policy = policy.combined();
    Arc::new_cyclic(|this| BuildJob {
      this: this.clone(),
      env,
      owner,
      policy,
      initial_state,
      state: AtomicU8::new(BuildJobState::NotStarted as u8),
      next_state: AtomicU8::new(BuildJobState::NotStarted as u8),
      advancing: AtomicBool::new(false),
      canceled: AtomicBool::new(false),
      data: Mutex::new(JobData {
        name,
        function,
        key,
        definition,
        action,
        inputs,
        output: None,
        implementation: None,
        missing_remote_inputs: Vec::new(),
        cache_policy: CachePolicy::NONE,
        build_policy,
        required_memory: 0,
        flags: BuildStatusFlags::NONE,
        configured: false,
        history: Vec::new(),
      }),
      request_id: Mutex::new(None),
      on_complete: Mutex::new(Some(on_complete)),
    })
  }

  /// Register with the owner and enter the first state.
  pub(crate) fn start(self: &Arc<Self>) {
    self.env.scheduler.begin_job(&self.scheduler_params());
    let request: Arc<dyn OwnedRequest> = self.clone();
    let id = self.owner.register(request);
    {
      let mut slot = lock(&self.request_id);
      if self.state() != BuildJobState::Complete {
        *slot = Some(id);
      } else {
        drop(slot);
        self.owner.end(id);
      }
    }
    self.advance_to_state(self.initial_state);
  }

  pub fn name(&self) -> String {
    self.data().name.clone()
  }

  pub fn state(&self) -> BuildJobState {
    BuildJobState::from_u8(self.state.load(Ordering::Acquire))
  }

  pub fn is_complete(&self) -> bool {
    self.state() == BuildJobState::Complete
  }

  /// Every state entered so far, in order.
  pub fn history(&self) -> Vec<BuildJobState> {
    self.data().history.clone()
  }

  pub fn status_flags(&self) -> BuildStatusFlags {
    self.data().flags
  }

  /// Abandon the job. Whatever stage is running finishes without effect and
  /// the job completes with [`Status::Canceled`].
  pub fn cancel(&self) {
    if self.is_complete() {
      return;
    }
    self.canceled.store(true, Ordering::Release);
    if let Some(job) = self.this.upgrade() {
      job.advance_to_state(BuildJobState::Complete);
    }
  }

  fn data(&self) -> MutexGuard<'_, JobData> {
    lock(&self.data)
  }

  /// Run `f` on the job data if the job is still in `expected`.
  fn apply_if<R>(&self, expected: BuildJobState, f: impl FnOnce(&mut JobData) -> R) -> Option<R> {
    let mut data = self.data();
    if self.state() != expected {
      trace!(name = %data.name, expected = %expected, "dropping stale step result");
      return None;
    }
    Some(f(&mut data))
  }

  /// Collapse any target to `Complete` once the owner is canceled.
  fn collapse(&self, target: u8) -> u8 {
    if target != BuildJobState::Complete as u8 && self.owner.is_canceled() {
      self.canceled.store(true, Ordering::Release);
      BuildJobState::Complete as u8
    } else {
      target
    }
  }

  /// Request a transition to `state`.
  ///
  /// Targets only ever rise. If another caller is already driving the job the
  /// request is recorded and picked up by that caller's loop.
  pub(crate) fn advance_to_state(self: &Arc<Self>, state: BuildJobState) {
    self.next_state.fetch_max(self.collapse(state as u8), Ordering::AcqRel);
    loop {
      if self.advancing.swap(true, Ordering::AcqRel) {
        return;
      }
      loop {
        let current = self.state.load(Ordering::Acquire);
        let target = self.next_state.load(Ordering::Acquire);
        if target <= current {
          break;
        }
        let target = self.collapse(target);
        self.next_state.fetch_max(target, Ordering::AcqRel);
        self.state.store(target, Ordering::Release);
        self.enter(BuildJobState::from_u8(target));
      }
      self.advancing.store(false, Ordering::Release);
      // A request may have landed between the last check and the release.
      if self.next_state.load(Ordering::Acquire) <= self.state.load(Ordering::Acquire) {
        return;
      }
    }
  }

  fn enter(self: &Arc<Self>, state: BuildJobState) {
    {
      let mut data = self.data();
      data.history.push(state);
      debug!(name = %data.name, state = %state, "entering build state");
    }
    match state {
      BuildJobState::NotStarted => {}
      BuildJobState::ResolveKey => self.enter_resolve_key(),
      BuildJobState::ResolveInputMeta => self.enter_resolve_input_meta(),
      BuildJobState::CacheQuery => self.enter_cache_query(),
      BuildJobState::ExecuteRemote => self.enter_execute_remote(BuildJobState::ExecuteRemote),
      BuildJobState::ResolveRemoteInputData => self.enter_resolve_remote_input_data(),
      BuildJobState::ExecuteRemoteRetry => self.enter_execute_remote(BuildJobState::ExecuteRemoteRetry),
      BuildJobState::ResolveInputData => self.enter_resolve_input_data(),
      BuildJobState::ExecuteLocal => self.enter_execute_local(),
      BuildJobState::CacheStore => self.enter_cache_store(),
      BuildJobState::Complete => self.enter_complete(),
    }
  }

  /// Fail the job with an error diagnostic. Does nothing if an output already
  /// exists.
  fn complete_with_error(self: &Arc<Self>, message: impl Into<String>) {
    let message = message.into();
    {
      let mut data = self.data();
      if data.output.is_some() {
        return;
      }
      error!(name = %data.name, function = %data.function, "{}", message);
      let mut output = BuildOutput::builder(data.name.clone(), data.function.clone());
      output.add_error(BUILD_LOG_CATEGORY, message);
      data.output = Some(output.build());
    }
    self.advance_to_state(BuildJobState::Complete);
  }

  fn fail_resolution(self: &Arc<Self>, state: BuildJobState, context: String, error: ResolveError) {
    if self.state() != state {
      return;
    }
    match error {
      ResolveError::Canceled => {
        self.canceled.store(true, Ordering::Release);
        self.advance_to_state(BuildJobState::Complete);
      }
      ResolveError::Error(message) => self.complete_with_error(format!("{}: {}", context, message)),
    }
  }

  fn scheduler_params(&self) -> SchedulerParams {
    let data = self.data();
    let (total, resolved) = match &data.action {
      Some(action) => {
        let resolved = data.inputs.as_ref().map_or(0, |inputs| {
          action
            .inputs()
            .iter()
            .filter_map(|(key, meta)| inputs.find_input(key).map(|_| meta.raw_size))
            .sum()
        });
        (action.total_input_size(), resolved)
      }
      None => (0, 0),
    };
    SchedulerParams {
      name: data.name.clone(),
      function: data.function.clone(),
      total_input_size: total,
      resolved_input_size: resolved,
      missing_input_size: total.saturating_sub(resolved),
      total_required_memory: data.required_memory,
      priority: self.owner.priority(),
    }
  }

  fn dispatch(self: &Arc<Self>, stage: BuildStage, future: impl Future<Output = ()> + Send + 'static) {
    let step = ScheduledStep::new(stage, self.scheduler_params(), Box::pin(future));
    self.env.scheduler.dispatch(step);
  }

  /// Dispatch a step of the remote path. Skipping it sends the job down the
  /// local path instead.
  fn dispatch_remote(self: &Arc<Self>, stage: BuildStage, future: impl Future<Output = ()> + Send + 'static) {
    let job = self.clone();
    let step =
      ScheduledStep::new(stage, self.scheduler_params(), Box::pin(future)).with_skip(move || job.skip_remote());
    self.env.scheduler.dispatch(step);
  }

  fn skip_remote(self: &Arc<Self>) {
    let state = self.state();
    if matches!(
      state,
      BuildJobState::ExecuteRemote | BuildJobState::ResolveRemoteInputData | BuildJobState::ExecuteRemoteRetry
    ) {
      debug!(name = %self.name(), state = %state, "remote step skipped by scheduler");
      self.advance_to_state(BuildJobState::ResolveInputData);
    }
  }

  fn enter_resolve_key(self: &Arc<Self>) {
    let (key, resolved) = {
      let data = self.data();
      (data.key, data.definition.is_some())
    };
    if resolved {
      return self.advance_to_state(BuildJobState::ResolveInputMeta);
    }
    let Some(key) = key else {
      return self.complete_with_error("Build job has neither a key nor a definition");
    };
    let Some(resolver) = self.env.resolver.clone() else {
      return self.complete_with_error(format!("Failed to resolve key {} due to missing input resolver", key));
    };

    let job = self.clone();
    self.dispatch(BuildStage::ResolveKey, async move {
      match resolver.resolve_key(&key, &job.owner).await {
        Ok(definition) if definition.key() != key => job.complete_with_error(format!(
          "Input resolver returned definition {} for key {}",
          definition.key(),
          key
        )),
        Ok(definition) => {
          let applied = job.apply_if(BuildJobState::ResolveKey, |data| {
            data.name = definition.name().to_string();
            data.function = definition.function().to_string();
            data.definition = Some(definition);
          });
          if applied.is_some() {
            job.advance_to_state(BuildJobState::ResolveInputMeta);
          }
        }
        Err(e) => job.fail_resolution(BuildJobState::ResolveKey, format!("Failed to resolve key {}", key), e),
      }
    });
  }

  fn create_action(&self, definition: &BuildDefinition, metas: Vec<(String, BuildInputMeta)>) -> Result<BuildAction, String> {
    let Some(version) = self.env.functions.find_version(definition.function()) else {
      return Err(format!(
        "Failed to create action for {}: function {} not found",
        definition.name(),
        definition.function()
      ));
    };
    let expected: BTreeSet<&str> = definition.inputs().keys().into_iter().collect();
    let resolved: BTreeSet<&str> = metas.iter().map(|(key, _)| key.as_str()).collect();
    if expected != resolved || resolved.len() != metas.len() {
      return Err(format!(
        "Input metadata for {} covers {:?}, expected {:?}",
        definition.name(),
        resolved,
        expected
      ));
    }

    let fail = |e: super::error::BuilderError| format!("Failed to create action for {}: {}", definition.name(), e);
    let mut builder =
      BuildAction::builder(definition.name(), definition.function(), version, self.env.build_system_version)
        .map_err(fail)?;
    for (key, value) in definition.constants() {
      builder.add_constant(key.clone(), value.clone()).map_err(fail)?;
    }
    for (key, meta) in metas {
      builder.add_input(key, meta.raw_hash, meta.raw_size).map_err(fail)?;
    }
    builder.build().map_err(fail)
  }

  fn install_action(self: &Arc<Self>, action: Result<BuildAction, String>) {
    match action {
      Ok(action) => {
        let applied = self.apply_if(BuildJobState::ResolveInputMeta, |data| {
          trace!(name = %data.name, key = %action.key(), "created action");
          data.action = Some(action);
        });
        if applied.is_some() {
          self.advance_to_state(BuildJobState::CacheQuery);
        }
      }
      Err(message) => {
        if self.state() == BuildJobState::ResolveInputMeta {
          self.complete_with_error(message);
        }
      }
    }
  }

  fn enter_resolve_input_meta(self: &Arc<Self>) {
    let (definition, inputs, has_action) = {
      let data = self.data();
      (data.definition.clone(), data.inputs.clone(), data.action.is_some())
    };
    if has_action {
      return self.advance_to_state(BuildJobState::CacheQuery);
    }
    let Some(definition) = definition else {
      return self.complete_with_error("Build job has no definition to resolve input metadata for");
    };

    if !definition.has_inputs() {
      return self.install_action(self.create_action(&definition, Vec::new()));
    }

    // Inputs supplied with the definition may already cover every key.
    let keys = definition.inputs().keys();
    if let Some(inputs) = inputs.filter(|inputs| keys.iter().all(|key| inputs.contains(key))) {
      let metas = keys
        .iter()
        .filter_map(|key| {
          inputs.find_input(key).map(|buffer| {
            (
              key.to_string(),
              BuildInputMeta {
                raw_hash: buffer.raw_hash(),
                raw_size: buffer.raw_size(),
              },
            )
          })
        })
        .collect();
      return self.install_action(self.create_action(&definition, metas));
    }

    let Some(resolver) = self.env.resolver.clone() else {
      return self.complete_with_error(format!(
        "Failed to resolve input metadata for {} due to missing input resolver",
        definition.name()
      ));
    };
    let job = self.clone();
    self.dispatch(BuildStage::ResolveInputMeta, async move {
      match resolver.resolve_input_meta(&definition, &job.owner).await {
        Ok(metas) => {
          let action = job.create_action(&definition, metas);
          job.install_action(action);
        }
        Err(e) => job.fail_resolution(
          BuildJobState::ResolveInputMeta,
          format!("Failed to resolve input metadata for {}", definition.name()),
          e,
        ),
      }
    });
  }

  /// Check the action against the registry and let the function narrow the
  /// job's policies. Runs once per job.
  fn configure(&self) -> Result<(), String> {
    let (action, build_policy) = {
      let data = self.data();
      if data.configured {
        return Ok(());
      }
      match &data.action {
        Some(action) => (action.clone(), data.build_policy),
        None => return Err("Build job has no action to configure".to_string()),
      }
    };
    let Some(function) = self.env.functions.find(action.function()) else {
      return Err(format!("Failed to build {}: function {} not found", action.name(), action.function()));
    };
    if function.version() != action.function_version() {
      return Err(format!(
        "Failed to build {}: function {} has version {} but the action requires {}",
        action.name(),
        action.function(),
        function.version(),
        action.function_version()
      ));
    }
    if action.build_system_version() != self.env.build_system_version {
      return Err(format!(
        "Failed to build {}: action requires build system version {}, this is {}",
        action.name(),
        action.build_system_version(),
        self.env.build_system_version
      ));
    }

    let mut cache_policy = self.env.cache_policy;
    if !build_policy.contains(BuildPolicy::CACHE_QUERY) {
      cache_policy.remove(CachePolicy::QUERY);
    }
    if !build_policy.contains(BuildPolicy::CACHE_STORE) {
      cache_policy.remove(CachePolicy::STORE);
    }
    let mut context = BuildConfigContext::new(action.constants(), cache_policy, build_policy);
    function.configure(&mut context);
    let (cache_policy, build_policy, required_memory) = context.into_parts();

    let mut data = self.data();
    data.cache_policy = cache_policy;
    data.build_policy = build_policy;
    data.required_memory = required_memory;
    data.implementation = Some(function);
    data.configured = true;
    Ok(())
  }

  /// Cache key of an action: the function name as bucket, the action key as
  /// hash.
  fn cache_key(action: &BuildAction) -> Option<CacheKey> {
    match CacheBucket::new(action.function()) {
      Ok(bucket) => Some(CacheKey::new(bucket, action.key().0)),
      Err(e) => {
        warn!(function = action.function(), error = %e, "function name is not a valid cache bucket");
        None
      }
    }
  }

  /// Cache record policy for `base`, carrying the caller's per-payload data
  /// requirements.
  fn record_policy(&self, base: CachePolicy) -> CacheRecordPolicy {
    let with_skip = |policy: BuildPolicy| {
      if policy.contains(BuildPolicy::SKIP_DATA) {
        base | CachePolicy::SKIP_DATA
      } else {
        base
      }
    };
    self
      .policy
      .overrides()
      .fold(CacheRecordPolicy::new(with_skip(self.policy.default_policy())), |record, (id, policy)| {
        record.with_value(*id, with_skip(policy))
      })
  }

  fn enter_cache_query(self: &Arc<Self>) {
    if let Err(message) = self.configure() {
      return self.complete_with_error(message);
    }
    let (action, query, build_policy, name, function) = {
      let data = self.data();
      let Some(action) = data.action.clone() else {
        drop(data);
        return self.complete_with_error("Build job has no action to query the cache for");
      };
      (
        action,
        data.cache_policy,
        data.build_policy,
        data.name.clone(),
        data.function.clone(),
      )
    };
    // The full policy travels with the query: its store bits select the
    // earlier nodes a remote hit is copied back into.
    let cache = match &self.env.cache {
      Some(cache) if query.intersects(CachePolicy::QUERY) && build_policy.contains(BuildPolicy::CACHE_QUERY) => {
        cache.clone()
      }
      _ => return self.advance_to_state(BuildJobState::ExecuteRemote),
    };
    let Some(key) = Self::cache_key(&action) else {
      return self.advance_to_state(BuildJobState::ExecuteRemote);
    };

    self.data().flags |= BuildStatusFlags::CACHE_QUERY;
    let request = CacheGetRequest {
      name: name.clone(),
      key,
      policy: self.record_policy(query),
      user_data: 0,
    };
    let job = self.clone();
    self.dispatch(BuildStage::CacheQuery, async move {
      let mut response = None;
      cache.get(vec![request], &job.owner, &mut |r| response = Some(r)).await;
      let hit = response.filter(|r| r.status == Status::Ok).and_then(|r| {
        match BuildOutput::from_cache_record(name.clone(), function, &r.record) {
          Ok(output) if !output.has_error() => Some(output),
          Ok(_) => None,
          Err(e) => {
            warn!(name = %name, key = %r.record.key(), error = %e, "ignoring unreadable cache record");
            None
          }
        }
      });
      match hit {
        Some(output) => {
          let applied = job.apply_if(BuildJobState::CacheQuery, |data| {
            data.output = Some(output);
            data.flags |= BuildStatusFlags::CACHE_QUERY_HIT;
          });
          if applied.is_some() {
            job.advance_to_state(BuildJobState::Complete);
          }
        }
        None => {
          if job.state() == BuildJobState::CacheQuery {
            job.advance_to_state(BuildJobState::ExecuteRemote);
          }
        }
      }
    });
  }

  fn enter_execute_remote(self: &Arc<Self>, current: BuildJobState) {
    let (action, inputs, build_policy) = {
      let data = self.data();
      (data.action.clone(), data.inputs.clone(), data.build_policy)
    };
    let Some(action) = action else {
      return self.complete_with_error("Build job has no action to execute");
    };
    if !build_policy.contains(BuildPolicy::BUILD_REMOTE) {
      return self.advance_to_state(BuildJobState::ResolveInputData);
    }
    let Some(worker) =
      self
        .env
        .workers
        .find_worker(action.function(), action.function_version(), action.build_system_version())
    else {
      return self.advance_to_state(BuildJobState::ResolveInputData);
    };

    self.data().flags |= BuildStatusFlags::BUILD_TRY_REMOTE;
    let job = self.clone();
    self.dispatch_remote(BuildStage::ExecuteRemote, async move {
      let result = worker.build_action(&action, inputs.as_ref(), &job.policy, &job.owner).await;
      job.finish_remote(current, &action, result);
    });
  }

  fn finish_remote(self: &Arc<Self>, current: BuildJobState, action: &BuildAction, result: RemoteBuildResult) {
    if self.state() != current {
      return;
    }
    let RemoteBuildResult {
      status,
      output,
      missing_inputs,
    } = result;

    if let Some(output) = output.as_ref().filter(|o| status == Status::Ok && !o.has_error()) {
      let applied = self.apply_if(current, |data| {
        data.output = Some(output.clone());
        data.flags |= BuildStatusFlags::BUILD_REMOTE;
      });
      if applied.is_some() {
        self.advance_to_state(BuildJobState::CacheStore);
      }
      return;
    }

    if current == BuildJobState::ExecuteRemote && output.is_none() && !missing_inputs.is_empty() {
      let applied = self.apply_if(current, |data| {
        let mut missing: Vec<String> = missing_inputs
          .into_iter()
          .filter(|key| {
            let declared = action.find_input(key).is_some();
            if !declared {
              warn!(name = %data.name, input = %key, "remote worker asked for an undeclared input");
            }
            declared && !data.inputs.as_ref().is_some_and(|inputs| inputs.contains(key))
          })
          .collect();
        missing.sort();
        missing.dedup();
        debug!(name = %data.name, missing = ?missing, "remote worker is missing inputs");
        data.missing_remote_inputs = missing;
      });
      if applied.is_some() {
        self.advance_to_state(BuildJobState::ResolveRemoteInputData);
      }
      return;
    }

    if self.data().build_policy.contains(BuildPolicy::BUILD_LOCAL) {
      debug!(name = %action.name(), status = %status, "remote execution failed, building locally");
      return self.advance_to_state(BuildJobState::ResolveInputData);
    }
    match output {
      Some(output) => {
        if self.apply_if(current, |data| data.output = Some(output)).is_some() {
          self.advance_to_state(BuildJobState::Complete);
        }
      }
      None => self.complete_with_error(format!(
        "Failed to build {}: remote execution failed and local execution is not allowed",
        action.name()
      )),
    }
  }

  fn enter_resolve_remote_input_data(self: &Arc<Self>) {
    let missing = self.data().missing_remote_inputs.clone();
    if missing.is_empty() {
      return self.advance_to_state(BuildJobState::ExecuteRemoteRetry);
    }
    self.resolve_input_data(
      BuildStage::ResolveRemoteInputData,
      BuildJobState::ResolveRemoteInputData,
      missing,
      BuildJobState::ExecuteRemoteRetry,
    );
  }

  fn enter_resolve_input_data(self: &Arc<Self>) {
    let (action, inputs, build_policy) = {
      let data = self.data();
      (data.action.clone(), data.inputs.clone(), data.build_policy)
    };
    let Some(action) = action else {
      return self.complete_with_error("Build job has no action to resolve input data for");
    };
    if !build_policy.contains(BuildPolicy::BUILD_LOCAL) {
      return self.complete_with_error(format!(
        "Failed to build {}: no remote worker succeeded and local execution is not allowed",
        action.name()
      ));
    }
    let missing: Vec<String> = action
      .inputs()
      .keys()
      .filter(|key| !inputs.as_ref().is_some_and(|inputs| inputs.contains(key)))
      .cloned()
      .collect();
    if missing.is_empty() {
      return self.advance_to_state(BuildJobState::ExecuteLocal);
    }
    self.resolve_input_data(
      BuildStage::ResolveInputData,
      BuildJobState::ResolveInputData,
      missing,
      BuildJobState::ExecuteLocal,
    );
  }

  /// Resolve the data of `missing`, merge it into the job's inputs and move
  /// on to `next`.
  fn resolve_input_data(
    self: &Arc<Self>,
    stage: BuildStage,
    current: BuildJobState,
    missing: Vec<String>,
    next: BuildJobState,
  ) {
    let (definition, action, name) = {
      let data = self.data();
      (data.definition.clone(), data.action.clone(), data.name.clone())
    };
    let Some(action) = action else {
      return self.complete_with_error("Build job has no action to resolve input data for");
    };
    let Some(resolver) = self.env.resolver.clone() else {
      return self.complete_with_error(format!(
        "Failed to resolve input data for {} due to missing input resolver",
        name
      ));
    };

    let job = self.clone();
    let future = async move {
      let wanted: BTreeSet<String> = missing.into_iter().collect();
      let filter = |key: &str| wanted.contains(key);
      let source = match &definition {
        Some(definition) => InputSource::Definition(definition),
        None => InputSource::Action(&action),
      };
      match resolver.resolve_input_data(source, &filter, &job.owner).await {
        Ok(resolved) => job.merge_inputs(current, next, resolved),
        Err(e) => job.fail_resolution(current, format!("Failed to resolve input data for {}", name), e),
      }
    };
    if stage.is_skippable() {
      self.dispatch_remote(stage, future);
    } else {
      self.dispatch(stage, future);
    }
  }

  fn merge_inputs(self: &Arc<Self>, current: BuildJobState, next: BuildJobState, resolved: Vec<(String, CompressedBuffer)>) {
    let merged = self.apply_if(current, |data| {
      let mut builder = match &data.inputs {
        Some(inputs) => inputs.to_builder(),
        None => BuildInputs::builder(data.name.clone()),
      };
      for (key, buffer) in resolved {
        builder
          .add_input(key, buffer)
          .map_err(|e| format!("Failed to merge resolved inputs of {}: {}", data.name, e))?;
      }
      data.inputs = Some(builder.build());
      Ok::<(), String>(())
    });
    match merged {
      Some(Ok(())) => self.advance_to_state(next),
      Some(Err(message)) => self.complete_with_error(message),
      None => {}
    }
  }

  fn enter_execute_local(self: &Arc<Self>) {
    let (action, inputs, function, name) = {
      let data = self.data();
      (
        data.action.clone(),
        data.inputs.clone(),
        data.implementation.clone(),
        data.name.clone(),
      )
    };
    let (Some(action), Some(function)) = (action, function) else {
      return self.complete_with_error(format!("Failed to build {}: job is not configured", name));
    };
    let inputs = inputs.unwrap_or_else(|| BuildInputs::builder(name).build());
    if let Err(message) = validate_inputs(&action, &inputs) {
      return self.complete_with_error(message);
    }

    self.data().flags |= BuildStatusFlags::BUILD_LOCAL;
    let job = self.clone();
    self.dispatch(BuildStage::ExecuteLocal, async move {
      let mut output = BuildOutput::builder(action.name(), action.function());
      {
        let mut context = BuildContext::new(&action, &inputs, &job.policy, &mut output);
        function.build(&mut context).await;
      }
      let output = output.build();
      let applied = job.apply_if(BuildJobState::ExecuteLocal, |data| data.output = Some(output));
      if applied.is_some() {
        job.advance_to_state(BuildJobState::CacheStore);
      }
    });
  }

  fn enter_cache_store(self: &Arc<Self>) {
    let (output, action, store, build_policy, name) = {
      let data = self.data();
      (
        data.output.clone(),
        data.action.clone(),
        data.cache_policy,
        data.build_policy,
        data.name.clone(),
      )
    };
    let (Some(output), Some(action), Some(cache)) = (output, action, self.env.cache.clone()) else {
      return self.advance_to_state(BuildJobState::Complete);
    };
    if output.has_error() || !store.intersects(CachePolicy::STORE) || !build_policy.contains(BuildPolicy::CACHE_STORE) {
      return self.advance_to_state(BuildJobState::Complete);
    }
    let Some(key) = Self::cache_key(&action) else {
      return self.advance_to_state(BuildJobState::Complete);
    };
    let record = match output.to_cache_record(key) {
      Ok(record) => record,
      Err(e) => {
        warn!(name = %name, error = %e, "failed to convert output to a cache record");
        return self.advance_to_state(BuildJobState::Complete);
      }
    };

    self.data().flags |= BuildStatusFlags::CACHE_STORE;
    let request = CachePutRequest {
      name: name.clone(),
      record,
      policy: CacheRecordPolicy::new(store),
      user_data: 0,
    };
    let job = self.clone();
    self.dispatch(BuildStage::CacheStore, async move {
      let mut status = Status::Error;
      cache.put(vec![request], &job.owner, &mut |r| status = r.status).await;
      if status == Status::Ok {
        job.apply_if(BuildJobState::CacheStore, |data| data.flags |= BuildStatusFlags::CACHE_STORE_HIT);
      } else {
        debug!(name = %name, status = %status, "cache store did not succeed");
      }
      job.advance_to_state(BuildJobState::Complete);
    });
  }

  fn enter_complete(self: &Arc<Self>) {
    let params = {
      let mut data = self.data();
      let canceled = self.canceled.load(Ordering::Acquire);
      let output = match data.output.clone() {
        Some(output) => output,
        None => {
          let mut output = BuildOutput::builder(data.name.clone(), data.function.clone());
          if !canceled {
            output.add_error(BUILD_LOG_CATEGORY, "Build completed without producing an output");
          }
          output.build()
        }
      };
      let status = if canceled {
        Status::Canceled
      } else if output.has_error() {
        Status::Error
      } else {
        Status::Ok
      };
      let output = output.without_data_where(|id| self.policy.skips_data(id));
      data.output = Some(output.clone());
      BuildCompleteParams {
        name: data.name.clone(),
        function: data.function.clone(),
        definition_key: data.key.or_else(|| data.definition.as_ref().map(BuildDefinition::key)),
        action_key: data.action.as_ref().map(BuildAction::key),
        status,
        output,
        flags: data.flags,
      }
    };
    info!(name = %params.name, function = %params.function, status = %params.status, flags = ?params.flags, "build complete");

    self.env.scheduler.end_job(&self.scheduler_params());
    let callback = lock(&self.on_complete).take();
    if let Some(callback) = callback {
      callback(params);
    }
    let id = lock(&self.request_id).take();
    if let Some(id) = id {
      self.owner.end(id);
    }
  }
}

impl OwnedRequest for BuildJob {
  fn cancel(&self) {
    BuildJob::cancel(self);
  }
}

impl fmt::Debug for BuildJob {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BuildJob")
      .field("name", &self.name())
      .field("state", &self.state())
      .finish()
  }
}

/// Every declared input must be present with exactly the declared hash and
/// size.
fn validate_inputs(action: &BuildAction, inputs: &BuildInputs) -> Result<(), String> {
  for (key, meta) in action.inputs() {
    let Some(buffer) = inputs.find_input(key) else {
      return Err(format!("Failed to build {}: input '{}' was not resolved", action.name(), key));
    };
    if buffer.raw_hash() != meta.raw_hash || buffer.raw_size() != meta.raw_size {
      return Err(format!(
        "Failed to build {}: input '{}' is {} ({} bytes) but the action expects {} ({} bytes)",
        action.name(),
        key,
        buffer.raw_hash(),
        buffer.raw_size(),
        meta.raw_hash,
        meta.raw_size
      ));
    }
  }
  Ok(())
}
