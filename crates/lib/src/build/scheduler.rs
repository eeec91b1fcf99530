//! Build schedulers.
//!
//! A job hands every asynchronous stage to its [`BuildScheduler`] as a
//! [`ScheduledStep`]. The scheduler decides when and where the step runs; the
//! step itself re-enters the job when it finishes. Steps for
//! [`BuildStage::ExecuteRemote`] and [`BuildStage::ResolveRemoteInputData`]
//! may instead be skipped, which sends the job down the local path.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::trace;

use crate::request::Priority;

/// Asynchronous stages of a build job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BuildStage {
  ResolveKey,
  ResolveInputMeta,
  CacheQuery,
  ExecuteRemote,
  ResolveRemoteInputData,
  ResolveInputData,
  ExecuteLocal,
  CacheStore,
}

impl BuildStage {
  /// True if the scheduler may skip the step instead of running it.
  pub fn is_skippable(self) -> bool {
    matches!(self, BuildStage::ExecuteRemote | BuildStage::ResolveRemoteInputData)
  }
}

impl fmt::Display for BuildStage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Debug::fmt(self, f)
  }
}

/// Snapshot of a job's resource estimates at dispatch time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerParams {
  pub name: String,
  pub function: String,
  /// Raw size of every declared input.
  pub total_input_size: u64,
  /// Raw size of the inputs already resolved.
  pub resolved_input_size: u64,
  /// Raw size of the inputs still to be resolved.
  pub missing_input_size: u64,
  /// Estimated peak memory of a local build, as declared by the function.
  pub total_required_memory: u64,
  pub priority: Priority,
}

/// One stage of one job, ready to run.
pub struct ScheduledStep {
  stage: BuildStage,
  params: SchedulerParams,
  future: BoxFuture<'static, ()>,
  skip: Option<Box<dyn FnOnce() + Send>>,
}

impl ScheduledStep {
  pub(crate) fn new(stage: BuildStage, params: SchedulerParams, future: BoxFuture<'static, ()>) -> Self {
    Self {
      stage,
      params,
      future,
      skip: None,
    }
  }

  pub(crate) fn with_skip(mut self, skip: impl FnOnce() + Send + 'static) -> Self {
    self.skip = Some(Box::new(skip));
    self
  }

  pub fn stage(&self) -> BuildStage {
    self.stage
  }

  pub fn params(&self) -> &SchedulerParams {
    &self.params
  }

  /// Run the step to completion.
  pub async fn run(self) {
    self.future.await
  }

  /// Skip the step. Gives the step back for stages that cannot be skipped.
  pub fn skip(self) -> Result<(), ScheduledStep> {
    if !self.stage.is_skippable() {
      return Err(self);
    }
    match self.skip {
      Some(skip) => {
        skip();
        Ok(())
      }
      None => Err(Self { skip: None, ..self }),
    }
  }
}

impl fmt::Debug for ScheduledStep {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ScheduledStep")
      .field("stage", &self.stage)
      .field("params", &self.params)
      .finish()
  }
}

pub trait BuildScheduler: Send + Sync {
  fn begin_job(&self, _params: &SchedulerParams) {}

  fn end_job(&self, _params: &SchedulerParams) {}

  /// Run `step` now or later. Every step must eventually be run or skipped.
  fn dispatch(&self, step: ScheduledStep);
}

/// Runs every step to completion on the dispatching thread.
///
/// A job driven by this scheduler completes before the call that started it
/// returns, provided its collaborators finish without outside help.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineScheduler;

impl BuildScheduler for InlineScheduler {
  fn dispatch(&self, step: ScheduledStep) {
    trace!(stage = %step.stage(), name = %step.params().name, "running step inline");
    futures::executor::block_on(step.run());
  }
}

const MEMORY_UNIT: u64 = 1 << 20;

/// Spawns steps onto a tokio runtime.
///
/// Local executions are bounded by `parallelism`. When a memory budget is set,
/// local executions also hold permits for their declared memory, so that the
/// sum of concurrent estimates stays under the budget. Blocking-priority jobs
/// bypass the memory gate.
pub struct TokioScheduler {
  handle: Handle,
  local: Arc<Semaphore>,
  memory: Option<(Arc<Semaphore>, u32)>,
  active_jobs: AtomicUsize,
}

impl TokioScheduler {
  pub fn new(handle: Handle, parallelism: usize, memory_budget: u64) -> Self {
    let memory = (memory_budget > 0).then(|| {
      let units = (memory_budget / MEMORY_UNIT).clamp(1, u64::from(u32::MAX >> 3)) as u32;
      (Arc::new(Semaphore::new(units as usize)), units)
    });
    Self {
      handle,
      local: Arc::new(Semaphore::new(parallelism.max(1))),
      memory,
      active_jobs: AtomicUsize::new(0),
    }
  }

  /// Jobs between `begin_job` and `end_job`.
  pub fn active_jobs(&self) -> usize {
    self.active_jobs.load(Ordering::Relaxed)
  }
}

impl BuildScheduler for TokioScheduler {
  fn begin_job(&self, _params: &SchedulerParams) {
    self.active_jobs.fetch_add(1, Ordering::Relaxed);
  }

  fn end_job(&self, _params: &SchedulerParams) {
    self.active_jobs.fetch_sub(1, Ordering::Relaxed);
  }

  fn dispatch(&self, step: ScheduledStep) {
    if step.stage() != BuildStage::ExecuteLocal {
      self.handle.spawn(step.run());
      return;
    }

    let local = self.local.clone();
    let memory = match &self.memory {
      Some((semaphore, budget)) if step.params().priority != Priority::Blocking => {
        let wanted = step.params().total_required_memory.div_ceil(MEMORY_UNIT);
        let units = wanted.clamp(0, u64::from(*budget)) as u32;
        (units > 0).then(|| (semaphore.clone(), units))
      }
      _ => None,
    };
    self.handle.spawn(async move {
      // The semaphores are never closed, so acquiring cannot fail.
      let _local = local.acquire_owned().await.ok();
      let _memory = match memory {
        Some((semaphore, units)) => semaphore.acquire_many_owned(units).await.ok(),
        None => None,
      };
      trace!(name = %step.params().name, "running local build");
      step.run().await;
    });
  }
}

impl fmt::Debug for TokioScheduler {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TokioScheduler")
      .field("local_permits", &self.local.available_permits())
      .field("active_jobs", &self.active_jobs())
      .finish()
  }
}
