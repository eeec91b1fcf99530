//! Remote build workers.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use super::action::BuildAction;
use super::inputs::BuildInputs;
use super::output::BuildOutput;
use super::policy::BuildRequestPolicy;
use crate::request::{RequestOwner, Status};

/// Result of one remote build attempt.
#[derive(Debug, Clone)]
pub struct RemoteBuildResult {
  pub status: Status,
  /// Present when the worker produced an output, including error outputs.
  pub output: Option<BuildOutput>,
  /// Input keys the worker needs before it can build. Only meaningful when
  /// `output` is `None`.
  pub missing_inputs: Vec<String>,
}

impl RemoteBuildResult {
  pub fn built(output: BuildOutput) -> Self {
    Self {
      status: if output.has_error() { Status::Error } else { Status::Ok },
      output: Some(output),
      missing_inputs: Vec::new(),
    }
  }

  pub fn missing(keys: Vec<String>) -> Self {
    Self {
      status: Status::Error,
      output: None,
      missing_inputs: keys,
    }
  }

  pub fn failed() -> Self {
    Self {
      status: Status::Error,
      output: None,
      missing_inputs: Vec::new(),
    }
  }
}

/// Executes actions somewhere other than the current process.
#[async_trait]
pub trait BuildWorker: Send + Sync {
  /// Build `action` with whatever inputs are available locally.
  ///
  /// `inputs` may be partial; the worker reports the keys it could not find
  /// elsewhere through [`RemoteBuildResult::missing_inputs`].
  async fn build_action(
    &self,
    action: &BuildAction,
    inputs: Option<&BuildInputs>,
    policy: &BuildRequestPolicy,
    owner: &RequestOwner,
  ) -> RemoteBuildResult;
}

/// Finds a worker able to run a given function version.
pub trait BuildWorkerRegistry: Send + Sync {
  fn find_worker(&self, function: &str, function_version: Uuid, build_system_version: Uuid) -> Option<Arc<dyn BuildWorker>>;
}

/// A registry with no workers; every build falls back to local execution.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoWorkers;

impl BuildWorkerRegistry for NoWorkers {
  fn find_worker(&self, _function: &str, _function_version: Uuid, _build_system_version: Uuid) -> Option<Arc<dyn BuildWorker>> {
    None
  }
}

/// Registry of workers keyed by exact function name and versions.
#[derive(Default, Clone)]
pub struct StaticWorkerRegistry {
  workers: Vec<(String, Uuid, Uuid, Arc<dyn BuildWorker>)>,
}

impl StaticWorkerRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(
    &mut self,
    function: impl Into<String>,
    function_version: Uuid,
    build_system_version: Uuid,
    worker: Arc<dyn BuildWorker>,
  ) -> &mut Self {
    self
      .workers
      .push((function.into(), function_version, build_system_version, worker));
    self
  }
}

impl BuildWorkerRegistry for StaticWorkerRegistry {
  fn find_worker(&self, function: &str, function_version: Uuid, build_system_version: Uuid) -> Option<Arc<dyn BuildWorker>> {
    self
      .workers
      .iter()
      .find(|(name, fv, bsv, _)| name == function && *fv == function_version && *bsv == build_system_version)
      .map(|(_, _, _, worker)| worker.clone())
  }
}

impl fmt::Debug for StaticWorkerRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_list()
      .entries(self.workers.iter().map(|(name, fv, bsv, _)| (name, fv, bsv)))
      .finish()
  }
}
