//! Build system bootstrap.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use super::action::{BuildAction, BuildActionBuilder};
use super::definition::{BuildDefinition, BuildDefinitionBuilder};
use super::error::BuilderError;
use super::function::BuildFunctionRegistry;
use super::job::JobEnvironment;
use super::scheduler::{BuildScheduler, InlineScheduler};
use super::session::BuildSession;
use super::worker::{BuildWorkerRegistry, NoWorkers};
use crate::cache::CachePolicy;
use crate::consts::BUILD_SYSTEM_VERSION;

/// Process-wide build state: the function and worker registries and the
/// scheduler every session dispatches through.
///
/// Construct one at startup and hand it to whatever creates sessions.
#[derive(Clone)]
pub struct BuildSystem {
  functions: Arc<BuildFunctionRegistry>,
  workers: Arc<dyn BuildWorkerRegistry>,
  scheduler: Arc<dyn BuildScheduler>,
}

impl BuildSystem {
  /// A system with no remote workers that runs every step inline.
  pub fn new(functions: BuildFunctionRegistry) -> Self {
    Self {
      functions: Arc::new(functions),
      workers: Arc::new(NoWorkers),
      scheduler: Arc::new(InlineScheduler),
    }
  }

  pub fn with_workers(mut self, workers: Arc<dyn BuildWorkerRegistry>) -> Self {
    self.workers = workers;
    self
  }

  pub fn with_scheduler(mut self, scheduler: Arc<dyn BuildScheduler>) -> Self {
    self.scheduler = scheduler;
    self
  }

  /// Version stored in every action this system creates.
  pub fn version(&self) -> Uuid {
    BUILD_SYSTEM_VERSION
  }

  pub fn functions(&self) -> &BuildFunctionRegistry {
    &self.functions
  }

  pub fn create_definition(
    &self,
    name: impl Into<String>,
    function: impl Into<String>,
  ) -> Result<BuildDefinitionBuilder, BuilderError> {
    BuildDefinition::builder(name, function)
  }

  /// Action builder for the registered version of `function`.
  pub fn create_action(
    &self,
    name: impl Into<String>,
    function: impl Into<String>,
  ) -> Result<BuildActionBuilder, BuilderError> {
    let function = function.into();
    let Some(version) = self.functions.find_version(&function) else {
      return Err(BuilderError::UnknownFunction(function));
    };
    BuildAction::builder(name, function, version, self.version())
  }

  pub fn create_session(&self, name: impl Into<String>) -> BuildSession {
    BuildSession::new(
      name,
      JobEnvironment {
        functions: self.functions.clone(),
        workers: self.workers.clone(),
        scheduler: self.scheduler.clone(),
        cache: None,
        resolver: None,
        cache_policy: CachePolicy::DEFAULT,
        build_system_version: self.version(),
      },
    )
  }
}

impl fmt::Debug for BuildSystem {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BuildSystem")
      .field("version", &self.version())
      .field("functions", &self.functions)
      .finish()
  }
}
