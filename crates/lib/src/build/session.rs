//! Build sessions.
//!
//! A session groups jobs that share an input resolver, a cache and a default
//! cache policy. It is cheap to clone and every job holds what it needs, so a
//! session may be dropped while its jobs are still running.

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::debug;

use super::action::BuildAction;
use super::definition::BuildDefinition;
use super::error::SessionError;
use super::inputs::BuildInputs;
use super::job::{BuildCompleteParams, BuildJob, JobEnvironment, JobSeed};
use super::key::BuildKey;
use super::policy::BuildRequestPolicy;
use super::resolver::BuildInputResolver;
use crate::cache::{CachePolicy, CacheStore};
use crate::request::RequestOwner;

#[derive(Clone)]
pub struct BuildSession {
  name: String,
  env: JobEnvironment,
}

impl BuildSession {
  pub(crate) fn new(name: impl Into<String>, env: JobEnvironment) -> Self {
    Self { name: name.into(), env }
  }

  pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
    self.env.cache = Some(cache);
    self
  }

  pub fn with_resolver(mut self, resolver: Arc<dyn BuildInputResolver>) -> Self {
    self.env.resolver = Some(resolver);
    self
  }

  /// Cache policy every job starts from, before build policy and function
  /// configuration narrow it. Defaults to [`CachePolicy::DEFAULT`].
  pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
    self.env.cache_policy = policy;
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn cache(&self) -> Option<&Arc<dyn CacheStore>> {
    self.env.cache.as_ref()
  }

  pub fn resolver(&self) -> Option<&Arc<dyn BuildInputResolver>> {
    self.env.resolver.as_ref()
  }

  fn start(
    &self,
    seed: JobSeed,
    owner: &RequestOwner,
    policy: BuildRequestPolicy,
    on_complete: impl FnOnce(BuildCompleteParams) + Send + 'static,
  ) -> Arc<BuildJob> {
    let job = BuildJob::new(self.env.clone(), seed, owner.clone(), policy, Box::new(on_complete));
    debug!(session = %self.name, job = %job.name(), "starting build job");
    job.start();
    job
  }

  /// Build the definition stored under `key`. The resolver must know the key.
  pub fn build_key(
    &self,
    key: BuildKey,
    owner: &RequestOwner,
    policy: impl Into<BuildRequestPolicy>,
    on_complete: impl FnOnce(BuildCompleteParams) + Send + 'static,
  ) -> Arc<BuildJob> {
    self.start(JobSeed::Key(key), owner, policy.into(), on_complete)
  }

  /// Build `definition`. Inputs that are supplied here are not resolved again.
  pub fn build_definition(
    &self,
    definition: BuildDefinition,
    inputs: Option<BuildInputs>,
    owner: &RequestOwner,
    policy: impl Into<BuildRequestPolicy>,
    on_complete: impl FnOnce(BuildCompleteParams) + Send + 'static,
  ) -> Arc<BuildJob> {
    self.start(JobSeed::Definition(definition, inputs), owner, policy.into(), on_complete)
  }

  /// Build `action`. Inputs may be partial; whatever is missing is resolved
  /// when a local build needs it.
  pub fn build_action(
    &self,
    action: BuildAction,
    inputs: Option<BuildInputs>,
    owner: &RequestOwner,
    policy: impl Into<BuildRequestPolicy>,
    on_complete: impl FnOnce(BuildCompleteParams) + Send + 'static,
  ) -> Arc<BuildJob> {
    self.start(JobSeed::Action(action, inputs), owner, policy.into(), on_complete)
  }

  async fn wait(job: Arc<BuildJob>, rx: oneshot::Receiver<BuildCompleteParams>) -> Result<BuildCompleteParams, SessionError> {
    rx.await.map_err(|_| SessionError::Abandoned(job.name()))
  }

  pub async fn build_key_async(
    &self,
    key: BuildKey,
    owner: &RequestOwner,
    policy: impl Into<BuildRequestPolicy>,
  ) -> Result<BuildCompleteParams, SessionError> {
    let (tx, rx) = oneshot::channel();
    let job = self.build_key(key, owner, policy, move |params| {
      let _ = tx.send(params);
    });
    Self::wait(job, rx).await
  }

  pub async fn build_definition_async(
    &self,
    definition: BuildDefinition,
    inputs: Option<BuildInputs>,
    owner: &RequestOwner,
    policy: impl Into<BuildRequestPolicy>,
  ) -> Result<BuildCompleteParams, SessionError> {
    let (tx, rx) = oneshot::channel();
    let job = self.build_definition(definition, inputs, owner, policy, move |params| {
      let _ = tx.send(params);
    });
    Self::wait(job, rx).await
  }

  pub async fn build_action_async(
    &self,
    action: BuildAction,
    inputs: Option<BuildInputs>,
    owner: &RequestOwner,
    policy: impl Into<BuildRequestPolicy>,
  ) -> Result<BuildCompleteParams, SessionError> {
    let (tx, rx) = oneshot::channel();
    let job = self.build_action(action, inputs, owner, policy, move |params| {
      let _ = tx.send(params);
    });
    Self::wait(job, rx).await
  }
}

impl std::fmt::Debug for BuildSession {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("BuildSession")
      .field("name", &self.name)
      .field("cache", &self.env.cache.is_some())
      .field("resolver", &self.env.resolver.is_some())
      .field("cache_policy", &self.env.cache_policy)
      .finish()
  }
}
