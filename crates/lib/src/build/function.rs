//! Build functions and the contexts they run in.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use super::action::BuildAction;
use super::error::RegistryError;
use super::inputs::BuildInputs;
use super::key::{ValueId, is_valid_function_name};
use super::output::BuildOutputBuilder;
use super::policy::{BuildPolicy, BuildRequestPolicy};
use crate::buffer::{BufferError, CompressedBuffer};
use crate::cache::CachePolicy;

/// Context passed to [`BuildFunction::configure`] before a job queries the
/// cache.
///
/// A function can narrow the cache and build policy of the job (for example to
/// forbid remote execution) and declare how much memory a local build needs.
pub struct BuildConfigContext<'a> {
  constants: &'a BTreeMap<String, Value>,
  cache_policy: CachePolicy,
  build_policy: BuildPolicy,
  required_memory: u64,
}

impl<'a> BuildConfigContext<'a> {
  pub(crate) fn new(constants: &'a BTreeMap<String, Value>, cache_policy: CachePolicy, build_policy: BuildPolicy) -> Self {
    Self {
      constants,
      cache_policy,
      build_policy,
      required_memory: 0,
    }
  }

  pub fn find_constant(&self, key: &str) -> Option<&Value> {
    self.constants.get(key)
  }

  pub fn cache_policy(&self) -> CachePolicy {
    self.cache_policy
  }

  pub fn build_policy(&self) -> BuildPolicy {
    self.build_policy
  }

  /// Clear every cache policy flag not in `mask`.
  pub fn set_cache_policy_mask(&mut self, mask: CachePolicy) {
    self.cache_policy = self.cache_policy & mask;
  }

  /// Clear every build policy flag not in `mask`.
  pub fn set_build_policy_mask(&mut self, mask: BuildPolicy) {
    self.build_policy = self.build_policy & mask;
  }

  /// Estimated peak memory of a local build, in bytes.
  pub fn set_required_memory(&mut self, bytes: u64) {
    self.required_memory = bytes;
  }

  pub(crate) fn into_parts(self) -> (CachePolicy, BuildPolicy, u64) {
    (self.cache_policy, self.build_policy, self.required_memory)
  }
}

/// Context passed to [`BuildFunction::build`].
///
/// Gives access to the action's constants and resolved inputs and collects
/// payloads and diagnostics into the output.
pub struct BuildContext<'a> {
  action: &'a BuildAction,
  inputs: &'a BuildInputs,
  policy: &'a BuildRequestPolicy,
  output: &'a mut BuildOutputBuilder,
}

impl<'a> BuildContext<'a> {
  pub(crate) fn new(
    action: &'a BuildAction,
    inputs: &'a BuildInputs,
    policy: &'a BuildRequestPolicy,
    output: &'a mut BuildOutputBuilder,
  ) -> Self {
    Self {
      action,
      inputs,
      policy,
      output,
    }
  }

  pub fn name(&self) -> &str {
    self.action.name()
  }

  pub fn find_constant(&self, key: &str) -> Option<&Value> {
    self.action.find_constant(key)
  }

  pub fn find_input(&self, key: &str) -> Option<&CompressedBuffer> {
    self.inputs.find_input(key)
  }

  /// Decompressed bytes of input `key`, or `None` if there is no such input.
  pub fn input_bytes(&self, key: &str) -> Option<Result<Vec<u8>, BufferError>> {
    self.inputs.find_input(key).map(CompressedBuffer::decompress)
  }

  /// Sorted keys of every input.
  pub fn input_keys(&self) -> Vec<&str> {
    self.action.inputs().keys().map(String::as_str).collect()
  }

  /// True if the caller does not need the data of payload `id`.
  ///
  /// Functions may still produce the payload; this is a hint to skip work
  /// that only serves the bytes.
  pub fn skips_data(&self, id: &ValueId) -> bool {
    self.policy.skips_data(id)
  }

  pub fn add_payload(&mut self, id: ValueId, data: CompressedBuffer) {
    if let Err(e) = self.output.add_payload(id, data) {
      self.output.add_error(crate::consts::BUILD_LOG_CATEGORY, e.to_string());
    }
  }

  pub fn set_meta(&mut self, meta: Value) {
    self.output.set_meta(meta);
  }

  pub fn add_error(&mut self, category: impl Into<String>, message: impl Into<String>) {
    self.output.add_error(category, message);
  }

  pub fn add_warning(&mut self, category: impl Into<String>, message: impl Into<String>) {
    self.output.add_warning(category, message);
  }

  pub fn has_error(&self) -> bool {
    self.output.has_error()
  }
}

/// A named, versioned build function.
///
/// Changing what a function produces for the same action must come with a new
/// [`version`](BuildFunction::version), because the version is part of the
/// action key and therefore of the cache key.
#[async_trait]
pub trait BuildFunction: Send + Sync {
  fn name(&self) -> &str;

  fn version(&self) -> Uuid;

  fn configure(&self, _context: &mut BuildConfigContext<'_>) {}

  /// Produce the output. The job waits for the returned future, so a
  /// function may finish asynchronously.
  async fn build(&self, context: &mut BuildContext<'_>);
}

/// Map from function name to implementation.
#[derive(Clone, Default)]
pub struct BuildFunctionRegistry {
  functions: HashMap<String, Arc<dyn BuildFunction>>,
}

impl BuildFunctionRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&mut self, function: Arc<dyn BuildFunction>) -> Result<(), RegistryError> {
    let name = function.name().to_string();
    if !is_valid_function_name(&name) {
      return Err(RegistryError::InvalidFunctionName(name));
    }
    if function.version().is_nil() {
      return Err(RegistryError::ZeroVersion(name));
    }
    if self.functions.contains_key(&name) {
      return Err(RegistryError::DuplicateFunction(name));
    }
    self.functions.insert(name, function);
    Ok(())
  }

  pub fn find(&self, name: &str) -> Option<Arc<dyn BuildFunction>> {
    self.functions.get(name).cloned()
  }

  pub fn find_version(&self, name: &str) -> Option<Uuid> {
    self.functions.get(name).map(|f| f.version())
  }

  /// Registered names in sorted order.
  pub fn names(&self) -> Vec<&str> {
    let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
    names.sort_unstable();
    names
  }
}

impl fmt::Debug for BuildFunctionRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BuildFunctionRegistry").field("functions", &self.names()).finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::build::BuildOutput;
  use crate::consts::BUILD_SYSTEM_VERSION;

  struct Upper;

  #[async_trait]
  impl BuildFunction for Upper {
    fn name(&self) -> &str {
      "Upper"
    }

    fn version(&self) -> Uuid {
      Uuid::from_u128(0x55)
    }

    fn configure(&self, context: &mut BuildConfigContext<'_>) {
      context.set_build_policy_mask(BuildPolicy::BUILD_LOCAL | BuildPolicy::CACHE);
      context.set_required_memory(1024);
    }

    async fn build(&self, context: &mut BuildContext<'_>) {
      let Some(Ok(bytes)) = context.input_bytes("src") else {
        context.add_error("Upper", "missing input");
        return;
      };
      context.add_payload(ValueId::from_name("Out"), CompressedBuffer::from_raw(bytes.to_ascii_uppercase()));
    }
  }

  struct Named(&'static str, u128);

  #[async_trait]
  impl BuildFunction for Named {
    fn name(&self) -> &str {
      self.0
    }

    fn version(&self) -> Uuid {
      Uuid::from_u128(self.1)
    }

    async fn build(&self, _context: &mut BuildContext<'_>) {}
  }

  #[test]
  fn registry_rejects_bad_functions() {
    let mut registry = BuildFunctionRegistry::new();
    registry.register(Arc::new(Upper)).unwrap();
    assert_eq!(
      registry.register(Arc::new(Named("Upper", 1))),
      Err(RegistryError::DuplicateFunction("Upper".to_string()))
    );
    assert_eq!(
      registry.register(Arc::new(Named("not valid", 1))),
      Err(RegistryError::InvalidFunctionName("not valid".to_string()))
    );
    assert_eq!(
      registry.register(Arc::new(Named("Zero", 0))),
      Err(RegistryError::ZeroVersion("Zero".to_string()))
    );
    assert_eq!(registry.find_version("Upper"), Some(Uuid::from_u128(0x55)));
    assert_eq!(registry.names(), vec!["Upper"]);
  }

  #[test]
  fn configure_narrows_policies() {
    let constants = BTreeMap::new();
    let mut context = BuildConfigContext::new(&constants, CachePolicy::DEFAULT, BuildPolicy::DEFAULT);
    Upper.configure(&mut context);
    let (cache, build, memory) = context.into_parts();
    assert_eq!(cache, CachePolicy::DEFAULT);
    assert_eq!(build, BuildPolicy::BUILD_LOCAL | BuildPolicy::CACHE);
    assert_eq!(memory, 1024);
  }

  #[tokio::test]
  async fn build_context_collects_payloads() {
    let source = CompressedBuffer::from_raw(b"abc");
    let mut action = BuildAction::builder("x", "Upper", Uuid::from_u128(0x55), BUILD_SYSTEM_VERSION).unwrap();
    action.add_input("src", source.raw_hash(), source.raw_size()).unwrap();
    let action = action.build().unwrap();
    let mut inputs = BuildInputs::builder("x");
    inputs.add_input("src", source).unwrap();
    let inputs = inputs.build();

    let policy = BuildRequestPolicy::default();
    let mut output = BuildOutput::builder("x", "Upper");
    {
      let mut context = BuildContext::new(&action, &inputs, &policy, &mut output);
      assert_eq!(context.input_keys(), vec!["src"]);
      Upper.build(&mut context).await;
    }
    let output = output.build();
    let payload = output.find_payload(&ValueId::from_name("Out")).unwrap();
    assert_eq!(payload.data.as_ref().unwrap().decompress().unwrap(), b"ABC");
  }
}
