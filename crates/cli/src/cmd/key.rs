use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use deriva_lib::build::{BuildAction, BuildDefinition, BuildInputResolver, BuildSystem};
use deriva_lib::request::RequestOwner;

use super::load_definition;
use crate::functions;
use crate::output::{OutputFormat, print_info, print_json, print_stat, truncate_hash};

#[derive(Debug, Serialize)]
struct InputReport {
  raw_hash: String,
  raw_size: u64,
}

#[derive(Debug, Serialize)]
struct KeyReport {
  name: String,
  function: String,
  definition_key: String,
  action_key: String,
  inputs: BTreeMap<String, InputReport>,
}

/// Resolve the definition's inputs and derive the action it would run.
async fn resolve_action(
  system: &BuildSystem,
  resolver: &dyn BuildInputResolver,
  definition: &BuildDefinition,
) -> Result<BuildAction> {
  let owner = RequestOwner::default();
  let metas = resolver
    .resolve_input_meta(definition, &owner)
    .await
    .with_context(|| format!("Failed to resolve inputs of {}", definition.name()))?;

  let mut builder = system.create_action(definition.name(), definition.function())?;
  for (key, value) in definition.constants() {
    builder.add_constant(key.clone(), value.clone())?;
  }
  for (key, meta) in metas {
    builder.add_input(key, meta.raw_hash, meta.raw_size)?;
  }
  Ok(builder.build()?)
}

pub async fn cmd_key(path: &Path, output: OutputFormat) -> Result<()> {
  let (definition, resolver) = load_definition(path)?;
  let system = BuildSystem::new(functions::registry());
  let action = resolve_action(&system, resolver.as_ref(), &definition).await?;

  let report = KeyReport {
    name: definition.name().to_string(),
    function: definition.function().to_string(),
    definition_key: definition.key().to_string(),
    action_key: action.key().to_string(),
    inputs: action
      .inputs()
      .iter()
      .map(|(key, meta)| {
        let input = InputReport {
          raw_hash: meta.raw_hash.to_string(),
          raw_size: meta.raw_size,
        };
        (key.clone(), input)
      })
      .collect(),
  };

  if output.is_json() {
    print_json(&report)?;
  } else {
    print_info(&format!("{} ({})", report.name, report.function));
    print_stat("Definition key", &report.definition_key);
    print_stat("Action key", &report.action_key);
    for (key, input) in &report.inputs {
      print_stat(
        &format!("Input {}", key),
        &format!("{} ({} bytes)", truncate_hash(&input.raw_hash), input.raw_size),
      );
    }
  }

  Ok(())
}
