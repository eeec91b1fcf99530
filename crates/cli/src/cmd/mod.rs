mod build;
mod cache;
mod key;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use deriva_lib::build::{BuildDefinition, MemoryInputResolver};
use deriva_lib::config::DerivaConfig;

pub use build::{BuildArgs, cmd_build};
pub use cache::cmd_cache_stats;
pub use key::cmd_key;

/// Load the config at `path`, or the per-user config when none is given.
pub fn load_config(path: Option<&Path>) -> Result<DerivaConfig> {
  let path = path.map(Path::to_path_buf).unwrap_or_else(DerivaConfig::default_path);
  DerivaConfig::load_or_default(&path).with_context(|| format!("Failed to load config from {}", path.display()))
}

/// Read a definition file and a resolver whose relative file inputs are
/// looked up next to it. The definition is named after the file stem.
pub fn load_definition(path: &Path) -> Result<(BuildDefinition, Arc<MemoryInputResolver>)> {
  let bytes = std::fs::read(path).with_context(|| format!("Failed to read definition {}", path.display()))?;
  let name = path
    .file_stem()
    .map(|stem| stem.to_string_lossy().into_owned())
    .unwrap_or_else(|| "definition".to_string());
  let definition =
    BuildDefinition::try_load(name, &bytes).with_context(|| format!("Invalid definition {}", path.display()))?;

  let root = match path.parent() {
    Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
    _ => PathBuf::from("."),
  };
  Ok((definition, Arc::new(MemoryInputResolver::new().with_file_root(root))))
}
