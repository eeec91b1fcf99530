//! Process configuration.
//!
//! A [`DerivaConfig`] describes how to bootstrap the engine: how many local
//! builds may run at once and which cache stores make up the hierarchy. It is
//! read from JSON and then overlaid with environment variables:
//!
//! - `DERIVA_CACHE_DIR` sets the root of every filesystem node without a path
//! - `DERIVA_PARALLELISM` overrides `scheduler.parallelism`

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::debug;

use crate::build::TokioScheduler;
use crate::cache::{CacheStore, CacheStoreFlags, CacheStoreHierarchy, FileSystemCacheStore, MemoryCacheStore};
use crate::paths;

pub const CACHE_DIR_ENV: &str = "DERIVA_CACHE_DIR";
pub const PARALLELISM_ENV: &str = "DERIVA_PARALLELISM";

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read config {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse config {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("invalid value '{value}' for {name}")]
  InvalidEnv { name: &'static str, value: String },

  #[error("cache node '{0}' has no flags")]
  NoFlags(String),

  #[error("duplicate cache node name '{0}'")]
  DuplicateNode(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
  /// Concurrent local builds. Zero means the available parallelism.
  pub parallelism: usize,
  /// Budget in bytes for the declared memory of concurrent local builds.
  /// Zero means unlimited.
  pub memory_budget: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheNodeKind {
  Memory,
  Filesystem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheNodeFlag {
  Local,
  Remote,
  Query,
  Store,
  StopStore,
}

impl From<CacheNodeFlag> for CacheStoreFlags {
  fn from(flag: CacheNodeFlag) -> Self {
    match flag {
      CacheNodeFlag::Local => CacheStoreFlags::LOCAL,
      CacheNodeFlag::Remote => CacheStoreFlags::REMOTE,
      CacheNodeFlag::Query => CacheStoreFlags::QUERY,
      CacheNodeFlag::Store => CacheStoreFlags::STORE,
      CacheNodeFlag::StopStore => CacheStoreFlags::STOP_STORE,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheNodeConfig {
  /// Defaults to the kind followed by the node's position.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  pub kind: CacheNodeKind,
  /// Root of a filesystem node.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub path: Option<PathBuf>,
  /// Maximum record count of a memory node.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub capacity: Option<usize>,
  pub flags: Vec<CacheNodeFlag>,
}

impl CacheNodeConfig {
  pub fn store_flags(&self) -> CacheStoreFlags {
    self
      .flags
      .iter()
      .fold(CacheStoreFlags::NONE, |flags, flag| flags | CacheStoreFlags::from(*flag))
  }

  /// The configured name, or the kind followed by `index`.
  pub fn node_name(&self, index: usize) -> String {
    self.name.clone().unwrap_or_else(|| match self.kind {
      CacheNodeKind::Memory => format!("memory{}", index),
      CacheNodeKind::Filesystem => format!("filesystem{}", index),
    })
  }

  /// Root directory of a filesystem node.
  pub fn root(&self) -> PathBuf {
    self.path.clone().unwrap_or_else(paths::cache_dir)
  }

  fn local(kind: CacheNodeKind) -> Self {
    Self {
      name: None,
      kind,
      path: None,
      capacity: None,
      flags: vec![CacheNodeFlag::Local, CacheNodeFlag::Query, CacheNodeFlag::Store],
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DerivaConfig {
  pub scheduler: SchedulerConfig,
  pub cache: Vec<CacheNodeConfig>,
}

impl Default for DerivaConfig {
  /// An in-memory node in front of a filesystem node in the data directory.
  fn default() -> Self {
    Self {
      scheduler: SchedulerConfig::default(),
      cache: vec![
        CacheNodeConfig::local(CacheNodeKind::Memory),
        CacheNodeConfig::local(CacheNodeKind::Filesystem),
      ],
    }
  }
}

impl DerivaConfig {
  /// `config.json` in the per-user configuration directory.
  pub fn default_path() -> PathBuf {
    paths::config_dir().join("config.json")
  }

  /// Read `path` and overlay the environment.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    let mut config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })?;
    debug!(path = %path.display(), nodes = config.cache.len(), "loaded config");
    config.apply_env()?;
    Ok(config)
  }

  /// Load `path` if it exists, otherwise start from the defaults.
  pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
    if path.exists() {
      return Self::load(path);
    }
    let mut config = Self::default();
    config.apply_env()?;
    Ok(config)
  }

  pub fn apply_env(&mut self) -> Result<(), ConfigError> {
    if let Ok(value) = std::env::var(PARALLELISM_ENV) {
      self.scheduler.parallelism = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        name: PARALLELISM_ENV,
        value: value.clone(),
      })?;
    }
    if let Some(dir) = std::env::var_os(CACHE_DIR_ENV).filter(|v| !v.is_empty()) {
      let dir = PathBuf::from(dir);
      for node in self.cache.iter_mut().filter(|n| n.kind == CacheNodeKind::Filesystem) {
        if node.path.is_none() {
          node.path = Some(dir.clone());
        }
      }
    }
    Ok(())
  }

  /// Effective local build parallelism.
  pub fn parallelism(&self) -> usize {
    match self.scheduler.parallelism {
      0 => thread::available_parallelism().map_or(1, |n| n.get()),
      n => n,
    }
  }

  pub fn build_scheduler(&self, handle: Handle) -> TokioScheduler {
    TokioScheduler::new(handle, self.parallelism(), self.scheduler.memory_budget)
  }

  /// Build the cache hierarchy described by the node list, in order.
  pub async fn build_cache(&self) -> Result<CacheStoreHierarchy, ConfigError> {
    let hierarchy = CacheStoreHierarchy::new();
    let mut names = Vec::with_capacity(self.cache.len());
    for (index, node) in self.cache.iter().enumerate() {
      let name = node.node_name(index);
      if names.contains(&name) {
        return Err(ConfigError::DuplicateNode(name));
      }
      let flags = node.store_flags();
      if flags.is_empty() {
        return Err(ConfigError::NoFlags(name));
      }
      let store: Arc<dyn CacheStore> = match node.kind {
        CacheNodeKind::Memory => match node.capacity {
          Some(capacity) => Arc::new(MemoryCacheStore::with_capacity(capacity)),
          None => Arc::new(MemoryCacheStore::new()),
        },
        CacheNodeKind::Filesystem => {
          let root = node.root();
          debug!(node = %name, root = %root.display(), "adding filesystem cache node");
          Arc::new(FileSystemCacheStore::new(root))
        }
      };
      hierarchy.add(name.clone(), store, flags).await;
      names.push(name);
    }
    Ok(hierarchy)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serial_test::serial;
  use tempfile::TempDir;

  mod parsing {
    use super::*;

    #[test]
    fn reads_nodes_and_flags() {
      let config: DerivaConfig = serde_json::from_str(
        r#"{
          "scheduler": { "parallelism": 4 },
          "cache": [
            { "kind": "memory", "capacity": 16, "flags": ["local", "query", "store"] },
            { "name": "shared", "kind": "filesystem", "path": "/srv/cache", "flags": ["remote", "query", "stop_store"] }
          ]
        }"#,
      )
      .unwrap();
      assert_eq!(config.parallelism(), 4);
      assert_eq!(config.scheduler.memory_budget, 0);
      assert_eq!(config.cache[0].capacity, Some(16));
      assert_eq!(
        config.cache[1].store_flags(),
        CacheStoreFlags::REMOTE | CacheStoreFlags::QUERY | CacheStoreFlags::STOP_STORE
      );
    }

    #[test]
    fn rejects_unknown_fields() {
      assert!(serde_json::from_str::<DerivaConfig>(r#"{ "schedular": {} }"#).is_err());
    }

    #[test]
    fn load_reports_the_path() {
      let temp = TempDir::new().unwrap();
      let path = temp.path().join("config.json");
      std::fs::write(&path, "{ not json").unwrap();
      let err = DerivaConfig::load(&path).unwrap_err();
      assert!(matches!(err, ConfigError::Parse { .. }));
      assert!(err.to_string().contains("config.json"));
    }
  }

  mod environment {
    use super::*;

    #[test]
    #[serial]
    fn cache_dir_fills_unset_paths() {
      let temp = TempDir::new().unwrap();
      let path = temp.path().join("config.json");
      std::fs::write(
        &path,
        r#"{ "cache": [
          { "kind": "filesystem", "flags": ["local", "query", "store"] },
          { "kind": "filesystem", "path": "/fixed", "flags": ["local", "query"] }
        ] }"#,
      )
      .unwrap();
      temp_env::with_vars(
        [(CACHE_DIR_ENV, Some("/from/env")), (PARALLELISM_ENV, Some("3"))],
        || {
          let config = DerivaConfig::load(&path).unwrap();
          assert_eq!(config.cache[0].path, Some(PathBuf::from("/from/env")));
          assert_eq!(config.cache[1].path, Some(PathBuf::from("/fixed")));
          assert_eq!(config.parallelism(), 3);
        },
      );
    }

    #[test]
    #[serial]
    fn invalid_parallelism_is_an_error() {
      temp_env::with_var(PARALLELISM_ENV, Some("many"), || {
        let mut config = DerivaConfig::default();
        assert!(matches!(
          config.apply_env(),
          Err(ConfigError::InvalidEnv { name: PARALLELISM_ENV, .. })
        ));
      });
    }

    #[test]
    #[serial]
    fn missing_file_uses_defaults() {
      temp_env::with_var(PARALLELISM_ENV, None::<&str>, || {
        let config = DerivaConfig::load_or_default(Path::new("/does/not/exist.json")).unwrap();
        assert_eq!(config.cache.len(), 2);
        assert!(config.parallelism() >= 1);
      });
    }
  }

  mod hierarchy {
    use super::*;

    #[tokio::test]
    async fn builds_nodes_in_order() {
      let temp = TempDir::new().unwrap();
      let mut config = DerivaConfig::default();
      config.cache[1].path = Some(temp.path().to_path_buf());
      let hierarchy = config.build_cache().await.unwrap();
      let names: Vec<String> = hierarchy.stats().await.into_iter().map(|s| s.name).collect();
      assert_eq!(names, vec!["memory0", "filesystem1"]);
    }

    #[tokio::test]
    async fn rejects_duplicate_names_and_empty_flags() {
      let mut config = DerivaConfig::default();
      config.cache[0].name = Some("same".to_string());
      config.cache[1].name = Some("same".to_string());
      assert!(matches!(config.build_cache().await, Err(ConfigError::DuplicateNode(_))));

      let config = DerivaConfig {
        cache: vec![CacheNodeConfig {
          flags: Vec::new(),
          ..CacheNodeConfig::local(CacheNodeKind::Memory)
        }],
        ..DerivaConfig::default()
      };
      assert!(matches!(config.build_cache().await, Err(ConfigError::NoFlags(_))));
    }
  }
}
