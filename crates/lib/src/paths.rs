//! Per-user directories.
//!
//! Unix follows the XDG base directory conventions; Windows uses the roaming
//! and local application data folders. When none of the variables are set the
//! system temporary directory is used so that a missing `HOME` never aborts.

use std::env;
use std::path::PathBuf;

use crate::consts::APP_NAME;

fn var_path(name: &str) -> Option<PathBuf> {
  env::var_os(name).filter(|v| !v.is_empty()).map(PathBuf::from)
}

#[cfg(windows)]
pub fn home_dir() -> PathBuf {
  var_path("USERPROFILE").unwrap_or_else(env::temp_dir)
}

#[cfg(not(windows))]
pub fn home_dir() -> PathBuf {
  var_path("HOME").unwrap_or_else(env::temp_dir)
}

/// Where `config.json` is looked up.
#[cfg(windows)]
pub fn config_dir() -> PathBuf {
  var_path("APPDATA").unwrap_or_else(home_dir).join(APP_NAME)
}

/// Where `config.json` is looked up.
#[cfg(not(windows))]
pub fn config_dir() -> PathBuf {
  var_path("XDG_CONFIG_HOME")
    .unwrap_or_else(|| home_dir().join(".config"))
    .join(APP_NAME)
}

#[cfg(windows)]
pub fn data_dir() -> PathBuf {
  var_path("LOCALAPPDATA").unwrap_or_else(home_dir).join(APP_NAME)
}

#[cfg(not(windows))]
pub fn data_dir() -> PathBuf {
  var_path("XDG_DATA_HOME")
    .unwrap_or_else(|| home_dir().join(".local").join("share"))
    .join(APP_NAME)
}

/// Default root of filesystem cache stores.
pub fn cache_dir() -> PathBuf {
  data_dir().join("cache")
}
