use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use deriva_lib::cache::FileSystemCacheStore;
use deriva_lib::config::{CacheNodeConfig, CacheNodeKind};

use super::load_config;
use crate::output::{OutputFormat, format_bytes, format_flags, print_info, print_json, print_stat};

#[derive(Debug, Serialize)]
struct DiskUsage {
  root: String,
  records: u64,
  values: u64,
  content_files: u64,
  total_bytes: u64,
}

#[derive(Debug, Serialize)]
struct NodeReport {
  name: String,
  kind: CacheNodeKind,
  flags: Vec<&'static str>,
  #[serde(skip_serializing_if = "Option::is_none")]
  capacity: Option<usize>,
  #[serde(skip_serializing_if = "Option::is_none")]
  disk: Option<DiskUsage>,
}

fn node_report(index: usize, node: &CacheNodeConfig) -> Result<NodeReport> {
  let name = node.node_name(index);
  let disk = match node.kind {
    CacheNodeKind::Memory => None,
    CacheNodeKind::Filesystem => {
      let store = FileSystemCacheStore::new(node.root());
      let stats = store
        .stats()
        .with_context(|| format!("Failed to scan cache node {} at {}", name, store.root().display()))?;
      Some(DiskUsage {
        root: store.root().display().to_string(),
        records: stats.records,
        values: stats.values,
        content_files: stats.content_files,
        total_bytes: stats.total_bytes,
      })
    }
  };
  Ok(NodeReport {
    name,
    kind: node.kind,
    flags: node.store_flags().names(),
    capacity: node.capacity,
    disk,
  })
}

/// Describe every configured cache node; filesystem nodes report what is on
/// disk. Memory nodes live only inside a build process.
pub fn cmd_cache_stats(config: Option<&Path>, output: OutputFormat) -> Result<()> {
  let config = load_config(config)?;
  let nodes = config
    .cache
    .iter()
    .enumerate()
    .map(|(index, node)| node_report(index, node))
    .collect::<Result<Vec<_>>>()?;

  if output.is_json() {
    return print_json(&nodes);
  }

  if nodes.is_empty() {
    print_info("No cache nodes configured");
    return Ok(());
  }
  for node in &nodes {
    println!();
    print_info(&node.name);
    print_stat("Flags", &format_flags(&node.flags));
    match (&node.disk, node.capacity) {
      (Some(disk), _) => {
        print_stat("Root", &disk.root);
        print_stat("Records", &disk.records.to_string());
        print_stat("Values", &disk.values.to_string());
        print_stat("Content files", &disk.content_files.to_string());
        print_stat("Size", &format_bytes(disk.total_bytes));
      }
      (None, Some(capacity)) => print_stat("Kind", &format!("memory (up to {} records)", capacity)),
      (None, None) => print_stat("Kind", "memory"),
    }
  }
  Ok(())
}
