use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use clap::Args;
use serde::Serialize;
use tokio::runtime::Handle;
use tracing::warn;

use deriva_lib::build::{BuildCompleteParams, BuildDiagnostic, BuildPolicy, BuildSystem};
use deriva_lib::request::{RequestOwner, Status};

use super::{load_config, load_definition};
use crate::functions::{self, output_id};
use crate::output::{
  OutputFormat, format_bytes, format_duration, format_flags, print_diagnostic, print_json, print_stat, print_status,
  truncate_hash,
};

#[derive(Debug, Args)]
pub struct BuildArgs {
  /// Definition file in canonical JSON form
  pub definition: PathBuf,

  /// Build policy flags, comma separated (e.g. build_local,cache_query)
  #[arg(long, value_delimiter = ',', value_parser = parse_policy)]
  pub policy: Vec<BuildPolicy>,

  /// Neither query nor store the cache
  #[arg(long)]
  pub no_cache: bool,

  /// Cancel the build after this long (e.g. "30s", "2m")
  #[arg(long, value_parser = humantime::parse_duration)]
  pub timeout: Option<Duration>,

  /// Write the output payload to this file
  #[arg(short = 'O', long)]
  pub out: Option<PathBuf>,
}

fn parse_policy(name: &str) -> Result<BuildPolicy, String> {
  BuildPolicy::from_name(name.trim()).ok_or_else(|| format!("unknown build policy flag '{}'", name))
}

impl BuildArgs {
  fn build_policy(&self) -> BuildPolicy {
    let policy = if self.policy.is_empty() {
      BuildPolicy::DEFAULT
    } else {
      self.policy.iter().fold(BuildPolicy::NONE, |all, flag| all | *flag)
    };
    if self.no_cache { policy - BuildPolicy::CACHE } else { policy }
  }
}

#[derive(Debug, Serialize)]
struct PayloadReport {
  id: String,
  raw_hash: String,
  raw_size: u64,
}

#[derive(Debug, Serialize)]
struct BuildReport {
  name: String,
  function: String,
  #[serde(skip)]
  status: Status,
  #[serde(rename = "status")]
  status_name: String,
  definition_key: Option<String>,
  action_key: Option<String>,
  flags: Vec<&'static str>,
  payloads: Vec<PayloadReport>,
  diagnostics: Vec<BuildDiagnostic>,
  duration_ms: u128,
}

impl BuildReport {
  fn new(params: &BuildCompleteParams, elapsed: Duration) -> Self {
    Self {
      name: params.name.clone(),
      function: params.function.clone(),
      status: params.status,
      status_name: params.status.to_string(),
      definition_key: params.definition_key.as_ref().map(ToString::to_string),
      action_key: params.action_key.as_ref().map(ToString::to_string),
      flags: params.flags.names(),
      payloads: params
        .output
        .payloads()
        .iter()
        .map(|payload| PayloadReport {
          id: payload.id.to_string(),
          raw_hash: payload.raw_hash.to_string(),
          raw_size: payload.raw_size,
        })
        .collect(),
      diagnostics: params.output.diagnostics().to_vec(),
      duration_ms: elapsed.as_millis(),
    }
  }

  fn print(&self, elapsed: Duration) {
    let headline = match self.status {
      Status::Ok => format!("Built {}", self.name),
      Status::Canceled => format!("Build of {} was canceled", self.name),
      Status::Error => format!("Build of {} failed", self.name),
    };
    println!();
    if let Some(key) = &self.definition_key {
      print_stat("Definition key", truncate_hash(key));
    }
    if let Some(key) = &self.action_key {
      print_stat("Action key", truncate_hash(key));
    }
    print_stat("Flags", &format_flags(&self.flags));
    for payload in &self.payloads {
      print_stat(
        &format!("Payload {}", payload.id),
        &format!("{} ({})", truncate_hash(&payload.raw_hash), format_bytes(payload.raw_size)),
      );
    }
    print_stat("Duration", &format_duration(elapsed));
    for diagnostic in &self.diagnostics {
      print_diagnostic(diagnostic);
    }
    println!();
    print_status(self.status, &headline);
  }
}

fn write_payload(params: &BuildCompleteParams, path: &Path) -> Result<()> {
  let payload = params
    .output
    .find_payload(&output_id())
    .ok_or_else(|| anyhow!("{} produced no '{}' payload", params.name, functions::OUTPUT))?;
  let Some(data) = &payload.data else {
    bail!("payload data was skipped by the build policy");
  };
  let bytes = data.decompress().context("Failed to decompress payload")?;
  std::fs::write(path, bytes).with_context(|| format!("Failed to write {}", path.display()))
}

pub async fn cmd_build(args: &BuildArgs, config: Option<&Path>, output: OutputFormat) -> Result<()> {
  let start = Instant::now();
  let config = load_config(config)?;
  let (definition, resolver) = load_definition(&args.definition)?;

  let system =
    BuildSystem::new(functions::registry()).with_scheduler(Arc::new(config.build_scheduler(Handle::current())));
  let mut session = system.create_session("cli").with_resolver(resolver);
  let cache = if args.no_cache {
    None
  } else {
    let cache = config.build_cache().await.context("Failed to set up the cache")?;
    Some(Arc::new(cache))
  };
  if let Some(cache) = &cache {
    session = session.with_cache(cache.clone());
  }

  let owner = RequestOwner::default();
  let watchdog = args.timeout.map(|timeout| {
    let owner = owner.clone();
    tokio::spawn(async move {
      tokio::time::sleep(timeout).await;
      warn!(timeout = %humantime::format_duration(timeout), "build timed out, canceling");
      owner.cancel();
    })
  });

  let params = session
    .build_definition_async(definition, None, &owner, args.build_policy())
    .await?;
  if let Some(watchdog) = watchdog {
    watchdog.abort();
  }
  // Write-backs run in the background; let them land before exiting.
  if let Some(cache) = &cache {
    cache.flush().await;
  }

  let report = BuildReport::new(&params, start.elapsed());
  if output.is_json() {
    print_json(&report)?;
  } else {
    report.print(start.elapsed());
  }

  if params.status != Status::Ok {
    bail!("build of {} finished with status {}", params.name, params.status);
  }
  if let Some(path) = &args.out {
    write_payload(&params, path)?;
  }
  Ok(())
}
