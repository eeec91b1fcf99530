mod cmd;
mod functions;
mod output;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cmd::{BuildArgs, cmd_build, cmd_cache_stats, cmd_key};
use output::OutputFormat;

/// deriva - content-addressed build engine
#[derive(Parser)]
#[command(name = "deriva")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable debug logging
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Config file (default: config.json in the user config directory)
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  /// Output format
  #[arg(short, long, global = true, value_enum, default_value_t)]
  output: OutputFormat,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Print the definition and action keys of a definition file
  Key {
    /// Definition file in canonical JSON form
    definition: PathBuf,
  },

  /// Build a definition file through the configured cache
  Build(BuildArgs),

  /// Inspect the configured cache
  Cache {
    #[command(subcommand)]
    command: CacheCommands,
  },
}

#[derive(Subcommand)]
enum CacheCommands {
  /// Show the configured nodes and their disk usage
  Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();

  let default_level = if cli.verbose { "debug" } else { "warn" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  let config = cli.config.as_deref();
  match &cli.command {
    Commands::Key { definition } => cmd_key(definition, cli.output).await,
    Commands::Build(args) => cmd_build(args, config, cli.output).await,
    Commands::Cache { command } => match command {
      CacheCommands::Stats => cmd_cache_stats(config, cli.output),
    },
  }
}
