//! pkgcheck: build every recipe configuration and run its smoke test against
//! the result.

mod cmd;
mod output;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cmd::{MatrixArgs, RunArgs};
use output::{OutputFormat, print_error};

/// Exit status for configuration and infrastructure errors.
const EXIT_ERROR: u8 = 2;

#[derive(Parser)]
#[command(name = "pkgcheck")]
#[command(author, version, about = "Build-and-smoke-test harness for native library recipes", long_about = None)]
struct Cli {
  /// Enable debug logging
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Output format
  #[arg(short = 'o', long, global = true, value_enum, default_value_t)]
  output: OutputFormat,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Build and verify every configuration of the selected recipes
  Run(RunArgs),

  /// Print the expanded work units without building anything
  List(MatrixArgs),

  /// Manage the artifact cache
  Cache {
    #[command(subcommand)]
    command: CacheCommands,
  },
}

#[derive(Subcommand)]
enum CacheCommands {
  /// Evict artifacts until the cache is within capacity and remove incomplete builds
  Gc(cmd::GcArgs),

  /// Remove cached results for the given fingerprints
  Invalidate {
    /// Fingerprints as printed by `list` or found in a report
    #[arg(required = true)]
    fingerprints: Vec<String>,
  },
}

fn main() -> ExitCode {
  let cli = Cli::parse();

  let default_level = if cli.verbose { "debug" } else { "warn" };
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  let result = match cli.command {
    Commands::Run(args) => cmd::cmd_run(args, cli.output),
    Commands::List(args) => cmd::cmd_list(&args, cli.output).map(|()| 0),
    Commands::Cache { command } => match command {
      CacheCommands::Gc(args) => cmd::cmd_cache_gc(&args, cli.output).map(|()| 0),
      CacheCommands::Invalidate { fingerprints } => cmd::cmd_cache_invalidate(&fingerprints, cli.output).map(|()| 0),
    },
  };

  match result {
    Ok(code) => ExitCode::from(code),
    Err(e) => {
      print_error(&format!("{e:#}"));
      ExitCode::from(EXIT_ERROR)
    }
  }
}
