mod cache;
mod list;
mod run;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tracing::debug;

use pkgcheck_lib::config::HarnessConfig;
use pkgcheck_lib::matrix::{WorkUnit, plan_units};
use pkgcheck_lib::recipe::{filter_recipes, load_recipes};

pub use cache::{GcArgs, cmd_cache_gc, cmd_cache_invalidate};
pub use list::cmd_list;
pub use run::{RunArgs, cmd_run};

/// Selects recipes and profiles and bounds the matrix.
#[derive(Debug, Clone, Args)]
pub struct MatrixArgs {
  /// Recipe repository root
  #[arg(default_value = "recipes")]
  pub recipes_dir: PathBuf,

  /// Only recipes whose `name` or `name/version` matches (`*` and `?` wildcards)
  #[arg(short, long = "filter", value_name = "PATTERN")]
  pub filters: Vec<String>,

  /// Only these profiles (repeatable)
  #[arg(short, long = "profile", value_name = "NAME")]
  pub profiles: Vec<String>,

  /// Abort if the matrix would exceed this many units
  #[arg(long, value_name = "N")]
  pub max_units: Option<usize>,

  /// Harness config file (default: pkgcheck.yml next to the recipes directory)
  #[arg(short, long, value_name = "PATH")]
  pub config: Option<PathBuf>,
}

/// Loaded config plus the expanded work units.
pub struct Plan {
  pub config: HarnessConfig,
  pub config_path: Option<PathBuf>,
  pub recipes: usize,
  pub units: Vec<WorkUnit>,
}

/// Load the config and recipes and expand the matrix.
pub fn plan(args: &MatrixArgs) -> Result<Plan> {
  let (mut config, config_path) = HarnessConfig::discover(args.config.as_deref(), &args.recipes_dir)?;
  if let Some(max_units) = args.max_units {
    config.max_units = max_units;
  }
  config.validate()?;

  let recipes = load_recipes(&args.recipes_dir)
    .with_context(|| format!("Failed to load recipes from {}", args.recipes_dir.display()))?;
  let recipes = filter_recipes(recipes, &args.filters);
  let profiles = config.select_profiles(&args.profiles)?;
  debug!(recipes = recipes.len(), profiles = profiles.len(), "planning");

  let count = recipes.len();
  let units = plan_units(recipes, &config, &profiles, config.max_units)?;
  Ok(Plan {
    config,
    config_path,
    recipes: count,
    units,
  })
}
