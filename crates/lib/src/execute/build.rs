//! Build executor: runs a recipe's build invocation for one work unit.

use std::path::PathBuf;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use super::process::{CommandLine, ProcessExit, ProcessSpec, log_excerpt, run_process};
use super::resolver::UnitResolver;
use super::types::{ExecuteConfig, ExecuteError};
use crate::matrix::WorkUnit;
use crate::schedule::CancelToken;
use crate::store::{StoreLayout, fresh_dir, remove_dir_if_exists};

/// How a build ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildStatus {
  Succeeded,
  Failed { exit_code: Option<i32>, signal: Option<i32> },
  TimedOut,
  Cancelled,
}

#[derive(Debug, Clone)]
pub struct BuildReport {
  pub status: BuildStatus,
  pub duration: Duration,
  pub artifact_dir: PathBuf,
  pub log_path: PathBuf,
  /// Tail of the build log; empty for successful builds.
  pub excerpt: Vec<String>,
}

/// Build one unit into `<store>/build/<fingerprint>`.
///
/// The artifact and working directories start empty; the working directory is
/// removed afterwards, and so is the artifact directory unless the build
/// succeeded. The caller holds the cache ticket for the fingerprint.
pub async fn build(
  unit: &WorkUnit,
  layout: &StoreLayout,
  config: &ExecuteConfig,
  deadline: Instant,
  cancel: &CancelToken,
) -> Result<BuildReport, ExecuteError> {
  let artifact_dir = layout.artifact_dir(&unit.fingerprint);
  let work_dir = layout.work_dir(&unit.fingerprint);
  let log_path = layout.log_dir(&unit.fingerprint).join("build.log");

  let resolver = UnitResolver::new(unit, layout);
  let command = CommandLine::resolve(&unit.recipe.build, &resolver, config.shell.as_deref())?;

  for dir in [&artifact_dir, &work_dir] {
    fresh_dir(dir).map_err(|source| ExecuteError::Prepare {
      path: dir.clone(),
      source,
    })?;
  }

  let spec = ProcessSpec {
    command,
    cwd: work_dir.clone(),
    env: resolver.env_vars(),
    tmp_dir: work_dir.join("tmp"),
    log_path,
  };

  info!(unit = %unit, build = %unit.fingerprint, "building");
  let result = run_process(&spec, config, deadline, cancel).await;

  if let Err(e) = remove_dir_if_exists(&work_dir) {
    warn!(path = %work_dir.display(), error = %e, "failed to remove working directory");
  }
  let output = match result {
    Ok(output) => output,
    Err(e) => {
      discard(&artifact_dir);
      return Err(e);
    }
  };

  let status = match output.exit {
    ProcessExit::Exited(0) => BuildStatus::Succeeded,
    ProcessExit::Exited(code) => BuildStatus::Failed {
      exit_code: Some(code),
      signal: None,
    },
    ProcessExit::Signaled(signal) => BuildStatus::Failed {
      exit_code: None,
      signal: Some(signal),
    },
    ProcessExit::TimedOut => BuildStatus::TimedOut,
    ProcessExit::Cancelled => BuildStatus::Cancelled,
  };

  let excerpt = if status == BuildStatus::Succeeded {
    Vec::new()
  } else {
    discard(&artifact_dir);
    log_excerpt(&output.log_path)
  };

  info!(
    build = %unit.fingerprint,
    status = ?status,
    duration_ms = output.duration.as_millis() as u64,
    "build finished"
  );

  Ok(BuildReport {
    status,
    duration: output.duration,
    artifact_dir,
    log_path: output.log_path,
    excerpt,
  })
}

fn discard(artifact_dir: &std::path::Path) {
  if let Err(e) = remove_dir_if_exists(artifact_dir) {
    warn!(path = %artifact_dir.display(), error = %e, "failed to remove partial artifact");
  }
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;
  use crate::config::HarnessConfig;
  use crate::matrix::plan_units;
  use crate::recipe::load_recipes;
  use crate::util::testutil::RecipeFixture;
  use tempfile::TempDir;

  fn units(temp: &TempDir, fixture: RecipeFixture) -> Vec<WorkUnit> {
    let recipes_dir = temp.path().join("recipes");
    fixture.write(&recipes_dir);
    let recipes = load_recipes(&recipes_dir).unwrap();
    let config = HarnessConfig::default();
    plan_units(recipes, &config, &config.profiles(), 100).unwrap()
  }

  fn deadline(secs: u64) -> Instant {
    Instant::now() + Duration::from_secs(secs)
  }

  #[tokio::test]
  async fn successful_build_populates_artifact_dir() {
    let temp = TempDir::new().unwrap();
    let fixture = RecipeFixture::new("foo", "1.0")
      .option("shared", &["True"])
      .build("mkdir -p $${out}/lib && echo shared=$${opt:shared} > $${out}/lib/info && pwd > $${out}/cwd");
    let unit = units(&temp, fixture).remove(0);
    let layout = StoreLayout::new(temp.path().join("store"));

    let report = build(&unit, &layout, &ExecuteConfig::default(), deadline(60), &CancelToken::new())
      .await
      .unwrap();

    assert_eq!(report.status, BuildStatus::Succeeded);
    assert_eq!(report.artifact_dir, layout.artifact_dir(&unit.fingerprint));
    let info = std::fs::read_to_string(report.artifact_dir.join("lib/info")).unwrap();
    assert_eq!(info.trim(), "shared=True");
    let cwd = std::fs::read_to_string(report.artifact_dir.join("cwd")).unwrap();
    assert!(cwd.trim().ends_with(&format!("work/{}", unit.fingerprint)));
    assert!(!layout.work_dir(&unit.fingerprint).exists());
    assert!(report.log_path.ends_with("build.log"));
    assert!(report.excerpt.is_empty());
  }

  #[tokio::test]
  async fn failing_build_reports_exit_code_and_excerpt() {
    let temp = TempDir::new().unwrap();
    let fixture =
      RecipeFixture::new("foo", "1.0").build("mkdir -p $${out}/lib; echo 'configure: error: no zlib'; exit 2");
    let unit = units(&temp, fixture).remove(0);
    let layout = StoreLayout::new(temp.path().join("store"));

    let report = build(&unit, &layout, &ExecuteConfig::default(), deadline(60), &CancelToken::new())
      .await
      .unwrap();

    assert_eq!(
      report.status,
      BuildStatus::Failed {
        exit_code: Some(2),
        signal: None
      }
    );
    assert!(report.excerpt.iter().any(|l| l.contains("configure: error: no zlib")));
    assert!(!report.artifact_dir.exists());
    assert!(report.log_path.exists());
  }

  #[tokio::test]
  async fn slow_build_times_out() {
    let temp = TempDir::new().unwrap();
    let fixture = RecipeFixture::new("foo", "1.0").build("sleep 30");
    let unit = units(&temp, fixture).remove(0);
    let layout = StoreLayout::new(temp.path().join("store"));

    let started = Instant::now();
    let report = build(
      &unit,
      &layout,
      &ExecuteConfig::default(),
      Instant::now() + Duration::from_millis(300),
      &CancelToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.status, BuildStatus::TimedOut);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(!report.artifact_dir.exists());
  }

  #[tokio::test]
  async fn unresolvable_placeholder_is_an_error() {
    let temp = TempDir::new().unwrap();
    let fixture = RecipeFixture::new("foo", "1.0").build("make WITH=$${opt:missing}");
    let unit = units(&temp, fixture).remove(0);
    let layout = StoreLayout::new(temp.path().join("store"));

    let err = build(&unit, &layout, &ExecuteConfig::default(), deadline(60), &CancelToken::new())
      .await
      .unwrap_err();
    assert!(matches!(err, ExecuteError::Placeholder(_)));
  }
}
