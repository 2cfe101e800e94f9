//! Verify executor: compiles the recipe's smoke test against a built artifact
//! and runs it.
//!
//! Both phases share one deadline. The smoke test is compiled in a fresh
//! directory with the same environment the build saw, so it links against the
//! artifact with the same toolchain identity.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::process::{CommandLine, ProcessExit, ProcessSpec, log_excerpt, run_process};
use super::resolver::UnitResolver;
use super::types::{ExecuteConfig, ExecuteError};
use crate::matrix::WorkUnit;
use crate::schedule::CancelToken;
use crate::store::{StoreLayout, fresh_dir, remove_dir_if_exists};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
  Compile,
  Run,
}

/// How a verification ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyStatus {
  Passed,
  Failed {
    phase: Phase,
    exit_code: Option<i32>,
    signal: Option<i32>,
    message: Option<String>,
  },
  /// The smoke test itself was killed by a signal.
  Crashed { signal: i32 },
  TimedOut { phase: Phase },
  Cancelled,
}

#[derive(Debug, Clone)]
pub struct VerifyReport {
  pub status: VerifyStatus,
  pub duration: Duration,
  pub logs: Vec<PathBuf>,
  /// Tail of the last phase's log; empty when the smoke test passed.
  pub excerpt: Vec<String>,
}

/// Name of the binary the compile step must produce.
pub fn test_binary_name() -> &'static str {
  if cfg!(windows) { "test_package.exe" } else { "test_package" }
}

/// Compile and run the unit's smoke test against `artifact_dir`.
///
/// The caller holds a lease on the artifact for the whole call.
pub async fn verify(
  unit: &WorkUnit,
  artifact_dir: &Path,
  layout: &StoreLayout,
  config: &ExecuteConfig,
  deadline: Instant,
  cancel: &CancelToken,
) -> Result<VerifyReport, ExecuteError> {
  let started = Instant::now();
  let test_dir = layout.work_dir(&unit.fingerprint).join("verify");
  let log_dir = layout.log_dir(&unit.fingerprint);
  let bin = test_dir.join(test_binary_name());
  let smoke = &unit.recipe.test_package;

  let resolver = UnitResolver::new(unit, layout).with_test(&test_dir, &bin, &smoke.sources);
  let compile = CommandLine::resolve(&smoke.compile, &resolver, config.shell.as_deref())?;
  let run = match &smoke.run {
    Some(invocation) => CommandLine::resolve(invocation, &resolver, config.shell.as_deref())?,
    None => CommandLine {
      program: bin.to_string_lossy().into_owned(),
      args: Vec::new(),
    },
  };

  fresh_dir(&test_dir).map_err(|source| ExecuteError::Prepare {
    path: test_dir.clone(),
    source,
  })?;

  info!(unit = %unit, artifact = %artifact_dir.display(), "verifying");
  let env = resolver.env_vars();
  // A custom run invocation need not use the test binary
  let required_bin = smoke.run.is_none().then_some(bin.as_path());
  let result = run_phases(
    [(Phase::Compile, compile), (Phase::Run, run)],
    &test_dir,
    required_bin,
    &env,
    &log_dir,
    config,
    deadline,
    cancel,
  )
  .await;

  if let Err(e) = remove_dir_if_exists(&test_dir) {
    warn!(path = %test_dir.display(), error = %e, "failed to remove smoke-test directory");
  }
  let (status, logs) = result?;

  let excerpt = match (&status, logs.last()) {
    (VerifyStatus::Passed, _) | (_, None) => Vec::new(),
    (_, Some(last)) => log_excerpt(last),
  };

  info!(build = %unit.fingerprint, status = ?status, "verify finished");
  Ok(VerifyReport {
    status,
    duration: started.elapsed(),
    logs,
    excerpt,
  })
}

#[allow(clippy::too_many_arguments)]
async fn run_phases(
  phases: [(Phase, CommandLine); 2],
  test_dir: &Path,
  required_bin: Option<&Path>,
  env: &std::collections::BTreeMap<String, String>,
  log_dir: &Path,
  config: &ExecuteConfig,
  deadline: Instant,
  cancel: &CancelToken,
) -> Result<(VerifyStatus, Vec<PathBuf>), ExecuteError> {
  let mut logs = Vec::with_capacity(2);

  for (phase, command) in phases {
    let name = match phase {
      Phase::Compile => "verify-compile.log",
      Phase::Run => "verify-run.log",
    };
    let spec = ProcessSpec {
      command,
      cwd: test_dir.to_path_buf(),
      env: env.clone(),
      tmp_dir: test_dir.join("tmp"),
      log_path: log_dir.join(name),
    };

    debug!(?phase, command = %spec.command, "smoke-test phase");
    let output = run_process(&spec, config, deadline, cancel).await?;
    logs.push(output.log_path);

    let failed = match (phase, output.exit) {
      (_, ProcessExit::Exited(0)) => None,
      (_, ProcessExit::TimedOut) => Some(VerifyStatus::TimedOut { phase }),
      (_, ProcessExit::Cancelled) => Some(VerifyStatus::Cancelled),
      (Phase::Run, ProcessExit::Signaled(signal)) => Some(VerifyStatus::Crashed { signal }),
      (_, ProcessExit::Signaled(signal)) => Some(VerifyStatus::Failed {
        phase,
        exit_code: None,
        signal: Some(signal),
        message: None,
      }),
      (_, ProcessExit::Exited(code)) => Some(VerifyStatus::Failed {
        phase,
        exit_code: Some(code),
        signal: None,
        message: None,
      }),
    };
    if let Some(status) = failed {
      return Ok((status, logs));
    }

    if let Some(bin) = required_bin.filter(|bin| phase == Phase::Compile && !bin.exists()) {
      return Ok((
        VerifyStatus::Failed {
          phase,
          exit_code: Some(0),
          signal: None,
          message: Some(format!("compile step did not produce {}", bin.display())),
        },
        logs,
      ));
    }
  }

  Ok((VerifyStatus::Passed, logs))
}
