//! Deadline- and cancellation-aware process runner.
//!
//! Every external command (recipe build, smoke-test compile, smoke-test run)
//! goes through [`run_process`]. The child is started in its own process group
//! so that a timeout or cancellation kills everything it spawned, and its
//! stdout/stderr are written straight into a log file.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::resolver::UnitResolver;
use super::types::{ExecuteConfig, ExecuteError};
use crate::consts::{LOG_EXCERPT_LINES, SOURCE_DATE_EPOCH};
use crate::placeholder::{Placeholder, Segment, TestField, parse, substitute, substitute_segments};
use crate::recipe::Invocation;
use crate::schedule::CancelToken;

/// A fully resolved command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
  pub program: String,
  pub args: Vec<String>,
}

impl fmt::Display for CommandLine {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.program)?;
    for arg in &self.args {
      write!(f, " {}", arg)?;
    }
    Ok(())
  }
}

impl CommandLine {
  /// Resolve an invocation's placeholders into a command line.
  ///
  /// Shell invocations run through the configured shell; argv invocations are
  /// executed directly, with a bare `$${test:sources}` element expanding to one
  /// argument per source.
  pub fn resolve(invocation: &Invocation, resolver: &UnitResolver, shell: Option<&str>) -> Result<Self, ExecuteError> {
    match invocation {
      Invocation::Shell(script) => {
        let (program, mut args) = get_shell(shell);
        args.push(substitute(script, resolver)?);
        Ok(Self { program, args })
      }
      Invocation::Argv(argv) => {
        let mut resolved = Vec::with_capacity(argv.len());
        for arg in argv {
          let segments = parse(arg)?;
          match (segments.as_slice(), resolver.test_sources()) {
            ([Segment::Placeholder(Placeholder::Test(TestField::Sources))], Some(sources)) => {
              resolved.extend(sources.iter().cloned());
            }
            _ => resolved.push(substitute_segments(&segments, resolver)?),
          }
        }
        let mut resolved = resolved.into_iter();
        let program = resolved.next().ok_or(ExecuteError::EmptyInvocation)?;
        Ok(Self {
          program,
          args: resolved.collect(),
        })
      }
    }
  }
}

/// Everything needed to start one process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
  pub command: CommandLine,
  pub cwd: PathBuf,
  /// Variables set on top of the base environment.
  pub env: BTreeMap<String, String>,
  /// Directory exported as TMPDIR/TMP/TEMP.
  pub tmp_dir: PathBuf,
  pub log_path: PathBuf,
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
  Exited(i32),
  /// Terminated by a signal (Unix only).
  Signaled(i32),
  /// The deadline passed; the process group was killed.
  TimedOut,
  /// The run was cancelled; the process group was killed.
  Cancelled,
}

impl ProcessExit {
  pub fn success(&self) -> bool {
    matches!(self, ProcessExit::Exited(0))
  }
}

impl fmt::Display for ProcessExit {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ProcessExit::Exited(code) => write!(f, "exit code {code}"),
      ProcessExit::Signaled(signal) => write!(f, "signal {signal}"),
      ProcessExit::TimedOut => write!(f, "timed out"),
      ProcessExit::Cancelled => write!(f, "cancelled"),
    }
  }
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
  pub exit: ProcessExit,
  pub duration: Duration,
  pub log_path: PathBuf,
}

/// Run a process to completion, its deadline, or cancellation.
///
/// Output replaces `spec.log_path` regardless of how the process ends. On
/// deadline or cancellation the whole process group is killed and reaped
/// before this returns. After a normal exit, anything the process left running
/// in its group is killed too.
pub async fn run_process(
  spec: &ProcessSpec,
  config: &ExecuteConfig,
  deadline: Instant,
  cancel: &CancelToken,
) -> Result<ProcessOutput, ExecuteError> {
  let started = Instant::now();
  if let Some(parent) = spec.log_path.parent() {
    tokio::fs::create_dir_all(parent).await?;
  }
  tokio::fs::create_dir_all(&spec.tmp_dir).await?;

  let mut log = open_log(&spec.log_path)?;
  writeln!(log, "$ {}", spec.command)?;
  writeln!(log, "# cwd: {}", spec.cwd.display())?;
  writeln!(log)?;
  log.flush()?;

  if cancel.is_cancelled() {
    writeln!(log, "\n# cancelled before start")?;
    return Ok(ProcessOutput {
      exit: ProcessExit::Cancelled,
      duration: Duration::ZERO,
      log_path: spec.log_path.clone(),
    });
  }

  let mut command = Command::new(&spec.command.program);
  command
    .args(&spec.command.args)
    .current_dir(&spec.cwd)
    .stdin(Stdio::null())
    .stdout(Stdio::from(log.try_clone()?))
    .stderr(Stdio::from(log.try_clone()?))
    .kill_on_drop(true);

  if !config.inherit_env {
    // Keep PATH so the toolchain is still reachable
    let path = std::env::var_os("PATH").unwrap_or_default();
    command
      .env_clear()
      .env("PATH", path)
      .env("HOME", "/homeless-shelter")
      .env("LANG", "C")
      .env("LC_ALL", "C");
  }

  command
    .env("TMPDIR", &spec.tmp_dir)
    .env("TMP", &spec.tmp_dir)
    .env("TEMP", &spec.tmp_dir)
    .env("SOURCE_DATE_EPOCH", SOURCE_DATE_EPOCH)
    .envs(&spec.env);

  #[cfg(unix)]
  command.process_group(0);

  debug!(program = %spec.command.program, cwd = ?spec.cwd, log = ?spec.log_path, "spawning process");

  let mut child = command.spawn().map_err(|source| ExecuteError::Spawn {
    program: spec.command.program.clone(),
    source,
  })?;
  // Gone from the child once it has been reaped
  let pid = child.id();

  enum Waited {
    Exited(ExitStatus),
    Deadline,
    Cancelled,
  }

  let waited = tokio::select! {
    status = child.wait() => Waited::Exited(status?),
    _ = tokio::time::sleep_until(deadline) => Waited::Deadline,
    _ = cancel.cancelled() => Waited::Cancelled,
  };

  let exit = match waited {
    Waited::Exited(status) => {
      kill_stragglers(pid);
      exit_from_status(status)
    }
    Waited::Deadline => {
      kill_tree(&mut child).await;
      ProcessExit::TimedOut
    }
    Waited::Cancelled => {
      kill_tree(&mut child).await;
      ProcessExit::Cancelled
    }
  };

  let duration = started.elapsed();
  writeln!(log, "\n# {} after {}", exit, humantime::format_duration(round_millis(duration)))?;

  debug!(program = %spec.command.program, %exit, ?duration, "process finished");
  Ok(ProcessOutput {
    exit,
    duration,
    log_path: spec.log_path.clone(),
  })
}

/// The last `LOG_EXCERPT_LINES` lines of a log file.
pub fn log_excerpt(path: &Path) -> Vec<String> {
  let Ok(bytes) = std::fs::read(path) else {
    return Vec::new();
  };
  let content = String::from_utf8_lossy(&bytes);
  let lines: Vec<&str> = content.lines().collect();
  let start = lines.len().saturating_sub(LOG_EXCERPT_LINES);
  lines[start..].iter().map(|l| l.to_string()).collect()
}

fn open_log(path: &Path) -> Result<File, ExecuteError> {
  OpenOptions::new()
    .create(true)
    .write(true)
    .truncate(true)
    .open(path)
    .map_err(|source| ExecuteError::Prepare {
      path: path.to_path_buf(),
      source,
    })
}

fn exit_from_status(status: ExitStatus) -> ProcessExit {
  if let Some(code) = status.code() {
    return ProcessExit::Exited(code);
  }

  #[cfg(unix)]
  {
    use std::os::unix::process::ExitStatusExt;
    if let Some(signal) = status.signal() {
      return ProcessExit::Signaled(signal);
    }
  }

  ProcessExit::Exited(-1)
}

/// Kill the child's whole process group and reap the child.
#[cfg(unix)]
async fn kill_tree(child: &mut Child) {
  use rustix::process::{Pid, Signal, kill_process_group};

  if let Some(pid) = child.id().and_then(|id| Pid::from_raw(id as i32))
    && let Err(e) = kill_process_group(pid, Signal::KILL)
  {
    debug!(?pid, error = %e, "failed to signal process group");
  }

  if let Err(e) = child.kill().await {
    warn!(error = %e, "failed to kill child process");
  }
}

/// Kill background processes an exited child left in its process group.
#[cfg(unix)]
fn kill_stragglers(pid: Option<u32>) {
  use rustix::io::Errno;
  use rustix::process::{Pid, Signal, kill_process_group};

  let Some(pid) = pid.and_then(|id| Pid::from_raw(id as i32)) else {
    return;
  };
  match kill_process_group(pid, Signal::KILL) {
    Ok(()) => debug!(?pid, "killed leftover processes"),
    Err(Errno::SRCH) => {}
    Err(e) => debug!(?pid, error = %e, "failed to signal process group"),
  }
}

#[cfg(windows)]
fn kill_stragglers(_pid: Option<u32>) {}

#[cfg(windows)]
async fn kill_tree(child: &mut Child) {
  if let Some(pid) = child.id() {
    let status = Command::new("taskkill")
      .args(["/T", "/F", "/PID", &pid.to_string()])
      .stdout(Stdio::null())
      .stderr(Stdio::null())
      .status()
      .await;
    if let Err(e) = status {
      debug!(pid, error = %e, "taskkill failed");
    }
  }

  if let Err(e) = child.kill().await {
    warn!(error = %e, "failed to kill child process");
  }
}

fn round_millis(duration: Duration) -> Duration {
  Duration::from_millis(duration.as_millis() as u64)
}

/// Get the shell command and argument for the current platform.
///
/// For isolated builds we default to `/bin/sh` (Unix) or `cmd.exe` (Windows)
/// rather than `$SHELL`, whose profile files may modify the environment.
fn get_shell(override_shell: Option<&str>) -> (String, Vec<String>) {
  if let Some(shell) = override_shell {
    let args = if shell.contains("powershell") || shell.contains("pwsh") {
      vec!["-NoProfile".to_string(), "-Command".to_string()]
    } else if shell.contains("cmd") {
      vec!["/C".to_string()]
    } else {
      vec!["-c".to_string()]
    };
    return (shell.to_string(), args);
  }

  #[cfg(unix)]
  {
    ("/bin/sh".to_string(), vec!["-c".to_string()])
  }

  #[cfg(windows)]
  {
    ("cmd.exe".to_string(), vec!["/C".to_string()])
  }
}
