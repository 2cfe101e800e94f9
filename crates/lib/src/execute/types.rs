//! Types shared by the build and verify executors.

use std::path::PathBuf;

use thiserror::Error;

use crate::placeholder::PlaceholderError;

/// Errors that prevent an external command from being started.
///
/// A command that starts and then fails is not an error here; it is reported
/// through [`ProcessExit`](super::ProcessExit) and recovered into an outcome.
#[derive(Debug, Error)]
pub enum ExecuteError {
  /// A placeholder could not be resolved.
  #[error("placeholder error: {0}")]
  Placeholder(#[from] PlaceholderError),

  /// An argv invocation with no program.
  #[error("empty invocation")]
  EmptyInvocation,

  #[error("failed to spawn {program}: {source}")]
  Spawn {
    program: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to prepare {path}: {source}")]
  Prepare {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  /// I/O error during execution.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// Configuration for running external commands.
#[derive(Debug, Clone)]
pub struct ExecuteConfig {
  /// Pass the harness's own environment through to child processes.
  pub inherit_env: bool,

  /// Shell used for string invocations.
  /// If None, uses /bin/sh (Unix) or cmd.exe (Windows).
  pub shell: Option<String>,
}

impl Default for ExecuteConfig {
  fn default() -> Self {
    Self {
      inherit_env: true,
      shell: None,
    }
  }
}
