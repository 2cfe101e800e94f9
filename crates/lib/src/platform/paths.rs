//! Per-user directories for the store and run reports.

use std::path::PathBuf;

use crate::consts::{APP_NAME, STORE_ENV};

/// Returns the user's home directory, falling back to the temp directory.
pub fn home_dir() -> PathBuf {
  let var = if cfg!(windows) { "USERPROFILE" } else { "HOME" };
  std::env::var_os(var).map(PathBuf::from).unwrap_or_else(std::env::temp_dir)
}

/// Returns the directory for data files (run reports).
#[cfg(windows)]
pub fn data_dir() -> PathBuf {
  std::env::var_os("APPDATA")
    .map(PathBuf::from)
    .unwrap_or_else(home_dir)
    .join(APP_NAME)
}

/// Returns the directory for data files (run reports).
#[cfg(not(windows))]
pub fn data_dir() -> PathBuf {
  std::env::var_os("XDG_DATA_HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|| home_dir().join(".local").join("share"))
    .join(APP_NAME)
}

/// Returns the directory for cache files.
#[cfg(windows)]
pub fn cache_dir() -> PathBuf {
  std::env::var_os("LOCALAPPDATA")
    .map(PathBuf::from)
    .unwrap_or_else(home_dir)
    .join(APP_NAME)
    .join("Cache")
}

/// Returns the directory for cache files.
#[cfg(not(windows))]
pub fn cache_dir() -> PathBuf {
  std::env::var_os("XDG_CACHE_HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|| home_dir().join(".cache"))
    .join(APP_NAME)
}

/// Returns the artifact store root.
///
/// `PKGCHECK_STORE` takes precedence over the cache directory.
pub fn store_dir() -> PathBuf {
  match std::env::var_os(STORE_ENV) {
    Some(path) if !path.is_empty() => PathBuf::from(path),
    _ => cache_dir().join("store"),
  }
}

/// Returns the directory run reports are written to by default.
pub fn reports_dir() -> PathBuf {
  data_dir().join("reports")
}
