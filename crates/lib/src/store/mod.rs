//! On-disk layout of the artifact store.
//!
//! # Layout
//!
//! ```text
//! store/
//! ├── build/<fingerprint>/        # artifacts (immutable once marked complete)
//! │   └── .pkgcheck-complete      # marker with metadata and output hash
//! ├── work/<fingerprint>/         # scratch working directories, removed after use
//! ├── logs/<fingerprint>/         # build.log, verify-<n>-compile.log, verify-<n>-run.log
//! ├── trash/                      # evicted artifacts awaiting deletion
//! └── .lock                       # process-level store lock
//! ```

use std::io;
use std::path::{Path, PathBuf};

use crate::consts::{LOCK_FILE, MARKER_FILE};
use crate::platform::paths::store_dir;
use crate::util::hash::Fingerprint;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
  root: PathBuf,
}

impl StoreLayout {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  /// The store at `PKGCHECK_STORE` or the per-user cache directory.
  pub fn current() -> Self {
    Self::new(store_dir())
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn build_root(&self) -> PathBuf {
    self.root.join("build")
  }

  pub fn artifact_dir(&self, fp: &Fingerprint) -> PathBuf {
    self.build_root().join(fp.as_str())
  }

  pub fn marker_path(&self, fp: &Fingerprint) -> PathBuf {
    self.artifact_dir(fp).join(MARKER_FILE)
  }

  pub fn work_dir(&self, fp: &Fingerprint) -> PathBuf {
    self.root.join("work").join(fp.as_str())
  }

  pub fn log_dir(&self, fp: &Fingerprint) -> PathBuf {
    self.root.join("logs").join(fp.as_str())
  }

  pub fn trash_dir(&self) -> PathBuf {
    self.root.join("trash")
  }

  pub fn lock_path(&self) -> PathBuf {
    self.root.join(LOCK_FILE)
  }

  /// Create the top-level directories.
  pub fn ensure(&self) -> io::Result<()> {
    for dir in [
      self.build_root(),
      self.root.join("work"),
      self.root.join("logs"),
      self.trash_dir(),
    ] {
      std::fs::create_dir_all(dir)?;
    }
    Ok(())
  }
}

/// Remove a directory tree if it exists.
pub fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
  match std::fs::remove_dir_all(path) {
    Ok(()) => Ok(()),
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
    Err(e) => Err(e),
  }
}

/// Remove and recreate a directory so it starts empty.
pub fn fresh_dir(path: &Path) -> io::Result<()> {
  remove_dir_if_exists(path)?;
  std::fs::create_dir_all(path)
}
