//! Single-writer lock on an artifact store.
//!
//! Two harness processes sharing one store would race on artifact directories
//! and evict each other's pinned artifacts. `run` and the `cache` commands
//! therefore hold an exclusive `flock` (`LockFileEx` on Windows) on
//! `<store>/.lock` for their whole lifetime. The holder records who it is in
//! the lock file so a second process can say what it is waiting on.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::store::StoreLayout;

const HOLDER_VERSION: u32 = 1;

/// Identity of the process holding the store lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
  pub version: u32,
  pub pid: u32,
  pub command: String,
  pub acquired_unix: u64,
}

impl LockHolder {
  fn current(command: &str) -> Self {
    Self {
      version: HOLDER_VERSION,
      pid: std::process::id(),
      command: command.to_string(),
      acquired_unix: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs(),
    }
  }
}

impl fmt::Display for LockHolder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let acquired = UNIX_EPOCH + Duration::from_secs(self.acquired_unix);
    write!(
      f,
      "`pkgcheck {}` (PID {}, since {})",
      self.command,
      self.pid,
      humantime::format_rfc3339_seconds(acquired)
    )
  }
}

#[derive(Debug, Error)]
pub enum StoreLockError {
  #[error(
    "store is in use by {holder}\n\
     If no pkgcheck process is running, remove the lock file:\n  {lock_path}"
  )]
  Held { holder: LockHolder, lock_path: PathBuf },

  #[error(
    "store is in use by another process\n\
     If no pkgcheck process is running, remove the lock file:\n  {lock_path}"
  )]
  HeldByUnknown { lock_path: PathBuf },

  #[error("failed to lock {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Exclusive lock on a store, released on drop.
#[derive(Debug)]
pub struct StoreLock {
  file: File,
  path: PathBuf,
}

impl StoreLock {
  /// Lock the store, creating its root if needed.
  ///
  /// Never waits: a store held by another process fails immediately with the
  /// holder's identity.
  pub fn acquire(layout: &StoreLayout, command: &str) -> Result<Self, StoreLockError> {
    let path = layout.lock_path();
    let io_err = |source| StoreLockError::Io {
      path: path.clone(),
      source,
    };

    std::fs::create_dir_all(layout.root()).map_err(io_err)?;
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&path)
      .map_err(io_err)?;

    match try_lock_exclusive(&file) {
      Ok(()) => {}
      Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Err(contention(&path)),
      Err(e) => return Err(io_err(e)),
    }

    let mut lock = StoreLock { file, path };
    lock.record_holder(command).map_err(|source| StoreLockError::Io {
      path: lock.path.clone(),
      source,
    })?;
    debug!(lock = %lock.path.display(), command, "acquired store lock");
    Ok(lock)
  }

  /// The holder record as written by this process.
  pub fn holder(&self) -> io::Result<LockHolder> {
    let mut file = &self.file;
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    serde_json::from_str(&contents).map_err(io::Error::other)
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn record_holder(&mut self, command: &str) -> io::Result<()> {
    self.file.set_len(0)?;
    self.file.seek(SeekFrom::Start(0))?;
    serde_json::to_writer(&self.file, &LockHolder::current(command)).map_err(io::Error::other)?;
    self.file.flush()
  }
}

/// Describe the process holding `path`, as far as its record can be read.
fn contention(path: &Path) -> StoreLockError {
  let holder = std::fs::read_to_string(path)
    .ok()
    .and_then(|contents| serde_json::from_str::<LockHolder>(&contents).ok());
  match holder {
    Some(holder) => StoreLockError::Held {
      holder,
      lock_path: path.to_path_buf(),
    },
    None => StoreLockError::HeldByUnknown {
      lock_path: path.to_path_buf(),
    },
  }
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};
  use std::os::unix::io::AsFd;

  flock(file.as_fd(), FlockOperation::NonBlockingLockExclusive)
    .map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(windows)]
fn try_lock_exclusive(file: &File) -> io::Result<()> {
  use std::os::windows::io::AsRawHandle;
  use windows_sys::Win32::Foundation::HANDLE;
  use windows_sys::Win32::Storage::FileSystem::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, LockFileEx};

  let handle = file.as_raw_handle() as HANDLE;

  // SAFETY: OVERLAPPED is a plain data struct that is valid when zero-initialized,
  // and the handle stays open for the duration of the call.
  let result = unsafe {
    let mut overlapped = std::mem::zeroed();
    LockFileEx(handle, LOCKFILE_FAIL_IMMEDIATELY | LOCKFILE_EXCLUSIVE_LOCK, 0, 1, 0, &mut overlapped)
  };

  if result == 0 {
    Err(io::Error::last_os_error())
  } else {
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn acquire_creates_store_and_records_holder() {
    let temp = TempDir::new().unwrap();
    let layout = StoreLayout::new(temp.path().join("store"));

    let lock = StoreLock::acquire(&layout, "run").unwrap();

    assert!(layout.root().is_dir());
    assert_eq!(lock.path(), layout.lock_path());
    let holder = lock.holder().unwrap();
    assert_eq!(holder.command, "run");
    assert_eq!(holder.pid, std::process::id());
    assert_eq!(holder.version, HOLDER_VERSION);
  }

  #[test]
  #[cfg(unix)]
  fn second_lock_names_the_holder() {
    let temp = TempDir::new().unwrap();
    let layout = StoreLayout::new(temp.path());
    let _held = StoreLock::acquire(&layout, "run").unwrap();

    let err = StoreLock::acquire(&layout, "cache gc").unwrap_err();
    match &err {
      StoreLockError::Held { holder, lock_path } => {
        assert_eq!(holder.command, "run");
        assert_eq!(lock_path, &layout.lock_path());
      }
      other => panic!("expected a held lock, got {other}"),
    }
    assert!(err.to_string().contains("`pkgcheck run`"));
  }

  #[test]
  #[cfg(unix)]
  fn unreadable_holder_record_still_reports_contention() {
    let temp = TempDir::new().unwrap();
    let layout = StoreLayout::new(temp.path());
    let held = StoreLock::acquire(&layout, "run").unwrap();
    held.file.set_len(0).unwrap();

    let err = StoreLock::acquire(&layout, "run").unwrap_err();
    assert!(matches!(err, StoreLockError::HeldByUnknown { .. }));
  }

  #[test]
  fn lock_released_on_drop() {
    let temp = TempDir::new().unwrap();
    let layout = StoreLayout::new(temp.path());
    drop(StoreLock::acquire(&layout, "cache gc").unwrap());

    let lock = StoreLock::acquire(&layout, "cache invalidate").unwrap();
    assert_eq!(lock.holder().unwrap().command, "cache invalidate");
  }
}
