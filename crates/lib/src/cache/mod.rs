//! Content-addressed artifact cache.
//!
//! Maps a fingerprint to the outcome of building it. The first worker to
//! [`reserve`](ArtifactCache::reserve) an unseen fingerprint gets a [`Ticket`]
//! and builds; everyone else waits for the ticket holder's result. Successful
//! builds persist in the store with a completion marker, so a later run reuses
//! them; failed builds are remembered for the lifetime of the process only.
//!
//! Workers verifying against an artifact hold a [`Lease`], which pins it: LRU
//! eviction never removes a pinned artifact's directory. A builder's own
//! artifact is pinned as it is stored, before eviction gets to run.

pub mod disk;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub use disk::{ArtifactMarker, ArtifactMeta};

use crate::config::CacheCapacity;
use crate::consts::MARKER_FILE;
use crate::store::{StoreLayout, remove_dir_if_exists};
use crate::util::hash::{Fingerprint, directory_size};

#[derive(Debug, Error)]
pub enum CacheError {
  #[error("build {0} is already cached")]
  AlreadyExists(Fingerprint),

  #[error("build {0} is in progress")]
  InProgress(Fingerprint),

  #[error("artifact {0} is in use")]
  Pinned(Fingerprint),

  #[error("artifact directory {0} does not exist")]
  MissingArtifact(PathBuf),

  #[error("I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to hash {path}: {message}")]
  Hash { path: PathBuf, message: String },

  #[error("invalid marker {path}: {message}")]
  Marker { path: PathBuf, message: String },

  #[error("cache task failed: {0}")]
  Task(String),
}

/// A successfully built artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
  pub fingerprint: Fingerprint,
  pub dir: PathBuf,
  pub marker: ArtifactMarker,
}

impl Artifact {
  pub fn duration(&self) -> Duration {
    Duration::from_millis(self.marker.duration_ms)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
  Failed,
  TimedOut,
}

/// A build that did not produce an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildFailure {
  pub kind: FailureKind,
  pub exit_code: Option<i32>,
  pub signal: Option<i32>,
  /// Infrastructure error text when the build never ran to completion.
  pub message: Option<String>,
  pub log_path: Option<PathBuf>,
  pub excerpt: Vec<String>,
  pub duration: Duration,
}

/// Terminal result of building a fingerprint.
#[derive(Debug, Clone)]
pub enum CachedBuild {
  Built(Arc<Artifact>),
  Failed(Arc<BuildFailure>),
}

/// What a ticket holder stores.
#[derive(Debug, Clone)]
pub enum BuildRecord {
  /// The artifact directory is complete; hash it and write the marker.
  Built(ArtifactMeta),
  Failed(BuildFailure),
}

pub enum Reservation {
  /// Exclusive permission to build the fingerprint.
  Ticket(Ticket),
  Ready(CachedBuild),
}

impl std::fmt::Debug for Reservation {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Reservation::Ticket(ticket) => write!(f, "Ticket({})", ticket.fingerprint),
      Reservation::Ready(build) => f.debug_tuple("Ready").field(build).finish(),
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
  /// Tickets handed out.
  pub builds_started: usize,
  pub hits: usize,
  pub misses: usize,
  pub evictions: usize,
  pub corruptions: usize,
  /// Artifacts currently on disk.
  pub entries: usize,
  pub bytes: u64,
}

#[derive(Debug, Default, Serialize)]
pub struct GcReport {
  pub evicted: Vec<Fingerprint>,
  pub incomplete: Vec<PathBuf>,
  pub bytes_freed: u64,
  pub dry_run: bool,
}

#[derive(Debug)]
struct Entry {
  build: CachedBuild,
  last_access: u64,
  pins: usize,
  bytes: u64,
  /// False once evicted; the outcome stays recorded.
  present: bool,
  /// Output hash checked against the marker in this process.
  verified: bool,
}

impl Entry {
  fn new(build: CachedBuild, bytes: u64, verified: bool) -> Self {
    Self {
      build,
      last_access: 0,
      pins: 0,
      bytes,
      present: true,
      verified,
    }
  }

  fn is_artifact(&self) -> bool {
    matches!(self.build, CachedBuild::Built(_))
  }

  /// Failures are always usable; artifacts only while on disk.
  fn is_usable(&self) -> bool {
    !self.is_artifact() || self.present
  }

  fn is_evictable(&self) -> bool {
    self.is_artifact() && self.present && self.pins == 0
  }
}

#[derive(Debug)]
enum Slot {
  /// A ticket holder is building; the sender side lives in the ticket.
  Building(watch::Receiver<()>),
  Done(Entry),
}

#[derive(Debug, Default)]
struct State {
  slots: HashMap<Fingerprint, Slot>,
  clock: u64,
  stats: CacheStats,
}

impl State {
  fn tick(&mut self) -> u64 {
    self.clock += 1;
    self.clock
  }

  fn usage(&self) -> (usize, u64) {
    self
      .slots
      .values()
      .filter_map(|slot| match slot {
        Slot::Done(entry) if entry.is_artifact() && entry.present => Some(entry.bytes),
        _ => None,
      })
      .fold((0, 0), |(count, bytes), b| (count + 1, bytes + b))
  }

  /// Evictable artifacts, least recently used first.
  fn eviction_order(&self) -> Vec<(u64, Fingerprint, u64)> {
    let mut candidates: Vec<_> = self
      .slots
      .iter()
      .filter_map(|(fp, slot)| match slot {
        Slot::Done(entry) if entry.is_evictable() => Some((entry.last_access, fp.clone(), entry.bytes)),
        _ => None,
      })
      .collect();
    candidates.sort();
    candidates
  }
}

#[derive(Debug)]
struct Inner {
  layout: StoreLayout,
  capacity: CacheCapacity,
  state: Mutex<State>,
}

/// Shared handle to the cache. Clones refer to the same cache.
#[derive(Debug, Clone)]
pub struct ArtifactCache {
  inner: Arc<Inner>,
}

enum Lookup {
  Wait(watch::Receiver<()>),
  Ready(CachedBuild),
  Verify(Ticket, Entry),
  Miss(Ticket),
}

impl ArtifactCache {
  /// An empty cache over `layout`, ignoring anything already on disk.
  pub fn new(layout: StoreLayout, capacity: CacheCapacity) -> Self {
    Self {
      inner: Arc::new(Inner {
        layout,
        capacity,
        state: Mutex::new(State::default()),
      }),
    }
  }

  /// Open the cache and register every marked artifact in the store.
  ///
  /// Registered artifacts are verified against their marker on first reserve.
  pub fn open(layout: StoreLayout, capacity: CacheCapacity) -> Result<Self, CacheError> {
    layout.ensure().map_err(|source| CacheError::Io {
      path: layout.root().to_path_buf(),
      source,
    })?;
    let scan = disk::scan(&layout)?;
    let cache = Self::new(layout, capacity);

    {
      let mut state = cache.state();
      for found in scan.artifacts {
        let fingerprint = found.marker.fingerprint.clone();
        let artifact = Artifact {
          dir: cache.inner.layout.artifact_dir(&fingerprint),
          fingerprint: fingerprint.clone(),
          marker: found.marker,
        };
        let mut entry = Entry::new(CachedBuild::Built(Arc::new(artifact)), found.bytes, false);
        entry.last_access = state.tick();
        state.slots.insert(fingerprint, Slot::Done(entry));
      }
      let (entries, bytes) = state.usage();
      info!(
        store = %cache.inner.layout.root().display(),
        entries,
        bytes,
        incomplete = scan.incomplete.len(),
        "opened artifact cache"
      );
    }

    Ok(cache)
  }

  pub fn layout(&self) -> &StoreLayout {
    &self.inner.layout
  }

  fn state(&self) -> MutexGuard<'_, State> {
    self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn stats(&self) -> CacheStats {
    let state = self.state();
    let (entries, bytes) = state.usage();
    CacheStats {
      entries,
      bytes,
      ..state.stats
    }
  }

  /// Reserve a fingerprint for building, or get its terminal result.
  ///
  /// Waits while another ticket holder is building it. If that holder drops
  /// its ticket without storing, one of the waiters receives a new ticket.
  pub async fn reserve(&self, fingerprint: &Fingerprint) -> Reservation {
    loop {
      let lookup = {
        let mut guard = self.state();
        let state = &mut *guard;
        let now = state.tick();
        match state.slots.get_mut(fingerprint) {
          Some(Slot::Building(rx)) => Lookup::Wait(rx.clone()),
          Some(Slot::Done(entry)) if entry.is_usable() && (entry.verified || !entry.is_artifact()) => {
            entry.last_access = now;
            state.stats.hits += 1;
            Lookup::Ready(entry.build.clone())
          }
          Some(Slot::Done(entry)) if entry.is_usable() => {
            let ticket = self.issue_ticket(fingerprint);
            match state.slots.insert(fingerprint.clone(), Slot::Building(ticket.rx.clone())) {
              Some(Slot::Done(entry)) => Lookup::Verify(ticket, entry),
              _ => Lookup::Miss(ticket),
            }
          }
          _ => {
            state.stats.misses += 1;
            state.stats.builds_started += 1;
            let ticket = self.issue_ticket(fingerprint);
            state
              .slots
              .insert(fingerprint.clone(), Slot::Building(ticket.rx.clone()));
            Lookup::Miss(ticket)
          }
        }
      };

      match lookup {
        Lookup::Ready(build) => return Reservation::Ready(build),
        Lookup::Miss(ticket) => {
          debug!(build = %fingerprint, "ticket issued");
          return Reservation::Ticket(ticket);
        }
        Lookup::Verify(ticket, entry) => return self.verify_entry(ticket, entry).await,
        Lookup::Wait(mut rx) => {
          debug!(build = %fingerprint, "waiting for in-flight build");
          // Err means the ticket was dropped; either way look again.
          let _ = rx.changed().await;
        }
      }
    }
  }

  fn issue_ticket(&self, fingerprint: &Fingerprint) -> Ticket {
    let (tx, rx) = watch::channel(());
    Ticket {
      cache: self.clone(),
      fingerprint: fingerprint.clone(),
      tx,
      rx,
      done: false,
    }
  }

  /// Check an artifact found on disk against its marker while holding its
  /// ticket, so concurrent reservers wait for the answer.
  async fn verify_entry(&self, ticket: Ticket, mut entry: Entry) -> Reservation {
    let CachedBuild::Built(artifact) = &entry.build else {
      return Reservation::Ready(ticket.complete(entry, false).0);
    };
    let dir = artifact.dir.clone();
    let marker = artifact.marker.clone();
    let valid = tokio::task::spawn_blocking(move || disk::verify_marker(&dir, &marker))
      .await
      .unwrap_or_else(|e| {
        warn!(error = %e, "artifact verification task failed");
        false
      });

    if valid {
      entry.verified = true;
      let (build, _) = ticket.complete(entry, false);
      self.state().stats.hits += 1;
      return Reservation::Ready(build);
    }

    let trash = {
      let mut state = self.state();
      state.stats.corruptions += 1;
      state.stats.misses += 1;
      state.stats.builds_started += 1;
      let tag = state.tick();
      self.move_to_trash(ticket.fingerprint(), tag)
    };
    self.empty_trash(trash.into_iter().collect());
    Reservation::Ticket(ticket)
  }

  /// Terminal result for a fingerprint, if any. Evicted artifacts are misses.
  pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<CachedBuild> {
    let mut guard = self.state();
    let state = &mut *guard;
    let now = state.tick();
    match state.slots.get_mut(fingerprint) {
      Some(Slot::Done(entry)) if entry.is_usable() => {
        entry.last_access = now;
        Some(entry.build.clone())
      }
      _ => None,
    }
  }

  /// Store a result without a prior reservation.
  pub async fn store(&self, fingerprint: &Fingerprint, record: BuildRecord) -> Result<CachedBuild, CacheError> {
    let ticket = {
      let mut guard = self.state();
      let state = &mut *guard;
      match state.slots.get(fingerprint) {
        Some(Slot::Building(_)) => return Err(CacheError::InProgress(fingerprint.clone())),
        Some(Slot::Done(entry)) if entry.is_usable() => return Err(CacheError::AlreadyExists(fingerprint.clone())),
        _ => {}
      }
      let ticket = self.issue_ticket(fingerprint);
      state
        .slots
        .insert(fingerprint.clone(), Slot::Building(ticket.rx.clone()));
      ticket
    };
    ticket.store(record).await
  }

  /// Forget a fingerprint's result and remove its artifact directory.
  ///
  /// Returns whether anything was removed. A fingerprint being built is left
  /// alone; a pinned artifact is an error.
  pub fn invalidate(&self, fingerprint: &Fingerprint) -> Result<bool, CacheError> {
    let (removed, trash) = {
      let mut guard = self.state();
      let state = &mut *guard;
      let removed = match state.slots.get(fingerprint) {
        Some(Slot::Building(_)) => return Ok(false),
        Some(Slot::Done(entry)) if entry.pins > 0 => return Err(CacheError::Pinned(fingerprint.clone())),
        Some(Slot::Done(_)) => {
          state.slots.remove(fingerprint);
          true
        }
        None => false,
      };
      let tag = state.tick();
      (removed, self.move_to_trash(fingerprint, tag))
    };

    let removed = removed || trash.is_some();
    if removed {
      info!(build = %fingerprint, "invalidated");
    }
    self.empty_trash(trash.into_iter().collect());
    Ok(removed)
  }

  /// Pin an artifact for verification.
  ///
  /// Returns `None` when the fingerprint has no artifact or its directory is
  /// gone from disk.
  pub fn lease(&self, fingerprint: &Fingerprint) -> Option<Lease> {
    let artifact = {
      let mut guard = self.state();
      let state = &mut *guard;
      let now = state.tick();
      match state.slots.get_mut(fingerprint) {
        Some(Slot::Done(entry)) if entry.present && entry.verified => match &entry.build {
          CachedBuild::Built(artifact) => {
            entry.pins += 1;
            entry.last_access = now;
            artifact.clone()
          }
          CachedBuild::Failed(_) => return None,
        },
        _ => return None,
      }
    };

    let lease = Lease {
      cache: self.clone(),
      artifact,
    };
    if !lease.dir().join(MARKER_FILE).is_file() {
      warn!(build = %fingerprint, "artifact vanished from the store");
      return None;
    }
    Some(lease)
  }

  /// Evict to capacity and remove incomplete artifact directories.
  pub fn gc(&self, dry_run: bool) -> Result<GcReport, CacheError> {
    let scan = disk::scan(&self.inner.layout)?;
    let mut report = GcReport {
      dry_run,
      ..Default::default()
    };

    let trash = {
      let mut guard = self.state();
      let state = &mut *guard;
      report.incomplete = scan
        .incomplete
        .into_iter()
        .filter(|path| {
          let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
          !matches!(
            state.slots.get(&Fingerprint(name.to_string())),
            Some(Slot::Building(_))
          )
        })
        .collect();

      if dry_run {
        let (mut count, mut bytes) = state.usage();
        for (_, fingerprint, size) in state.eviction_order() {
          if !self.over_capacity(count, bytes) {
            break;
          }
          count -= 1;
          bytes = bytes.saturating_sub(size);
          report.bytes_freed += size;
          report.evicted.push(fingerprint);
        }
        Vec::new()
      } else {
        let (_, bytes_before) = state.usage();
        let (trash, evicted) = self.evict_locked(state);
        let (_, bytes_after) = state.usage();
        report.evicted = evicted;
        report.bytes_freed = bytes_before.saturating_sub(bytes_after);
        trash
      }
    };

    if !dry_run {
      self.empty_trash(trash);
      for path in &report.incomplete {
        if let Err(e) = remove_dir_if_exists(path) {
          warn!(path = %path.display(), error = %e, "failed to remove incomplete artifact");
        }
      }
      // Leftovers from processes that died before emptying the trash
      if let Ok(entries) = std::fs::read_dir(self.inner.layout.trash_dir()) {
        self.empty_trash(entries.flatten().map(|e| e.path()).collect());
      }
    }

    info!(
      evicted = report.evicted.len(),
      incomplete = report.incomplete.len(),
      bytes_freed = report.bytes_freed,
      dry_run,
      "cache gc complete"
    );
    Ok(report)
  }

  fn over_capacity(&self, count: usize, bytes: u64) -> bool {
    let capacity = &self.inner.capacity;
    capacity.max_entries.is_some_and(|max| count > max) || capacity.max_bytes.is_some_and(|max| bytes > max)
  }

  /// Evict least-recently-used unpinned artifacts until within capacity.
  ///
  /// Victim directories are moved into the trash under the lock; the caller
  /// deletes the returned paths after releasing it.
  fn evict_locked(&self, state: &mut State) -> (Vec<PathBuf>, Vec<Fingerprint>) {
    let mut trash = Vec::new();
    let mut evicted = Vec::new();

    let (mut count, mut bytes) = state.usage();
    if !self.over_capacity(count, bytes) {
      return (trash, evicted);
    }

    for (_, fingerprint, size) in state.eviction_order() {
      if !self.over_capacity(count, bytes) {
        break;
      }
      let tag = state.tick();
      if let Some(path) = self.move_to_trash(&fingerprint, tag) {
        trash.push(path);
      }
      if let Some(Slot::Done(entry)) = state.slots.get_mut(&fingerprint) {
        entry.present = false;
        entry.verified = false;
        entry.bytes = 0;
      }
      state.stats.evictions += 1;
      count -= 1;
      bytes = bytes.saturating_sub(size);
      info!(build = %fingerprint, bytes = size, "evicted artifact");
      evicted.push(fingerprint);
    }

    if self.over_capacity(count, bytes) {
      debug!(count, bytes, "cache over capacity; remaining artifacts are pinned");
    }
    (trash, evicted)
  }

  /// Move an artifact directory out of the build tree. Returns the trash path.
  fn move_to_trash(&self, fingerprint: &Fingerprint, tag: u64) -> Option<PathBuf> {
    let dir = self.inner.layout.artifact_dir(fingerprint);
    if !dir.exists() {
      return None;
    }
    let trash_dir = self.inner.layout.trash_dir();
    let target = trash_dir.join(format!("{fingerprint}-{}-{tag}", std::process::id()));
    let moved = std::fs::create_dir_all(&trash_dir).and_then(|()| std::fs::rename(&dir, &target));
    match moved {
      Ok(()) => Some(target),
      Err(e) => {
        debug!(path = %dir.display(), error = %e, "rename into trash failed, deleting in place");
        if let Err(e) = remove_dir_if_exists(&dir) {
          warn!(path = %dir.display(), error = %e, "failed to remove artifact");
        }
        None
      }
    }
  }

  fn empty_trash(&self, paths: Vec<PathBuf>) {
    for path in paths {
      if let Err(e) = remove_dir_if_exists(&path) {
        warn!(path = %path.display(), error = %e, "failed to delete evicted artifact");
      }
    }
  }
}

/// Exclusive permission to build one fingerprint.
///
/// Dropping a ticket without storing releases the reservation.
pub struct Ticket {
  cache: ArtifactCache,
  fingerprint: Fingerprint,
  tx: watch::Sender<()>,
  rx: watch::Receiver<()>,
  done: bool,
}

impl Ticket {
  pub fn fingerprint(&self) -> &Fingerprint {
    &self.fingerprint
  }

  /// Record the build's result and wake every waiter.
  pub async fn store(self, record: BuildRecord) -> Result<CachedBuild, CacheError> {
    self.store_leased(record).await.map(|(build, _)| build)
  }

  /// Like [`Ticket::store`], but a new artifact comes back already pinned.
  ///
  /// The lease is taken before eviction runs, so the builder always gets to
  /// verify what it built even when every other artifact is pinned and the
  /// cache has to stay over capacity until the lease drops.
  pub async fn store_leased(self, record: BuildRecord) -> Result<(CachedBuild, Option<Lease>), CacheError> {
    match record {
      BuildRecord::Built(meta) => {
        let fingerprint = self.fingerprint.clone();
        let dir = self.cache.inner.layout.artifact_dir(&fingerprint);
        let (marker, bytes) = tokio::task::spawn_blocking({
          let dir = dir.clone();
          move || write_artifact_marker(&dir, &fingerprint, &meta)
        })
        .await
        .map_err(|e| CacheError::Task(e.to_string()))??;

        debug!(build = %self.fingerprint, bytes, "stored artifact");
        let artifact = Artifact {
          fingerprint: self.fingerprint.clone(),
          dir,
          marker,
        };
        let entry = Entry::new(CachedBuild::Built(Arc::new(artifact)), bytes, true);
        Ok(self.complete(entry, true))
      }
      BuildRecord::Failed(failure) => {
        debug!(build = %self.fingerprint, kind = ?failure.kind, "stored build failure");
        Ok(self.complete(Entry::new(CachedBuild::Failed(Arc::new(failure)), 0, true), false))
      }
    }
  }

  fn complete(mut self, mut entry: Entry, pin: bool) -> (CachedBuild, Option<Lease>) {
    let build = entry.build.clone();
    let lease = match &entry.build {
      CachedBuild::Built(artifact) if pin => {
        entry.pins += 1;
        Some(Lease {
          cache: self.cache.clone(),
          artifact: artifact.clone(),
        })
      }
      _ => None,
    };
    let (trash, _) = {
      let mut guard = self.cache.state();
      let state = &mut *guard;
      entry.last_access = state.tick();
      state.slots.insert(self.fingerprint.clone(), Slot::Done(entry));
      self.cache.evict_locked(state)
    };
    self.done = true;
    self.tx.send_replace(());
    self.cache.empty_trash(trash);
    (build, lease)
  }
}

fn write_artifact_marker(
  dir: &Path,
  fingerprint: &Fingerprint,
  meta: &ArtifactMeta,
) -> Result<(ArtifactMarker, u64), CacheError> {
  if !dir.is_dir() {
    return Err(CacheError::MissingArtifact(dir.to_path_buf()));
  }
  let marker = disk::write_marker(dir, fingerprint, meta)?;
  Ok((marker, directory_size(dir)))
}

impl Drop for Ticket {
  fn drop(&mut self) {
    if self.done {
      return;
    }
    let mut state = self.cache.state();
    if matches!(state.slots.get(&self.fingerprint), Some(Slot::Building(_))) {
      state.slots.remove(&self.fingerprint);
      debug!(build = %self.fingerprint, "reservation released");
    }
  }
}

/// A pinned artifact. Unpinned on drop.
#[derive(Debug)]
pub struct Lease {
  cache: ArtifactCache,
  artifact: Arc<Artifact>,
}

impl Lease {
  pub fn artifact(&self) -> &Artifact {
    &self.artifact
  }

  pub fn dir(&self) -> &Path {
    &self.artifact.dir
  }
}

impl Drop for Lease {
  fn drop(&mut self) {
    let trash = {
      let mut guard = self.cache.state();
      let state = &mut *guard;
      if let Some(Slot::Done(entry)) = state.slots.get_mut(&self.artifact.fingerprint) {
        entry.pins = entry.pins.saturating_sub(1);
      }
      self.cache.evict_locked(state).0
    };
    self.cache.empty_trash(trash);
  }
}
