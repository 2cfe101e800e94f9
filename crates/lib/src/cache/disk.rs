//! Completion markers and store scanning.
//!
//! An artifact directory counts as stored only once its marker exists. The
//! marker records the hash of everything else in the directory, so a later run
//! can tell a reusable artifact from one that was modified or half-deleted.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::CacheError;
use crate::consts::{MARKER_FILE, MARKER_VERSION};
use crate::store::StoreLayout;
use crate::util::hash::{ContentHash, Fingerprint, directory_size, hash_directory};

/// Entries excluded when hashing an artifact directory.
/// - MARKER_FILE: written after the hash
/// - "tmp": scratch files a build may leave behind
const ARTIFACT_HASH_EXCLUSIONS: &[&str] = &[MARKER_FILE, "tmp"];

/// Contents of an artifact's completion marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMarker {
  pub version: u32,
  pub fingerprint: Fingerprint,
  /// `name/version#revision` of the recipe that produced the artifact.
  pub recipe: String,
  pub output_hash: ContentHash,
  pub duration_ms: u64,
  pub toolchain: String,
  pub created_unix: u64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub build_log: Option<PathBuf>,
}

/// Metadata supplied by the builder when storing a successful build.
#[derive(Debug, Clone)]
pub struct ArtifactMeta {
  pub recipe: String,
  pub duration: Duration,
  pub toolchain: String,
  pub build_log: Option<PathBuf>,
}

pub fn output_hash(dir: &Path) -> Result<ContentHash, CacheError> {
  hash_directory(dir, ARTIFACT_HASH_EXCLUSIONS).map_err(|e| CacheError::Hash {
    path: dir.to_path_buf(),
    message: e.to_string(),
  })
}

/// Hash `dir` and write its completion marker.
pub fn write_marker(dir: &Path, fingerprint: &Fingerprint, meta: &ArtifactMeta) -> Result<ArtifactMarker, CacheError> {
  let marker = ArtifactMarker {
    version: MARKER_VERSION,
    fingerprint: fingerprint.clone(),
    recipe: meta.recipe.clone(),
    output_hash: output_hash(dir)?,
    duration_ms: meta.duration.as_millis() as u64,
    toolchain: meta.toolchain.clone(),
    created_unix: SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map(|d| d.as_secs())
      .unwrap_or(0),
    build_log: meta.build_log.clone(),
  };

  let path = dir.join(MARKER_FILE);
  let content = serde_json::to_string(&marker).map_err(|e| CacheError::Marker {
    path: path.clone(),
    message: e.to_string(),
  })?;
  fs::write(&path, format!("{content}\n")).map_err(|source| CacheError::Io { path, source })?;
  Ok(marker)
}

/// Read a completion marker.
///
/// Returns `None` when the marker is missing or was written by another marker
/// format version.
pub fn read_marker(dir: &Path) -> Result<Option<ArtifactMarker>, CacheError> {
  let path = dir.join(MARKER_FILE);
  let content = match fs::read_to_string(&path) {
    Ok(content) => content,
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
    Err(source) => return Err(CacheError::Io { path, source }),
  };
  let marker: ArtifactMarker = serde_json::from_str(&content).map_err(|e| CacheError::Marker {
    path: path.clone(),
    message: e.to_string(),
  })?;
  if marker.version != MARKER_VERSION {
    debug!(path = %path.display(), version = marker.version, "ignoring marker from another format version");
    return Ok(None);
  }
  Ok(Some(marker))
}

/// True if the directory still hashes to what its marker recorded.
pub fn verify_marker(dir: &Path, marker: &ArtifactMarker) -> bool {
  match output_hash(dir) {
    Ok(current) if current == marker.output_hash => true,
    Ok(current) => {
      warn!(
        path = %dir.display(),
        expected = %marker.output_hash,
        actual = %current,
        "artifact corrupted, discarding"
      );
      false
    }
    Err(e) => {
      warn!(path = %dir.display(), error = %e, "failed to hash artifact, discarding");
      false
    }
  }
}

/// A completed artifact found on disk.
#[derive(Debug)]
pub struct FoundArtifact {
  pub marker: ArtifactMarker,
  pub bytes: u64,
}

#[derive(Debug, Default)]
pub struct StoreScan {
  pub artifacts: Vec<FoundArtifact>,
  /// Artifact directories with no usable marker: interrupted or foreign builds.
  pub incomplete: Vec<PathBuf>,
}

/// List the artifact directories of a store.
pub fn scan(layout: &StoreLayout) -> Result<StoreScan, CacheError> {
  let build_root = layout.build_root();
  let mut result = StoreScan::default();

  let entries = match fs::read_dir(&build_root) {
    Ok(entries) => entries,
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(result),
    Err(source) => return Err(CacheError::Io { path: build_root, source }),
  };

  for entry in entries.flatten() {
    let path = entry.path();
    if !path.is_dir() {
      continue;
    }
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
      continue;
    };

    let marker = match read_marker(&path) {
      Ok(marker) => marker,
      Err(e) => {
        warn!(path = %path.display(), error = %e, "unreadable marker");
        None
      }
    };
    match marker {
      Some(marker) if marker.fingerprint.as_str() == name => {
        let bytes = directory_size(&path);
        result.artifacts.push(FoundArtifact { marker, bytes });
      }
      _ => {
        debug!(path = %path.display(), "incomplete artifact");
        result.incomplete.push(path);
      }
    }
  }

  result.artifacts.sort_by(|a, b| a.marker.created_unix.cmp(&b.marker.created_unix));
  result.incomplete.sort();
  Ok(result)
}
