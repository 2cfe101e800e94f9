//! Harness configuration (`pkgcheck.yml`).
//!
//! Settings are resolved in three layers: built-in defaults, the config file,
//! then command-line flags (applied by the CLI). Profiles name the environment
//! axes (platform, compiler, linkage, ...) every recipe is expanded against.
//!
//! ```yaml
//! workers: 8
//! build_timeout: 45m
//! verify_timeout: 5m
//! cache:
//!   max_entries: 2000
//! profiles:
//!   - name: gcc13-static
//!     compiler: gcc
//!     compiler_version: "13"
//!     linkage: static
//!   - name: gcc13-shared
//!     compiler: gcc
//!     compiler_version: "13"
//!     linkage: shared
//!     vars: { CFLAGS: -O2 }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::consts::{DEFAULT_MAX_UNITS, HARNESS_CONFIG_FILE};
use crate::platform;
use crate::recipe::RecipeError;

/// Names of the environment axes, usable in recipe exclude/skip rules.
pub const ENV_AXES: &[&str] = &["platform", "compiler", "compiler_version", "linkage", "build_type"];

pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_PROFILE: &str = "default";

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_yaml::Error,
  },

  #[error(transparent)]
  Recipe(#[from] RecipeError),

  #[error("invalid setting '{key}': {message}")]
  InvalidSetting { key: String, message: String },

  #[error("profile '{0}' is defined more than once")]
  DuplicateProfile(String),

  #[error("{referenced_by}: unknown profile '{profile}'")]
  UnknownProfile { referenced_by: String, profile: String },

  #[error("{recipe}: option '{axis}' has an empty domain")]
  EmptyDomain { recipe: String, axis: String },

  #[error("{recipe}: option '{axis}' is declared more than once")]
  DuplicateAxis { recipe: String, axis: String },

  #[error("{recipe}: option name '{axis}' is reserved for the environment")]
  ReservedAxis { recipe: String, axis: String },

  #[error("{recipe}: {rule} rule references undeclared axis '{axis}'")]
  UnknownAxis { recipe: String, rule: String, axis: String },

  #[error("{recipe}: {rule} rule references value '{value}' not in the domain of '{axis}'")]
  UnknownAxisValue {
    recipe: String,
    rule: String,
    axis: String,
    value: String,
  },

  #[error("{scope}: matrix expands to {units} units, more than the maximum of {max}")]
  TooManyUnits { scope: String, units: u128, max: usize },

  #[error("{recipe}: failed to compute fingerprint: {source}")]
  Fingerprint {
    recipe: String,
    #[source]
    source: serde_json::Error,
  },
}

/// Library linkage mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Linkage {
  #[default]
  Static,
  Shared,
}

impl Linkage {
  pub fn as_str(&self) -> &'static str {
    match self {
      Linkage::Static => "static",
      Linkage::Shared => "shared",
    }
  }
}

impl fmt::Display for Linkage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Assignment of the environment axes plus variables exported to the toolchain.
///
/// Serialized into the fingerprint, so every field uses ordered containers.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Environment {
  #[serde(default = "default_platform")]
  pub platform: String,
  #[serde(default = "default_compiler")]
  pub compiler: String,
  #[serde(default)]
  pub compiler_version: String,
  #[serde(default)]
  pub linkage: Linkage,
  #[serde(default = "default_build_type")]
  pub build_type: String,
  #[serde(default)]
  pub vars: BTreeMap<String, String>,
}

impl Default for Environment {
  fn default() -> Self {
    Self {
      platform: default_platform(),
      compiler: default_compiler(),
      compiler_version: String::new(),
      linkage: Linkage::default(),
      build_type: default_build_type(),
      vars: BTreeMap::new(),
    }
  }
}

impl Environment {
  /// Value of an environment axis by name.
  pub fn axis_value(&self, axis: &str) -> Option<&str> {
    match axis {
      "platform" => Some(&self.platform),
      "compiler" => Some(&self.compiler),
      "compiler_version" => Some(&self.compiler_version),
      "linkage" => Some(self.linkage.as_str()),
      "build_type" => Some(&self.build_type),
      _ => None,
    }
  }

  /// Compiler identity, e.g. `gcc-13` or `cc`.
  pub fn toolchain(&self) -> String {
    if self.compiler_version.is_empty() {
      self.compiler.clone()
    } else {
      format!("{}-{}", self.compiler, self.compiler_version)
    }
  }
}

fn default_platform() -> String {
  platform::host_triple()
}

fn default_compiler() -> String {
  platform::default_compiler().to_string()
}

fn default_build_type() -> String {
  "Release".to_string()
}

/// A named environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
  pub name: String,
  #[serde(flatten)]
  pub environment: Environment,
}

impl Profile {
  /// The host profile used when the config declares none.
  pub fn host() -> Self {
    Self {
      name: DEFAULT_PROFILE.to_string(),
      environment: Environment::default(),
    }
  }
}

/// Bounds past which the artifact cache evicts least-recently-used entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheCapacity {
  pub max_entries: Option<usize>,
  pub max_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
  /// Worker pool size; `None` uses the available parallelism.
  pub workers: Option<usize>,
  pub max_units: usize,
  pub fail_fast: bool,
  #[serde(with = "humantime_duration")]
  pub build_timeout: Duration,
  #[serde(with = "humantime_duration")]
  pub verify_timeout: Duration,
  /// Pass the harness's own environment through to builds and smoke tests.
  pub inherit_env: bool,
  /// Shell used for string invocations; defaults to `/bin/sh` (`cmd.exe` on
  /// Windows). `$SHELL` is never consulted.
  pub shell: Option<String>,
  pub cache: CacheCapacity,
  pub profiles: Vec<Profile>,
}

impl Default for HarnessConfig {
  fn default() -> Self {
    Self {
      workers: None,
      max_units: DEFAULT_MAX_UNITS,
      fail_fast: false,
      build_timeout: DEFAULT_BUILD_TIMEOUT,
      verify_timeout: DEFAULT_VERIFY_TIMEOUT,
      inherit_env: true,
      shell: None,
      cache: CacheCapacity::default(),
      profiles: Vec::new(),
    }
  }
}

impl HarnessConfig {
  /// Load and validate a config file.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    let config: HarnessConfig = serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })?;
    config.validate()?;
    debug!(path = %path.display(), profiles = config.profiles.len(), "loaded harness config");
    Ok(config)
  }

  /// Locate the config: an explicit path, else `pkgcheck.yml` next to the
  /// recipes directory, else built-in defaults.
  ///
  /// Returns the config and the file it came from, if any.
  pub fn discover(explicit: Option<&Path>, recipes_dir: &Path) -> Result<(Self, Option<PathBuf>), ConfigError> {
    if let Some(path) = explicit {
      return Ok((Self::load(path)?, Some(path.to_path_buf())));
    }

    let candidate = recipes_dir
      .parent()
      .filter(|p| !p.as_os_str().is_empty())
      .unwrap_or(Path::new("."))
      .join(HARNESS_CONFIG_FILE);
    if candidate.is_file() {
      return Ok((Self::load(&candidate)?, Some(candidate)));
    }

    debug!("no {} found, using defaults", HARNESS_CONFIG_FILE);
    Ok((Self::default(), None))
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.workers == Some(0) {
      return Err(ConfigError::InvalidSetting {
        key: "workers".to_string(),
        message: "must be at least 1".to_string(),
      });
    }
    if self.max_units == 0 {
      return Err(ConfigError::InvalidSetting {
        key: "max_units".to_string(),
        message: "must be at least 1".to_string(),
      });
    }
    for (key, timeout) in [("build_timeout", self.build_timeout), ("verify_timeout", self.verify_timeout)] {
      if timeout.is_zero() {
        return Err(ConfigError::InvalidSetting {
          key: key.to_string(),
          message: "must be greater than zero".to_string(),
        });
      }
    }

    let mut seen = BTreeSet::new();
    for profile in &self.profiles {
      if !seen.insert(profile.name.as_str()) {
        return Err(ConfigError::DuplicateProfile(profile.name.clone()));
      }
    }
    Ok(())
  }

  /// Worker pool size after applying the parallelism default.
  pub fn worker_count(&self) -> usize {
    self
      .workers
      .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1))
  }

  /// Configured profiles, or the host profile when none are declared.
  pub fn profiles(&self) -> Vec<Profile> {
    if self.profiles.is_empty() {
      vec![Profile::host()]
    } else {
      self.profiles.clone()
    }
  }

  /// Profiles selected by name, in config order. An empty selection means all.
  pub fn select_profiles(&self, names: &[String]) -> Result<Vec<Profile>, ConfigError> {
    let all = self.profiles();
    if names.is_empty() {
      return Ok(all);
    }
    for name in names {
      if !all.iter().any(|p| &p.name == name) {
        return Err(ConfigError::UnknownProfile {
          referenced_by: "--profile".to_string(),
          profile: name.clone(),
        });
      }
    }
    Ok(all.into_iter().filter(|p| names.contains(&p.name)).collect())
  }
}

/// Serde adapter for `Duration` written as a humantime string (`"45m"`).
pub mod humantime_duration {
  use std::time::Duration;

  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&humantime::format_duration(*value))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let s = String::deserialize(deserializer)?;
    humantime::parse_duration(&s).map_err(serde::de::Error::custom)
  }
}

/// Serde adapter for `Option<Duration>` written as a humantime string.
pub mod humantime_opt {
  use std::time::Duration;

  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
      Some(d) => serializer.collect_str(&humantime::format_duration(*d)),
      None => serializer.serialize_none(),
    }
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
    match Option::<String>::deserialize(deserializer)? {
      Some(s) => humantime::parse_duration(&s).map(Some).map_err(serde::de::Error::custom),
      None => Ok(None),
    }
  }
}
