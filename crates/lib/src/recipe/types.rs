//! Recipe types.
//!
//! A `Recipe` is the harness's immutable view of one library version: its
//! identity, option axes, matrix rules, build invocation, and smoke test.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

/// Identity of a recipe: `name/version#revision`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecipeId {
  pub name: String,
  pub version: String,
  pub revision: String,
}

impl RecipeId {
  /// `name/version`, the form used by filters and log lines.
  pub fn reference(&self) -> String {
    format!("{}/{}", self.name, self.version)
  }
}

impl fmt::Display for RecipeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}#{}", self.name, self.version, self.revision)
  }
}

/// One option axis: a name and its finite, ordered domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Axis {
  pub name: String,
  #[serde(deserialize_with = "scalar_list")]
  pub values: Vec<String>,
}

/// Axis assignments that must all match for a rule to apply.
pub type AxisMatch = BTreeMap<String, String>;

/// A combination that is valid but known not to work; units matching it are
/// reported as skipped instead of being built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipRule {
  #[serde(deserialize_with = "scalar_map")]
  pub when: AxisMatch,
  pub reason: String,
}

/// An external command: a shell script line or an explicit argv.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Invocation {
  Shell(String),
  Argv(Vec<String>),
}

impl fmt::Display for Invocation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Invocation::Shell(script) => write!(f, "{}", script.trim()),
      Invocation::Argv(argv) => write!(f, "{}", argv.join(" ")),
    }
  }
}

/// The recipe's `test_package` program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmokeTest {
  /// Absolute paths to the program sources.
  pub sources: Vec<PathBuf>,
  /// Compiles and links the sources against the artifact into `$${test:bin}`.
  pub compile: Invocation,
  /// Runs the program. Defaults to executing `$${test:bin}` with no arguments.
  pub run: Option<Invocation>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timeouts {
  pub build: Option<Duration>,
  pub verify: Option<Duration>,
}

/// A loaded recipe. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipe {
  pub id: RecipeId,
  /// The version folder holding `recipe.yml`.
  pub folder: PathBuf,
  /// Option axes in declaration order.
  pub options: Vec<Axis>,
  pub exclude: Vec<AxisMatch>,
  pub skip: Vec<SkipRule>,
  /// Profile names this recipe is restricted to; `None` means all profiles.
  pub profiles: Option<Vec<String>>,
  pub build: Invocation,
  pub test_package: SmokeTest,
  pub timeouts: Timeouts,
}

/// On-disk form of `recipe.yml`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RecipeManifest {
  #[serde(default, deserialize_with = "optional_scalar")]
  pub revision: Option<String>,
  #[serde(default)]
  pub options: Vec<Axis>,
  #[serde(default, deserialize_with = "scalar_map_list")]
  pub exclude: Vec<AxisMatch>,
  #[serde(default)]
  pub skip: Vec<SkipRule>,
  #[serde(default)]
  pub profiles: Option<Vec<String>>,
  pub build: Invocation,
  pub test_package: SmokeTestManifest,
  #[serde(default)]
  pub timeouts: TimeoutsManifest,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SmokeTestManifest {
  pub sources: Vec<PathBuf>,
  pub compile: Invocation,
  #[serde(default)]
  pub run: Option<Invocation>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct TimeoutsManifest {
  #[serde(default, with = "crate::config::humantime_opt")]
  pub build: Option<Duration>,
  #[serde(default, with = "crate::config::humantime_opt")]
  pub verify: Option<Duration>,
}

/// On-disk form of a recipe directory's `config.yml`.
#[derive(Debug, Deserialize)]
pub(crate) struct VersionsFile {
  pub versions: BTreeMap<Scalar, VersionEntry>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct VersionEntry {
  pub folder: String,
}

/// A YAML scalar read as text.
///
/// Recipe files write option values as `true`, `3`, or `1.2.11`; all of them
/// are compared as strings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Scalar(pub String);

impl<'de> Deserialize<'de> for Scalar {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    struct ScalarVisitor;

    impl serde::de::Visitor<'_> for ScalarVisitor {
      type Value = Scalar;

      fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a string, number, or boolean")
      }

      fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Scalar, E> {
        Ok(Scalar(v.to_string()))
      }

      fn visit_bool<E: serde::de::Error>(self, v: bool) -> Result<Scalar, E> {
        Ok(Scalar(v.to_string()))
      }

      fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Scalar, E> {
        Ok(Scalar(v.to_string()))
      }

      fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Scalar, E> {
        Ok(Scalar(v.to_string()))
      }

      fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<Scalar, E> {
        Ok(Scalar(v.to_string()))
      }
    }

    deserializer.deserialize_any(ScalarVisitor)
  }
}

fn scalar_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
  let values = Vec::<Scalar>::deserialize(deserializer)?;
  Ok(values.into_iter().map(|s| s.0).collect())
}

fn scalar_map<'de, D: Deserializer<'de>>(deserializer: D) -> Result<AxisMatch, D::Error> {
  let map = BTreeMap::<String, Scalar>::deserialize(deserializer)?;
  Ok(map.into_iter().map(|(k, v)| (k, v.0)).collect())
}

fn scalar_map_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<AxisMatch>, D::Error> {
  let maps = Vec::<BTreeMap<String, Scalar>>::deserialize(deserializer)?;
  Ok(
    maps
      .into_iter()
      .map(|m| m.into_iter().map(|(k, v)| (k, v.0)).collect())
      .collect(),
  )
}

fn optional_scalar<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
  Ok(Option::<Scalar>::deserialize(deserializer)?.map(|s| s.0))
}
