//! Configuration matrix expansion.
//!
//! A recipe declares option axes with finite domains; the harness config
//! declares profiles that fix the environment axes. Expansion takes the cross
//! product of both, drops excluded combinations, and turns the result into
//! fingerprinted [`WorkUnit`]s in a deterministic order: profiles outermost in
//! config order, then option axes in declaration order with the last axis
//! varying fastest.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::{ConfigError, ENV_AXES, Environment, HarnessConfig, Linkage, Profile};
use crate::recipe::{AxisMatch, Recipe};
use crate::util::hash::{Fingerprint, Fingerprinted};

/// One concrete assignment of every option axis plus an environment.
///
/// Equality and hashing are structural over every assigned value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Configuration {
  /// Option assignments in axis declaration order.
  pub options: Vec<(String, String)>,
  pub environment: Environment,
}

impl Configuration {
  pub fn option(&self, name: &str) -> Option<&str> {
    self
      .options
      .iter()
      .find(|(axis, _)| axis == name)
      .map(|(_, value)| value.as_str())
  }

  /// Value of an option axis or environment axis.
  pub fn axis_value(&self, axis: &str) -> Option<&str> {
    self.option(axis).or_else(|| self.environment.axis_value(axis))
  }

  /// True when every assignment in `rule` holds for this configuration.
  pub fn matches(&self, rule: &AxisMatch) -> bool {
    rule.iter().all(|(axis, value)| self.axis_value(axis) == Some(value.as_str()))
  }

  pub fn options_map(&self) -> BTreeMap<String, String> {
    self.options.iter().cloned().collect()
  }

  /// Short human label, e.g. `shared=True fPIC=False`.
  pub fn label(&self) -> String {
    self
      .options
      .iter()
      .map(|(axis, value)| format!("{axis}={value}"))
      .collect::<Vec<_>>()
      .join(" ")
  }
}

/// An expanded configuration and the profile it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixEntry {
  pub profile: String,
  pub configuration: Configuration,
}

/// A (recipe, configuration) pair ready to schedule. Never mutated after planning.
#[derive(Debug, Clone)]
pub struct WorkUnit {
  /// Position in expansion order; reports are ordered by it.
  pub index: usize,
  pub recipe: Arc<Recipe>,
  pub profile: String,
  pub configuration: Configuration,
  pub fingerprint: Fingerprint,
  /// Reason from the first matching recipe skip rule.
  pub skip: Option<String>,
}

impl fmt::Display for WorkUnit {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} [{}]", self.recipe.id.reference(), self.profile)?;
    if !self.configuration.options.is_empty() {
      write!(f, " {}", self.configuration.label())?;
    }
    Ok(())
  }
}

/// Canonical fingerprint input.
#[derive(Serialize)]
struct FingerprintInput<'a> {
  name: &'a str,
  version: &'a str,
  revision: &'a str,
  options: BTreeMap<&'a str, &'a str>,
  environment: &'a Environment,
}

impl Fingerprinted for FingerprintInput<'_> {}

/// Fingerprint of a recipe built in a configuration.
pub fn fingerprint(recipe: &Recipe, configuration: &Configuration) -> Result<Fingerprint, ConfigError> {
  FingerprintInput {
    name: &recipe.id.name,
    version: &recipe.id.version,
    revision: &recipe.id.revision,
    options: configuration
      .options
      .iter()
      .map(|(axis, value)| (axis.as_str(), value.as_str()))
      .collect(),
    environment: &configuration.environment,
  }
  .fingerprint()
  .map_err(|source| ConfigError::Fingerprint {
    recipe: recipe.id.reference(),
    source,
  })
}

/// Expand one recipe against the active profiles.
///
/// The cross-product size is checked against `max_units` before anything is
/// enumerated.
pub fn expand(recipe: &Recipe, profiles: &[Profile], max_units: usize) -> Result<Vec<MatrixEntry>, ConfigError> {
  let reference = recipe.id.reference();
  let domains = validate_axes(recipe)?;
  validate_rules(recipe, &domains)?;

  let profiles: Vec<&Profile> = match &recipe.profiles {
    Some(allowed) => profiles.iter().filter(|p| allowed.contains(&p.name)).collect(),
    None => profiles.iter().collect(),
  };

  let size = domains
    .iter()
    .try_fold(profiles.len() as u128, |acc, (_, values)| acc.checked_mul(values.len() as u128))
    .unwrap_or(u128::MAX);
  if size > max_units as u128 {
    return Err(ConfigError::TooManyUnits {
      scope: reference,
      units: size,
      max: max_units,
    });
  }

  let mut seen = HashSet::new();
  let mut entries = Vec::with_capacity(size as usize);
  for profile in profiles {
    let mut odometer = vec![0usize; domains.len()];
    loop {
      let configuration = Configuration {
        options: domains
          .iter()
          .zip(&odometer)
          .map(|((axis, values), &i)| (axis.to_string(), values[i].to_string()))
          .collect(),
        environment: profile.environment.clone(),
      };

      if recipe.exclude.iter().any(|rule| configuration.matches(rule)) {
        debug!(recipe = %reference, profile = %profile.name, config = %configuration.label(), "excluded");
      } else if seen.insert(configuration.clone()) {
        entries.push(MatrixEntry {
          profile: profile.name.clone(),
          configuration,
        });
      }

      if !advance(&mut odometer, &domains) {
        break;
      }
    }
  }

  debug!(recipe = %reference, units = entries.len(), candidates = size, "expanded matrix");
  Ok(entries)
}

/// Expand every recipe into work units, enforcing `max_units` per recipe and
/// across the whole run.
pub fn plan_units(
  recipes: Vec<Recipe>,
  config: &HarnessConfig,
  selected: &[Profile],
  max_units: usize,
) -> Result<Vec<WorkUnit>, ConfigError> {
  let known = config.profiles();
  let mut units = Vec::new();

  for recipe in recipes {
    if let Some(allowed) = &recipe.profiles {
      for name in allowed {
        if !known.iter().any(|p| &p.name == name) {
          return Err(ConfigError::UnknownProfile {
            referenced_by: recipe.id.reference(),
            profile: name.clone(),
          });
        }
      }
    }

    let entries = expand(&recipe, selected, max_units)?;
    let total = units.len() + entries.len();
    if total > max_units {
      return Err(ConfigError::TooManyUnits {
        scope: "run".to_string(),
        units: total as u128,
        max: max_units,
      });
    }

    let recipe = Arc::new(recipe);
    for entry in entries {
      let fp = fingerprint(&recipe, &entry.configuration)?;
      let skip = recipe
        .skip
        .iter()
        .find(|rule| entry.configuration.matches(&rule.when))
        .map(|rule| rule.reason.clone());
      units.push(WorkUnit {
        index: units.len(),
        recipe: Arc::clone(&recipe),
        profile: entry.profile,
        configuration: entry.configuration,
        fingerprint: fp,
        skip,
      });
    }
  }

  info!(units = units.len(), profiles = selected.len(), "planned work units");
  Ok(units)
}

/// Validated axes with duplicate values removed, in declaration order.
fn validate_axes(recipe: &Recipe) -> Result<Vec<(&str, Vec<&str>)>, ConfigError> {
  let reference = recipe.id.reference();
  let mut domains: Vec<(&str, Vec<&str>)> = Vec::with_capacity(recipe.options.len());

  for axis in &recipe.options {
    if ENV_AXES.contains(&axis.name.as_str()) {
      return Err(ConfigError::ReservedAxis {
        recipe: reference,
        axis: axis.name.clone(),
      });
    }
    if domains.iter().any(|(name, _)| *name == axis.name) {
      return Err(ConfigError::DuplicateAxis {
        recipe: reference,
        axis: axis.name.clone(),
      });
    }
    if axis.values.is_empty() {
      return Err(ConfigError::EmptyDomain {
        recipe: reference,
        axis: axis.name.clone(),
      });
    }

    let mut values: Vec<&str> = Vec::with_capacity(axis.values.len());
    for value in &axis.values {
      if !values.contains(&value.as_str()) {
        values.push(value);
      }
    }
    domains.push((axis.name.as_str(), values));
  }

  Ok(domains)
}

fn validate_rules(recipe: &Recipe, domains: &[(&str, Vec<&str>)]) -> Result<(), ConfigError> {
  let rules = recipe
    .exclude
    .iter()
    .map(|rule| ("exclude", rule))
    .chain(recipe.skip.iter().map(|rule| ("skip", &rule.when)));

  for (kind, rule) in rules {
    if rule.is_empty() {
      return Err(ConfigError::InvalidSetting {
        key: format!("{}: {kind}", recipe.id.reference()),
        message: "rule matches no axis".to_string(),
      });
    }

    for (axis, value) in rule {
      let known_value = if let Some((_, values)) = domains.iter().find(|(name, _)| *name == axis.as_str()) {
        values.contains(&value.as_str())
      } else if axis == "linkage" {
        value == Linkage::Static.as_str() || value == Linkage::Shared.as_str()
      } else if ENV_AXES.contains(&axis.as_str()) {
        true
      } else {
        return Err(ConfigError::UnknownAxis {
          recipe: recipe.id.reference(),
          rule: kind.to_string(),
          axis: axis.clone(),
        });
      };

      if !known_value {
        return Err(ConfigError::UnknownAxisValue {
          recipe: recipe.id.reference(),
          rule: kind.to_string(),
          axis: axis.clone(),
          value: value.clone(),
        });
      }
    }
  }
  Ok(())
}

/// Step the odometer; the last axis turns fastest. Returns false on wrap-around.
fn advance(odometer: &mut [usize], domains: &[(&str, Vec<&str>)]) -> bool {
  for pos in (0..odometer.len()).rev() {
    odometer[pos] += 1;
    if odometer[pos] < domains[pos].1.len() {
      return true;
    }
    odometer[pos] = 0;
  }
  false
}
