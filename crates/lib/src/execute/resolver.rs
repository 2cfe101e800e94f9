//! Placeholder resolution and environment export for one work unit.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::ENV_AXES;
use crate::matrix::WorkUnit;
use crate::placeholder::{Placeholder, PlaceholderError, RecipeField, Resolver, TestField};
use crate::store::StoreLayout;

/// Paths of a smoke test being compiled and run.
#[derive(Debug, Clone)]
struct TestPaths {
  dir: String,
  bin: String,
  sources: Vec<String>,
  sources_joined: String,
}

/// Resolver for placeholders in a unit's build and smoke-test invocations.
///
/// Knows the unit's store paths, option values, environment axes and profile
/// variables. Test fields resolve only after [`with_test`](Self::with_test).
#[derive(Debug, Clone)]
pub struct UnitResolver {
  out: String,
  src: String,
  work: String,
  options: BTreeMap<String, String>,
  /// Environment axes and profile variables; axes shadow variables.
  env: BTreeMap<String, String>,
  vars: BTreeMap<String, String>,
  name: String,
  version: String,
  revision: String,
  fingerprint: String,
  test: Option<TestPaths>,
}

impl UnitResolver {
  pub fn new(unit: &WorkUnit, layout: &StoreLayout) -> Self {
    let environment = &unit.configuration.environment;
    let vars = environment.vars.clone();

    let mut env = vars.clone();
    for axis in ENV_AXES {
      if let Some(value) = environment.axis_value(axis) {
        env.insert(axis.to_string(), value.to_string());
      }
    }

    Self {
      out: path_string(&layout.artifact_dir(&unit.fingerprint)),
      src: path_string(&unit.recipe.folder),
      work: path_string(&layout.work_dir(&unit.fingerprint)),
      options: unit.configuration.options_map(),
      env,
      vars,
      name: unit.recipe.id.name.clone(),
      version: unit.recipe.id.version.clone(),
      revision: unit.recipe.id.revision.clone(),
      fingerprint: unit.fingerprint.0.clone(),
      test: None,
    }
  }

  /// Enable `$${test:...}` placeholders for a smoke test compiled in `dir`.
  pub fn with_test(mut self, dir: &Path, bin: &Path, sources: &[PathBuf]) -> Self {
    let sources: Vec<String> = sources.iter().map(|p| path_string(p)).collect();
    self.test = Some(TestPaths {
      dir: path_string(dir),
      bin: path_string(bin),
      sources_joined: sources.join(" "),
      sources,
    });
    self
  }

  /// Smoke-test sources, spliced as separate arguments for argv invocations.
  pub fn test_sources(&self) -> Option<&[String]> {
    self.test.as_ref().map(|t| t.sources.as_slice())
  }

  /// Variables exported to every process of this unit.
  pub fn env_vars(&self) -> BTreeMap<String, String> {
    let mut vars = self.vars.clone();

    vars.insert("out".to_string(), self.out.clone());
    vars.insert("PKGCHECK_OUT".to_string(), self.out.clone());
    vars.insert("PKGCHECK_SRC".to_string(), self.src.clone());
    vars.insert("PKGCHECK_WORK".to_string(), self.work.clone());
    vars.insert("PKGCHECK_RECIPE".to_string(), self.name.clone());
    vars.insert("PKGCHECK_VERSION".to_string(), self.version.clone());
    vars.insert("PKGCHECK_REVISION".to_string(), self.revision.clone());
    vars.insert("PKGCHECK_FINGERPRINT".to_string(), self.fingerprint.clone());

    for axis in ENV_AXES {
      if let Some(value) = self.env.get(*axis) {
        vars.insert(format!("PKGCHECK_{}", axis.to_uppercase()), value.clone());
      }
    }
    for (name, value) in &self.options {
      vars.insert(format!("PKGCHECK_OPT_{}", env_key(name)), value.clone());
    }
    if let Some(test) = &self.test {
      vars.insert("PKGCHECK_TEST_DIR".to_string(), test.dir.clone());
      vars.insert("PKGCHECK_TEST_BIN".to_string(), test.bin.clone());
    }

    vars
  }
}

impl Resolver for UnitResolver {
  fn resolve_out(&self) -> Result<&str, PlaceholderError> {
    Ok(&self.out)
  }

  fn resolve_src(&self) -> Result<&str, PlaceholderError> {
    Ok(&self.src)
  }

  fn resolve_work(&self) -> Result<&str, PlaceholderError> {
    Ok(&self.work)
  }

  fn resolve_option(&self, name: &str) -> Result<&str, PlaceholderError> {
    self
      .options
      .get(name)
      .map(String::as_str)
      .ok_or_else(|| PlaceholderError::Unresolved(Placeholder::Option(name.to_string()).to_string()))
  }

  fn resolve_env(&self, key: &str) -> Result<&str, PlaceholderError> {
    self
      .env
      .get(key)
      .map(String::as_str)
      .ok_or_else(|| PlaceholderError::Unresolved(Placeholder::Env(key.to_string()).to_string()))
  }

  fn resolve_recipe(&self, field: RecipeField) -> Result<&str, PlaceholderError> {
    Ok(match field {
      RecipeField::Name => &self.name,
      RecipeField::Version => &self.version,
      RecipeField::Revision => &self.revision,
      RecipeField::Fingerprint => &self.fingerprint,
    })
  }

  fn resolve_test(&self, field: TestField) -> Result<&str, PlaceholderError> {
    let test = self
      .test
      .as_ref()
      .ok_or_else(|| PlaceholderError::Unresolved(Placeholder::Test(field).to_string()))?;
    Ok(match field {
      TestField::Bin => &test.bin,
      TestField::Sources => &test.sources_joined,
      TestField::Dir => &test.dir,
    })
  }
}

/// `with-zlib` -> `WITH_ZLIB`
fn env_key(name: &str) -> String {
  name
    .chars()
    .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
    .collect()
}

fn path_string(path: &Path) -> String {
  path.to_string_lossy().into_owned()
}
