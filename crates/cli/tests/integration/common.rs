//! Shared test helpers for CLI integration tests.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::TempDir;

/// Recipe build that records its `shared` option in the artifact.
pub const BUILD_RECORDING_SHARED: &str = "mkdir -p \"$${out}/lib\" && echo $${opt:shared} > \"$${out}/lib/shared\"";

/// Copies `test_package/test.sh` into place as the test binary.
pub const COMPILE_COPY: &str = "cp \"$${test:sources}\" \"$${test:bin}\" && chmod +x \"$${test:bin}\"";

/// Smoke test that only passes for the shared build.
pub const TEST_REQUIRES_SHARED: &str = "#!/bin/sh\n[ \"$PKGCHECK_OPT_SHARED\" = \"True\" ]\n";

/// Isolated test environment.
///
/// Each test gets its own temporary directory with an isolated recipe tree,
/// store, data, and cache paths.
pub struct TestEnv {
  pub temp: TempDir,
}

impl TestEnv {
  pub fn empty() -> Self {
    Self {
      temp: TempDir::new().unwrap(),
    }
  }

  /// An environment with the `foo/1.0` recipe: option `shared` in
  /// {True, False}, where only the shared build passes its smoke test.
  pub fn with_foo() -> Self {
    let env = Self::empty();
    env.write_recipe("foo", "1.0", &foo_manifest(), TEST_REQUIRES_SHARED);
    env
  }

  /// Write a file relative to the temp directory.
  pub fn write_file(&self, relative_path: &str, content: &str) {
    let path = self.temp.path().join(relative_path);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
  }

  /// Write `recipes/<name>/<version>/` with its manifest and smoke test.
  pub fn write_recipe(&self, name: &str, version: &str, manifest: &str, test_script: &str) {
    self.write_file(&format!("recipes/{name}/{version}/recipe.yml"), manifest);
    self.write_file(&format!("recipes/{name}/{version}/test_package/test.sh"), test_script);
  }

  /// Write `pkgcheck.yml` next to the recipes directory.
  pub fn write_config(&self, content: &str) {
    self.write_file("pkgcheck.yml", content);
  }

  pub fn recipes_path(&self) -> PathBuf {
    self.temp.path().join("recipes")
  }

  pub fn report_path(&self) -> PathBuf {
    self.temp.path().join("report.jsonl")
  }

  /// Store path (isolated per test).
  pub fn store_path(&self) -> PathBuf {
    self.dir("store")
  }

  pub fn data_path(&self) -> PathBuf {
    self.dir("data")
  }

  pub fn cache_path(&self) -> PathBuf {
    self.dir("cache")
  }

  fn dir(&self, name: &str) -> PathBuf {
    let p = self.temp.path().join(name);
    std::fs::create_dir_all(&p).unwrap();
    dunce::canonicalize(&p).unwrap_or(p)
  }

  /// Get a pre-configured Command for the pkgcheck binary.
  ///
  /// Sets environment variables for isolated testing:
  /// - `PKGCHECK_STORE`: Isolated store path
  /// - `XDG_DATA_HOME`: Isolated data path (for reports)
  /// - `XDG_CACHE_HOME`: Isolated cache path
  pub fn pkgcheck_cmd(&self) -> Command {
    let mut cmd: Command = cargo_bin_cmd!("pkgcheck");
    cmd.current_dir(self.temp.path());
    cmd.env("PKGCHECK_STORE", self.store_path());
    cmd.env("XDG_DATA_HOME", self.data_path());
    cmd.env("XDG_CACHE_HOME", self.cache_path());
    cmd.env_remove("RUST_LOG");
    cmd
  }

  /// `pkgcheck run` writing its report to [`TestEnv::report_path`].
  pub fn run_cmd(&self) -> Command {
    let mut cmd = self.pkgcheck_cmd();
    cmd.arg("run").arg(self.recipes_path()).arg("--report").arg(self.report_path());
    cmd
  }

  /// Parsed report lines; the last one is the summary.
  pub fn report_lines(&self) -> Vec<serde_json::Value> {
    read_jsonl(&self.report_path())
  }
}

pub fn foo_manifest() -> String {
  format!(
    "options:\n  - name: shared\n    values: ['True', 'False']\nbuild: '{BUILD_RECORDING_SHARED}'\ntest_package:\n  sources: [test_package/test.sh]\n  compile: '{COMPILE_COPY}'\n"
  )
}

pub fn read_jsonl(path: &Path) -> Vec<serde_json::Value> {
  std::fs::read_to_string(path)
    .unwrap()
    .lines()
    .map(|line| serde_json::from_str(line).unwrap())
    .collect()
}
