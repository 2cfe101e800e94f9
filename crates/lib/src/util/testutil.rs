//! Test utilities for pkgcheck-lib.
//!
//! Helpers for writing recipe trees to disk and for building shell
//! invocations that behave the same on every Unix runner.

use std::fs;
use std::path::{Path, PathBuf};

/// Write `content` to `path`, creating parent directories.
pub fn write_file(path: &Path, content: &str) {
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent).unwrap();
  }
  fs::write(path, content).unwrap();
}

/// Quote a string for a single-quoted YAML scalar.
pub fn yaml_quote(s: &str) -> String {
  format!("'{}'", s.replace('\'', "''"))
}

/// Returns the shell command and args to execute a shell script.
#[cfg(unix)]
pub fn shell_cmd(script: &str) -> (&'static str, Vec<String>) {
  ("/bin/sh", vec!["-c".to_string(), script.to_string()])
}

#[cfg(windows)]
pub fn shell_cmd(script: &str) -> (&'static str, Vec<String>) {
  ("cmd.exe", vec!["/C".to_string(), script.to_string()])
}

/// Builder for a recipe version folder.
///
/// The default recipe builds a one-file artifact and a smoke test that copies
/// `test_package/test.sh` into place as the test binary and runs it.
pub struct RecipeFixture {
  name: String,
  folder: String,
  options: Vec<(String, Vec<String>)>,
  build: String,
  compile: String,
  run: Option<String>,
  test_script: String,
  extra: Vec<String>,
}

impl RecipeFixture {
  pub fn new(name: &str, folder: &str) -> Self {
    Self {
      name: name.to_string(),
      folder: folder.to_string(),
      options: Vec::new(),
      build: "mkdir -p \"$${out}/lib\" && echo built > \"$${out}/lib/libpkg.a\"".to_string(),
      compile: "cp \"$${test:sources}\" \"$${test:bin}\" && chmod +x \"$${test:bin}\"".to_string(),
      run: None,
      test_script: "#!/bin/sh\nexit 0\n".to_string(),
      extra: Vec::new(),
    }
  }

  pub fn option(mut self, name: &str, values: &[&str]) -> Self {
    self
      .options
      .push((name.to_string(), values.iter().map(|v| v.to_string()).collect()));
    self
  }

  pub fn build(mut self, script: &str) -> Self {
    self.build = script.to_string();
    self
  }

  pub fn compile(mut self, script: &str) -> Self {
    self.compile = script.to_string();
    self
  }

  pub fn run(mut self, script: &str) -> Self {
    self.run = Some(script.to_string());
    self
  }

  /// Contents of `test_package/test.sh`, which the default compile step
  /// turns into the test binary.
  pub fn test_script(mut self, script: &str) -> Self {
    self.test_script = script.to_string();
    self
  }

  /// Append a raw top-level line to `recipe.yml`.
  pub fn manifest_line(mut self, line: &str) -> Self {
    self.extra.push(line.to_string());
    self
  }

  /// Render `recipe.yml`.
  pub fn manifest(&self) -> String {
    let mut yaml = String::new();
    if !self.options.is_empty() {
      yaml.push_str("options:\n");
      for (name, values) in &self.options {
        let values: Vec<_> = values.iter().map(|v| yaml_quote(v)).collect();
        yaml.push_str(&format!("  - name: {}\n    values: [{}]\n", name, values.join(", ")));
      }
    }
    yaml.push_str(&format!("build: {}\n", yaml_quote(&self.build)));
    yaml.push_str("test_package:\n  sources: [test_package/test.sh]\n");
    yaml.push_str(&format!("  compile: {}\n", yaml_quote(&self.compile)));
    if let Some(run) = &self.run {
      yaml.push_str(&format!("  run: {}\n", yaml_quote(run)));
    }
    for line in &self.extra {
      yaml.push_str(line);
      yaml.push('\n');
    }
    yaml
  }

  /// Write the folder below `root` and return its path.
  pub fn write(&self, root: &Path) -> PathBuf {
    let folder = root.join(&self.name).join(&self.folder);
    write_file(&folder.join("recipe.yml"), &self.manifest());
    write_file(&folder.join("test_package/test.sh"), &self.test_script);
    folder
  }
}
