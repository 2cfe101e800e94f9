use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::RecipeError;
use super::types::{Recipe, RecipeId, RecipeManifest, SmokeTest, Timeouts, VersionsFile};
use crate::consts::{RECIPE_MANIFEST, RECIPE_VERSIONS_FILE, REVISION_LEN};
use crate::util::hash::hash_directory;

/// Entries ignored when computing a recipe revision: VCS metadata and
/// build detritus left behind by manual `test_package` runs.
const REVISION_EXCLUSIONS: &[&str] = &[".git", "build", "CMakeUserPresets.json"];

/// Load every recipe version below `root`, sorted by name then version.
///
/// Version folders without a `recipe.yml` are skipped; the repository may hold
/// recipes the harness has not been taught to build yet.
pub fn load_recipes(root: &Path) -> Result<Vec<Recipe>, RecipeError> {
  if !root.is_dir() {
    return Err(RecipeError::RootNotFound(root.to_path_buf()));
  }
  let root = dunce::canonicalize(root).map_err(|source| RecipeError::Read {
    path: root.to_path_buf(),
    source,
  })?;

  let mut recipes = Vec::new();
  for (name, dir) in visible_subdirs(&root)? {
    for (version, folder) in versions_of(&name, &dir)? {
      if !folder.join(RECIPE_MANIFEST).exists() {
        debug!(recipe = %name, version = %version, "no {} in version folder, skipping", RECIPE_MANIFEST);
        continue;
      }
      recipes.push(load_recipe(&name, &version, &folder)?);
    }
  }

  recipes.sort_by(|a, b| (&a.id.name, &a.id.version).cmp(&(&b.id.name, &b.id.version)));
  info!(count = recipes.len(), root = %root.display(), "loaded recipes");
  Ok(recipes)
}

/// Load a single recipe version from its folder.
pub fn load_recipe(name: &str, version: &str, folder: &Path) -> Result<Recipe, RecipeError> {
  let reference = format!("{name}/{version}");
  let manifest_path = folder.join(RECIPE_MANIFEST);
  let content = fs::read_to_string(&manifest_path).map_err(|source| RecipeError::Read {
    path: manifest_path.clone(),
    source,
  })?;
  let manifest: RecipeManifest = serde_yaml::from_str(&content).map_err(|source| RecipeError::Parse {
    path: manifest_path.clone(),
    source,
  })?;

  if manifest.test_package.sources.is_empty() {
    return Err(RecipeError::NoSources { recipe: reference });
  }

  let mut sources = Vec::with_capacity(manifest.test_package.sources.len());
  for source in &manifest.test_package.sources {
    let path = folder.join(source);
    if !path.is_file() {
      return Err(RecipeError::MissingSource {
        recipe: reference,
        path,
      });
    }
    sources.push(path);
  }

  let revision = match manifest.revision {
    Some(revision) => revision,
    None => {
      let hash = hash_directory(folder, REVISION_EXCLUSIONS).map_err(|e| RecipeError::Revision {
        recipe: reference.clone(),
        message: e.to_string(),
      })?;
      hash.0[..REVISION_LEN].to_string()
    }
  };

  debug!(recipe = %reference, revision = %revision, axes = manifest.options.len(), "loaded recipe");

  Ok(Recipe {
    id: RecipeId {
      name: name.to_string(),
      version: version.to_string(),
      revision,
    },
    folder: folder.to_path_buf(),
    options: manifest.options,
    exclude: manifest.exclude,
    skip: manifest.skip,
    profiles: manifest.profiles,
    build: manifest.build,
    test_package: SmokeTest {
      sources,
      compile: manifest.test_package.compile,
      run: manifest.test_package.run,
    },
    timeouts: Timeouts {
      build: manifest.timeouts.build,
      verify: manifest.timeouts.verify,
    },
  })
}

/// Keep recipes whose `name` or `name/version` matches any pattern.
///
/// An empty pattern list keeps everything.
pub fn filter_recipes(recipes: Vec<Recipe>, patterns: &[String]) -> Vec<Recipe> {
  if patterns.is_empty() {
    return recipes;
  }
  recipes
    .into_iter()
    .filter(|recipe| {
      let reference = recipe.id.reference();
      patterns
        .iter()
        .any(|p| matches_pattern(p, &recipe.id.name) || matches_pattern(p, &reference))
    })
    .collect()
}

/// Shell-style wildcard match supporting `*` and `?`.
pub fn matches_pattern(pattern: &str, text: &str) -> bool {
  let pattern: Vec<char> = pattern.chars().collect();
  let text: Vec<char> = text.chars().collect();

  let (mut p, mut t) = (0, 0);
  let mut star: Option<(usize, usize)> = None;

  while t < text.len() {
    if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
      p += 1;
      t += 1;
    } else if p < pattern.len() && pattern[p] == '*' {
      star = Some((p, t));
      p += 1;
    } else if let Some((star_p, star_t)) = star {
      p = star_p + 1;
      t = star_t + 1;
      star = Some((star_p, star_t + 1));
    } else {
      return false;
    }
  }

  pattern[p..].iter().all(|&c| c == '*')
}

fn versions_of(name: &str, dir: &Path) -> Result<Vec<(String, PathBuf)>, RecipeError> {
  let versions_path = dir.join(RECIPE_VERSIONS_FILE);
  if !versions_path.exists() {
    return visible_subdirs(dir);
  }

  let content = fs::read_to_string(&versions_path).map_err(|source| RecipeError::Read {
    path: versions_path.clone(),
    source,
  })?;
  let file: VersionsFile = serde_yaml::from_str(&content).map_err(|source| RecipeError::Parse {
    path: versions_path.clone(),
    source,
  })?;

  let mut versions = Vec::with_capacity(file.versions.len());
  for (version, entry) in file.versions {
    let folder = dir.join(&entry.folder);
    if !folder.is_dir() {
      return Err(RecipeError::MissingFolder {
        recipe: format!("{}/{}", name, version.0),
        folder,
      });
    }
    versions.push((version.0, folder));
  }
  Ok(versions)
}

fn visible_subdirs(dir: &Path) -> Result<Vec<(String, PathBuf)>, RecipeError> {
  let read_err = |source| RecipeError::Read {
    path: dir.to_path_buf(),
    source,
  };

  let mut dirs = Vec::new();
  for entry in fs::read_dir(dir).map_err(read_err)? {
    let entry = entry.map_err(read_err)?;
    let path = entry.path();
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
      continue;
    };
    if name.starts_with('.') || !path.is_dir() {
      continue;
    }
    dirs.push((name.to_string(), path.clone()));
  }
  dirs.sort();
  Ok(dirs)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::util::testutil::{RecipeFixture, write_file};
  use tempfile::TempDir;

  #[test]
  fn loads_versions_from_config_yml() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    RecipeFixture::new("zlib", "all").write(root);
    write_file(
      &root.join("zlib/config.yml"),
      "versions:\n  \"1.2.11\": { folder: all }\n  \"1.2.13\": { folder: all }\n",
    );

    let recipes = load_recipes(root).unwrap();
    let refs: Vec<_> = recipes.iter().map(|r| r.id.reference()).collect();
    assert_eq!(refs, vec!["zlib/1.2.11", "zlib/1.2.13"]);
    assert_eq!(recipes[0].folder, recipes[1].folder);
    assert_eq!(recipes[0].id.revision, recipes[1].id.revision);
  }

  #[test]
  fn folder_names_are_versions_without_config_yml() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    RecipeFixture::new("fmt", "9.1.0").write(root);
    RecipeFixture::new("fmt", "10.0.0").write(root);
    RecipeFixture::new("abseil", "20230125").write(root);

    let recipes = load_recipes(root).unwrap();
    let refs: Vec<_> = recipes.iter().map(|r| r.id.reference()).collect();
    assert_eq!(refs, vec!["abseil/20230125", "fmt/10.0.0", "fmt/9.1.0"]);
  }

  #[test]
  fn folders_without_manifest_are_skipped() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    RecipeFixture::new("zlib", "1.2.11").write(root);
    std::fs::create_dir_all(root.join("legacy/1.0")).unwrap();
    std::fs::create_dir_all(root.join(".github/workflows")).unwrap();

    let recipes = load_recipes(root).unwrap();
    assert_eq!(recipes.len(), 1);
    assert_eq!(recipes[0].id.name, "zlib");
  }

  #[test]
  fn missing_smoke_test_source_is_an_error() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    let folder = RecipeFixture::new("zlib", "1.2.11").write(root);
    std::fs::remove_file(folder.join("test_package/test.sh")).unwrap();

    let err = load_recipes(root).unwrap_err();
    assert!(matches!(err, RecipeError::MissingSource { .. }), "got {err}");
  }

  #[test]
  fn config_yml_pointing_at_missing_folder_is_an_error() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    RecipeFixture::new("zlib", "all").write(root);
    write_file(&root.join("zlib/config.yml"), "versions:\n  \"1.3\": { folder: gone }\n");

    let err = load_recipes(root).unwrap_err();
    assert!(matches!(err, RecipeError::MissingFolder { .. }), "got {err}");
  }

  #[test]
  fn revision_follows_recipe_content_but_not_build_detritus() {
    let temp = TempDir::new().unwrap();
    let folder = RecipeFixture::new("zlib", "1.2.11").write(temp.path());
    let first = load_recipe("zlib", "1.2.11", &folder).unwrap().id.revision;
    assert_eq!(first.len(), REVISION_LEN);

    write_file(&folder.join("test_package/build/CMakeCache.txt"), "junk");
    assert_eq!(load_recipe("zlib", "1.2.11", &folder).unwrap().id.revision, first);

    write_file(&folder.join("patches/0001-fix.patch"), "--- a\n+++ b\n");
    assert_ne!(load_recipe("zlib", "1.2.11", &folder).unwrap().id.revision, first);
  }

  #[test]
  fn declared_revision_wins() {
    let temp = TempDir::new().unwrap();
    let folder = RecipeFixture::new("zlib", "1.2.11")
      .manifest_line("revision: 7")
      .write(temp.path());
    assert_eq!(load_recipe("zlib", "1.2.11", &folder).unwrap().id.revision, "7");
  }

  #[test]
  fn wildcard_patterns() {
    assert!(matches_pattern("zlib", "zlib"));
    assert!(matches_pattern("z*", "zlib"));
    assert!(matches_pattern("*lib", "zlib"));
    assert!(matches_pattern("zlib/1.2.*", "zlib/1.2.11"));
    assert!(matches_pattern("?lib", "zlib"));
    assert!(matches_pattern("*", ""));
    assert!(!matches_pattern("zlib", "zlib-ng"));
    assert!(!matches_pattern("?lib", "libz"));
    assert!(!matches_pattern("open*ssl", "openssh"));
  }

  #[test]
  fn filter_matches_name_or_reference() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    RecipeFixture::new("zlib", "1.2.11").write(root);
    RecipeFixture::new("zlib", "1.3").write(root);
    RecipeFixture::new("openssl", "3.0.0").write(root);
    let recipes = load_recipes(root).unwrap();

    let by_name = filter_recipes(recipes.clone(), &["zlib".to_string()]);
    assert_eq!(by_name.len(), 2);

    let by_ref = filter_recipes(recipes.clone(), &["zlib/1.3".to_string(), "open*".to_string()]);
    let refs: Vec<_> = by_ref.iter().map(|r| r.id.reference()).collect();
    assert_eq!(refs, vec!["openssl/3.0.0", "zlib/1.3"]);

    assert_eq!(filter_recipes(recipes, &[]).len(), 3);
  }
}
