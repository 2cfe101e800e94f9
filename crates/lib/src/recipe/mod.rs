//! Recipe discovery and loading.
//!
//! A recipe repository is laid out as:
//!
//! ```text
//! recipes/
//! └── <name>/
//!     ├── config.yml              # optional: versions -> folder
//!     └── <folder>/
//!         ├── recipe.yml          # harness manifest
//!         └── test_package/       # smoke-test sources
//! ```

mod load;
mod types;

use std::path::PathBuf;

use thiserror::Error;

pub use load::{filter_recipes, load_recipe, load_recipes, matches_pattern};
pub use types::{Axis, AxisMatch, Invocation, Recipe, RecipeId, SkipRule, SmokeTest, Timeouts};

#[derive(Debug, Error)]
pub enum RecipeError {
  #[error("recipes directory not found: {0}")]
  RootNotFound(PathBuf),

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

  #[error("{recipe}: version folder {folder} does not exist")]
  MissingFolder { recipe: String, folder: PathBuf },

  #[error("{recipe}: smoke-test source {path} does not exist")]
  MissingSource { recipe: String, path: PathBuf },

  #[error("{recipe}: test_package declares no sources")]
  NoSources { recipe: String },

  #[error("{recipe}: failed to compute recipe revision: {message}")]
  Revision { recipe: String, message: String },
}
