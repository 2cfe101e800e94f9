//! Harness-wide constants.

pub const APP_NAME: &str = "pkgcheck";

/// Length of the truncated fingerprint used for store paths.
pub const FINGERPRINT_LEN: usize = 20;

/// Length of a computed recipe revision.
pub const REVISION_LEN: usize = 12;

/// Per-version harness manifest inside a recipe folder.
pub const RECIPE_MANIFEST: &str = "recipe.yml";

/// Optional version-to-folder map at the top of a recipe directory.
pub const RECIPE_VERSIONS_FILE: &str = "config.yml";

/// Harness configuration file name.
pub const HARNESS_CONFIG_FILE: &str = "pkgcheck.yml";

/// Default guard against combinatorial explosion.
pub const DEFAULT_MAX_UNITS: usize = 10_000;

/// Number of trailing log lines kept in a report record.
pub const LOG_EXCERPT_LINES: usize = 20;

/// January 1, 1980 00:00:00 UTC (ZIP epoch), exported for reproducible timestamps.
pub const SOURCE_DATE_EPOCH: &str = "315532800";

/// Environment variable overriding the store location.
pub const STORE_ENV: &str = "PKGCHECK_STORE";

/// Store lock file at the store root.
pub const LOCK_FILE: &str = ".lock";

/// Completion marker written into an artifact directory once it is stored.
pub const MARKER_FILE: &str = ".pkgcheck-complete";

/// Version of the marker format; markers with another version are ignored.
pub const MARKER_VERSION: u32 = 1;
