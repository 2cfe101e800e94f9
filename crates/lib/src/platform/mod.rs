//! Host platform detection and well-known directories.

pub mod paths;

/// Platform identifier for the host in `<arch>-<os>` form (e.g. "x86_64-linux", "aarch64-darwin").
///
/// Used as the `platform` axis of the default profile.
pub fn host_triple() -> String {
  format!("{}-{}", std::env::consts::ARCH, os_name())
}

fn os_name() -> &'static str {
  match std::env::consts::OS {
    "macos" => "darwin",
    other => other,
  }
}

/// Compiler identity of the default profile.
pub fn default_compiler() -> &'static str {
  if cfg!(windows) { "msvc" } else { "cc" }
}
