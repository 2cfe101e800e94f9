use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::Args;
use serde::Serialize;

use pkgcheck_lib::cache::ArtifactCache;
use pkgcheck_lib::config::{CacheCapacity, HarnessConfig};
use pkgcheck_lib::consts::FINGERPRINT_LEN;
use pkgcheck_lib::store::StoreLayout;
use pkgcheck_lib::store_lock::StoreLock;
use pkgcheck_lib::util::hash::Fingerprint;

use crate::output::{
  OutputFormat, format_bytes, format_duration, print_info, print_json, print_stat, print_success, print_warning,
};

#[derive(Debug, Clone, Args)]
pub struct GcArgs {
  /// Report what would be removed without removing anything
  #[arg(long)]
  pub dry_run: bool,

  /// Harness config file providing the cache capacity
  #[arg(short, long, value_name = "PATH")]
  pub config: Option<PathBuf>,

  /// Keep at most this many artifacts
  #[arg(long, value_name = "N")]
  pub max_entries: Option<usize>,

  /// Keep at most this many bytes of artifacts
  #[arg(long, value_name = "BYTES")]
  pub max_bytes: Option<u64>,
}

pub fn cmd_cache_gc(args: &GcArgs, output: OutputFormat) -> Result<()> {
  let start = Instant::now();

  let mut capacity = match &args.config {
    Some(path) => HarnessConfig::load(path)?.cache,
    None => CacheCapacity::default(),
  };
  if args.max_entries.is_some() {
    capacity.max_entries = args.max_entries;
  }
  if args.max_bytes.is_some() {
    capacity.max_bytes = args.max_bytes;
  }

  let (_lock, cache) = open_cache(capacity, "cache gc")?;
  let report = cache.gc(args.dry_run).context("Failed to collect garbage")?;

  if output.is_json() {
    print_json(&report)?;
  } else {
    println!();
    if args.dry_run {
      print_info("Dry run - no changes made");
    } else {
      print_success("Cache garbage collection complete!");
    }
    print_stat("Artifacts evicted", &report.evicted.len().to_string());
    print_stat("Incomplete removed", &report.incomplete.len().to_string());
    print_stat("Space freed", &format_bytes(report.bytes_freed));
    print_stat("Duration", &format_duration(start.elapsed()));
  }

  Ok(())
}

#[derive(Serialize)]
struct InvalidateOutput {
  removed: Vec<Fingerprint>,
  not_cached: Vec<Fingerprint>,
}

pub fn cmd_cache_invalidate(fingerprints: &[String], output: OutputFormat) -> Result<()> {
  let fingerprints = fingerprints
    .iter()
    .map(|s| parse_fingerprint(s))
    .collect::<Result<Vec<_>>>()?;

  let (_lock, cache) = open_cache(CacheCapacity::default(), "cache invalidate")?;

  let mut result = InvalidateOutput {
    removed: Vec::new(),
    not_cached: Vec::new(),
  };
  for fingerprint in fingerprints {
    if cache
      .invalidate(&fingerprint)
      .with_context(|| format!("Failed to invalidate {fingerprint}"))?
    {
      result.removed.push(fingerprint);
    } else {
      result.not_cached.push(fingerprint);
    }
  }

  if output.is_json() {
    print_json(&result)?;
  } else {
    for fingerprint in &result.removed {
      print_success(&format!("Removed {fingerprint}"));
    }
    for fingerprint in &result.not_cached {
      print_warning(&format!("{fingerprint} is not cached"));
    }
  }

  Ok(())
}

fn open_cache(capacity: CacheCapacity, command: &str) -> Result<(StoreLock, ArtifactCache)> {
  let layout = StoreLayout::current();
  layout
    .ensure()
    .with_context(|| format!("Failed to create store at {}", layout.root().display()))?;
  let lock = StoreLock::acquire(&layout, command).context("Failed to acquire store lock")?;
  let cache = ArtifactCache::open(layout, capacity).context("Failed to open artifact cache")?;
  Ok((lock, cache))
}

fn parse_fingerprint(s: &str) -> Result<Fingerprint> {
  if s.len() != FINGERPRINT_LEN || !s.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
    bail!("invalid fingerprint '{s}': expected {FINGERPRINT_LEN} lowercase hex characters");
  }
  Ok(Fingerprint(s.to_string()))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_fingerprint_accepts_lowercase_hex() {
    let fp = parse_fingerprint("0123456789abcdef0123").unwrap();
    assert_eq!(fp.as_str(), "0123456789abcdef0123");
  }

  #[test]
  fn parse_fingerprint_rejects_bad_input() {
    assert!(parse_fingerprint("0123").is_err());
    assert!(parse_fingerprint("0123456789ABCDEF0123").is_err());
    assert!(parse_fingerprint("0123456789abcdef012g").is_err());
  }
}
