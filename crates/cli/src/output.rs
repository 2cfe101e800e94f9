//! CLI output formatting utilities.
//!
//! Colored status messages, unit outcome lines, and human-readable byte and
//! duration formatting.

use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;
use owo_colors::{OwoColorize, Stream};
use pkgcheck_lib::report::{OutcomeKind, SkipReason, UnitRecord};

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
  #[default]
  Text,
  Json,
}

impl OutputFormat {
  pub fn is_json(self) -> bool {
    matches!(self, OutputFormat::Json)
  }
}

pub mod symbols {
  pub const SUCCESS: &str = "✓";
  pub const ERROR: &str = "✗";
  pub const WARNING: &str = "⚠";
  pub const INFO: &str = "•";
  pub const SKIP: &str = "-";
  pub const CACHED: &str = "=";
}

pub fn truncate_hash(hash: &str) -> &str {
  let len = hash.len().min(12);
  &hash[..len]
}

pub fn format_bytes(bytes: u64) -> String {
  const KB: u64 = 1024;
  const MB: u64 = KB * 1024;
  const GB: u64 = MB * 1024;

  if bytes >= GB {
    format!("{:.1} GB", bytes as f64 / GB as f64)
  } else if bytes >= MB {
    format!("{:.1} MB", bytes as f64 / MB as f64)
  } else if bytes >= KB {
    format!("{:.1} KB", bytes as f64 / KB as f64)
  } else {
    format!("{} B", bytes)
  }
}

pub fn format_duration(duration: Duration) -> String {
  let secs = duration.as_secs();
  let millis = duration.subsec_millis();

  if secs >= 60 {
    let mins = secs / 60;
    let remaining_secs = secs % 60;
    format!("{}m {}s", mins, remaining_secs)
  } else if secs > 0 {
    format!("{}.{:02}s", secs, millis / 10)
  } else {
    format!("{}ms", millis)
  }
}

pub fn print_success(message: &str) {
  println!(
    "{} {}",
    symbols::SUCCESS.if_supports_color(Stream::Stdout, |s| s.green()),
    message
  );
}

pub fn print_error(message: &str) {
  eprintln!(
    "{} {}",
    symbols::ERROR.if_supports_color(Stream::Stderr, |s| s.red()),
    message.if_supports_color(Stream::Stderr, |s| s.red())
  );
}

pub fn print_warning(message: &str) {
  eprintln!(
    "{} {}",
    symbols::WARNING.if_supports_color(Stream::Stderr, |s| s.yellow()),
    message.if_supports_color(Stream::Stderr, |s| s.yellow())
  );
}

pub fn print_info(message: &str) {
  println!(
    "{} {}",
    symbols::INFO.if_supports_color(Stream::Stdout, |s| s.blue()),
    message
  );
}

pub fn print_stat(label: &str, value: &str) {
  println!(
    "  {}: {}",
    label.if_supports_color(Stream::Stdout, |s| s.dimmed()),
    value
  );
}

/// Short status word for an outcome, e.g. `build failed`.
pub fn describe_outcome(record: &UnitRecord) -> String {
  let outcome = &record.outcome;
  match outcome.kind {
    OutcomeKind::Success => "ok".to_string(),
    OutcomeKind::BuildFailed => "build failed".to_string(),
    OutcomeKind::BuildTimedOut => "build timed out".to_string(),
    OutcomeKind::VerifyFailed => match outcome.exit_code {
      Some(code) => format!("verify failed (exit {code})"),
      None => "verify failed".to_string(),
    },
    OutcomeKind::VerifyTimedOut => "verify timed out".to_string(),
    OutcomeKind::VerifyCrashed => match outcome.signal {
      Some(signal) => format!("verify crashed (signal {signal})"),
      None => "verify crashed".to_string(),
    },
    OutcomeKind::Skipped => match outcome.skip_reason {
      Some(SkipReason::Policy) => "skipped".to_string(),
      Some(SkipReason::FailFast) => "skipped (fail-fast)".to_string(),
      Some(SkipReason::Cancelled) | None => "skipped (cancelled)".to_string(),
    },
  }
}

/// One progress line per finished unit.
pub fn print_unit(record: &UnitRecord) {
  let outcome = &record.outcome;
  let symbol = match outcome.kind {
    OutcomeKind::Success if outcome.cache_hit => {
      symbols::CACHED.if_supports_color(Stream::Stdout, |s| s.green()).to_string()
    }
    OutcomeKind::Success => symbols::SUCCESS.if_supports_color(Stream::Stdout, |s| s.green()).to_string(),
    OutcomeKind::Skipped => symbols::SKIP.if_supports_color(Stream::Stdout, |s| s.dimmed()).to_string(),
    _ => symbols::ERROR.if_supports_color(Stream::Stdout, |s| s.red()).to_string(),
  };
  let status = describe_outcome(record);
  let status = if outcome.is_failure() {
    status.if_supports_color(Stream::Stdout, |s| s.red()).to_string()
  } else {
    status
  };
  println!(
    "{} {} {} {} ({})",
    symbol,
    truncate_hash(record.fingerprint.as_str()).if_supports_color(Stream::Stdout, |s| s.dimmed()),
    record.label(),
    status,
    format_duration(Duration::from_millis(outcome.duration_ms))
  );
  if let Some(detail) = &outcome.detail
    && outcome.kind != OutcomeKind::Skipped
  {
    println!("    {}", detail);
  }
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{}", json);
  Ok(())
}
