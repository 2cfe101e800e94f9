//! Outcomes, aggregation, and the final run report.
//!
//! Every work unit ends with exactly one [`UnitRecord`]. The [`Aggregator`]
//! accepts them from concurrent workers, streams them to an optional progress
//! listener, triggers fail-fast cancellation, and assembles the [`Report`]
//! ordered by expansion index once the run is over.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::Environment;
use crate::execute::verify::Phase;
use crate::matrix::WorkUnit;
use crate::recipe::RecipeId;
use crate::schedule::{CancelReason, CancelToken};
use crate::util::hash::Fingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OutcomeKind {
  Success,
  BuildFailed,
  BuildTimedOut,
  VerifyFailed,
  VerifyTimedOut,
  VerifyCrashed,
  Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SkipReason {
  /// The run was interrupted before the unit finished.
  Cancelled,
  /// Another unit failed and fail-fast is enabled.
  FailFast,
  /// A recipe skip rule matched the configuration.
  Policy,
}

impl From<CancelReason> for SkipReason {
  fn from(reason: CancelReason) -> Self {
    match reason {
      CancelReason::Interrupted => SkipReason::Cancelled,
      CancelReason::FailFast => SkipReason::FailFast,
    }
  }
}

/// Terminal result of one work unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
  pub kind: OutcomeKind,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub skip_reason: Option<SkipReason>,
  /// Human-readable detail: skip reason text, infrastructure error message.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub detail: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub phase: Option<Phase>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub exit_code: Option<i32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub signal: Option<i32>,
  /// The build result came from the cache rather than a build in this unit.
  pub cache_hit: bool,
  pub duration_ms: u64,
  pub logs: Vec<PathBuf>,
  pub excerpt: Vec<String>,
}

impl Outcome {
  pub fn new(kind: OutcomeKind) -> Self {
    Self {
      kind,
      skip_reason: None,
      detail: None,
      phase: None,
      exit_code: None,
      signal: None,
      cache_hit: false,
      duration_ms: 0,
      logs: Vec::new(),
      excerpt: Vec::new(),
    }
  }

  pub fn skipped(reason: SkipReason, detail: Option<String>) -> Self {
    Self {
      skip_reason: Some(reason),
      detail,
      ..Self::new(OutcomeKind::Skipped)
    }
  }

  /// Success, or a skip the recipe asked for.
  pub fn is_pass(&self) -> bool {
    match self.kind {
      OutcomeKind::Success => true,
      OutcomeKind::Skipped => self.skip_reason == Some(SkipReason::Policy),
      _ => false,
    }
  }

  /// A unit that ran and did not succeed. Cancellation skips are not failures.
  pub fn is_failure(&self) -> bool {
    !matches!(self.kind, OutcomeKind::Success | OutcomeKind::Skipped)
  }
}

/// One report line.
#[derive(Debug, Clone, Serialize)]
pub struct UnitRecord {
  pub index: usize,
  pub fingerprint: Fingerprint,
  pub recipe: RecipeId,
  pub profile: String,
  pub options: BTreeMap<String, String>,
  pub environment: Environment,
  pub outcome: Outcome,
}

impl UnitRecord {
  pub fn new(unit: &WorkUnit, outcome: Outcome) -> Self {
    Self {
      index: unit.index,
      fingerprint: unit.fingerprint.clone(),
      recipe: unit.recipe.id.clone(),
      profile: unit.profile.clone(),
      options: unit.configuration.options_map(),
      environment: unit.configuration.environment.clone(),
      outcome,
    }
  }

  /// `name/version [profile] options`
  pub fn label(&self) -> String {
    let mut label = format!("{} [{}]", self.recipe.reference(), self.profile);
    for (name, value) in &self.options {
      label.push_str(&format!(" {name}={value}"));
    }
    label
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
  pub total: usize,
  pub success: usize,
  pub build_failed: usize,
  pub build_timed_out: usize,
  pub verify_failed: usize,
  pub verify_timed_out: usize,
  pub verify_crashed: usize,
  pub skipped: usize,
  /// Builds executed by this run.
  pub builds: usize,
  pub cache_hits: usize,
  pub duration_ms: u64,
}

impl Summary {
  fn from_records(records: &[UnitRecord], duration: Duration) -> Self {
    let mut summary = Summary {
      total: records.len(),
      duration_ms: duration.as_millis() as u64,
      ..Default::default()
    };
    for record in records {
      let outcome = &record.outcome;
      match outcome.kind {
        OutcomeKind::Success => summary.success += 1,
        OutcomeKind::BuildFailed => summary.build_failed += 1,
        OutcomeKind::BuildTimedOut => summary.build_timed_out += 1,
        OutcomeKind::VerifyFailed => summary.verify_failed += 1,
        OutcomeKind::VerifyTimedOut => summary.verify_timed_out += 1,
        OutcomeKind::VerifyCrashed => summary.verify_crashed += 1,
        OutcomeKind::Skipped => summary.skipped += 1,
      }
      if outcome.kind != OutcomeKind::Skipped {
        if outcome.cache_hit {
          summary.cache_hits += 1;
        } else {
          summary.builds += 1;
        }
      }
    }
    summary
  }
}

/// Final result of a run.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
  /// Ordered by expansion index.
  pub records: Vec<UnitRecord>,
  pub summary: Summary,
}

impl Report {
  pub fn from_records(mut records: Vec<UnitRecord>, duration: Duration) -> Self {
    records.sort_by_key(|r| r.index);
    let summary = Summary::from_records(&records, duration);
    Self { records, summary }
  }

  pub fn is_success(&self) -> bool {
    self.records.iter().all(|r| r.outcome.is_pass())
  }

  /// 0 when every unit passed, 1 otherwise.
  pub fn exit_code(&self) -> u8 {
    if self.is_success() { 0 } else { 1 }
  }

  pub fn failures(&self) -> impl Iterator<Item = &UnitRecord> {
    self.records.iter().filter(|r| !r.outcome.is_pass())
  }

  /// One JSON object per unit, then a `{"summary": ...}` line.
  pub fn to_writer<W: Write>(&self, mut writer: W) -> io::Result<()> {
    for record in &self.records {
      serde_json::to_writer(&mut writer, record)?;
      writer.write_all(b"\n")?;
    }
    serde_json::to_writer(&mut writer, &SummaryLine { summary: &self.summary })?;
    writer.write_all(b"\n")?;
    writer.flush()
  }

  pub fn write_jsonl(&self, path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent()
      && !parent.as_os_str().is_empty()
    {
      fs::create_dir_all(parent)?;
    }
    let file = fs::File::create(path)?;
    self.to_writer(BufWriter::new(file))
  }
}

#[derive(Serialize)]
struct SummaryLine<'a> {
  summary: &'a Summary,
}

/// Collects unit records from concurrent workers.
#[derive(Debug)]
pub struct Aggregator {
  records: Mutex<BTreeMap<usize, UnitRecord>>,
  expected: usize,
  fail_fast: bool,
  cancel: CancelToken,
  progress: Option<mpsc::UnboundedSender<UnitRecord>>,
}

impl Aggregator {
  pub fn new(
    expected: usize,
    fail_fast: bool,
    cancel: CancelToken,
    progress: Option<mpsc::UnboundedSender<UnitRecord>>,
  ) -> Self {
    Self {
      records: Mutex::new(BTreeMap::new()),
      expected,
      fail_fast,
      cancel,
      progress,
    }
  }

  /// Record a unit's outcome. Each unit is recorded once; later records for
  /// the same index are ignored and return false.
  pub fn record(&self, record: UnitRecord) -> bool {
    {
      let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
      if records.contains_key(&record.index) {
        warn!(index = record.index, "unit already recorded, ignoring second outcome");
        return false;
      }
      records.insert(record.index, record.clone());
    }

    info!(
      unit = %record.label(),
      outcome = ?record.outcome.kind,
      cache_hit = record.outcome.cache_hit,
      "unit finished"
    );

    if self.fail_fast && record.outcome.is_failure() && self.cancel.cancel(CancelReason::FailFast) {
      info!(unit = %record.label(), "fail-fast: cancelling remaining units");
    }

    if let Some(progress) = &self.progress {
      // The listener may have gone away; the report is still complete.
      let _ = progress.send(record);
    }
    true
  }

  pub fn is_recorded(&self, index: usize) -> bool {
    let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
    records.contains_key(&index)
  }

  pub fn finish(&self, duration: Duration) -> Report {
    let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
    if records.len() < self.expected {
      warn!(missing = self.expected - records.len(), "units finished without an outcome");
    }
    Report::from_records(records.values().cloned().collect(), duration)
  }
}
