//! Bounded worker pool driving build and verify across work units.
//!
//! Units are queued in expansion order and pulled by a fixed number of worker
//! tasks. Per unit a worker reserves the fingerprint in the cache, builds if it
//! got the ticket, verifies against a leased artifact, and records exactly one
//! outcome. Build and verify failures become outcomes; nothing a single unit
//! does aborts the run.

mod cancel;

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub use cancel::{CancelReason, CancelToken};

use crate::cache::{
  ArtifactCache, ArtifactMeta, BuildFailure, BuildRecord, CachedBuild, FailureKind, Lease, Reservation, Ticket,
};
use crate::config::HarnessConfig;
use crate::execute::{BuildStatus, ExecuteConfig, Phase, VerifyStatus, build, verify};
use crate::matrix::WorkUnit;
use crate::report::{Aggregator, Outcome, OutcomeKind, Report, SkipReason, UnitRecord};

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
  pub workers: usize,
  pub fail_fast: bool,
  /// Invalidate every unit's fingerprint before running.
  pub force_build: bool,
  pub build_timeout: Duration,
  pub verify_timeout: Duration,
  pub execute: ExecuteConfig,
}

impl SchedulerConfig {
  pub fn from_harness(config: &HarnessConfig) -> Self {
    Self {
      workers: config.worker_count(),
      fail_fast: config.fail_fast,
      force_build: false,
      build_timeout: config.build_timeout,
      verify_timeout: config.verify_timeout,
      execute: ExecuteConfig {
        inherit_env: config.inherit_env,
        shell: config.shell.clone(),
      },
    }
  }
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self::from_harness(&HarnessConfig::default())
  }
}

pub struct Scheduler {
  cache: ArtifactCache,
  config: SchedulerConfig,
  progress: Option<mpsc::UnboundedSender<UnitRecord>>,
}

/// Shared by all workers of one run.
struct RunContext {
  cache: ArtifactCache,
  config: SchedulerConfig,
  queue: Mutex<VecDeque<WorkUnit>>,
  aggregator: Aggregator,
  cancel: CancelToken,
}

/// Result of one pass over a unit.
enum Attempt {
  Done(Outcome),
  /// The cache reported an artifact that is no longer on disk.
  ArtifactMissing,
}

impl Scheduler {
  pub fn new(cache: ArtifactCache, config: SchedulerConfig) -> Self {
    Self {
      cache,
      config,
      progress: None,
    }
  }

  /// Stream every unit record to `progress` as it is recorded.
  pub fn with_progress(mut self, progress: mpsc::UnboundedSender<UnitRecord>) -> Self {
    self.progress = Some(progress);
    self
  }

  /// Run every unit and return the report.
  ///
  /// Returns once every unit has an outcome. After `cancel` fires, running
  /// processes are killed and every unit not yet finished is recorded as
  /// skipped.
  pub async fn run(&self, units: Vec<WorkUnit>, cancel: &CancelToken) -> Report {
    let started = Instant::now();
    let total = units.len();
    let workers = self.config.workers.max(1).min(total.max(1));
    info!(units = total, workers, fail_fast = self.config.fail_fast, "starting run");

    if self.config.force_build {
      self.invalidate_all(&units);
    }

    let context = Arc::new(RunContext {
      cache: self.cache.clone(),
      config: self.config.clone(),
      queue: Mutex::new(units.iter().cloned().collect()),
      aggregator: Aggregator::new(total, self.config.fail_fast, cancel.clone(), self.progress.clone()),
      cancel: cancel.clone(),
    });

    let mut join_set = JoinSet::new();
    for worker in 0..workers {
      let context = context.clone();
      join_set.spawn(async move { context.work(worker).await });
    }

    while let Some(result) = join_set.join_next().await {
      if let Err(e) = result {
        error!(error = %e, "worker task panicked");
      }
    }

    // Units taken by a worker that died still need an outcome.
    for unit in &units {
      if !context.aggregator.is_recorded(unit.index) {
        let outcome = match cancel.reason() {
          Some(reason) => Outcome::skipped(reason.into(), None),
          None => Outcome {
            detail: Some("worker task failed".to_string()),
            ..Outcome::new(OutcomeKind::BuildFailed)
          },
        };
        context.aggregator.record(UnitRecord::new(unit, outcome));
      }
    }

    let report = context.aggregator.finish(started.elapsed());
    let stats = self.cache.stats();
    info!(
      total = report.summary.total,
      success = report.summary.success,
      failed = report.failures().count(),
      builds = report.summary.builds,
      cache_hits = report.summary.cache_hits,
      evictions = stats.evictions,
      duration_ms = report.summary.duration_ms,
      "run finished"
    );
    report
  }

  fn invalidate_all(&self, units: &[WorkUnit]) {
    let mut seen = HashSet::new();
    for unit in units {
      if unit.skip.is_some() || !seen.insert(&unit.fingerprint) {
        continue;
      }
      if let Err(e) = self.cache.invalidate(&unit.fingerprint) {
        warn!(build = %unit.fingerprint, error = %e, "failed to invalidate for forced rebuild");
      }
    }
  }
}

impl RunContext {
  fn next_unit(&self) -> Option<WorkUnit> {
    self.queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
  }

  async fn work(&self, worker: usize) {
    debug!(worker, "worker started");
    while let Some(unit) = self.next_unit() {
      let outcome = if let Some(reason) = &unit.skip {
        Outcome::skipped(SkipReason::Policy, Some(reason.clone()))
      } else if let Some(reason) = self.cancel.reason() {
        Outcome::skipped(reason.into(), None)
      } else {
        self.run_unit(&unit).await
      };
      self.aggregator.record(UnitRecord::new(&unit, outcome));
    }
    debug!(worker, "worker finished");
  }

  async fn run_unit(&self, unit: &WorkUnit) -> Outcome {
    let started = Instant::now();
    info!(unit = %unit, build = %unit.fingerprint, "unit started");

    let mut outcome = match self.attempt(unit).await {
      Attempt::Done(outcome) => outcome,
      Attempt::ArtifactMissing => {
        warn!(unit = %unit, build = %unit.fingerprint, "artifact vanished, rebuilding once");
        if let Err(e) = self.cache.invalidate(&unit.fingerprint) {
          warn!(build = %unit.fingerprint, error = %e, "failed to invalidate vanished artifact");
        }
        match self.attempt(unit).await {
          Attempt::Done(outcome) => outcome,
          Attempt::ArtifactMissing => Outcome {
            detail: Some("artifact missing from the store after rebuilding".to_string()),
            ..Outcome::new(OutcomeKind::BuildFailed)
          },
        }
      }
    };

    outcome.duration_ms = started.elapsed().as_millis() as u64;
    outcome
  }

  fn skipped(&self) -> Outcome {
    let reason = self.cancel.reason().unwrap_or(CancelReason::Interrupted);
    Outcome::skipped(reason.into(), None)
  }

  async fn attempt(&self, unit: &WorkUnit) -> Attempt {
    let reservation = tokio::select! {
      reservation = self.cache.reserve(&unit.fingerprint) => reservation,
      _ = self.cancel.cancelled() => return Attempt::Done(self.skipped()),
    };

    let (cached, built_lease, cache_hit) = match reservation {
      Reservation::Ready(cached) => (cached, None, true),
      Reservation::Ticket(ticket) => match self.build(unit, ticket).await {
        Ok((cached, lease)) => (cached, lease, false),
        Err(outcome) => return Attempt::Done(outcome),
      },
    };

    let artifact = match cached {
      CachedBuild::Failed(failure) => return Attempt::Done(failure_outcome(&failure, cache_hit)),
      CachedBuild::Built(artifact) => artifact,
    };

    if self.cancel.is_cancelled() {
      return Attempt::Done(self.skipped());
    }

    let Some(lease) = built_lease.or_else(|| self.cache.lease(&unit.fingerprint)) else {
      return Attempt::ArtifactMissing;
    };

    let deadline = Instant::now() + unit.recipe.timeouts.verify.unwrap_or(self.config.verify_timeout);
    let layout = self.cache.layout();
    let result = verify(unit, lease.dir(), layout, &self.config.execute, deadline, &self.cancel).await;
    drop(lease);

    let mut logs: Vec<_> = artifact.marker.build_log.iter().cloned().collect();
    let mut outcome = match result {
      Ok(report) => {
        logs.extend(report.logs);
        let mut outcome = match report.status {
          VerifyStatus::Passed => Outcome::new(OutcomeKind::Success),
          VerifyStatus::Failed {
            phase,
            exit_code,
            signal,
            message,
          } => Outcome {
            phase: Some(phase),
            exit_code,
            signal,
            detail: message,
            ..Outcome::new(OutcomeKind::VerifyFailed)
          },
          VerifyStatus::Crashed { signal } => Outcome {
            phase: Some(Phase::Run),
            signal: Some(signal),
            ..Outcome::new(OutcomeKind::VerifyCrashed)
          },
          VerifyStatus::TimedOut { phase } => Outcome {
            phase: Some(phase),
            ..Outcome::new(OutcomeKind::VerifyTimedOut)
          },
          VerifyStatus::Cancelled => return Attempt::Done(self.skipped()),
        };
        outcome.excerpt = report.excerpt;
        outcome
      }
      Err(e) => {
        warn!(unit = %unit, error = %e, "smoke test could not run");
        Outcome {
          detail: Some(e.to_string()),
          ..Outcome::new(OutcomeKind::VerifyFailed)
        }
      }
    };

    outcome.cache_hit = cache_hit;
    outcome.logs = logs;
    Attempt::Done(outcome)
  }

  /// Build under a ticket and store the result. A new artifact comes back
  /// pinned for verification.
  ///
  /// Returns the outcome directly when the build was cancelled or could not
  /// run; neither is cached.
  async fn build(&self, unit: &WorkUnit, ticket: Ticket) -> Result<(CachedBuild, Option<Lease>), Outcome> {
    let deadline = Instant::now() + unit.recipe.timeouts.build.unwrap_or(self.config.build_timeout);
    let report = match build(unit, self.cache.layout(), &self.config.execute, deadline, &self.cancel).await {
      Ok(report) => report,
      Err(e) => {
        warn!(unit = %unit, error = %e, "build could not run");
        return Err(Outcome {
          detail: Some(e.to_string()),
          ..Outcome::new(OutcomeKind::BuildFailed)
        });
      }
    };

    let failure = |kind, exit_code, signal| BuildFailure {
      kind,
      exit_code,
      signal,
      message: None,
      log_path: Some(report.log_path.clone()),
      excerpt: report.excerpt.clone(),
      duration: report.duration,
    };
    let record = match report.status {
      BuildStatus::Succeeded => BuildRecord::Built(ArtifactMeta {
        recipe: unit.recipe.id.to_string(),
        duration: report.duration,
        toolchain: unit.configuration.environment.toolchain(),
        build_log: Some(report.log_path.clone()),
      }),
      BuildStatus::Failed { exit_code, signal } => BuildRecord::Failed(failure(FailureKind::Failed, exit_code, signal)),
      BuildStatus::TimedOut => BuildRecord::Failed(failure(FailureKind::TimedOut, None, None)),
      BuildStatus::Cancelled => return Err(self.skipped()),
    };

    ticket.store_leased(record).await.map_err(|e| {
      warn!(unit = %unit, error = %e, "failed to store build result");
      Outcome {
        detail: Some(e.to_string()),
        logs: vec![report.log_path.clone()],
        ..Outcome::new(OutcomeKind::BuildFailed)
      }
    })
  }
}

fn failure_outcome(failure: &BuildFailure, cache_hit: bool) -> Outcome {
  let kind = match failure.kind {
    FailureKind::Failed => OutcomeKind::BuildFailed,
    FailureKind::TimedOut => OutcomeKind::BuildTimedOut,
  };
  Outcome {
    exit_code: failure.exit_code,
    signal: failure.signal,
    detail: failure.message.clone(),
    cache_hit,
    logs: failure.log_path.iter().cloned().collect(),
    excerpt: failure.excerpt.clone(),
    ..Outcome::new(kind)
  }
}
