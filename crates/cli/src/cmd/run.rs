use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use pkgcheck_lib::cache::ArtifactCache;
use pkgcheck_lib::platform::paths::reports_dir;
use pkgcheck_lib::report::{Report, Summary};
use pkgcheck_lib::schedule::{CancelReason, CancelToken, Scheduler, SchedulerConfig};
use pkgcheck_lib::store::StoreLayout;
use pkgcheck_lib::store_lock::StoreLock;

use super::{MatrixArgs, plan};
use crate::output::{
  OutputFormat, describe_outcome, format_duration, print_error, print_info, print_json, print_stat, print_success,
  print_unit, print_warning,
};

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
  #[command(flatten)]
  pub matrix: MatrixArgs,

  /// Number of concurrent workers (default: available parallelism)
  #[arg(short = 'j', long, value_name = "N")]
  pub workers: Option<usize>,

  /// Stop scheduling new work after the first failure
  #[arg(long)]
  pub fail_fast: bool,

  /// Rebuild every configuration even when a cached artifact exists
  #[arg(long)]
  pub force_build: bool,

  /// Write the JSON Lines report here instead of the reports directory
  #[arg(long, value_name = "PATH")]
  pub report: Option<PathBuf>,
}

#[derive(Serialize)]
struct RunOutput<'a> {
  report: &'a PathBuf,
  summary: &'a Summary,
}

/// Build and verify every planned unit. Returns the process exit code.
pub fn cmd_run(args: RunArgs, output: OutputFormat) -> Result<u8> {
  let mut plan = plan(&args.matrix)?;
  if let Some(workers) = args.workers {
    plan.config.workers = Some(workers);
  }
  if args.fail_fast {
    plan.config.fail_fast = true;
  }
  plan.config.validate()?;

  if let Some(path) = &plan.config_path {
    debug!(path = %path.display(), "using harness config");
  }

  let layout = StoreLayout::current();
  layout
    .ensure()
    .with_context(|| format!("Failed to create store at {}", layout.root().display()))?;
  let _lock = StoreLock::acquire(&layout, "run").context("Failed to acquire store lock")?;
  let cache = ArtifactCache::open(layout, plan.config.cache).context("Failed to open artifact cache")?;

  let mut scheduler_config = SchedulerConfig::from_harness(&plan.config);
  scheduler_config.force_build = args.force_build;

  if !output.is_json() {
    print_info(&format!(
      "Running {} units from {} recipes with {} workers",
      plan.units.len(),
      plan.recipes,
      scheduler_config.workers
    ));
  }

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let report = rt.block_on(async move {
    let cancel = CancelToken::new();

    let interrupt = {
      let cancel = cancel.clone();
      tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
          print_warning("Interrupted, stopping running builds");
          cancel.cancel(CancelReason::Interrupted);
        }
      })
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
      while let Some(record) = rx.recv().await {
        if !output.is_json() {
          print_unit(&record);
        }
      }
    });

    let scheduler = Scheduler::new(cache, scheduler_config).with_progress(tx);
    let report = scheduler.run(plan.units, &cancel).await;
    drop(scheduler);

    interrupt.abort();
    let _ = printer.await;
    report
  });

  let report_path = match args.report {
    Some(path) => path,
    None => default_report_path(),
  };
  report
    .write_jsonl(&report_path)
    .with_context(|| format!("Failed to write report to {}", report_path.display()))?;
  info!(path = %report_path.display(), "report written");

  if output.is_json() {
    print_json(&RunOutput {
      report: &report_path,
      summary: &report.summary,
    })?;
  } else {
    print_summary(&report, &report_path);
  }

  Ok(report.exit_code())
}

fn default_report_path() -> PathBuf {
  let stamp = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_secs())
    .unwrap_or_default();
  reports_dir().join(format!("run-{stamp}.jsonl"))
}

fn print_summary(report: &Report, report_path: &std::path::Path) {
  let summary = &report.summary;
  println!();
  if report.is_success() {
    print_success("All units passed");
  } else {
    print_error("Some units did not pass:");
    for record in report.failures() {
      eprintln!("  {} {}", record.label(), describe_outcome(record));
    }
  }
  print_stat("Units", &summary.total.to_string());
  print_stat("Succeeded", &summary.success.to_string());
  let failed = summary.build_failed + summary.build_timed_out;
  let verify_failed = summary.verify_failed + summary.verify_timed_out + summary.verify_crashed;
  if failed > 0 {
    print_stat("Build failures", &failed.to_string());
  }
  if verify_failed > 0 {
    print_stat("Verify failures", &verify_failed.to_string());
  }
  if summary.skipped > 0 {
    print_stat("Skipped", &summary.skipped.to_string());
  }
  print_stat("Builds", &summary.builds.to_string());
  print_stat("Cache hits", &summary.cache_hits.to_string());
  print_stat("Duration", &format_duration(std::time::Duration::from_millis(summary.duration_ms)));
  print_stat("Report", &report_path.display().to_string());
}
