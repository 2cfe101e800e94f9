use predicates::prelude::*;

use super::common::{COMPILE_COPY, TestEnv};

#[test]
fn run_reports_one_success_and_one_verify_failure() {
  let env = TestEnv::with_foo();

  env
    .run_cmd()
    .assert()
    .code(1)
    .stdout(predicate::str::contains("verify failed"));

  let lines = env.report_lines();
  assert_eq!(lines.len(), 3);
  let kinds: Vec<(&str, &str)> = lines[..2]
    .iter()
    .map(|l| {
      (
        l["options"]["shared"].as_str().unwrap(),
        l["outcome"]["kind"].as_str().unwrap(),
      )
    })
    .collect();
  assert_eq!(kinds, vec![("True", "Success"), ("False", "VerifyFailed")]);

  let summary = &lines[2]["summary"];
  assert_eq!(summary["total"], 2);
  assert_eq!(summary["success"], 1);
  assert_eq!(summary["verify_failed"], 1);
  assert_eq!(summary["builds"], 2);
}

#[test]
fn warm_rerun_builds_nothing() {
  let env = TestEnv::with_foo();

  env.run_cmd().assert().code(1);
  env.run_cmd().assert().code(1);

  let lines = env.report_lines();
  let summary = &lines[2]["summary"];
  assert_eq!(summary["builds"], 0);
  assert_eq!(summary["cache_hits"], 2);
  assert!(lines[..2].iter().all(|l| l["outcome"]["cache_hit"] == true));
}

#[test]
fn force_build_rebuilds_cached_artifacts() {
  let env = TestEnv::with_foo();

  env.run_cmd().assert().code(1);
  env.run_cmd().arg("--force-build").assert().code(1);

  let summary = &env.report_lines()[2]["summary"];
  assert_eq!(summary["builds"], 2);
}

#[test]
fn all_passing_run_exits_zero() {
  let env = TestEnv::empty();
  env.write_recipe(
    "bar",
    "2.0",
    &format!(
      "build: 'mkdir -p \"$${{out}}/lib\"'\ntest_package:\n  sources: [test_package/test.sh]\n  compile: '{COMPILE_COPY}'\n"
    ),
    "#!/bin/sh\nexit 0\n",
  );

  env
    .run_cmd()
    .assert()
    .success()
    .stdout(predicate::str::contains("All units passed"));
}

#[test]
fn build_failure_is_reported_with_log_excerpt() {
  let env = TestEnv::empty();
  env.write_recipe(
    "broken",
    "1.0",
    &format!(
      "build: 'echo compiler exploded >&2; exit 2'\ntest_package:\n  sources: [test_package/test.sh]\n  compile: '{COMPILE_COPY}'\n"
    ),
    "#!/bin/sh\nexit 0\n",
  );

  env.run_cmd().assert().code(1);

  let lines = env.report_lines();
  let outcome = &lines[0]["outcome"];
  assert_eq!(outcome["kind"], "BuildFailed");
  assert_eq!(outcome["exit_code"], 2);
  let excerpt = outcome["excerpt"].as_array().unwrap();
  assert!(excerpt.iter().any(|l| l.as_str().unwrap().contains("compiler exploded")));
}

#[test]
fn fail_fast_skips_remaining_units() {
  let env = TestEnv::empty();
  env.write_recipe(
    "flaky",
    "1.0",
    &format!(
      "options:\n  - name: n\n    values: ['1', '2', '3']\nbuild: 'true'\ntest_package:\n  sources: [test_package/test.sh]\n  compile: '{COMPILE_COPY}'\n"
    ),
    "#!/bin/sh\nexit 1\n",
  );
  env.write_config("workers: 1\n");

  env.run_cmd().arg("--fail-fast").assert().code(1);

  let lines = env.report_lines();
  assert_eq!(lines[0]["outcome"]["kind"], "VerifyFailed");
  for line in &lines[1..3] {
    assert_eq!(line["outcome"]["kind"], "Skipped");
    assert_eq!(line["outcome"]["skip_reason"], "FailFast");
  }
}

#[test]
fn json_output_prints_summary() {
  let env = TestEnv::with_foo();

  let output = env.run_cmd().args(["-o", "json"]).output().unwrap();
  assert_eq!(output.status.code(), Some(1));

  let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(value["summary"]["total"], 2);
  assert!(value["report"].as_str().unwrap().ends_with("report.jsonl"));
}

#[test]
fn report_defaults_to_data_directory() {
  let env = TestEnv::with_foo();

  env.pkgcheck_cmd().arg("run").arg(env.recipes_path()).assert().code(1);

  let reports: Vec<_> = std::fs::read_dir(env.data_path().join("pkgcheck/reports"))
    .unwrap()
    .map(|e| e.unwrap().path())
    .collect();
  assert_eq!(reports.len(), 1);
  assert_eq!(reports[0].extension().unwrap(), "jsonl");
}

#[test]
fn missing_recipes_directory_exits_two() {
  let env = TestEnv::empty();

  env
    .pkgcheck_cmd()
    .args(["run", "does-not-exist"])
    .assert()
    .code(2)
    .stderr(predicate::str::contains("does-not-exist"));
}

#[test]
fn invalid_config_exits_two() {
  let env = TestEnv::with_foo();
  env.write_config("workers: 0\n");

  env
    .run_cmd()
    .assert()
    .code(2)
    .stderr(predicate::str::contains("workers"));
}

#[test]
fn unknown_profile_exits_two() {
  let env = TestEnv::with_foo();

  env
    .run_cmd()
    .args(["--profile", "nope"])
    .assert()
    .code(2)
    .stderr(predicate::str::contains("unknown profile 'nope'"));
}

#[test]
fn matrix_over_limit_exits_two() {
  let env = TestEnv::with_foo();

  env
    .run_cmd()
    .args(["--max-units", "1"])
    .assert()
    .code(2)
    .stderr(predicate::str::contains("maximum of 1"));
}
