use predicates::prelude::*;

use super::common::TestEnv;

fn fingerprints(env: &TestEnv) -> Vec<String> {
  env
    .report_lines()
    .iter()
    .filter_map(|l| l["fingerprint"].as_str().map(str::to_string))
    .collect()
}

#[test]
fn gc_with_empty_store_succeeds() {
  let env = TestEnv::empty();

  env
    .pkgcheck_cmd()
    .args(["cache", "gc"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Cache garbage collection complete"));
}

#[test]
fn gc_evicts_down_to_capacity() {
  let env = TestEnv::with_foo();
  env.run_cmd().assert().code(1);

  env
    .pkgcheck_cmd()
    .args(["cache", "gc", "--dry-run", "--max-entries", "1"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Dry run"))
    .stdout(predicate::str::contains("Artifacts evicted: 1"));

  let output = env
    .pkgcheck_cmd()
    .args(["-o", "json", "cache", "gc", "--max-entries", "1"])
    .output()
    .unwrap();
  assert!(output.status.success());
  let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(report["evicted"].as_array().unwrap().len(), 1);
  assert_eq!(report["dry_run"], false);

  // One artifact survived, the other is rebuilt.
  env.run_cmd().assert().code(1);
  let summary = &env.report_lines()[2]["summary"];
  assert_eq!(summary["builds"], 1);
  assert_eq!(summary["cache_hits"], 1);
}

#[test]
fn gc_removes_incomplete_artifacts() {
  let env = TestEnv::empty();
  env.write_file("store/build/0123456789abcdef0123/lib/partial.a", "half");

  env.pkgcheck_cmd().args(["cache", "gc"]).assert().success();

  assert!(!env.store_path().join("build/0123456789abcdef0123").exists());
}

#[test]
fn invalidate_forces_a_rebuild() {
  let env = TestEnv::with_foo();
  env.run_cmd().assert().code(1);
  let fps = fingerprints(&env);

  env
    .pkgcheck_cmd()
    .args(["cache", "invalidate", &fps[0]])
    .assert()
    .success()
    .stdout(predicate::str::contains(format!("Removed {}", fps[0])));

  env.run_cmd().assert().code(1);
  let summary = &env.report_lines()[2]["summary"];
  assert_eq!(summary["builds"], 1);
}

#[test]
fn invalidate_unknown_fingerprint_warns() {
  let env = TestEnv::empty();

  env
    .pkgcheck_cmd()
    .args(["cache", "invalidate", "0123456789abcdef0123"])
    .assert()
    .success()
    .stderr(predicate::str::contains("is not cached"));
}

#[test]
fn invalidate_rejects_malformed_fingerprint() {
  let env = TestEnv::empty();

  env
    .pkgcheck_cmd()
    .args(["cache", "invalidate", "not-a-fingerprint"])
    .assert()
    .code(2)
    .stderr(predicate::str::contains("invalid fingerprint"));
}
