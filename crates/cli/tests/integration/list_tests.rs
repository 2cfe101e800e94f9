use predicates::prelude::*;

use super::common::TestEnv;

#[test]
fn list_prints_every_configuration() {
  let env = TestEnv::with_foo();

  env
    .pkgcheck_cmd()
    .arg("list")
    .arg(env.recipes_path())
    .assert()
    .success()
    .stdout(predicate::str::contains("foo/1.0 [default] shared=True"))
    .stdout(predicate::str::contains("foo/1.0 [default] shared=False"))
    .stdout(predicate::str::contains("2 units from 1 recipes"));
}

#[test]
fn list_json_has_stable_fingerprints() {
  let env = TestEnv::with_foo();

  let list = || {
    let output = env
      .pkgcheck_cmd()
      .args(["list", "-o", "json"])
      .arg(env.recipes_path())
      .output()
      .unwrap();
    assert!(output.status.success());
    serde_json::from_slice::<serde_json::Value>(&output.stdout).unwrap()
  };

  let first = list();
  let units = first.as_array().unwrap();
  assert_eq!(units.len(), 2);
  assert_eq!(units[0]["index"], 0);
  assert_eq!(units[0]["recipe"]["name"], "foo");
  assert_ne!(units[0]["fingerprint"], units[1]["fingerprint"]);
  assert_eq!(first, list());
}

#[test]
fn list_shows_policy_skips() {
  let env = TestEnv::with_foo();
  let manifest = format!(
    "{}skip:\n  - when: {{ shared: 'False' }}\n    reason: static build unsupported\n",
    super::common::foo_manifest()
  );
  env.write_recipe("foo", "1.0", &manifest, super::common::TEST_REQUIRES_SHARED);

  env
    .pkgcheck_cmd()
    .arg("list")
    .arg(env.recipes_path())
    .assert()
    .success()
    .stdout(predicate::str::contains("skip: static build unsupported"));
}

#[test]
fn list_filters_by_recipe_and_profile() {
  let env = TestEnv::with_foo();
  env.write_config(
    "profiles:\n  - name: gcc\n    compiler: gcc\n  - name: clang\n    compiler: clang\n",
  );

  env
    .pkgcheck_cmd()
    .arg("list")
    .arg(env.recipes_path())
    .args(["--profile", "clang", "--filter", "foo"])
    .assert()
    .success()
    .stdout(predicate::str::contains("[clang]"))
    .stdout(predicate::str::contains("[gcc]").not())
    .stdout(predicate::str::contains("2 units"));

  env
    .pkgcheck_cmd()
    .arg("list")
    .arg(env.recipes_path())
    .args(["--filter", "bar*"])
    .assert()
    .success()
    .stdout(predicate::str::contains("0 units from 0 recipes"));
}
