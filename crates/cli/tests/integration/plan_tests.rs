//! Plan command integration tests.

use predicates::prelude::*;

use super::common::TestEnv;

fn descriptor(name: &str, deps: &[&str]) -> String {
  let deps: Vec<String> = deps.iter().map(|d| format!("\"{}\"", d)).collect();
  format!(
    r#"return {{ name = "{}", dependencies = {{ {} }} }}"#,
    name,
    deps.join(", ")
  )
}

#[test]
fn plan_prints_waves_in_order() {
  let env = TestEnv::with_project(r#"return { name = "datadog-updater", dependencies = { "preparation", "updater" } }"#);
  env.write_file("software/preparation.lua", &descriptor("preparation", &[]));
  env.write_file("software/sds.lua", &descriptor("sds", &[]));
  env.write_file("software/updater.lua", &descriptor("updater", &["sds"]));

  let output = env
    .kiln_cmd()
    .args(["plan", "--target-os", "linux", "--target-arch", "x86_64"])
    .arg(env.project_dir())
    .output()
    .unwrap();
  assert!(output.status.success());

  let stdout = String::from_utf8(output.stdout).unwrap();
  assert!(stdout.contains("Plan for datadog-updater on x86_64-linux"));
  assert!(stdout.contains("Wave 2:"));
  let sds = stdout.find("sds").unwrap();
  let updater = stdout.find("updater\n").unwrap();
  assert!(sds < updater);
}

#[test]
fn plan_json_lists_order() {
  let env = TestEnv::with_project(r#"return { name = "agent", dependencies = { "curl" } }"#);
  env.write_file("software/zlib.lua", &descriptor("zlib", &[]));
  env.write_file("software/curl.lua", &descriptor("curl", &["zlib"]));

  let output = env
    .kiln_cmd()
    .args(["plan", "-o", "json"])
    .arg(env.project_dir())
    .output()
    .unwrap();
  assert!(output.status.success());

  let plan: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(plan["order"], serde_json::json!(["zlib", "curl"]));
  assert_eq!(plan["descriptors"][1]["dependencies"], serde_json::json!(["zlib"]));
}

#[test]
fn plan_reports_cycles() {
  let env = TestEnv::with_project(r#"return { name = "agent", dependencies = { "a" } }"#);
  env.write_file("software/a.lua", &descriptor("a", &["b"]));
  env.write_file("software/b.lua", &descriptor("b", &["a"]));

  env
    .kiln_cmd()
    .arg("plan")
    .arg(env.project_dir())
    .assert()
    .failure()
    .stderr(predicate::str::contains("dependency cycle detected"));
}

#[test]
fn plan_reports_unresolved_dependencies() {
  let env = TestEnv::with_project(r#"return { name = "agent", dependencies = { "curl" } }"#);
  env.write_file("software/curl.lua", &descriptor("curl", &["openssl"]));

  env
    .kiln_cmd()
    .arg("plan")
    .arg(env.project_dir())
    .assert()
    .failure()
    .stderr(predicate::str::contains("unresolved dependency 'openssl'"));
}

#[test]
fn plan_does_not_create_anything() {
  let env = TestEnv::with_project(r#"return { name = "agent", dependencies = { "zlib" } }"#);
  env.write_file("software/zlib.lua", &descriptor("zlib", &[]));

  env.kiln_cmd().arg("plan").arg(env.project_dir()).assert().success();

  assert!(!env.work_dir().exists());
}
