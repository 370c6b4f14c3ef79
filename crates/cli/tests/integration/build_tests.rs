//! Build command integration tests.
//!
//! Steps use POSIX shell syntax, so these only run on unix hosts.
#![cfg(unix)]

use std::fs;

use predicates::prelude::*;

use super::common::TestEnv;

/// A descriptor whose build writes `<name>.txt` and installs it into
/// `embedded/lib`.
fn library(name: &str, deps: &[&str]) -> String {
  let deps: Vec<String> = deps.iter().map(|d| format!("\"{}\"", d)).collect();
  format!(
    r#"return {{
  name = "{name}",
  default_version = "1.0.0",
  license = {{ name = "MIT" }},
  dependencies = {{ {deps} }},
  build = {{
    {{ command = "printf '%s' {name} > {name}.txt" }},
    {{ copy = "{name}.txt", to = "embedded/lib" }},
  }},
}}"#,
    name = name,
    deps = deps.join(", ")
  )
}

fn curl_project() -> TestEnv {
  let env = TestEnv::with_project(r#"return { name = "agent", dependencies = { "curl" } }"#);
  env.write_file("software/zlib.lua", &library("zlib", &[]));
  env.write_file("software/curl.lua", &library("curl", &["zlib"]));
  env
}

#[test]
fn build_installs_dependencies_first() {
  let env = curl_project();

  env
    .build_cmd()
    .assert()
    .success()
    .stdout(predicate::str::contains("Build complete"))
    .stdout(predicate::str::contains("Built: 2"));

  let lib = env.install_dir().join("embedded/lib");
  assert_eq!(fs::read_to_string(lib.join("zlib.txt")).unwrap(), "zlib");
  assert_eq!(fs::read_to_string(lib.join("curl.txt")).unwrap(), "curl");
  assert!(env.install_dir().join("embedded/bin").is_dir());
}

#[test]
fn build_writes_manifest_and_install_record() {
  let env = curl_project();

  env.build_cmd().assert().success();

  let manifest = fs::read_to_string(env.work_dir().join("version-manifest.json")).unwrap();
  assert!(manifest.contains("\"curl\""));
  assert!(manifest.contains("\"zlib\""));
  assert!(manifest.contains("1.0.0"));
  assert!(manifest.contains("MIT"));

  let record = fs::read_to_string(env.work_dir().join("install-record.json")).unwrap();
  assert!(record.contains("curl.txt"));
}

#[test]
fn second_build_restores_from_cache() {
  let env = curl_project();

  env.build_cmd().assert().success();
  fs::remove_dir_all(env.install_dir()).unwrap();

  env
    .build_cmd()
    .assert()
    .success()
    .stdout(predicate::str::contains("Cached: 2"));
  assert!(env.install_dir().join("embedded/lib/curl.txt").is_file());
}

#[test]
fn no_cache_rebuilds() {
  let env = curl_project();

  env.build_cmd().assert().success();
  env
    .build_cmd()
    .arg("--no-cache")
    .assert()
    .success()
    .stdout(predicate::str::contains("Built: 2"));
}

#[test]
fn failing_step_reports_descriptor_and_status() {
  let env = TestEnv::with_project(r#"return { name = "agent", dependencies = { "broken" } }"#);
  env.write_file(
    "software/broken.lua",
    r#"return { name = "broken", build = { { command = "exit 3" } } }"#,
  );

  env
    .build_cmd()
    .assert()
    .failure()
    .code(1)
    .stderr(predicate::str::contains("broken step 0 failed with exit status 3"));
}

#[test]
fn keep_going_builds_independent_descriptors() {
  let env = TestEnv::with_project(r#"return { name = "agent", dependencies = { "zlib", "curl" } }"#);
  env.write_file(
    "software/broken.lua",
    r#"return { name = "broken", build = { { command = "exit 1" } } }"#,
  );
  env.write_file("software/zlib.lua", &library("zlib", &[]));
  env.write_file("software/curl.lua", &library("curl", &["broken"]));

  env
    .build_cmd()
    .arg("--keep-going")
    .assert()
    .failure()
    .stdout(predicate::str::contains("Skipped: curl"));

  assert!(env.install_dir().join("embedded/lib/zlib.txt").is_file());
  assert!(!env.install_dir().join("embedded/lib/curl.txt").exists());
}

#[test]
fn target_selects_conditional_steps() {
  let env = TestEnv::with_project(r#"return { name = "agent", dependencies = { "sds" } }"#);
  env.write_file(
    "software/sds.lua",
    r#"
local ext = kiln.os == "darwin" and "dylib" or "so"
return {
  name = "sds",
  build = {
    { command = "touch libsds_go." .. ext },
    { when = "linux_target", steps = {
      { copy = "libsds_go.so", to = "embedded/lib" },
    } },
    { when = "osx_target", steps = {
      { copy = "libsds_go.dylib", to = "embedded/lib" },
    } },
  },
}
"#,
  );

  env
    .build_cmd()
    .args(["--target-os", "darwin", "--target-arch", "aarch64"])
    .assert()
    .success();

  let lib = env.install_dir().join("embedded/lib");
  assert!(lib.join("libsds_go.dylib").is_file());
  assert!(!lib.join("libsds_go.so").exists());
}

#[test]
fn step_placeholders_and_env_are_set() {
  let env = TestEnv::with_project(r#"return { name = "agent", dependencies = { "preparation" } }"#);
  env.write_file(
    "software/preparation.lua",
    r#"return {
  name = "preparation",
  build = {
    { command = "mkdir -p $${install_dir}/etc && printf '%s' \"$SOURCE_DATE_EPOCH\" > $${install_dir}/etc/epoch" },
  },
}"#,
  );

  env.build_cmd().assert().success();

  let epoch = fs::read_to_string(env.install_dir().join("etc/epoch")).unwrap();
  assert_eq!(epoch, "315532800");
}

#[test]
fn unknown_fact_is_a_configuration_error() {
  let env = TestEnv::with_project(r#"return { name = "agent", dependencies = { "zlib" } }"#);
  env.write_file(
    "software/zlib.lua",
    r#"return { name = "zlib", build = { { command = "true", when = "solaris_target" } } }"#,
  );

  env
    .build_cmd()
    .assert()
    .failure()
    .stderr(predicate::str::contains("Configuration error"))
    .stderr(predicate::str::contains("solaris_target"));

  assert!(!env.install_dir().exists());
}

#[test]
fn json_output_is_machine_readable() {
  let env = curl_project();

  let output = env.build_cmd().args(["-o", "json"]).output().unwrap();
  assert!(output.status.success());

  let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(report["project"], "agent");
  assert_eq!(report["success"], true);
  assert_eq!(report["order"], serde_json::json!(["zlib", "curl"]));
}
