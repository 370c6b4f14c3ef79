use std::fs;
use std::time::Duration;

use tempfile::TempDir;

use super::*;
use crate::descriptor::{BuildStep, SourceRef};
use crate::install::{InstallError, InstallStatus};
use crate::platform::{Arch, Os};
use crate::predicate::parse;
use crate::resolve::ResolveError;
use crate::step::StepError;
#[cfg(unix)]
use crate::util::testutil::GitRepo;
use crate::util::testutil::{exit_cmd, long_sleep_cmd, write_file_cmd};

fn linux() -> Platform {
  Platform::new(Arch::X86_64, Os::Linux)
}

fn config(temp: &TempDir) -> SessionConfig {
  SessionConfig {
    platform: Some(linux()),
    fetch_backoff: Duration::from_millis(1),
    ..SessionConfig::rooted_at(temp.path())
  }
}

fn project(temp: &TempDir, deps: &[&str]) -> Project {
  deps.iter().fold(
    Project::new("datadog-updater", temp.path().join("omnibus")),
    |p, d| p.dependency(*d),
  )
}

/// A descriptor that writes `<name>.out` in its source dir and copies it
/// into `embedded/lib`, only on Linux.
fn linux_lib(name: &str, deps: &[&str]) -> SoftwareDescriptor {
  let file = format!("{}.out", name);
  deps
    .iter()
    .fold(SoftwareDescriptor::builder(name).version("main"), |b, d| b.dependency(*d))
    .step(BuildStep::command(write_file_cmd(&file, name)).when(parse("linux_target").unwrap()))
    .step(BuildStep::copy(&file, "embedded/lib").when(parse("linux_target?").unwrap()))
    .build()
    .unwrap()
}

/// A pinned descriptor that writes `lib<name>.so` holding its version and
/// copies it into `embedded/lib`.
fn pinned_lib(name: &str, version: &str, deps: &[&str]) -> SoftwareDescriptor {
  let file = format!("lib{}.so", name);
  deps
    .iter()
    .fold(SoftwareDescriptor::builder(name).version(version), |b, d| b.dependency(*d))
    .step(BuildStep::command(write_file_cmd(&file, version)))
    .step(BuildStep::copy(&file, "embedded/lib"))
    .build()
    .unwrap()
}

fn failing(name: &str, deps: &[&str]) -> SoftwareDescriptor {
  deps
    .iter()
    .fold(SoftwareDescriptor::builder(name), |b, d| b.dependency(*d))
    .step(BuildStep::command(write_file_cmd("ok", "1")))
    .step(BuildStep::command(exit_cmd(1)))
    .build()
    .unwrap()
}

#[tokio::test]
async fn builds_in_dependency_order_and_reports_manifest() {
  let temp = TempDir::new().unwrap();
  let registry: Registry = [
    linux_lib("updater", &["sds"]),
    linux_lib("sds", &[]),
    linux_lib("preparation", &[]),
  ]
  .into_iter()
  .collect();
  let manifest = Arc::new(VersionManifest::new());
  let session = Session::new(project(&temp, &["preparation", "updater"]), registry, config(&temp))
    .with_manifest(manifest.clone());

  let report = session.run().await.unwrap();

  assert!(report.success(), "{:?}", report.errors);
  assert_eq!(report.order, vec!["preparation", "sds", "updater"]);
  assert_eq!(report.built, vec!["preparation", "sds", "updater"]);

  let root = session.install_root();
  for name in ["preparation", "sds", "updater"] {
    assert!(root.join("embedded/lib").join(format!("{}.out", name)).is_file());
    assert_eq!(report.install.descriptors[name].status, InstallStatus::Complete);
    assert_eq!(manifest.get(name).unwrap().version, "main");
  }
  assert!(temp.path().join("work").join(INSTALL_RECORD_FILE).is_file());
}

#[tokio::test]
async fn unmet_platform_facts_build_nothing_into_the_tree() {
  let temp = TempDir::new().unwrap();
  let registry: Registry = [linux_lib("sds", &[])].into_iter().collect();
  let config = SessionConfig {
    platform: Some(Platform::new(Arch::Aarch64, Os::MacOs)),
    ..config(&temp)
  };
  let session = Session::new(project(&temp, &["sds"]), registry, config);

  let report = session.run().await.unwrap();

  assert!(report.success());
  assert_eq!(report.steps["sds"].skipped(), 2);
  assert!(report.install.descriptors["sds"].paths.is_empty());
  assert_eq!(fs::read_dir(session.install_root().join("embedded/lib")).unwrap().count(), 0);
}

#[tokio::test]
async fn failing_step_halts_the_session() {
  let temp = TempDir::new().unwrap();
  let registry: Registry = [failing("sds", &[]), linux_lib("updater", &["sds"])].into_iter().collect();
  let session = Session::new(project(&temp, &["sds", "updater"]), registry, config(&temp));

  let report = session.run().await.unwrap();

  assert!(!report.success());
  assert_eq!(report.failed, vec!["sds"]);
  assert_eq!(report.not_started, vec!["updater"]);
  match report.first_error() {
    Some(SessionError::Step(StepError::StepExecution {
      descriptor,
      step_index,
      exit_status,
      ..
    })) => {
      assert_eq!(descriptor, "sds");
      assert_eq!(*step_index, 1);
      assert_eq!(exit_status.code(), Some(1));
    }
    other => panic!("unexpected first error: {:?}", other),
  }
  assert_eq!(report.install.descriptors["sds"].status, InstallStatus::Incomplete);
  assert!(!report.install.descriptors.contains_key("updater"));
}

#[tokio::test]
async fn halt_stops_descriptors_waiting_in_the_same_wave() {
  let temp = TempDir::new().unwrap();
  let registry: Registry = [
    linux_lib("top", &["a", "b", "c"]),
    failing("a", &[]),
    linux_lib("b", &[]),
    linux_lib("c", &[]),
  ]
  .into_iter()
  .collect();
  let config = SessionConfig {
    parallelism: 1,
    ..config(&temp)
  };
  let session = Session::new(project(&temp, &["top"]), registry, config);

  let report = session.run().await.unwrap();

  assert_eq!(report.failed, vec!["a"]);
  assert_eq!(report.built.len() + report.not_started.len(), 3);
  assert!(report.not_started.contains(&"top".to_string()));
  assert_eq!(report.errors.len(), 1);
}

#[tokio::test]
async fn continue_policy_builds_siblings_and_skips_dependents() {
  let temp = TempDir::new().unwrap();
  let registry: Registry = [
    failing("openssl", &[]),
    linux_lib("curl", &["openssl"]),
    linux_lib("zlib", &[]),
  ]
  .into_iter()
  .collect();
  let config = SessionConfig {
    failure_policy: FailurePolicy::Continue,
    ..config(&temp)
  };
  let session = Session::new(project(&temp, &["zlib", "curl"]), registry, config);

  let report = session.run().await.unwrap();

  assert_eq!(report.failed, vec!["openssl"]);
  assert_eq!(report.built, vec!["zlib"]);
  assert_eq!(report.skipped, vec!["curl"]);
  assert!(session.install_root().join("embedded/lib/zlib.out").is_file());
}

#[tokio::test]
async fn configuration_errors_touch_nothing() {
  let temp = TempDir::new().unwrap();
  let bad = SoftwareDescriptor::builder("sds")
    .step(BuildStep::command(write_file_cmd("ran", "1")))
    .step(BuildStep::command("true").when(parse("linux_target && solaris_target").unwrap()))
    .build()
    .unwrap();
  let registry: Registry = [bad].into_iter().collect();
  let session = Session::new(project(&temp, &["sds"]), registry, config(&temp));

  let err = session.run().await.unwrap_err();

  assert!(err.is_configuration());
  assert!(matches!(err, SessionError::Predicate { step_index: 1, .. }));
  assert!(!session.install_root().exists());
  assert!(!temp.path().join("work/src/sds").exists());
}

#[tokio::test]
async fn cycles_are_configuration_errors() {
  let temp = TempDir::new().unwrap();
  let registry: Registry = [linux_lib("a", &["b"]), linux_lib("b", &["a"])].into_iter().collect();
  let session = Session::new(project(&temp, &["a"]), registry, config(&temp));

  let err = session.run().await.unwrap_err();

  assert!(err.is_configuration());
  assert!(!err.is_retryable());
  assert!(matches!(err, SessionError::Resolve(ResolveError::CycleDetected { .. })));
}

#[tokio::test]
async fn cancellation_marks_in_flight_descriptor_incomplete() {
  let temp = TempDir::new().unwrap();
  let slow = SoftwareDescriptor::builder("slow")
    .step(BuildStep::command(long_sleep_cmd()))
    .build()
    .unwrap();
  let registry: Registry = [slow, linux_lib("after", &["slow"])].into_iter().collect();
  let session = Session::new(project(&temp, &["slow", "after"]), registry, config(&temp));

  let handle = session.cancel_handle();
  tokio::spawn(async move {
    tokio::time::sleep(Duration::from_millis(300)).await;
    handle.cancel();
  });

  let report = tokio::time::timeout(Duration::from_secs(20), session.run())
    .await
    .unwrap()
    .unwrap();

  assert!(report.cancelled);
  assert!(!report.success());
  assert_eq!(report.failed, vec!["slow"]);
  assert!(report.first_error().unwrap().is_cancelled());
  assert_eq!(report.not_started, vec!["after"]);
  assert_eq!(report.install.descriptors["slow"].status, InstallStatus::Incomplete);
}

#[cfg(unix)]
#[tokio::test]
async fn pinned_descriptor_is_restored_from_cache() {
  let temp = TempDir::new().unwrap();
  fs::create_dir_all(temp.path().join("omnibus")).unwrap();
  let pinned = || {
    SoftwareDescriptor::builder("sds")
      .version("v0.1.2")
      .step(BuildStep::command("echo run >> \"$project_dir/runs\" && printf elf > libsds_go.so"))
      .step(BuildStep::copy("libsds_go.so", "embedded/lib"))
      .build()
      .unwrap()
  };

  let first = Session::new(
    project(&temp, &["sds"]),
    [pinned()].into_iter().collect(),
    SessionConfig {
      install_dir: Some(temp.path().join("install-1")),
      ..config(&temp)
    },
  );
  let report = first.run().await.unwrap();
  assert_eq!(report.built, vec!["sds"]);

  let manifest = Arc::new(VersionManifest::new());
  let second = Session::new(
    project(&temp, &["sds"]),
    [pinned()].into_iter().collect(),
    SessionConfig {
      install_dir: Some(temp.path().join("install-2")),
      ..config(&temp)
    },
  )
  .with_manifest(manifest.clone());
  let report = second.run().await.unwrap();

  assert_eq!(report.cached, vec!["sds"]);
  assert!(report.built.is_empty());
  assert_eq!(
    fs::read_to_string(temp.path().join("install-2/embedded/lib/libsds_go.so")).unwrap(),
    "elf"
  );
  assert_eq!(fs::read_to_string(temp.path().join("omnibus/runs")).unwrap().lines().count(), 1);
  assert_eq!(manifest.get("sds").unwrap().version, "v0.1.2");
  assert_eq!(
    report.install.descriptors["sds"].paths.iter().cloned().collect::<Vec<_>>(),
    vec![PathBuf::from("embedded/lib/libsds_go.so")]
  );
}

#[tokio::test]
async fn floating_descriptors_are_never_cached() {
  let temp = TempDir::new().unwrap();
  let registry = || -> Registry { [linux_lib("sds", &[])].into_iter().collect() };

  for _ in 0..2 {
    let session = Session::new(project(&temp, &["sds"]), registry(), config(&temp));
    let report = session.run().await.unwrap();
    assert_eq!(report.built, vec!["sds"]);
    assert!(report.cached.is_empty());
  }
}

#[tokio::test]
async fn custom_facts_gate_steps() {
  let temp = TempDir::new().unwrap();
  let descriptor = SoftwareDescriptor::builder("fips")
    .step(BuildStep::command(write_file_cmd("fips.out", "1")).when(parse("fips_mode").unwrap()))
    .step(BuildStep::copy("fips.out", "embedded/lib").when(parse("fips_mode").unwrap()))
    .build()
    .unwrap();
  let mut config = config(&temp);
  config.extra_facts.insert("fips_mode".to_string(), true);
  let session = Session::new(project(&temp, &["fips"]), [descriptor].into_iter().collect(), config);

  let report = session.run().await.unwrap();

  assert!(report.success());
  assert!(session.install_root().join("embedded/lib/fips.out").is_file());
}

#[tokio::test]
async fn local_sources_are_fetched_relative_to_project() {
  let temp = TempDir::new().unwrap();
  let upstream = temp.path().join("omnibus/vendor/updater");
  fs::create_dir_all(upstream.join("bin")).unwrap();
  fs::write(upstream.join("bin/datadog-updater"), "binary").unwrap();

  let descriptor = SoftwareDescriptor::builder("updater")
    .version("7.60.0")
    .source(SourceRef::local("vendor/updater"))
    .step(BuildStep::copy("bin/datadog-updater", "embedded/bin/"))
    .build()
    .unwrap();
  let session = Session::new(
    project(&temp, &["updater"]),
    [descriptor].into_iter().collect(),
    SessionConfig {
      cache_builds: false,
      ..config(&temp)
    },
  );

  let report = session.run().await.unwrap();

  assert!(report.success(), "{:?}", report.errors);
  assert!(session.install_root().join("embedded/bin/datadog-updater").is_file());
}

#[cfg(unix)]
#[tokio::test]
async fn project_entries_wait_for_earlier_entries() {
  let temp = TempDir::new().unwrap();
  fs::create_dir_all(temp.path().join("omnibus")).unwrap();
  let preparation = SoftwareDescriptor::builder("preparation")
    .step(BuildStep::command("sleep 1 && touch \"$project_dir/prepared\""))
    .build()
    .unwrap();
  let updater = SoftwareDescriptor::builder("updater")
    .step(BuildStep::command("test -f \"$project_dir/prepared\""))
    .build()
    .unwrap();
  let config = SessionConfig {
    parallelism: 4,
    ..config(&temp)
  };
  let session = Session::new(
    project(&temp, &["preparation", "updater"]),
    [preparation, updater].into_iter().collect(),
    config,
  );

  let report = session.run().await.unwrap();

  assert!(report.success(), "{:?}", report.errors);
  assert_eq!(report.built, vec!["preparation", "updater"]);
}

#[tokio::test]
async fn overwriting_another_descriptors_file_fails_the_writer() {
  let temp = TempDir::new().unwrap();
  let shipping = |name: &str, content: &str, deps: &[&str]| {
    deps
      .iter()
      .fold(SoftwareDescriptor::builder(name), |b, d| b.dependency(*d))
      .step(BuildStep::command(write_file_cmd("libssl.so", content)))
      .step(BuildStep::copy("libssl.so", "embedded/lib"))
      .build()
      .unwrap()
  };
  let registry: Registry = [shipping("a", "from-a", &[]), shipping("b", "from-b", &["a"])]
    .into_iter()
    .collect();
  let session = Session::new(project(&temp, &["b"]), registry, config(&temp));

  let report = session.run().await.unwrap();

  assert_eq!(report.built, vec!["a"]);
  assert_eq!(report.failed, vec!["b"]);
  match report.first_error() {
    Some(SessionError::Step(StepError::Install {
      step_index: 1,
      source: InstallError::Conflict { path, owner, .. },
      ..
    })) => {
      assert_eq!(owner, "a");
      assert_eq!(path, &PathBuf::from("embedded/lib/libssl.so"));
    }
    other => panic!("expected install conflict, got {:?}", other),
  }
  assert_eq!(
    fs::read_to_string(session.install_root().join("embedded/lib/libssl.so")).unwrap(),
    "from-a"
  );
}

#[tokio::test]
async fn changed_local_source_is_rebuilt_despite_pinned_version() {
  let temp = TempDir::new().unwrap();
  let upstream = temp.path().join("omnibus/vendor/tool");
  fs::create_dir_all(&upstream).unwrap();
  fs::write(upstream.join("tool.so"), "v1").unwrap();
  let tool = || {
    SoftwareDescriptor::builder("tool")
      .version("1.0.0")
      .source(SourceRef::local("vendor/tool"))
      .step(BuildStep::copy("tool.so", "embedded/lib"))
      .build()
      .unwrap()
  };
  let session = |install: &str| {
    Session::new(
      project(&temp, &["tool"]),
      [tool()].into_iter().collect(),
      SessionConfig {
        install_dir: Some(temp.path().join(install)),
        ..config(&temp)
      },
    )
  };

  let report = session("install-1").run().await.unwrap();
  assert_eq!(report.built, vec!["tool"]);

  fs::write(upstream.join("tool.so"), "v2").unwrap();
  let report = session("install-2").run().await.unwrap();

  assert_eq!(report.built, vec!["tool"]);
  assert!(report.cached.is_empty());
  assert_eq!(
    fs::read_to_string(temp.path().join("install-2/embedded/lib/tool.so")).unwrap(),
    "v2"
  );
}

#[tokio::test]
async fn dependency_version_bump_rebuilds_dependents() {
  let temp = TempDir::new().unwrap();
  let session = |zlib: &str, install: &str| {
    Session::new(
      project(&temp, &["curl"]),
      [pinned_lib("zlib", zlib, &[]), pinned_lib("curl", "8.4.0", &["zlib"])]
        .into_iter()
        .collect(),
      SessionConfig {
        install_dir: Some(temp.path().join(install)),
        ..config(&temp)
      },
    )
  };

  let report = session("1.2.11", "install-1").run().await.unwrap();
  assert_eq!(report.built, vec!["zlib", "curl"]);

  let report = session("1.3.1", "install-2").run().await.unwrap();
  assert_eq!(report.built, vec!["zlib", "curl"]);
  assert!(report.cached.is_empty());
  assert_eq!(
    fs::read_to_string(temp.path().join("install-2/embedded/lib/libzlib.so")).unwrap(),
    "1.3.1"
  );

  let report = session("1.3.1", "install-3").run().await.unwrap();
  assert_eq!(report.cached, vec!["zlib", "curl"]);
  assert!(report.built.is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn git_descriptor_builds_from_local_repository() {
  let temp = TempDir::new().unwrap();
  let Some(repo) = GitRepo::init(&temp.path().join("dd-sensitive-data-scanner")) else {
    return;
  };
  let commit = repo.commit(&[("sds-go/rust/Cargo.toml", "[package]\nname = \"sds-go\"\n")], "init");
  let sds = SoftwareDescriptor::builder("sds")
    .version("main")
    .source(SourceRef::git(repo.url()))
    .relative_path("sds-go/rust")
    .step(BuildStep::command("test -f Cargo.toml && printf elf > libsds_go.so").when(parse("linux_target").unwrap()))
    .step(BuildStep::copy("libsds_go.so", "$${install_dir}/embedded/lib").when(parse("linux_target").unwrap()))
    .build()
    .unwrap();
  let manifest = Arc::new(VersionManifest::new());
  let session = Session::new(project(&temp, &["sds"]), [sds].into_iter().collect(), config(&temp))
    .with_manifest(manifest.clone());

  let report = session.run().await.unwrap();

  assert!(report.success(), "{:?}", report.errors);
  assert_eq!(
    fs::read_to_string(session.install_root().join("embedded/lib/libsds_go.so")).unwrap(),
    "elf"
  );
  let versions: BTreeMap<String, String> = manifest
    .entries()
    .into_iter()
    .map(|(name, entry)| (name, entry.version))
    .collect();
  assert_eq!(versions, BTreeMap::from([("sds".to_string(), "main".to_string())]));
  assert_eq!(manifest.get("sds").unwrap().source_revision, Some(commit));
}
