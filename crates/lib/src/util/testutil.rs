//! Test utilities for kiln-lib.
//!
//! Cross-platform snippets for steps that need a shell.

/// A command that writes `content` into `file` relative to the cwd.
#[cfg(unix)]
pub fn write_file_cmd(file: &str, content: &str) -> String {
  format!("printf '%s' '{}' > {}", content, file)
}

#[cfg(windows)]
pub fn write_file_cmd(file: &str, content: &str) -> String {
  format!("Set-Content -NoNewline -Path {} -Value '{}'", file, content)
}

/// A command that exits with the given status.
pub fn exit_cmd(code: i32) -> String {
  format!("exit {}", code)
}

/// A command that echoes an environment variable into a file.
#[cfg(unix)]
pub fn echo_env_to_file(var: &str, file: &str) -> String {
  format!("printf '%s' \"${}\" > {}", var, file)
}

#[cfg(windows)]
pub fn echo_env_to_file(var: &str, file: &str) -> String {
  format!("Set-Content -NoNewline -Path {} -Value $env:{}", file, var)
}

/// A command that sleeps long enough to be cancelled.
#[cfg(unix)]
pub fn long_sleep_cmd() -> String {
  "sleep 30".to_string()
}

#[cfg(windows)]
pub fn long_sleep_cmd() -> String {
  "Start-Sleep -Seconds 30".to_string()
}

/// A throwaway git repository driven through the `git` CLI, for exercising
/// fetches over `file://` URLs.
#[cfg(unix)]
pub struct GitRepo {
  dir: std::path::PathBuf,
}

#[cfg(unix)]
impl GitRepo {
  /// Initialize a repository on branch `main`. `None` when `git` is not
  /// installed.
  pub fn init(dir: &std::path::Path) -> Option<Self> {
    let available = std::process::Command::new("git")
      .arg("--version")
      .output()
      .is_ok_and(|out| out.status.success());
    if !available {
      eprintln!("git not installed, skipping");
      return None;
    }
    std::fs::create_dir_all(dir).unwrap();
    let repo = Self { dir: dir.to_path_buf() };
    repo.git(&["init", "--quiet"]);
    repo.git(&["symbolic-ref", "HEAD", "refs/heads/main"]);
    Some(repo)
  }

  /// Write `files` and commit them. Returns the commit id.
  pub fn commit(&self, files: &[(&str, &str)], message: &str) -> String {
    for (path, content) in files {
      let path = self.dir.join(path);
      std::fs::create_dir_all(path.parent().unwrap()).unwrap();
      std::fs::write(path, content).unwrap();
    }
    self.git(&["add", "--all"]);
    self.git(&["commit", "--quiet", "-m", message]);
    self.git(&["rev-parse", "HEAD"])
  }

  pub fn tag(&self, name: &str) {
    self.git(&["tag", name]);
  }

  pub fn url(&self) -> String {
    format!("file://{}", self.dir.display())
  }

  fn git(&self, args: &[&str]) -> String {
    let out = std::process::Command::new("git")
      .args(["-c", "user.name=kiln", "-c", "user.email=kiln@example.com", "-c", "commit.gpgsign=false"])
      .args(args)
      .current_dir(&self.dir)
      .output()
      .unwrap();
    assert!(out.status.success(), "git {:?}: {}", args, String::from_utf8_lossy(&out.stderr));
    String::from_utf8(out.stdout).unwrap().trim().to_string()
  }
}
