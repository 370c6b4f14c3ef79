//! Shell command execution for build steps.

use std::path::Path;

use tokio::process::Command;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::consts::SOURCE_DATE_EPOCH;

/// How a command finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CmdOutcome {
  Exited {
    /// `None` when the process was terminated by a signal.
    code: Option<i32>,
    stdout: String,
    stderr: String,
  },
  Cancelled,
}

impl CmdOutcome {
  pub fn success(&self) -> bool {
    matches!(self, Self::Exited { code: Some(0), .. })
  }
}

/// Run `cmd` through the shell in `cwd`.
///
/// The inherited environment is kept; `env` entries are added on top along
/// with `SOURCE_DATE_EPOCH`. The child is killed if `cancel` fires first.
pub async fn execute_cmd(
  cmd: &str,
  env: &[(String, String)],
  cwd: &Path,
  shell: Option<&str>,
  cancel: &CancelToken,
) -> std::io::Result<CmdOutcome> {
  let (shell_cmd, shell_args) = get_shell(shell);

  let mut command = Command::new(&shell_cmd);
  command
    .args(&shell_args)
    .arg(cmd)
    .current_dir(cwd)
    .env("SOURCE_DATE_EPOCH", SOURCE_DATE_EPOCH)
    .kill_on_drop(true);
  for (key, value) in env {
    command.env(key, value);
  }

  debug!(shell = %shell_cmd, cwd = %cwd.display(), "spawning process");

  let output = tokio::select! {
    output = command.output() => output?,
    _ = cancel.cancelled() => {
      debug!(cmd, "command cancelled, child killed");
      return Ok(CmdOutcome::Cancelled);
    }
  };

  let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
  let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
  if !stdout.is_empty() {
    debug!(stdout = %stdout, "command stdout");
  }
  if !stderr.is_empty() {
    debug!(stderr = %stderr, "command stderr");
  }

  Ok(CmdOutcome::Exited {
    code: output.status.code(),
    stdout,
    stderr,
  })
}

/// Shell program and the arguments that precede the command string.
///
/// Defaults to `/bin/sh -c` on Unix and PowerShell on Windows; `$SHELL` is
/// never consulted since interactive shells may source profile files.
pub fn get_shell(override_shell: Option<&str>) -> (String, Vec<String>) {
  if let Some(shell) = override_shell {
    let args = if shell.contains("powershell") || shell.contains("pwsh") {
      vec!["-NoProfile".to_string(), "-Command".to_string()]
    } else if shell.ends_with("cmd") || shell.ends_with("cmd.exe") {
      vec!["/C".to_string()]
    } else {
      vec!["-c".to_string()]
    };
    return (shell.to_string(), args);
  }

  #[cfg(unix)]
  {
    ("/bin/sh".to_string(), vec!["-c".to_string()])
  }

  #[cfg(windows)]
  {
    (
      "powershell.exe".to_string(),
      vec![
        "-NoProfile".to_string(),
        "-ExecutionPolicy".to_string(),
        "Bypass".to_string(),
        "-Command".to_string(),
      ],
    )
  }
}
