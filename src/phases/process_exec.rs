//! Direct argv process execution (no shell), with platform-appropriate
//! cancellation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;

pub struct ProcessRunOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub combined_output: String,
}

pub async fn run_process(
    executable: &str,
    args: &[String],
    cwd: &Path,
    env: &BTreeMap<String, String>,
    timeout: Option<Duration>,
) -> std::io::Result<(ProcessRunOutcome, Option<u32>)> {
    let mut cmd = Command::new(executable);
    cmd.args(args);
    cmd.current_dir(cwd);
    cmd.envs(env);
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    let mut child = cmd
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()?;
    let pid = child.id();

    // Clamp to i32::MAX ms per the process-timeout contract.
    let clamped = timeout.map(|d| d.min(Duration::from_millis(i32::MAX as u64)));

    let output = match clamped {
        Some(duration) => match tokio::time::timeout(duration, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                if let Some(pid) = pid {
                    kill_process(pid).await;
                }
                return Ok((
                    ProcessRunOutcome { success: false, exit_code: None, combined_output: "process timed out".to_string() },
                    pid,
                ));
            }
        },
        None => child.wait_with_output().await?,
    };

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    Ok((
        ProcessRunOutcome { success: output.status.success(), exit_code: output.status.code(), combined_output: combined },
        pid,
    ))
}

/// Kill a tracked process on cancellation or timeout. Windows uses
/// `taskkill /pid <pid> /f /t` to kill the whole tree; Unix sends SIGTERM
/// (no cascade — callers should avoid shell wrappers for long-lived work).
pub async fn kill_process(pid: u32) {
    #[cfg(windows)]
    {
        let _ = Command::new("taskkill")
            .args(["/pid", &pid.to_string(), "/f", "/t"])
            .status()
            .await;
    }
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
}

pub fn default_cwd(worktree: &Path, override_cwd: &Option<PathBuf>) -> PathBuf {
    match override_cwd {
        Some(p) if p.is_absolute() => p.clone(),
        Some(p) => worktree.join(p),
        None => worktree.to_path_buf(),
    }
}
