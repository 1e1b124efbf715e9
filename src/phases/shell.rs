//! Shell-kind resolution and Windows PowerShell command rewriting.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;

use crate::model::ShellKind;

/// Resolve `Auto` to a concrete shell: on Windows, prefers `cmd.exe`, then
/// `powershell.exe`, then `pwsh`, first found wins; on Unix, `bash` falling
/// back to `sh`.
pub fn resolve_shell(kind: ShellKind) -> ShellKind {
    if kind != ShellKind::Auto {
        return kind;
    }
    if cfg!(windows) {
        for (exe, resolved) in [("cmd.exe", ShellKind::Cmd), ("powershell.exe", ShellKind::PowerShell), ("pwsh", ShellKind::Pwsh)] {
            if which::which(exe).is_ok() {
                return resolved;
            }
        }
        ShellKind::PowerShell
    } else {
        if which::which("bash").is_ok() { ShellKind::Bash } else { ShellKind::Sh }
    }
}

/// Preamble that marks a command as already having gone through
/// [`adapt_command_for_powershell`], so a second pass (the job executor may
/// retry a phase with the same resolved `ShellKind::PowerShell` spec) is
/// idempotent rather than double-wrapping.
const WRAPPED_PREAMBLE: &str = "$ErrorActionPreference = 'Continue'; ";

/// Rewrite a POSIX-style shell command for PowerShell: every `&&` becomes
/// an explicit exit-code check, `ls -la` becomes `Get-ChildItem`, the whole
/// script is bracketed with an error-action preference and an explicit
/// `exit $LASTEXITCODE`. Idempotent: calling this again on its own output
/// returns the input unchanged.
pub fn adapt_command_for_powershell(command: &str) -> String {
    if command.starts_with(WRAPPED_PREAMBLE) {
        return command.to_string();
    }
    let mut rewritten = command.replace("&&", "; if (!$?) { exit 1 }; ");
    rewritten = rewritten.replace("ls -la", "Get-ChildItem");
    format!("{WRAPPED_PREAMBLE}{rewritten}; exit $LASTEXITCODE")
}

pub struct ShellRunOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub combined_output: String,
}

pub async fn run_shell(
    kind: ShellKind,
    command: &str,
    cwd: &Path,
    env: &BTreeMap<String, String>,
    timeout: Option<Duration>,
) -> std::io::Result<(ShellRunOutcome, Option<u32>)> {
    let resolved = resolve_shell(kind);
    let mut cmd = match resolved {
        ShellKind::Cmd => {
            let mut c = Command::new("cmd.exe");
            c.args(["/C", command]);
            c
        }
        ShellKind::PowerShell | ShellKind::Pwsh => {
            let exe = if resolved == ShellKind::Pwsh { "pwsh" } else { "powershell.exe" };
            let mut c = Command::new(exe);
            c.args(["-NoProfile", "-Command", &adapt_command_for_powershell(command)]);
            c
        }
        ShellKind::Bash => {
            let mut c = Command::new("bash");
            c.args(["-c", command]);
            c
        }
        ShellKind::Sh | ShellKind::Auto => {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        }
    };
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

    let clamped = timeout.map(|d| d.min(Duration::from_millis(i32::MAX as u64)));

    let output = match clamped {
        Some(duration) => match tokio::time::timeout(duration, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                if let Some(pid) = pid {
                    super::process_exec::kill_process(pid).await;
                }
                return Ok((
                    ShellRunOutcome { success: false, exit_code: None, combined_output: "shell command timed out".to_string() },
                    pid,
                ));
            }
        },
        None => child.wait_with_output().await?,
    };

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    Ok((
        ShellRunOutcome {
            success: output.status.success(),
            exit_code: output.status.code(),
            combined_output: combined,
        },
        pid,
    ))
}

pub fn default_cwd(worktree: &Path, override_cwd: &Option<PathBuf>) -> PathBuf {
    match override_cwd {
        Some(p) if p.is_absolute() => p.clone(),
        Some(p) => worktree.join(p),
        None => worktree.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_and_rejoins_chained_command() {
        let rewritten = adapt_command_for_powershell("mkdir foo && cd foo");
        assert!(rewritten.contains("if (!$?) { exit 1 }"));
        assert!(rewritten.ends_with("exit $LASTEXITCODE"));
        assert!(rewritten.starts_with("$ErrorActionPreference = 'Continue';"));
    }

    #[test]
    fn rewrites_ls_la_to_get_childitem() {
        let rewritten = adapt_command_for_powershell("ls -la");
        assert!(rewritten.contains("Get-ChildItem"));
        assert!(!rewritten.contains("ls -la"));
    }

    #[test]
    fn rewrite_is_idempotent_on_its_own_output() {
        let once = adapt_command_for_powershell("a && b");
        let twice = adapt_command_for_powershell(&once);
        assert_eq!(once, twice, "re-wrapping an already-wrapped script must be a no-op");
        assert_eq!(twice.matches("$ErrorActionPreference").count(), 1);
        assert_eq!(twice.matches("exit $LASTEXITCODE").count(), 1);
    }

    #[test]
    fn default_cwd_uses_worktree_when_unset() {
        let worktree = Path::new("/repo/wt-1");
        assert_eq!(default_cwd(worktree, &None), worktree);
    }

    #[test]
    fn default_cwd_joins_relative_override() {
        let worktree = Path::new("/repo/wt-1");
        let result = default_cwd(worktree, &Some(PathBuf::from("sub")));
        assert_eq!(result, PathBuf::from("/repo/wt-1/sub"));
    }
}
