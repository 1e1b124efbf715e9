//! Shared async `git` CLI invocation helper used by every capability
//! namespace.

use std::path::Path;

use tokio::process::Command;
use tracing::debug;

use super::error::{GitError, GitErrorKind, classify_stderr};

/// Run `git <args>` in `cwd`, returning trimmed stdout on success.
pub async fn run(cwd: &Path, args: &[&str]) -> Result<String, GitError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .await?;

    debug!(?args, cwd = %cwd.display(), success = output.status.success(), "git command");

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let kind = classify_stderr(&stderr);
        return Err(GitError::CommandFailed {
            args: args.join(" "),
            stderr,
            kind,
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim_end_matches('\n').to_owned())
}

/// Run `git <args>`, returning raw (non-UTF8-lossy-trimmed) stdout bytes.
/// Used by `catFileFromTree`, which may return arbitrary binary content.
pub async fn run_bytes(cwd: &Path, args: &[&str]) -> Result<Vec<u8>, GitError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let kind = classify_stderr(&stderr);
        return Err(GitError::CommandFailed {
            args: args.join(" "),
            stderr,
            kind,
        });
    }

    Ok(output.stdout)
}

/// Run `git <args>` and report only whether it exited zero, for commands
/// that use exit codes as boolean results (`merge-base --is-ancestor`,
/// `diff --quiet`).
pub async fn run_check(cwd: &Path, args: &[&str]) -> Result<bool, GitError> {
    let status = Command::new("git").args(args).current_dir(cwd).status().await?;
    Ok(status.success())
}

/// Raw result of a `git` invocation, with stdout retained even on a
/// non-zero exit. Some plumbing commands (`merge-tree --write-tree`)
/// signal an expected, non-error outcome via exit code while still
/// writing the payload the caller needs to stdout; `run`'s
/// success-or-stderr-only contract can't represent that.
#[derive(Debug, Clone)]
pub struct RawOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Run `git <args>` and return stdout/stderr/exit code regardless of
/// outcome. Only a failure to spawn `git` itself is an `Err`.
pub async fn run_raw(cwd: &Path, args: &[&str]) -> Result<RawOutput, GitError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .await?;

    debug!(?args, cwd = %cwd.display(), success = output.status.success(), "git command");

    Ok(RawOutput {
        success: output.status.success(),
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).trim_end_matches('\n').to_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

pub fn not_found(kind: GitErrorKind, args: &str, stderr: impl Into<String>) -> GitError {
    GitError::CommandFailed {
        args: args.to_string(),
        stderr: stderr.into(),
        kind,
    }
}
