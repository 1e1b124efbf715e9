//! Git Adapter error type.

/// Coarse failure kind, independent of which capability raised it. Lets
/// callers decide whether a failure is worth retrying without string
/// matching on `message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitErrorKind {
    NotFound,
    AlreadyExists,
    Conflict,
    WorkingTreeDirty,
    PermissionDenied,
    InvalidArgument,
    Transient,
    Unknown,
}

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("git {args}: {stderr}")]
    CommandFailed {
        args: String,
        stderr: String,
        kind: GitErrorKind,
    },

    #[error("failed to parse git output: {0}")]
    ParseError(String),

    #[error("failed to spawn git: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("branch {branch} already exists")]
    BranchAlreadyExists { branch: String },

    #[error("no worktree found for {branch}")]
    NoWorktreeFound { branch: String },

    #[error("worktree path already exists: {}", path.display())]
    WorktreePathExists { path: std::path::PathBuf },

    #[error("merge of {source} into {target} has conflicts in: {conflict_files:?}")]
    MergeConflict {
        source: String,
        target: String,
        conflict_files: Vec<String>,
    },

    #[error("invalid UTF-8 in path: {}", path.display())]
    InvalidUtf8Path { path: std::path::PathBuf },
}

impl GitError {
    pub fn kind(&self) -> GitErrorKind {
        match self {
            GitError::CommandFailed { kind, .. } => *kind,
            GitError::BranchAlreadyExists { .. } | GitError::WorktreePathExists { .. } => {
                GitErrorKind::AlreadyExists
            }
            GitError::NoWorktreeFound { .. } => GitErrorKind::NotFound,
            GitError::MergeConflict { .. } => GitErrorKind::Conflict,
            GitError::ParseError(_) | GitError::InvalidUtf8Path { .. } => GitErrorKind::InvalidArgument,
            GitError::Spawn(_) => GitErrorKind::Unknown,
        }
    }
}

/// Classify raw git stderr into a [`GitErrorKind`]. Best-effort: git's error
/// text isn't a stable interface, so this only recognizes the patterns the
/// engine actually needs to react to (stash-pop recovery, dirty working
/// tree detection before a ref move).
pub fn classify_stderr(stderr: &str) -> GitErrorKind {
    let lower = stderr.to_lowercase();
    if lower.contains("already exists") {
        GitErrorKind::AlreadyExists
    } else if lower.contains("not a git repository") || lower.contains("unknown revision") || lower.contains("pathspec") {
        GitErrorKind::NotFound
    } else if lower.contains("would be overwritten") || lower.contains("local changes") || lower.contains("uncommitted") {
        GitErrorKind::WorkingTreeDirty
    } else if lower.contains("conflict") {
        GitErrorKind::Conflict
    } else if lower.contains("permission denied") {
        GitErrorKind::PermissionDenied
    } else if lower.contains("index.lock") || lower.contains("could not lock") || lower.contains("connection") {
        GitErrorKind::Transient
    } else {
        GitErrorKind::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_recognizes_dirty_working_tree() {
        let stderr = "error: Your local changes to the following files would be overwritten by merge:";
        assert_eq!(classify_stderr(stderr), GitErrorKind::WorkingTreeDirty);
    }

    #[test]
    fn classify_recognizes_lock_contention_as_transient() {
        assert_eq!(
            classify_stderr("fatal: Unable to create '.git/index.lock': File exists."),
            GitErrorKind::Transient
        );
    }

    #[test]
    fn classify_falls_back_to_unknown() {
        assert_eq!(classify_stderr("something unexpected"), GitErrorKind::Unknown);
    }
}
