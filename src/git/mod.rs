//! Git Adapter: a typed async façade over the `git` CLI, split into five
//! capability namespaces (branches, worktrees, merge, repository,
//! gitignore) so every other component depends on traits rather than on
//! `std::process::Command` directly.

mod branches;
mod command;
mod error;
mod gitignore;
mod merge;
mod repository;
mod worktrees;

pub use branches::{Branches, CliBranches};
pub use error::{GitError, GitErrorKind, classify_stderr};
pub use gitignore::{CliGitignore, Gitignore, is_diff_only_orchestrator_changes};
pub use merge::{CliMerge, Merge, MergeOptions, MergeOutcome, MergeTreeOutcome, passes_file_count_ratio};
pub use repository::{CliRepositoryOps, RepositoryOps};
pub use worktrees::{CliWorktrees, WorktreeCreationResult, WorktreeEntry, Worktrees};

/// Bundles the five capability namespaces behind real `git`-CLI
/// implementations. Phase executors, the scheduler, and the snapshot and
/// final-merge modules hold a `&GitAdapter` and never touch a process
/// handle themselves.
pub struct GitAdapter {
    pub branches: Box<dyn Branches>,
    pub worktrees: Box<dyn Worktrees>,
    pub merge: Box<dyn Merge>,
    pub repository: Box<dyn RepositoryOps>,
    pub gitignore: Box<dyn Gitignore>,
}

impl GitAdapter {
    pub fn cli() -> Self {
        Self {
            branches: Box::new(CliBranches),
            worktrees: Box::new(CliWorktrees),
            merge: Box::new(CliMerge),
            repository: Box::new(CliRepositoryOps),
            gitignore: Box::new(CliGitignore),
        }
    }
}

impl Default for GitAdapter {
    fn default() -> Self {
        Self::cli()
    }
}
