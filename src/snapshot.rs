//! Snapshot Manager: the per-plan branch that accumulates leaf
//! reverse-integration merges before a single validated final merge lands
//! them on the target branch.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::git::{GitAdapter, GitError};
use crate::model::PlanId;

/// A plan's accumulation branch plus the worktree it lives in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub branch: String,
    pub worktree_path: PathBuf,
    /// The target branch commit the snapshot was last created or rebased
    /// from. Updated by [`SnapshotManager::rebase_on_target`].
    pub base_commit: String,
}

impl Snapshot {
    pub fn branch_name(plan_id: PlanId) -> String {
        format!("orchestrator/snapshot/{plan_id}")
    }

    pub fn worktree_dir_name(plan_id: PlanId) -> String {
        format!("_snapshot-{}", plan_id.short())
    }
}

pub struct SnapshotManager<'a> {
    git: &'a GitAdapter,
}

impl<'a> SnapshotManager<'a> {
    pub fn new(git: &'a GitAdapter) -> Self {
        Self { git }
    }

    /// Create the snapshot branch and worktree for a plan, at the target
    /// branch's current HEAD.
    pub async fn create(
        &self,
        repo_path: &std::path::Path,
        worktree_root: &std::path::Path,
        plan_id: PlanId,
        target_branch: &str,
    ) -> Result<Snapshot, GitError> {
        let base_commit = self.git.repository.resolve_ref(repo_path, target_branch).await?;
        let branch = Snapshot::branch_name(plan_id);
        self.git
            .branches
            .create(repo_path, &branch, &base_commit)
            .await?;

        let worktree_path = worktree_root.join(Snapshot::worktree_dir_name(plan_id));
        self.git
            .worktrees
            .create_detached(repo_path, &worktree_path, &base_commit, &[])
            .await?;
        self.git.repository.checkout(&worktree_path, &branch).await?;

        info!(%plan_id, %branch, "created snapshot branch and worktree");
        Ok(Snapshot {
            branch,
            worktree_path,
            base_commit,
        })
    }

    /// Rebase the snapshot onto the target branch's current HEAD if it has
    /// moved. Returns `Ok(true)` on success (including the no-op case where
    /// target hasn't moved), `Ok(false)` if the rebase hit conflicts and was
    /// aborted.
    pub async fn rebase_on_target(
        &self,
        repo_path: &std::path::Path,
        snapshot: &mut Snapshot,
        target_branch: &str,
    ) -> Result<bool, GitError> {
        let new_head = self.git.repository.resolve_ref(repo_path, target_branch).await?;
        if new_head == snapshot.base_commit {
            return Ok(true);
        }

        let ok = self
            .git
            .repository
            .rebase_onto(&snapshot.worktree_path, &new_head, &snapshot.base_commit, &snapshot.branch)
            .await?;
        if !ok {
            self.git.repository.rebase_abort(&snapshot.worktree_path).await?;
            warn!(branch = %snapshot.branch, "snapshot rebase onto target hit conflicts, aborted");
            return Ok(false);
        }
        snapshot.base_commit = new_head;
        Ok(true)
    }

    /// Remove the snapshot worktree and branch, tolerant of either already
    /// being absent.
    pub async fn cleanup(&self, repo_path: &std::path::Path, snapshot: &Snapshot) -> Result<(), GitError> {
        self.git
            .worktrees
            .remove_safe(repo_path, &snapshot.worktree_path)
            .await?;
        self.git.branches.delete_local_safe(repo_path, &snapshot.branch).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn branch_name_is_namespaced_under_orchestrator() {
        let plan_id = PlanId::new(Uuid::nil());
        assert_eq!(Snapshot::branch_name(plan_id), format!("orchestrator/snapshot/{plan_id}"));
    }

    #[test]
    fn worktree_dir_name_uses_short_plan_id() {
        let plan_id = PlanId::new(Uuid::nil());
        assert_eq!(Snapshot::worktree_dir_name(plan_id), "_snapshot-00000000");
    }
}
