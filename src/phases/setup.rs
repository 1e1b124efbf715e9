//! Setup phase: materializes the node's worktree before prechecks run.
//!
//! Not named in the externally-facing pipeline list, but required by the
//! invariant that a node's base commit and worktree exist before any other
//! phase touches them. A root node's worktree starts at the plan's base
//! branch (or the node's `base_branch_override`); a single-dependency node
//! starts at that dependency's completed commit; a multi-dependency node
//! starts at the *first* dependency's commit, deferring the rest to
//! merge-fi.

use async_trait::async_trait;

use super::{PhaseContext, PhaseExecutor, PhaseOutcome};

pub struct SetupExecutor;

#[async_trait]
impl PhaseExecutor for SetupExecutor {
    async fn execute(&self, ctx: &mut PhaseContext<'_>) -> PhaseOutcome {
        let base = ctx
            .dependency_commits
            .first()
            .cloned()
            .or_else(|| ctx.base_commit.clone())
            .unwrap_or_else(|| ctx.plan_base_branch.clone());

        match ctx
            .git
            .worktrees
            .create_or_reuse_detached(&ctx.repo_path, &ctx.worktree_path, &base, &[])
            .await
        {
            Ok(result) => {
                ctx.base_commit = Some(result.base_commit.clone());
                PhaseOutcome::ok_with_commit(result.base_commit)
            }
            Err(e) => PhaseOutcome::failure(format!("failed to create worktree: {e}")),
        }
    }
}
