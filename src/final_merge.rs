//! Final Merge Executor (§4.6): lands the per-plan snapshot branch, which
//! has accumulated every leaf's reverse-integration merge, onto the real
//! target branch with a bounded number of attempts.

use tracing::{info, warn};

use crate::agent::AgentDelegator;
use crate::config::EngineConfig;
use crate::git::{GitAdapter, passes_file_count_ratio};
use crate::model::Plan;
use crate::phases::run_verify_spec;
use crate::snapshot::SnapshotManager;

#[derive(Debug, Clone)]
pub enum FinalMergeOutcome {
    Merged { commit: String },
    Exhausted { attempts: u32, last_error: String },
}

pub struct FinalMergeExecutor<'a> {
    git: &'a GitAdapter,
    agent: &'a dyn AgentDelegator,
    config: &'a EngineConfig,
}

impl<'a> FinalMergeExecutor<'a> {
    pub fn new(git: &'a GitAdapter, agent: &'a dyn AgentDelegator, config: &'a EngineConfig) -> Self {
        Self { git, agent, config }
    }

    /// Run up to `config.final_merge_max_attempts` attempts. `plan.snapshot`
    /// must be `Some`; callers only invoke this once every leaf has merged
    /// into the snapshot branch (`Plan::derive_status` reaching
    /// `awaiting-final-merge`).
    pub async fn run(&self, plan: &mut Plan) -> FinalMergeOutcome {
        let mut last_error = String::new();
        let max_attempts = self.config.final_merge_max_attempts;

        for attempt in 1..=max_attempts {
            plan.final_merge_attempts = attempt;
            match self.attempt(plan).await {
                Ok(commit) => return FinalMergeOutcome::Merged { commit },
                Err(e) => {
                    warn!(plan = %plan.id, attempt, error = %e, "final merge attempt failed");
                    last_error = e;
                }
            }
        }

        FinalMergeOutcome::Exhausted { attempts: max_attempts, last_error }
    }

    async fn attempt(&self, plan: &mut Plan) -> Result<String, String> {
        let Some(snapshot) = plan.snapshot.as_mut() else {
            return Err("plan has no snapshot to merge from".to_string());
        };

        let snapshot_manager = SnapshotManager::new(self.git);
        let rebased = snapshot_manager
            .rebase_on_target(&plan.repo_path, snapshot, &plan.target_branch)
            .await
            .map_err(|e| e.to_string())?;
        if !rebased {
            return Err(format!("rebase of {} onto {} hit conflicts", snapshot.branch, plan.target_branch));
        }

        if let Some(verify) = &plan.spec.verify_ri {
            run_verify_spec(verify, &snapshot.worktree_path, self.agent, &format!("final-merge/{}/pre", plan.id))
                .await
                .map_err(|e| format!("verify-ri against snapshot failed: {e}"))?;
        }

        let target_sha = self.git.repository.resolve_ref(&plan.repo_path, &plan.target_branch).await.map_err(|e| e.to_string())?;
        let snapshot_sha = self.git.repository.resolve_ref(&plan.repo_path, &snapshot.branch).await.map_err(|e| e.to_string())?;

        // Merge the snapshot branch's current tip, not `snapshot.base_commit`:
        // that field only tracks the commit the snapshot was last rebased
        // from, while every landed RI merge moves the branch itself forward.
        let merge_tree = self
            .git
            .merge
            .merge_without_checkout(&plan.repo_path, &snapshot_sha, &plan.target_branch)
            .await
            .map_err(|e| e.to_string())?;
        if merge_tree.has_conflicts || !merge_tree.success {
            return Err(merge_tree.error.unwrap_or_else(|| "merge-tree produced conflicts".to_string()));
        }
        let Some(tree) = merge_tree.tree_sha else {
            return Err("merge-tree produced no tree".to_string());
        };

        let message = format!("Plan {}: final merge from snapshot", plan.spec.name);
        let new_commit = self
            .git
            .merge
            .commit_tree(&plan.repo_path, &tree, &[&target_sha, &snapshot_sha], &message)
            .await
            .map_err(|e| e.to_string())?;

        self.validate_ratio(plan, &tree, &snapshot_sha, &target_sha).await?;

        self.git
            .repository
            .update_branch_ref(&plan.repo_path, &plan.target_branch, &new_commit, &plan.repo_path)
            .await
            .map_err(|e| e.to_string())?;

        if let Some(verify) = &plan.spec.verify_ri {
            run_verify_spec(verify, &plan.repo_path, self.agent, &format!("final-merge/{}/post", plan.id))
                .await
                .map_err(|e| format!("verify-ri against target failed after ref update: {e}"))?;
        }

        if self.config.push_on_merge_success
            && let Err(e) = self.git.repository.push(&plan.repo_path, "origin", &plan.target_branch).await
        {
            warn!(plan = %plan.id, branch = %plan.target_branch, %e, "push after final merge failed, continuing");
        }

        info!(plan = %plan.id, commit = %new_commit, target = %plan.target_branch, "final merge landed");
        Ok(new_commit)
    }

    async fn validate_ratio(&self, plan: &Plan, result_tree: &str, source: &str, target: &str) -> Result<(), String> {
        let result_files = self.git.merge.tree_file_count(&plan.repo_path, result_tree).await.map_err(|e| e.to_string())?;
        let source_files = self.git.merge.tree_file_count(&plan.repo_path, source).await.map_err(|e| e.to_string())?;
        let target_files = self.git.merge.tree_file_count(&plan.repo_path, target).await.map_err(|e| e.to_string())?;

        if !passes_file_count_ratio(result_files, source_files, target_files) {
            return Err(format!(
                "tree validation aborted: result has {result_files} files, source had {source_files}, target had {target_files}"
            ));
        }
        Ok(())
    }
}

/// A plan only becomes eligible for the Final Merge Executor once every
/// leaf job has successfully merged into the snapshot branch.
pub fn is_ready_for_final_merge(plan: &Plan) -> bool {
    plan.snapshot.is_some()
        && !plan.leaf_job_ids().is_empty()
        && plan
            .leaf_job_ids()
            .iter()
            .all(|id| plan.node(*id).is_some_and(|n| n.state.merged_to_target))
}
