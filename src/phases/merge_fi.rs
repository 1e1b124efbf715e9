//! Forward integration: merges the remaining dependency commits into a
//! multi-dependency job's own worktree before its work phase ran (the
//! worktree was created at the *first* dependency's commit in the setup
//! phase; this phase brings in the rest).

use async_trait::async_trait;
use tracing::{info, warn};

use super::{PhaseContext, PhaseExecutor, PhaseOutcome};
use crate::agent::AgentRequest;
use crate::git::{MergeOptions, is_diff_only_orchestrator_changes};

const MERGE_HELPER_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(600);

pub struct MergeFiExecutor;

#[async_trait]
impl PhaseExecutor for MergeFiExecutor {
    async fn execute(&self, ctx: &mut PhaseContext<'_>) -> PhaseOutcome {
        if ctx.dependency_commits.len() < 2 {
            return PhaseOutcome::ok();
        }

        for commit in ctx.dependency_commits[1..].to_vec() {
            if ctx.is_aborted() {
                return PhaseOutcome::failure("Execution canceled");
            }

            let outcome = ctx
                .git
                .merge
                .merge(
                    &ctx.worktree_path,
                    &commit,
                    MergeOptions { source: &commit, no_commit: false, message: Some(&format!("merge {commit}")), fast_forward: true },
                )
                .await;

            let outcome = match outcome {
                Ok(o) => o,
                Err(e) => return PhaseOutcome::failure(format!("merge-fi failed: {e}")),
            };

            if outcome.success {
                continue;
            }

            if outcome.has_conflicts {
                if let Err(e) = run_merge_helper(ctx, &commit, &outcome.conflict_files).await {
                    let _ = ctx.git.merge.abort(&ctx.worktree_path).await;
                    return PhaseOutcome::failure(format!("merge-fi conflict resolution failed: {e}"));
                }
                continue;
            }

            let stderr = outcome.error.unwrap_or_default();
            if stderr.to_lowercase().contains("local changes") || stderr.to_lowercase().contains("would be overwritten") {
                match recover_via_stash(ctx, &commit).await {
                    Ok(()) => continue,
                    Err(e) => return PhaseOutcome::failure(format!("merge-fi stash recovery failed: {e}")),
                }
            }

            return PhaseOutcome::failure(format!("merge-fi failed merging {commit}: {stderr}"));
        }

        PhaseOutcome::ok()
    }
}

async fn run_merge_helper(ctx: &PhaseContext<'_>, source: &str, conflict_files: &[String]) -> Result<(), String> {
    let policy = ctx.config.merge_conflict_policy;
    let prompt = format!(
        "Resolve the git merge conflicts from merging {source} into this worktree's current branch. \
Conflicted files: {conflict_files:?} (or run `git diff --name-only --diff-filter=U` to confirm). \
Preference policy: prefer '{policy}' when a conflict cannot be reconciled structurally. \
Remove all conflict markers, preserve non-conflicting changes from both sides, stage the result, \
and commit with the message \"merge {source}\". Do not refactor unrelated code and do not run tests.",
    );

    let request = AgentRequest {
        worktree_path: ctx.worktree_path.clone(),
        job_id: ctx.node_id.to_string(),
        instructions: prompt,
        session_id: None,
        model: None,
        config_dir: None,
        allowed_folders: Vec::new(),
        allowed_urls: Vec::new(),
        timeout: Some(MERGE_HELPER_TIMEOUT),
    };

    let response = ctx.agent.run(request).await.map_err(|e| e.to_string())?;
    if !response.success {
        return Err(response.combined_output);
    }
    Ok(())
}

/// Recovery for the "local changes would be overwritten" failure: stash,
/// retry, and if the pop itself conflicts, delegate to the merge helper
/// using the stash as the conflict source.
async fn recover_via_stash(ctx: &PhaseContext<'_>, commit: &str) -> Result<(), String> {
    let stashed = ctx.git.repository.stash_push(&ctx.worktree_path, true).await.map_err(|e| e.to_string())?;
    if !stashed {
        return Err("merge reported dirty tree but stash found nothing to save".to_string());
    }

    let outcome = ctx
        .git
        .merge
        .merge(
            &ctx.worktree_path,
            commit,
            MergeOptions { source: commit, no_commit: false, message: Some(&format!("merge {commit}")), fast_forward: true },
        )
        .await
        .map_err(|e| e.to_string())?;

    if !outcome.success && outcome.has_conflicts {
        run_merge_helper(ctx, commit, &outcome.conflict_files).await?;
    } else if !outcome.success {
        return Err(outcome.error.unwrap_or_default());
    }

    let popped = ctx.git.repository.stash_pop(&ctx.worktree_path).await.map_err(|e| e.to_string())?;
    if popped {
        return Ok(());
    }

    // Pop itself conflicted.
    let conflicts = ctx.git.merge.list_conflicts(&ctx.worktree_path).await.map_err(|e| e.to_string())?;
    match run_merge_helper(ctx, "stash@{0}", &conflicts).await {
        Ok(()) => {
            ctx.git.repository.stage_all(&ctx.worktree_path).await.map_err(|e| e.to_string())?;
            ctx.git.repository.stash_drop(&ctx.worktree_path).await.map_err(|e| e.to_string())?;
            Ok(())
        }
        Err(helper_err) => {
            let patch = ctx
                .git
                .repository
                .stash_show_patch(&ctx.worktree_path, "stash@{0}")
                .await
                .unwrap_or_default();
            if is_diff_only_orchestrator_changes(&patch, &[".orchestrator/"]) {
                info!(node = %ctx.node_id, "dropping stash: only orchestrator-managed paths remained conflicted");
            } else {
                warn!(node = %ctx.node_id, %helper_err, "dropping stash after failed pop: worktree-merged content is authoritative");
            }
            ctx.git.repository.stash_drop(&ctx.worktree_path).await.map_err(|e| e.to_string())?;
            Ok(())
        }
    }
}
