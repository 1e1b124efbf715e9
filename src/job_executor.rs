//! Job Executor: drives a single node through its phase pipeline, and owns
//! the process-wide registry of in-flight executions that `cancel(plan,
//! node)` acts on.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::agent::AgentDelegator;
use crate::config::EngineConfig;
use crate::git::GitAdapter;
use crate::model::{NodeId, NodeStatus, Phase, Plan, PlanId, StepStatus};
use crate::phases::{
    CommitExecutor, MergeFiExecutor, MergeRiExecutor, PhaseContext, PhaseExecutor, PhaseOutcome, PostcheckExecutor,
    PrecheckExecutor, SetupExecutor, WorkExecutor,
};

/// A single in-flight node execution's cancellation handle.
struct ExecutionHandle {
    aborted: Arc<AtomicBool>,
    active_pid: Arc<Mutex<Option<u32>>>,
}

/// The outcome of driving one node through its full pipeline once.
pub struct JobOutcome {
    pub status: NodeStatus,
    pub failed_phase: Option<Phase>,
    pub error: Option<String>,
    pub completed_commit: Option<String>,
    pub session_id: Option<String>,
    pub merged_to_target: bool,
}

pub struct JobExecutor {
    git: GitAdapter,
    agent: Arc<dyn AgentDelegator>,
    config: EngineConfig,
    registry: DashMap<(PlanId, NodeId), ExecutionHandle>,
}

impl JobExecutor {
    pub fn new(git: GitAdapter, agent: Arc<dyn AgentDelegator>, config: EngineConfig) -> Self {
        Self { git, agent, config, registry: DashMap::new() }
    }

    /// Mark `(plan, node)`'s execution as canceled and, if a child process is
    /// currently attached, kill it. A no-op if the node isn't in flight.
    pub async fn cancel(&self, plan: PlanId, node: NodeId) -> bool {
        let Some(handle) = self.registry.get(&(plan, node)) else {
            return false;
        };
        handle.aborted.store(true, Ordering::SeqCst);
        if let Some(pid) = *handle.active_pid.lock().await {
            crate::phases::kill_active_process(pid).await;
        }
        true
    }

    /// Drive `node_id` through setup → precheck → work → postcheck → commit
    /// → merge-fi (multi-dependency nodes only) → merge-ri (leaves only).
    /// Each phase's `StepStatus` is recorded on the node before the next
    /// phase starts, so a retry can resume from the failed phase forward.
    pub async fn execute_node(&self, plan: &mut Plan, node_id: NodeId, worktree_root: &Path) -> JobOutcome {
        let plan_id = plan.id;
        let plan_base_branch = plan.base_branch.clone();
        let repo_path = plan.repo_path.clone();
        let target_branch = plan
            .snapshot
            .as_ref()
            .map(|s| s.branch.clone())
            .unwrap_or_else(|| plan.target_branch.clone());
        let main_worktree_path = repo_path.clone();

        let Some(node) = plan.node(node_id) else {
            return JobOutcome {
                status: NodeStatus::Failed,
                failed_phase: None,
                error: Some("node not found".to_string()),
                completed_commit: None,
                session_id: None,
                merged_to_target: false,
            };
        };
        let Some(job) = node.job().cloned() else {
            return JobOutcome {
                status: NodeStatus::Succeeded,
                failed_phase: None,
                error: None,
                completed_commit: None,
                session_id: None,
                merged_to_target: false,
            };
        };
        let is_leaf = node.is_leaf();
        let base_commit = node.state.base_commit.clone();
        let prior_session_id = node.state.session_id.clone();
        let dependency_commits: Vec<String> = node
            .dependencies
            .iter()
            .filter_map(|dep| plan.node(*dep).and_then(|n| n.state.completed_commit.clone()))
            .collect();

        let handle = ExecutionHandle { aborted: Arc::new(AtomicBool::new(false)), active_pid: Arc::new(Mutex::new(None)) };
        let aborted = handle.aborted.clone();
        let active_pid = handle.active_pid.clone();
        let execution_log = Arc::new(Mutex::new(Vec::new()));
        self.registry.insert((plan_id, node_id), handle);

        let worktree_path = worktree_path_for(worktree_root, node_id);
        let job_base_override = job.base_branch_override.clone().unwrap_or(plan_base_branch);

        let mut ctx = PhaseContext {
            git: &self.git,
            agent: self.agent.as_ref(),
            config: &self.config,
            plan_id,
            node_id,
            job: &job,
            worktree_path,
            repo_path,
            main_worktree_path,
            base_commit,
            dependency_commits,
            plan_base_branch: job_base_override,
            target_branch,
            prior_session_id,
            aborted,
            active_pid,
            execution_log,
        };

        let outcome = self.run_pipeline(plan, node_id, &mut ctx, is_leaf).await;
        self.registry.remove(&(plan_id, node_id));
        outcome
    }

    async fn run_pipeline(&self, plan: &mut Plan, node_id: NodeId, ctx: &mut PhaseContext<'_>, is_leaf: bool) -> JobOutcome {
        let base_commit_at_start = ctx.base_commit.clone();
        let mut completed_commit = None;
        let mut session_id = None;

        let steps: &[(Phase, &dyn PhaseExecutor)] = &[
            (Phase::Setup, &SetupExecutor),
            (Phase::Precheck, &PrecheckExecutor),
            (Phase::Work, &WorkExecutor),
            (Phase::Postcheck, &PostcheckExecutor),
            (Phase::Commit, &CommitExecutor),
        ];

        for (phase, executor) in steps {
            set_step_status(plan, node_id, *phase, StepStatus::Running);
            let result = executor.execute(ctx).await;
            if let Some(commit) = &result.commit {
                ctx.base_commit = Some(commit.clone());
                completed_commit = Some(commit.clone());
            }
            if result.session_id.is_some() {
                session_id = result.session_id.clone();
            }
            if !result.success {
                set_step_status(plan, node_id, *phase, StepStatus::Failed);
                return failure_outcome(*phase, result, completed_commit, session_id);
            }
            set_step_status(plan, node_id, *phase, StepStatus::Succeeded);
        }

        let needs_merge_fi = ctx.dependency_commits.len() >= 2;
        if needs_merge_fi {
            set_step_status(plan, node_id, Phase::MergeFi, StepStatus::Running);
            let result = MergeFiExecutor.execute(ctx).await;
            if !result.success {
                set_step_status(plan, node_id, Phase::MergeFi, StepStatus::Failed);
                return failure_outcome(Phase::MergeFi, result, completed_commit, session_id);
            }
            set_step_status(plan, node_id, Phase::MergeFi, StepStatus::Succeeded);
        } else {
            set_step_status(plan, node_id, Phase::MergeFi, StepStatus::Skipped);
        }

        let mut merged_to_target = false;
        if is_leaf {
            set_step_status(plan, node_id, Phase::MergeRi, StepStatus::Running);
            let base = base_commit_at_start.as_deref().unwrap_or_default();
            let result = MergeRiExecutor.execute_with_commit(ctx, base, completed_commit.as_deref()).await;
            if !result.success {
                set_step_status(plan, node_id, Phase::MergeRi, StepStatus::Failed);
                return failure_outcome(Phase::MergeRi, result, completed_commit, session_id);
            }
            set_step_status(plan, node_id, Phase::MergeRi, StepStatus::Succeeded);
            merged_to_target = true;
        } else {
            set_step_status(plan, node_id, Phase::MergeRi, StepStatus::Skipped);
        }

        info!(node = %node_id, "node pipeline completed");
        JobOutcome {
            status: NodeStatus::Succeeded,
            failed_phase: None,
            error: None,
            completed_commit,
            session_id,
            merged_to_target,
        }
    }
}

fn worktree_path_for(worktree_root: &Path, node_id: NodeId) -> PathBuf {
    worktree_root.join(node_id.to_string())
}

fn set_step_status(plan: &mut Plan, node_id: NodeId, phase: Phase, status: StepStatus) {
    if let Some(node) = plan.node_mut(node_id) {
        node.state.steps.insert(phase, status);
    }
}

fn failure_outcome(phase: Phase, result: PhaseOutcome, completed_commit: Option<String>, session_id: Option<String>) -> JobOutcome {
    if result.error.as_deref() == Some("Execution canceled") {
        warn!(%phase, "node execution canceled");
        return JobOutcome {
            status: NodeStatus::Canceled,
            failed_phase: Some(phase),
            error: result.error,
            completed_commit,
            session_id,
            merged_to_target: false,
        };
    }
    JobOutcome {
        status: NodeStatus::Failed,
        failed_phase: Some(phase),
        error: result.error,
        completed_commit,
        session_id,
        merged_to_target: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Node, PlanSpec, PlanStatus, ProducerId};
    use chrono::Utc;
    use indexmap::IndexMap;
    use uuid::Uuid;

    fn empty_plan() -> Plan {
        Plan {
            id: PlanId::new(Uuid::nil()),
            spec: PlanSpec::default(),
            repo_path: "/tmp/repo".into(),
            base_branch: "main".into(),
            target_branch: "copilot_plan/test".into(),
            snapshot: None,
            paused: false,
            status: PlanStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            version: 0,
            nodes: IndexMap::new(),
            final_merge_attempts: 0,
        }
    }

    #[test]
    fn worktree_path_is_namespaced_by_node_id() {
        let root = Path::new("/repo/.orchestrator/worktrees");
        let node_id = NodeId::new(Uuid::nil());
        let path = worktree_path_for(root, node_id);
        assert_eq!(path, root.join(node_id.to_string()));
    }

    #[test]
    fn set_step_status_is_a_no_op_for_a_missing_node() {
        let mut plan = empty_plan();
        set_step_status(&mut plan, NodeId::new(Uuid::new_v4()), Phase::Work, StepStatus::Running);
    }

    #[test]
    fn group_node_has_no_job_to_run() {
        let node = Node::new_group(NodeId::new(Uuid::nil()), ProducerId("g".into()), "G");
        assert!(node.job().is_none());
    }
}
