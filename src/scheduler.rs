//! DAG Scheduler / State Machine (§4.5): turns a validated plan request into
//! a running `Plan`, derives per-node readiness from dependency outcomes,
//! enforces the parallelism cap, and drives a plan through to its final
//! merge.
//!
//! Concurrency model: [`Scheduler::claim_ready`] is the only mutating,
//! synchronous entry point that picks which nodes may start next, and it
//! enforces `max_parallel` by counting nodes already `Scheduled`/`Running`.
//! An embedder runs N workers, each looping "load plan → claim a node →
//! `run_claimed` → save plan" against the shared [`crate::store::PlanStore`];
//! `claim_ready`'s bookkeeping is what keeps two workers from running more
//! than the cap at once. [`Scheduler::tick`] is a single-worker convenience
//! that claims and runs one batch sequentially, useful for tests and small
//! embedders that don't need real concurrency.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::AgentDelegator;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::final_merge::{FinalMergeExecutor, FinalMergeOutcome, is_ready_for_final_merge};
use crate::git::GitAdapter;
use crate::job_executor::JobExecutor;
use crate::model::{NodeId, NodeStatus, Plan, PlanId, PlanStatus};
use crate::snapshot::SnapshotManager;
use crate::store::PlanStore;
use crate::validation::{self, CreatePlanRequest};

/// The result of one [`Scheduler::tick`] call.
#[derive(Debug, Clone)]
pub enum TickOutcome {
    /// Nothing runnable: paused, at capacity, or waiting on a
    /// `resumeAfterPlan` gate.
    Idle,
    /// One batch of ready nodes was started and run to completion.
    Ran { finished: Vec<(NodeId, NodeStatus)> },
    /// Every leaf has merged into the snapshot branch; final merge ran.
    FinalMerge(FinalMergeOutcome),
}

pub struct Scheduler {
    git: GitAdapter,
    agent: Arc<dyn AgentDelegator>,
    config: EngineConfig,
    job_executor: JobExecutor,
}

impl Scheduler {
    pub fn new(config: EngineConfig, agent: Arc<dyn AgentDelegator>) -> Self {
        Self {
            git: GitAdapter::cli(),
            agent: agent.clone(),
            job_executor: JobExecutor::new(GitAdapter::cli(), agent, config.clone()),
            config,
        }
    }

    fn worktree_root(&self, repo_path: &Path) -> PathBuf {
        let joined = repo_path.join(&self.config.worktree_root);
        dunce::simplified(&joined).to_path_buf()
    }

    /// Validate a `create_copilot_plan` request, resolve its base/target
    /// branches, create the plan's snapshot branch, and hand back a `Plan`
    /// in `Pending` (or `Paused`, if `startPaused`) status. Does not run any
    /// node; the caller persists the returned plan and starts calling
    /// `claim_ready`/`run_claimed` (or `tick`).
    pub async fn enqueue(&self, repo_path: PathBuf, request: CreatePlanRequest) -> EngineResult<Plan> {
        let validated = validation::validate(request)?;

        let base_branch = match validated.base_branch {
            Some(branch) => branch,
            None => self
                .git
                .branches
                .current(&repo_path)
                .await?
                .unwrap_or_else(|| "main".to_string()),
        };

        let plan_id = PlanId::new(Uuid::new_v4());
        // §4.5: a target branch is only fabricated when none was given *and*
        // the base branch is a default branch — generating a fresh branch
        // off a feature branch the user is already on would silently
        // redirect their work away from the branch they picked. In that
        // case the plan just integrates directly into `base_branch`.
        let target_branch = match validated.target_branch {
            Some(branch) => branch,
            None if self.git.branches.is_default_branch(&repo_path, &base_branch).await? => {
                format!("copilot_plan/{plan_id}")
            }
            None => base_branch.clone(),
        };

        if !self.git.branches.exists_local(&repo_path, &target_branch).await? {
            let base_commit = self.git.repository.resolve_ref(&repo_path, &base_branch).await?;
            self.git.branches.create(&repo_path, &target_branch, &base_commit).await?;
        }

        self.git
            .gitignore
            .ensure_entries(&repo_path, &[".orchestrator/", &self.config.worktree_root])
            .await?;

        let worktree_root = self.worktree_root(&repo_path);
        let snapshot = SnapshotManager::new(&self.git)
            .create(&repo_path, &worktree_root, plan_id, &target_branch)
            .await?;

        let max_parallel = validated.max_parallel.unwrap_or(self.config.default_max_parallel as u32);
        let spec = crate::model::PlanSpec {
            name: validated.name,
            max_parallel,
            base_branch: Some(base_branch.clone()),
            target_branch: Some(target_branch.clone()),
            resume_after_plan: None,
            start_paused: validated.start_paused,
            verify_ri: None,
        };

        let mut plan = Plan {
            id: plan_id,
            spec,
            repo_path,
            base_branch,
            target_branch,
            snapshot: Some(snapshot),
            paused: validated.start_paused,
            status: PlanStatus::Scaffolding,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            version: 0,
            nodes: validated.nodes,
            final_merge_attempts: 0,
        };

        recompute_readiness(&mut plan);
        plan.status = plan.derive_status();
        info!(plan = %plan.id, name = %plan.spec.name, "plan scaffolded");
        Ok(plan)
    }

    /// Pick up to `max_parallel - in_flight` `Ready` job nodes, mark them
    /// `Scheduled`, and return their ids. A no-op (empty result) while
    /// paused, waiting on `resumeAfterPlan`, or already at capacity.
    pub fn claim_ready(&self, plan: &mut Plan) -> Vec<NodeId> {
        if plan.paused {
            return Vec::new();
        }
        recompute_readiness(plan);

        let in_flight = plan
            .nodes
            .values()
            .filter(|n| n.is_job() && matches!(n.state.status, NodeStatus::Scheduled | NodeStatus::Running))
            .count() as u32;
        let capacity = plan.spec.max_parallel.saturating_sub(in_flight);
        if capacity == 0 {
            return Vec::new();
        }

        let claimed: Vec<NodeId> = plan
            .nodes
            .values()
            .filter(|n| n.is_job() && n.state.status == NodeStatus::Ready)
            .take(capacity as usize)
            .map(|n| n.id)
            .collect();

        for id in &claimed {
            if let Some(node) = plan.node_mut(*id) {
                node.state.status = NodeStatus::Scheduled;
            }
        }
        if plan.started_at.is_none() && !claimed.is_empty() {
            plan.started_at = Some(Utc::now());
        }
        claimed
    }

    /// Run one previously-claimed node's full phase pipeline to completion,
    /// recording its outcome on the plan and recomputing downstream
    /// readiness. Returns the node's terminal status.
    pub async fn run_claimed(&self, plan: &mut Plan, node_id: NodeId) -> EngineResult<NodeStatus> {
        let worktree_root = self.worktree_root(&plan.repo_path);
        let Some(node) = plan.node_mut(node_id) else {
            return Err(EngineError::NodeNotFound(node_id, plan.id));
        };
        node.state.status = NodeStatus::Running;
        node.state.attempt += 1;
        node.state.started_at = Some(Utc::now());

        let outcome = self.job_executor.execute_node(plan, node_id, &worktree_root).await;

        if let Some(node) = plan.node_mut(node_id) {
            node.state.status = outcome.status;
            node.state.ended_at = Some(Utc::now());
            node.state.failed_phase = outcome.failed_phase;
            node.state.last_error = outcome.error;
            if outcome.completed_commit.is_some() {
                node.state.completed_commit = outcome.completed_commit;
            }
            if outcome.session_id.is_some() {
                node.state.session_id = outcome.session_id;
            }
            node.state.merged_to_target = node.state.merged_to_target || outcome.merged_to_target;
        }

        recompute_readiness(plan);
        plan.status = plan.derive_status();
        plan.version += 1;

        if plan.status == PlanStatus::AwaitingFinalMerge {
            self.run_final_merge(plan).await?;
        }
        if plan.status.is_terminal() {
            plan.ended_at = Some(Utc::now());
        }

        Ok(outcome.status)
    }

    /// `resumeAfterPlan` (set via `update_copilot_plan`) holds a plan paused
    /// regardless of its own `paused` flag until the referenced plan reaches
    /// a terminal status. Clears the gate the first time it observes that,
    /// so later ticks go back to honoring `plan.paused` normally.
    async fn gate_open(&self, plan: &mut Plan, store: &dyn PlanStore) -> EngineResult<bool> {
        let Some(gate) = plan.spec.resume_after_plan else {
            return Ok(true);
        };
        match store.plan_status(gate).await {
            Ok(status) if status.is_terminal() => {
                plan.spec.resume_after_plan = None;
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(_) => Ok(false),
        }
    }

    /// Single-worker convenience: claim a batch of ready nodes and run them
    /// one at a time, returning once the batch has finished (or
    /// immediately, if nothing was runnable). `store` resolves the
    /// `resumeAfterPlan` gate; pass an [`crate::store::InMemoryPlanStore`]
    /// (or any `PlanStore`) that can look up the gate plan's status.
    pub async fn tick(&self, plan: &mut Plan, store: &dyn PlanStore) -> EngineResult<TickOutcome> {
        if plan.status.is_terminal() {
            return Ok(TickOutcome::Idle);
        }
        if !self.gate_open(plan, store).await? {
            return Ok(TickOutcome::Idle);
        }
        if is_ready_for_final_merge(plan) && plan.derive_status() == PlanStatus::AwaitingFinalMerge {
            let outcome = self.run_final_merge(plan).await?;
            return Ok(TickOutcome::FinalMerge(outcome));
        }

        let claimed = self.claim_ready(plan);
        if claimed.is_empty() {
            return Ok(TickOutcome::Idle);
        }

        let mut finished = Vec::with_capacity(claimed.len());
        for node_id in claimed {
            let status = self.run_claimed(plan, node_id).await?;
            finished.push((node_id, status));
        }
        Ok(TickOutcome::Ran { finished })
    }

    async fn run_final_merge(&self, plan: &mut Plan) -> EngineResult<FinalMergeOutcome> {
        let executor = FinalMergeExecutor::new(&self.git, self.agent.as_ref(), &self.config);
        let outcome = executor.run(plan).await;
        match &outcome {
            FinalMergeOutcome::Merged { .. } => {
                plan.status = PlanStatus::Succeeded;
                plan.ended_at = Some(Utc::now());
            }
            FinalMergeOutcome::Exhausted { attempts, last_error } => {
                warn!(plan = %plan.id, attempts, %last_error, "final merge exhausted, plan remains awaiting-final-merge");
            }
        }
        Ok(outcome)
    }

    pub fn pause(&self, plan: &mut Plan) {
        plan.paused = true;
        plan.status = PlanStatus::Paused;
    }

    pub fn resume(&self, plan: &mut Plan) {
        plan.paused = false;
        recompute_readiness(plan);
        plan.status = plan.derive_status();
    }

    /// Cancel one node's in-flight execution (if running) and mark it
    /// `Canceled`. Dependents become `Blocked` on the next readiness pass.
    pub async fn cancel_node(&self, plan: &mut Plan, node_id: NodeId) -> EngineResult<()> {
        self.job_executor.cancel(plan.id, node_id).await;
        if let Some(node) = plan.node_mut(node_id) {
            if !node.state.status.is_terminal() {
                node.state.status = NodeStatus::Canceled;
                node.state.ended_at = Some(Utc::now());
            }
        }
        recompute_readiness(plan);
        plan.status = plan.derive_status();
        Ok(())
    }

    /// Cancel every non-terminal node in the plan.
    pub async fn cancel_plan(&self, plan: &mut Plan) -> EngineResult<()> {
        let in_flight: Vec<NodeId> = plan
            .nodes
            .values()
            .filter(|n| n.is_job() && !n.state.status.is_terminal())
            .map(|n| n.id)
            .collect();
        for node_id in in_flight {
            self.cancel_node(plan, node_id).await?;
        }
        plan.paused = false;
        plan.status = PlanStatus::Canceled;
        plan.ended_at = Some(Utc::now());
        Ok(())
    }

    /// Reset a `Failed` node back to `Ready`/`Pending` for another attempt,
    /// cascading the reset to any dependent that is only `Blocked` because
    /// of this node (never to a dependent that failed or succeeded on its
    /// own). Only `Failed` nodes are retriable; `Canceled` nodes are not
    /// (a cancellation is a deliberate stop, not a recoverable fault).
    pub fn retry_node(&self, plan: &mut Plan, node_id: NodeId) -> EngineResult<()> {
        let Some(node) = plan.node(node_id) else {
            return Err(EngineError::NodeNotFound(node_id, plan.id));
        };
        if node.state.status != NodeStatus::Failed {
            return Err(EngineError::ValidationFailed(crate::validation::ValidationError::NotRetriable {
                plan: plan.id,
                node: node_id,
                status: node.state.status,
            }));
        }

        let mut to_reset = vec![node_id];
        let mut cursor = 0;
        while cursor < to_reset.len() {
            let current = to_reset[cursor];
            cursor += 1;
            let Some(node) = plan.node(current) else { continue };
            for &dependent in &node.dependents.clone() {
                if plan.node(dependent).is_some_and(|d| d.state.status == NodeStatus::Blocked) {
                    to_reset.push(dependent);
                }
            }
        }

        for id in to_reset {
            if let Some(node) = plan.node_mut(id) {
                node.state.reset_for_retry();
            }
        }
        recompute_readiness(plan);
        plan.status = plan.derive_status();
        Ok(())
    }

    /// Retry every `Failed` node in the plan (and their blocked-only
    /// dependents), e.g. after fixing an environment issue common to
    /// several jobs.
    pub fn retry_plan(&self, plan: &mut Plan) -> EngineResult<()> {
        let failed: Vec<NodeId> = plan
            .nodes
            .values()
            .filter(|n| n.is_job() && n.state.status == NodeStatus::Failed)
            .map(|n| n.id)
            .collect();
        for node_id in failed {
            self.retry_node(plan, node_id)?;
        }
        Ok(())
    }
}

/// Recompute `Pending`/`Blocked` job nodes' readiness from their
/// dependencies' current status: `Ready` once every dependency has
/// `Succeeded`, `Blocked` if any dependency `Failed` or was `Canceled`,
/// otherwise left `Pending`. Idempotent and side-effect-free on nodes whose
/// status isn't `Pending`/`Blocked`.
fn recompute_readiness(plan: &mut Plan) {
    let statuses: std::collections::HashMap<NodeId, NodeStatus> =
        plan.nodes.values().map(|n| (n.id, n.state.status)).collect();

    for node in plan.nodes.values_mut() {
        if !node.is_job() || !matches!(node.state.status, NodeStatus::Pending | NodeStatus::Blocked) {
            continue;
        }
        let mut any_failed_or_canceled = false;
        let mut all_succeeded = true;
        for dep in &node.dependencies {
            match statuses.get(dep) {
                Some(NodeStatus::Succeeded) => {}
                Some(NodeStatus::Failed) | Some(NodeStatus::Canceled) => {
                    any_failed_or_canceled = true;
                    all_succeeded = false;
                }
                _ => all_succeeded = false,
            }
        }
        node.state.status = if any_failed_or_canceled {
            NodeStatus::Blocked
        } else if all_succeeded {
            NodeStatus::Ready
        } else {
            NodeStatus::Pending
        };
    }
}
