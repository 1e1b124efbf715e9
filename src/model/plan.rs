//! The Plan: a named DAG of nodes plus its lifecycle state.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::ids::{NodeId, PlanId};
use super::node::{Node, NodeStatus};
use super::work::WorkSpec;
use crate::snapshot::Snapshot;

/// User-supplied configuration for a new plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSpec {
    pub name: String,
    pub max_parallel: u32,
    pub base_branch: Option<String>,
    pub target_branch: Option<String>,
    /// Hold the plan paused until the referenced plan reaches a terminal
    /// status. See `update_copilot_plan`'s `resumeAfterPlan`.
    pub resume_after_plan: Option<PlanId>,
    pub start_paused: bool,
    /// Run after each final-merge attempt's `mergeWithoutCheckout`, once
    /// against the snapshot branch and once (on success) against the real
    /// target branch. A non-zero exit fails that attempt.
    pub verify_ri: Option<WorkSpec>,
}

impl Default for PlanSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            max_parallel: 4,
            base_branch: None,
            target_branch: None,
            resume_after_plan: None,
            start_paused: false,
            verify_ri: None,
        }
    }
}

/// Plan-level lifecycle status, derived from the aggregate of its nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum PlanStatus {
    Scaffolding,
    Pending,
    Running,
    Paused,
    AwaitingFinalMerge,
    Succeeded,
    Partial,
    Failed,
    Canceled,
}

impl PlanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PlanStatus::Succeeded | PlanStatus::Partial | PlanStatus::Failed | PlanStatus::Canceled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub spec: PlanSpec,
    pub repo_path: std::path::PathBuf,
    pub base_branch: String,
    pub target_branch: String,
    pub snapshot: Option<Snapshot>,
    pub paused: bool,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Monotonic version bumped on every mutation, exposed so callers can
    /// detect a stale read without relying on wall-clock timestamps.
    pub version: u64,
    pub nodes: IndexMap<NodeId, Node>,
    pub final_merge_attempts: u32,
}

impl Plan {
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    pub fn find_by_producer_id(&self, producer_id: &str) -> Option<&Node> {
        self.nodes.values().find(|n| n.producer_id.0 == producer_id)
    }

    /// Leaf job nodes: no dependents, real work (not a namespace group).
    pub fn leaf_job_ids(&self) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.is_job() && n.is_leaf())
            .map(|n| n.id)
            .collect()
    }

    /// Derive plan-level status from the current node states. Does not
    /// mutate `self.status`; callers apply the result explicitly.
    pub fn derive_status(&self) -> PlanStatus {
        if self.paused {
            return PlanStatus::Paused;
        }
        let jobs: Vec<_> = self.nodes.values().filter(|n| n.is_job()).collect();
        if jobs.is_empty() {
            return PlanStatus::Pending;
        }
        let any_running = jobs
            .iter()
            .any(|n| matches!(n.state.status, NodeStatus::Running | NodeStatus::Scheduled));
        if any_running {
            return PlanStatus::Running;
        }
        let all_succeeded = jobs.iter().all(|n| n.state.status == NodeStatus::Succeeded);
        if all_succeeded {
            // Every leaf job's own pipeline run already performed its
            // reverse-integration merge into the snapshot branch (a leaf
            // can't reach `Succeeded` without it), so this is always true
            // here; it's checked explicitly so a future deferred-RI job
            // still routes through this gate correctly. Landing the
            // snapshot on the real target branch is the Final Merge
            // Executor's job, triggered by this status — `derive_status`
            // itself never reports `Succeeded`.
            let all_leaves_merged = self
                .nodes
                .values()
                .filter(|n| n.is_job() && n.is_leaf())
                .all(|n| n.state.merged_to_target);
            return if all_leaves_merged { PlanStatus::AwaitingFinalMerge } else { PlanStatus::Running };
        }
        let any_failed = jobs.iter().any(|n| n.state.status == NodeStatus::Failed);
        let any_pending_or_ready = jobs
            .iter()
            .any(|n| matches!(n.state.status, NodeStatus::Pending | NodeStatus::Ready | NodeStatus::Blocked));
        if any_failed && !any_pending_or_ready {
            let any_succeeded = jobs.iter().any(|n| n.state.status == NodeStatus::Succeeded);
            return if any_succeeded { PlanStatus::Partial } else { PlanStatus::Failed };
        }
        if any_failed {
            return PlanStatus::Partial;
        }
        PlanStatus::Pending
    }
}
