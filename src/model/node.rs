//! DAG vertices: jobs (real work) and groups (namespace only).

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{NodeId, ProducerId};
use super::work::WorkSpec;
use crate::phases::Phase;

/// A vertex in a plan's DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub producer_id: ProducerId,
    pub display_name: String,
    pub kind: NodeKind,
    pub dependencies: Vec<NodeId>,
    pub dependents: Vec<NodeId>,
    pub state: NodeState,
}

impl Node {
    pub fn new_job(id: NodeId, producer_id: ProducerId, display_name: impl Into<String>, job: Job) -> Self {
        Self {
            id,
            producer_id,
            display_name: display_name.into(),
            kind: NodeKind::Job(job),
            dependencies: Vec::new(),
            dependents: Vec::new(),
            state: NodeState::new(),
        }
    }

    pub fn new_group(id: NodeId, producer_id: ProducerId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            producer_id,
            display_name: display_name.into(),
            kind: NodeKind::Group,
            dependencies: Vec::new(),
            dependents: Vec::new(),
            state: NodeState::new(),
        }
    }

    pub fn is_job(&self) -> bool {
        matches!(self.kind, NodeKind::Job(_))
    }

    pub fn job(&self) -> Option<&Job> {
        match &self.kind {
            NodeKind::Job(j) => Some(j),
            NodeKind::Group => None,
        }
    }

    pub fn job_mut(&mut self) -> Option<&mut Job> {
        match &mut self.kind {
            NodeKind::Job(j) => Some(j),
            NodeKind::Group => None,
        }
    }

    /// A leaf has no dependents: its reverse-integration phase lands work
    /// directly on the plan's snapshot branch.
    pub fn is_leaf(&self) -> bool {
        self.dependents.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeKind {
    Job(Job),
    /// A namespace vertex that scopes producer ids; carries no phases.
    Group,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub task: String,
    pub prechecks: Option<WorkSpec>,
    pub work: Option<WorkSpec>,
    pub postchecks: Option<WorkSpec>,
    /// If set, the commit phase will not require evidence of change: a
    /// no-op outcome is always legitimate.
    pub expects_no_changes: bool,
    /// Overrides the plan's base branch for this node's root setup (has no
    /// effect on non-root nodes, whose base is their dependency's commit).
    pub base_branch_override: Option<String>,
}

impl Job {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            prechecks: None,
            work: None,
            postchecks: None,
            expects_no_changes: false,
            base_branch_override: None,
        }
    }
}

/// Scheduler-visible lifecycle of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum NodeStatus {
    Pending,
    Blocked,
    Ready,
    Scheduled,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeStatus::Succeeded | NodeStatus::Failed | NodeStatus::Canceled)
    }
}

/// Per-phase step outcome, tracked independently so a retry can resume
/// partway through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub status: NodeStatus,
    pub steps: indexmap::IndexMap<Phase, StepStatus>,
    pub attempt: u32,
    pub base_commit: Option<String>,
    pub completed_commit: Option<String>,
    pub merged_to_target: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub failed_phase: Option<Phase>,
    pub session_id: Option<String>,
    pub worktree_path: Option<PathBuf>,
}

impl NodeState {
    pub fn new() -> Self {
        Self {
            status: NodeStatus::Pending,
            steps: Phase::pipeline().iter().map(|p| (*p, StepStatus::Pending)).collect(),
            attempt: 0,
            base_commit: None,
            completed_commit: None,
            merged_to_target: false,
            started_at: None,
            ended_at: None,
            last_error: None,
            failed_phase: None,
            session_id: None,
            worktree_path: None,
        }
    }

    /// Reset for a fresh retry attempt, keeping the attempt counter and
    /// optionally the worktree (the caller decides whether to clear it).
    pub fn reset_for_retry(&mut self) {
        self.status = NodeStatus::Ready;
        self.last_error = None;
        self.failed_phase = None;
        self.started_at = None;
        self.ended_at = None;
        for status in self.steps.values_mut() {
            *status = StepStatus::Pending;
        }
    }
}

impl Default for NodeState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn new_node_state_has_all_phases_pending() {
        let state = NodeState::new();
        assert_eq!(state.steps.len(), Phase::pipeline().len());
        assert!(state.steps.values().all(|s| *s == StepStatus::Pending));
    }

    #[test]
    fn leaf_detection_from_empty_dependents() {
        let node = Node::new_job(
            NodeId::new(Uuid::nil()),
            ProducerId("a".into()),
            "A",
            Job::new("do a"),
        );
        assert!(node.is_leaf());
    }

    #[test]
    fn reset_for_retry_clears_error_but_keeps_attempt() {
        let mut state = NodeState::new();
        state.attempt = 3;
        state.last_error = Some("boom".into());
        state.status = NodeStatus::Failed;
        state.reset_for_retry();
        assert_eq!(state.attempt, 3);
        assert_eq!(state.status, NodeStatus::Ready);
        assert!(state.last_error.is_none());
    }
}
