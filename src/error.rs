//! Crate-level error type unifying each component's error enum.

use crate::git::GitError;
use crate::model::{NodeId, PlanId};

/// The error kinds named by the engine's domain model, independent of which
/// component raised them.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("plan validation failed: {0}")]
    ValidationFailed(#[from] crate::validation::ValidationError),

    #[error("{0}")]
    Git(#[from] GitError),

    #[error("phase {phase} failed for node {node}: {message}")]
    PhaseFailed {
        plan: PlanId,
        node: NodeId,
        phase: crate::phases::Phase,
        message: String,
        exit_code: Option<i32>,
    },

    #[error("merge conflict merging {source} into {target}: {files:?}")]
    MergeConflict {
        source: String,
        target: String,
        files: Vec<String>,
    },

    #[error(
        "tree validation aborted: result has {result_files} files, source had {source_files}, target had {target_files}"
    )]
    TreeValidationAborted {
        result_files: usize,
        source_files: usize,
        target_files: usize,
    },

    #[error("working tree for {branch} is not safe to update: {reason}")]
    WorkingTreeUnsafe { branch: String, reason: String },

    #[error("final merge exhausted after {attempts} attempts")]
    FinalMergeExhausted { plan: PlanId, attempts: u32 },

    #[error("execution of {node} in plan {plan} was canceled")]
    Canceled { plan: PlanId, node: NodeId },

    #[error("transient failure, retry may succeed: {0}")]
    Transient(String),

    #[error("plan {0} not found")]
    PlanNotFound(PlanId),

    #[error("node {0} not found in plan {1}")]
    NodeNotFound(NodeId, PlanId),

    #[error(transparent)]
    Store(#[from] crate::store::StoreError),

    #[error(transparent)]
    Agent(#[from] crate::agent::AgentError),
}

pub type EngineResult<T> = Result<T, EngineError>;
