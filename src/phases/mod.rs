//! Phase Executors: six (plus setup) independent stages that together move
//! a job from "ready" to "merged", each independently retryable.

mod commit;
mod merge_fi;
mod merge_ri;
mod precheck;
mod process_exec;
mod setup;
mod shell;
mod work;

pub use commit::CommitExecutor;
pub use merge_fi::MergeFiExecutor;
pub use merge_ri::MergeRiExecutor;
pub use precheck::{PostcheckExecutor, PrecheckExecutor};
pub use setup::SetupExecutor;
pub use work::WorkExecutor;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::agent::{AgentDelegator, AgentMetrics};
use crate::config::EngineConfig;
use crate::git::GitAdapter;
use crate::model::{Job, NodeId, PlanId, WorkSpec};

/// The ordered pipeline a job moves through. `Setup` is an engine-internal
/// step (see `SPEC_FULL.md` §4.4.1); `MergeFi` only runs for multi-dependency
/// nodes and `MergeRi` only for leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Phase {
    Setup,
    Precheck,
    Work,
    Postcheck,
    Commit,
    MergeFi,
    MergeRi,
}

impl Phase {
    pub fn pipeline() -> &'static [Phase] {
        &[
            Phase::Setup,
            Phase::Precheck,
            Phase::Work,
            Phase::Postcheck,
            Phase::Commit,
            Phase::MergeFi,
            Phase::MergeRi,
        ]
    }
}

/// Everything a phase executor needs to run once. Built fresh per attempt
/// by the Job Executor.
pub struct PhaseContext<'a> {
    pub git: &'a GitAdapter,
    pub agent: &'a dyn AgentDelegator,
    pub config: &'a EngineConfig,
    pub plan_id: PlanId,
    pub node_id: NodeId,
    pub job: &'a Job,
    pub worktree_path: PathBuf,
    pub repo_path: PathBuf,
    pub main_worktree_path: PathBuf,
    pub base_commit: Option<String>,
    pub dependency_commits: Vec<String>,
    /// For a root node's setup phase, the base a worktree with no
    /// dependencies and no `base_branch_override` starts from: the plan's
    /// base branch, never the merge target.
    pub plan_base_branch: String,
    /// The branch reverse-integration merges into: the plan's snapshot
    /// branch for leaf nodes (never the real target branch directly).
    pub target_branch: String,
    pub prior_session_id: Option<String>,
    /// Flipped by `cancel(planId, nodeId)`; phase executors check this
    /// between suspension points and before starting a child process.
    pub aborted: Arc<AtomicBool>,
    /// The currently live child process PID, if any, so cancellation can
    /// find it. Cleared when the phase's process exits.
    pub active_pid: Arc<Mutex<Option<u32>>>,
    /// Output lines from the precheck/work/postcheck phases, in execution
    /// order, so the commit phase's AI no-change review can show the agent
    /// what actually ran without re-reading process output itself.
    pub execution_log: Arc<Mutex<Vec<String>>>,
}

/// Append a phase's output to `ctx.execution_log`, prefixed with the
/// phase name so the no-change review prompt reads as a transcript.
pub(crate) async fn push_log(ctx: &PhaseContext<'_>, phase: Phase, text: &str) {
    if text.is_empty() {
        return;
    }
    let mut log = ctx.execution_log.lock().await;
    for line in text.lines() {
        log.push(format!("[{phase}] {line}"));
    }
}

impl PhaseContext<'_> {
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub commit: Option<String>,
    pub session_id: Option<String>,
    pub metrics: Option<AgentMetrics>,
    /// Lets a phase redirect the pipeline to re-enter at an earlier phase
    /// on the next scheduler auto-heal pass instead of simply failing.
    pub override_resume_from_phase: Option<Phase>,
    pub no_auto_heal: bool,
}

impl PhaseOutcome {
    pub fn ok() -> Self {
        Self { success: true, ..Default::default() }
    }

    pub fn ok_with_commit(commit: impl Into<String>) -> Self {
        Self { success: true, commit: Some(commit.into()), ..Default::default() }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self { success: false, error: Some(message.into()), ..Default::default() }
    }
}

#[async_trait]
pub trait PhaseExecutor {
    async fn execute(&self, ctx: &mut PhaseContext<'_>) -> PhaseOutcome;
}

/// Normalize a job's work spec into something runnable: an explicit spec if
/// present, or `Ok(None)` to signal "no-op, succeeds immediately".
pub(crate) fn normalize(spec: &Option<WorkSpec>) -> Option<&WorkSpec> {
    spec.as_ref()
}

/// Kill a tracked child process by pid, platform-appropriately. Exposed for
/// the Job Executor's `cancel(plan, node)` to act on the active-execution
/// registry without reaching into the private `process_exec` submodule.
pub async fn kill_active_process(pid: u32) {
    process_exec::kill_process(pid).await;
}

/// Run a [`WorkSpec`] against `cwd` outside the job pipeline, for the
/// verify-ri hook the Final Merge Executor runs against the snapshot and
/// target branches. Returns `Err` with the combined output/failure reason
/// on a non-zero exit or unsuccessful agent response.
pub async fn run_verify_spec(spec: &WorkSpec, cwd: &std::path::Path, agent: &dyn AgentDelegator, job_id: &str) -> Result<(), String> {
    match spec {
        WorkSpec::Shell { command, shell, env, timeout, cwd: cwd_override } => {
            let resolved_cwd = shell::default_cwd(cwd, cwd_override);
            let (outcome, _) = shell::run_shell(shell.0, command, &resolved_cwd, env, *timeout).await.map_err(|e| e.to_string())?;
            if outcome.success { Ok(()) } else { Err(outcome.combined_output) }
        }
        WorkSpec::Process { executable, args, env, timeout, cwd: cwd_override } => {
            let resolved_cwd = process_exec::default_cwd(cwd, cwd_override);
            let (outcome, _) = process_exec::run_process(executable, args, &resolved_cwd, env, *timeout).await.map_err(|e| e.to_string())?;
            if outcome.success { Ok(()) } else { Err(outcome.combined_output) }
        }
        WorkSpec::Agent { instructions, model, session_id, allowed_folders, allowed_urls, .. } => {
            let request = crate::agent::AgentRequest {
                worktree_path: cwd.to_path_buf(),
                job_id: job_id.to_string(),
                instructions: instructions.clone(),
                session_id: session_id.clone(),
                model: model.clone(),
                config_dir: None,
                allowed_folders: allowed_folders.clone(),
                allowed_urls: allowed_urls.clone(),
                timeout: None,
            };
            let response = agent.run(request).await.map_err(|e| e.to_string())?;
            if response.success { Ok(()) } else { Err(response.combined_output) }
        }
    }
}
