//! Work phase: dispatches a job's `work` spec to a shell, a direct
//! process, or the agent delegator, and (for agent work) accumulates the
//! session id and usage metrics the commit phase and future retries need.

use async_trait::async_trait;
use tracing::info;

use super::process_exec::{default_cwd as process_cwd, run_process};
use super::shell::{default_cwd as shell_cwd, run_shell};
use super::{Phase, PhaseContext, PhaseExecutor, PhaseOutcome, push_log};
use crate::agent::AgentRequest;
use crate::model::WorkSpec;

pub struct WorkExecutor;

#[async_trait]
impl PhaseExecutor for WorkExecutor {
    async fn execute(&self, ctx: &mut PhaseContext<'_>) -> PhaseOutcome {
        let Some(spec) = &ctx.job.work else {
            return PhaseOutcome::ok();
        };
        dispatch(ctx, Phase::Work, spec, true).await
    }
}

/// Shared dispatch used by the work phase and (without the `is_work`
/// metrics bookkeeping) the precheck/postcheck phases. `phase` labels the
/// lines appended to `ctx.execution_log`.
pub(crate) async fn dispatch(ctx: &mut PhaseContext<'_>, phase: Phase, spec: &WorkSpec, is_work: bool) -> PhaseOutcome {
    if ctx.is_aborted() {
        return PhaseOutcome::failure("Execution canceled");
    }

    match spec {
        WorkSpec::Shell { command, shell, env, timeout, cwd } => {
            let cwd = shell_cwd(&ctx.worktree_path, cwd);
            match run_shell(shell.0, command, &cwd, env, *timeout).await {
                Ok((outcome, pid)) => {
                    if let Some(pid) = pid {
                        *ctx.active_pid.lock().await = Some(pid);
                    }
                    push_log(ctx, phase, &outcome.combined_output).await;
                    if outcome.success {
                        PhaseOutcome::ok()
                    } else {
                        let mut failure = PhaseOutcome::failure(outcome.combined_output);
                        failure.exit_code = outcome.exit_code;
                        failure
                    }
                }
                Err(e) => PhaseOutcome::failure(format!("failed to run shell command: {e}")),
            }
        }
        WorkSpec::Process { executable, args, env, timeout, cwd } => {
            let cwd = process_cwd(&ctx.worktree_path, cwd);
            match run_process(executable, args, &cwd, env, *timeout).await {
                Ok((outcome, pid)) => {
                    if let Some(pid) = pid {
                        *ctx.active_pid.lock().await = Some(pid);
                    }
                    push_log(ctx, phase, &outcome.combined_output).await;
                    if outcome.success {
                        PhaseOutcome::ok()
                    } else {
                        let mut failure = PhaseOutcome::failure(outcome.combined_output);
                        failure.exit_code = outcome.exit_code;
                        failure
                    }
                }
                Err(e) => PhaseOutcome::failure(format!("failed to run process: {e}")),
            }
        }
        WorkSpec::Agent { instructions, model, session_id, allowed_folders, allowed_urls, .. } => {
            if is_work {
                info!(node = %ctx.node_id, "dispatching agent work");
            }
            let request = AgentRequest {
                worktree_path: ctx.worktree_path.clone(),
                job_id: ctx.node_id.to_string(),
                instructions: instructions.clone(),
                session_id: session_id.clone().or_else(|| ctx.prior_session_id.clone()),
                model: model.clone(),
                config_dir: None,
                allowed_folders: allowed_folders.clone(),
                allowed_urls: allowed_urls.clone(),
                timeout: None,
            };
            match ctx.agent.run(request).await {
                Ok(response) if response.success => {
                    push_log(ctx, phase, &response.combined_output).await;
                    PhaseOutcome {
                        success: true,
                        session_id: response.session_id,
                        metrics: Some(response.metrics),
                        exit_code: response.exit_code,
                        ..Default::default()
                    }
                }
                Ok(response) => {
                    push_log(ctx, phase, &response.combined_output).await;
                    PhaseOutcome {
                        success: false,
                        error: Some(response.combined_output),
                        session_id: response.session_id,
                        metrics: Some(response.metrics),
                        exit_code: response.exit_code,
                        ..Default::default()
                    }
                }
                Err(e) => PhaseOutcome::failure(format!("agent delegation failed: {e}")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_phase_is_part_of_the_canonical_pipeline() {
        assert!(Phase::pipeline().contains(&Phase::Work));
    }
}
