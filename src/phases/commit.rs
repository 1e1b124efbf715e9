//! Commit phase: decides whether the worktree's state represents
//! legitimate completed work and, if so, commits it.

use async_trait::async_trait;
use tracing::{info, warn};

use super::{PhaseContext, PhaseExecutor, PhaseOutcome};
use crate::agent::AgentRequest;

const EPHEMERAL_DIRS: &[&str] = &[".orchestrator/skill", ".orchestrator/agent-scratch"];

const NO_EVIDENCE_MESSAGE: &str = "\
no evidence of completed work: the job produced no uncommitted changes, no new \
commit since its base, no evidence file at .orchestrator/evidence/<nodeId>.json, \
and expectsNoChanges was not set";

pub struct CommitExecutor;

#[async_trait]
impl PhaseExecutor for CommitExecutor {
    async fn execute(&self, ctx: &mut PhaseContext<'_>) -> PhaseOutcome {
        for dir in EPHEMERAL_DIRS {
            let _ = tokio::fs::remove_dir_all(ctx.worktree_path.join(dir)).await;
        }

        let message = format!("[Plan] {}", ctx.job.task);

        match ctx.git.repository.has_uncommitted_changes(&ctx.worktree_path).await {
            Ok(true) => {
                if let Err(e) = ctx.git.repository.stage_all(&ctx.worktree_path).await {
                    return PhaseOutcome::failure(format!("failed to stage changes: {e}"));
                }
                return match ctx.git.repository.commit(&ctx.worktree_path, &message).await {
                    Ok(commit) => PhaseOutcome::ok_with_commit(commit),
                    Err(e) => PhaseOutcome::failure(format!("failed to commit: {e}")),
                };
            }
            Ok(false) => {}
            Err(e) => return PhaseOutcome::failure(format!("failed to inspect working tree: {e}")),
        }

        let head = match ctx.git.repository.get_head(&ctx.worktree_path).await {
            Ok(head) => head,
            Err(e) => return PhaseOutcome::failure(format!("failed to read HEAD: {e}")),
        };
        if Some(&head) != ctx.base_commit.as_ref() {
            // The work phase (an agent, typically) already committed directly.
            return PhaseOutcome::ok_with_commit(head);
        }

        let evidence_path = ctx
            .worktree_path
            .join(".orchestrator/evidence")
            .join(format!("{}.json", ctx.node_id));
        if evidence_path.exists() {
            if let Err(e) = ctx.git.repository.stage_all(&ctx.worktree_path).await {
                return PhaseOutcome::failure(format!("failed to stage evidence: {e}"));
            }
            let message = format!("{message} (evidence only)");
            return match ctx.git.repository.commit(&ctx.worktree_path, &message).await {
                Ok(commit) => PhaseOutcome::ok_with_commit(commit),
                Err(e) => PhaseOutcome::failure(format!("failed to commit evidence: {e}")),
            };
        }

        if ctx.job.expects_no_changes {
            info!(node = %ctx.node_id, "no changes produced, expectsNoChanges is set");
            return PhaseOutcome::ok();
        }

        match review_no_change_outcome(ctx).await {
            Some(true) => {
                info!(node = %ctx.node_id, "agent judged the no-change outcome legitimate");
                PhaseOutcome::ok()
            }
            Some(false) | None => PhaseOutcome::failure(NO_EVIDENCE_MESSAGE),
        }
    }
}

/// Ask the agent delegator whether a no-change outcome was legitimate.
/// Returns `None` if no delegator is configured or its reply can't be
/// parsed — both treated as "not legitimate" by the caller.
async fn review_no_change_outcome(ctx: &PhaseContext<'_>) -> Option<bool> {
    let log_lines = ctx.execution_log.lock().await;
    let lines: Vec<&str> = log_lines.iter().map(String::as_str).collect();
    let logs = truncated_log_tail(&lines, 150);
    let prompt = format!(
        "The job \"{}\" produced no file changes and no evidence file. \
Here is its recent execution log:\n\n{logs}\n\n\
Was this a legitimate no-op (e.g. the requested change was already present, \
or the task was purely investigative)? Reply with exactly one line of JSON: \
{{\"legitimate\": true|false, \"reason\": \"...\"}}",
        ctx.job.task
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
        timeout: Some(std::time::Duration::from_secs(120)),
    };

    let response = ctx.agent.run(request).await.ok()?;
    parse_legitimacy_verdict(&response.combined_output)
}

#[derive(serde::Deserialize)]
struct LegitimacyVerdict {
    legitimate: bool,
    #[allow(dead_code)]
    reason: Option<String>,
}

/// Parse the last JSON-shaped line in the agent's combined output; fall
/// back to attempting to parse the entire combined output if no single
/// line parses.
fn parse_legitimacy_verdict(combined_output: &str) -> Option<bool> {
    for line in combined_output.lines().rev() {
        let trimmed = line.trim();
        if trimmed.starts_with('{')
            && let Ok(verdict) = serde_json::from_str::<LegitimacyVerdict>(trimmed)
        {
            return Some(verdict.legitimate);
        }
    }
    serde_json::from_str::<LegitimacyVerdict>(combined_output.trim())
        .ok()
        .map(|v| v.legitimate)
}

fn truncated_log_tail(lines: &[&str], max_lines: usize) -> String {
    if lines.len() <= max_lines {
        return lines.join("\n");
    }
    let dropped = lines.len() - max_lines;
    let tail = &lines[dropped..];
    format!("[{dropped} earlier lines omitted]\n{}", tail.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_verdict_from_last_json_line() {
        let output = "some chatter\nmore chatter\n{\"legitimate\": true, \"reason\": \"already fixed\"}";
        assert_eq!(parse_legitimacy_verdict(output), Some(true));
    }

    #[test]
    fn parses_verdict_when_output_is_only_json() {
        let output = "{\"legitimate\": false, \"reason\": \"nothing happened\"}";
        assert_eq!(parse_legitimacy_verdict(output), Some(false));
    }

    #[test]
    fn unparsable_output_yields_none() {
        let output = "the agent got confused and said nothing useful";
        assert_eq!(parse_legitimacy_verdict(output), None);
    }

    #[test]
    fn log_tail_untruncated_when_short() {
        let lines = vec!["a", "b"];
        assert_eq!(truncated_log_tail(&lines, 150), "a\nb");
    }

    #[test]
    fn log_tail_prefixes_count_when_truncated() {
        let lines: Vec<&str> = (0..200).map(|_| "x").collect();
        let tail = truncated_log_tail(&lines, 150);
        assert!(tail.starts_with("[50 earlier lines omitted]"));
        assert_eq!(tail.lines().count(), 151);
    }
}
