//! End-to-end lifecycle tests driving the real `Scheduler` against a
//! throwaway git repository. Unlike the per-module unit tests, these
//! exercise the actual `git` CLI: worktree creation, reverse-integration
//! merges, and the final merge.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use async_trait::async_trait;
use plan_engine::agent::{AgentDelegator, AgentError, AgentMetrics, AgentRequest, AgentResponse, NullAgentDelegator};
use plan_engine::config::EngineConfig;
use plan_engine::model::{NodeStatus, PlanStatus};
use plan_engine::scheduler::TickOutcome;
use plan_engine::store::{InMemoryPlanStore, PlanStore};
use plan_engine::validation::CreatePlanRequest;
use plan_engine::Scheduler;

/// A throwaway git repository with one commit on `main`, isolated from the
/// caller's real git identity/config via environment overrides.
struct TestRepo {
    dir: tempfile::TempDir,
}

impl TestRepo {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let repo = Self { dir };
        repo.git(&["init", "-b", "main"]);
        repo.git(&["config", "user.email", "test@example.com"]);
        repo.git(&["config", "user.name", "Test"]);
        std::fs::write(repo.path().join("README.md"), "hello\n").unwrap();
        repo.git(&["add", "-A"]);
        repo.git(&["commit", "-m", "initial"]);
        repo
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn git(&self, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .env("GIT_AUTHOR_DATE", "2026-01-01T00:00:00")
            .env("GIT_COMMITTER_DATE", "2026-01-01T00:00:00")
            .status()
            .expect("spawn git");
        assert!(status.success(), "git {args:?} failed");
    }

    fn file_exists(&self, branch: &str, name: &str) -> bool {
        let output = Command::new("git")
            .args(["show", &format!("{branch}:{name}")])
            .current_dir(self.path())
            .output()
            .expect("spawn git show");
        output.status.success()
    }

    fn show(&self, branch: &str, name: &str) -> String {
        let output = Command::new("git")
            .args(["show", &format!("{branch}:{name}")])
            .current_dir(self.path())
            .output()
            .expect("spawn git show");
        assert!(output.status.success(), "git show {branch}:{name} failed");
        String::from_utf8_lossy(&output.stdout).into_owned()
    }
}

fn scheduler() -> Scheduler {
    Scheduler::new(EngineConfig::default(), Arc::new(NullAgentDelegator))
}

fn scheduler_with(agent: Arc<dyn AgentDelegator>) -> Scheduler {
    Scheduler::new(EngineConfig::default(), agent)
}

/// An agent stand-in for the merge-fi/merge-ri conflict resolution paths
/// (S2). Takes the "theirs" side of every conflict marker it finds. For
/// merge-fi's conflicted working tree it also stages and commits, mirroring
/// the real merge-helper contract (§4.2.4); for reverse-integration's
/// scratch-file resolution it only needs to rewrite the file in place.
struct TheirsConflictResolver;

#[async_trait]
impl AgentDelegator for TheirsConflictResolver {
    async fn run(&self, request: AgentRequest) -> Result<AgentResponse, AgentError> {
        let is_merge_fi = request.instructions.contains("Resolve the git merge conflicts from merging");
        resolve_conflict_markers_in_dir(&request.worktree_path);

        if is_merge_fi {
            let status = Command::new("git")
                .args(["add", "-A"])
                .current_dir(&request.worktree_path)
                .status()
                .expect("spawn git add");
            assert!(status.success());
            let status = Command::new("git")
                .args(["commit", "-m", "conflict resolution"])
                .current_dir(&request.worktree_path)
                .status()
                .expect("spawn git commit");
            assert!(status.success());
        }

        Ok(AgentResponse {
            success: true,
            session_id: None,
            exit_code: Some(0),
            combined_output: "resolved conflicts, preferring theirs".to_string(),
            token_usage: None,
            metrics: AgentMetrics::default(),
        })
    }
}

fn resolve_conflict_markers_in_dir(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(&path) else { continue };
        if !content.contains("<<<<<<<") {
            continue;
        }
        std::fs::write(&path, resolve_theirs(&content)).expect("write resolved file");
    }
}

/// Keep everything outside conflict markers, plus only the "theirs" half of
/// each conflicted hunk (the content after `=======`).
fn resolve_theirs(content: &str) -> String {
    let mut result = String::new();
    let mut in_conflict = false;
    let mut take = false;
    for line in content.lines() {
        if line.starts_with("<<<<<<<") {
            in_conflict = true;
            take = false;
            continue;
        }
        if in_conflict && line.starts_with("=======") {
            take = true;
            continue;
        }
        if in_conflict && line.starts_with(">>>>>>>") {
            in_conflict = false;
            take = false;
            continue;
        }
        if in_conflict {
            if take {
                result.push_str(line);
                result.push('\n');
            }
        } else {
            result.push_str(line);
            result.push('\n');
        }
    }
    result
}

fn shell_job_request(name: &str, file: &str) -> CreatePlanRequest {
    let body = format!(
        r#"{{
            "name": "{name}",
            "jobs": [
                {{
                    "producerId": "write-file",
                    "task": "write a file",
                    "work": "touch {file} && git add -A && git commit -m work"
                }}
            ]
        }}"#
    );
    serde_json::from_str(&body).expect("valid create-plan request")
}

#[tokio::test]
async fn linear_single_job_plan_runs_to_success_and_lands_on_target() {
    let repo = TestRepo::new();
    let scheduler = scheduler();
    let store = InMemoryPlanStore::new();

    let request = shell_job_request("s1-linear-success", "output.txt");
    let mut plan = scheduler
        .enqueue(repo.path().to_path_buf(), request)
        .await
        .expect("enqueue succeeds");
    assert_eq!(plan.status, PlanStatus::Pending);
    let target_branch = plan.target_branch.clone();

    // Drive ticks until the plan reaches a terminal status or we give up.
    for _ in 0..10 {
        let outcome = scheduler.tick(&mut plan, &store).await.expect("tick succeeds");
        store.save_plan(&plan).await.unwrap();
        if plan.status.is_terminal() {
            break;
        }
        if matches!(outcome, TickOutcome::Idle) && !plan.status.is_terminal() {
            // nothing runnable and not done: avoid spinning forever on a bug
            break;
        }
    }

    assert_eq!(plan.status, PlanStatus::Succeeded, "plan should reach Succeeded");
    let node = plan.nodes.values().next().unwrap();
    assert_eq!(node.state.status, NodeStatus::Succeeded);
    assert!(node.state.merged_to_target);
    assert!(repo.file_exists(&target_branch, "output.txt"));
}

#[tokio::test]
async fn pause_holds_the_plan_even_when_work_is_ready() {
    let repo = TestRepo::new();
    let scheduler = scheduler();
    let store = InMemoryPlanStore::new();

    let request = shell_job_request("s5-pause-mid-run", "paused.txt");
    let mut plan = scheduler
        .enqueue(repo.path().to_path_buf(), request)
        .await
        .expect("enqueue succeeds");

    scheduler.pause(&mut plan);
    let outcome = scheduler.tick(&mut plan, &store).await.expect("tick succeeds");
    assert!(matches!(outcome, TickOutcome::Idle));
    assert_eq!(plan.status, PlanStatus::Paused);
    assert_eq!(plan.nodes.values().next().unwrap().state.status, NodeStatus::Ready);

    scheduler.resume(&mut plan);
    for _ in 0..10 {
        let outcome = scheduler.tick(&mut plan, &store).await.expect("tick succeeds");
        if plan.status.is_terminal() {
            break;
        }
        if matches!(outcome, TickOutcome::Idle) {
            break;
        }
    }
    assert_eq!(plan.status, PlanStatus::Succeeded);
}

/// S2 — diamond dependency graph where two siblings edit the same line of
/// the same file. The join node's forward-integration merge hits a
/// conflict, delegates to the merge helper, and lands with the "theirs"
/// resolution policy.
#[tokio::test]
async fn diamond_dependency_resolves_forward_integration_conflict() {
    let repo = TestRepo::new();
    let scheduler = scheduler_with(Arc::new(TheirsConflictResolver));
    let store = InMemoryPlanStore::new();

    let request: CreatePlanRequest = serde_json::from_str(
        r#"{
            "name": "s2-diamond-conflict",
            "jobs": [
                {
                    "producerId": "a",
                    "task": "create base file",
                    "work": "printf 'line0\nline1\nline2\n' > foo.txt && git add -A && git commit -m A"
                },
                {
                    "producerId": "b",
                    "task": "edit from b",
                    "dependencies": ["a"],
                    "work": "sed -i 's/line1/B-edit/' foo.txt && git add -A && git commit -m B"
                },
                {
                    "producerId": "c",
                    "task": "edit from c",
                    "dependencies": ["a"],
                    "work": "sed -i 's/line1/C-edit/' foo.txt && git add -A && git commit -m C"
                },
                {
                    "producerId": "d",
                    "task": "join b and c",
                    "dependencies": ["b", "c"],
                    "work": "touch d.txt && git add -A && git commit -m D"
                }
            ]
        }"#,
    )
    .expect("valid create-plan request");

    let mut plan = scheduler
        .enqueue(repo.path().to_path_buf(), request)
        .await
        .expect("enqueue succeeds");
    let target_branch = plan.target_branch.clone();

    for _ in 0..20 {
        let outcome = scheduler.tick(&mut plan, &store).await.expect("tick succeeds");
        store.save_plan(&plan).await.unwrap();
        if plan.status.is_terminal() {
            break;
        }
        if matches!(outcome, TickOutcome::Idle) && !plan.status.is_terminal() {
            break;
        }
    }

    assert_eq!(plan.status, PlanStatus::Succeeded, "diamond plan should reach Succeeded");

    let resolved = repo.show(&target_branch, "foo.txt");
    assert!(!resolved.contains("<<<<<<<"), "no conflict markers should remain: {resolved:?}");
    assert!(resolved.contains("C-edit"), "theirs policy should keep C's edit: {resolved:?}");
    assert!(repo.file_exists(&target_branch, "d.txt"));
}

/// S6 — the target branch advances (via a side effect of the first
/// verify-ri run) between two final-merge attempts. The first attempt's
/// verify-ri fails; the second attempt rebases the snapshot onto the new
/// target HEAD and lands successfully.
#[tokio::test]
async fn final_merge_retries_after_target_branch_advances_between_attempts() {
    let repo = TestRepo::new();
    let scheduler = scheduler();
    let store = InMemoryPlanStore::new();

    let request: CreatePlanRequest = serde_json::from_str(
        r#"{
            "name": "s6-final-merge-retry",
            "baseBranch": "main",
            "targetBranch": "main",
            "jobs": [
                {
                    "producerId": "leaf",
                    "task": "leaf work",
                    "work": "touch leaf-output.txt && git add -A && git commit -m leaf"
                }
            ]
        }"#,
    )
    .expect("valid create-plan request");

    let mut plan = scheduler
        .enqueue(repo.path().to_path_buf(), request)
        .await
        .expect("enqueue succeeds");

    let counter_file = repo.path().join("verify-attempt-counter");
    let repo_path = repo.path().display().to_string();
    let counter_path = counter_file.display().to_string();
    let verify_script = format!(
        "count=$(cat {counter_path} 2>/dev/null || echo 0); count=$((count + 1)); echo $count > {counter_path}; \
         if [ \"$count\" -eq 1 ]; then \
             echo advanced-by-another-actor > {repo_path}/advance.txt && \
             git -C {repo_path} add -A && git -C {repo_path} commit -m advance >/dev/null && exit 1; \
         fi; \
         exit 0"
    );
    plan.spec.verify_ri = Some(plan_engine::model::WorkSpec::from_raw(&verify_script));

    for _ in 0..10 {
        let outcome = scheduler.tick(&mut plan, &store).await.expect("tick succeeds");
        store.save_plan(&plan).await.unwrap();
        if plan.status.is_terminal() {
            break;
        }
        if matches!(outcome, TickOutcome::Idle) && !plan.status.is_terminal() {
            break;
        }
    }

    assert_eq!(plan.status, PlanStatus::Succeeded, "plan should recover on the second final-merge attempt");
    assert_eq!(plan.final_merge_attempts, 2, "verify-ri should have failed exactly once before succeeding");
    assert!(repo.file_exists("main", "leaf-output.txt"));
    assert!(repo.file_exists("main", "advance.txt"), "the concurrent advance must have landed on main");
}
