//! Property-level tests for the Git Adapter's working-tree safety rule
//! (§4.2.5, `update_branch_ref`) and the reverse-integration file-count
//! ratio guard, run against throwaway real git repositories.

use std::path::Path;
use std::process::Command;

use plan_engine::git::GitAdapter;

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

    fn write(&self, name: &str, content: &str) {
        std::fs::write(self.path().join(name), content).unwrap();
    }

    fn head(&self) -> String {
        String::from_utf8(
            Command::new("git")
                .args(["rev-parse", "HEAD"])
                .current_dir(self.path())
                .output()
                .unwrap()
                .stdout,
        )
        .unwrap()
        .trim()
        .to_string()
    }

    fn read(&self, name: &str) -> String {
        std::fs::read_to_string(self.path().join(name)).unwrap()
    }
}

fn adapter() -> GitAdapter {
    GitAdapter::cli()
}

/// S4 — a dirty `main` checkout keeps its uncommitted edit untouched after
/// `update_branch_ref` moves `main` to a commit that itself changed other
/// files (universal property 5, §8).
#[tokio::test]
async fn update_branch_ref_preserves_pre_existing_dirty_file_on_checked_out_branch() {
    let repo = TestRepo::new();
    repo.write("Cargo.lock", "locked-v1\n");
    repo.write("tracked.txt", "original\n");
    repo.git(&["add", "-A"]);
    repo.git(&["commit", "-m", "initial"]);

    // Plan-produced commit, built off the same base, that changes a
    // different file than the one the user is about to dirty.
    let git = adapter();
    let base = repo.head();
    repo.git(&["checkout", "-b", "scratch"]);
    repo.write("plan-output.txt", "plan wrote this\n");
    repo.git(&["add", "-A"]);
    repo.git(&["commit", "-m", "plan work"]);
    let plan_commit = repo.head();
    repo.git(&["checkout", "main"]);
    assert_eq!(repo.head(), base);

    // User dirties a tracked file on `main` before the ref move.
    repo.write("Cargo.lock", "locked-v2-user-edit\n");

    git.repository
        .update_branch_ref(repo.path(), "main", &plan_commit, repo.path())
        .await
        .expect("update_branch_ref succeeds");

    assert_eq!(repo.read("Cargo.lock"), "locked-v2-user-edit\n", "pre-existing dirty file must survive untouched");
    assert_eq!(repo.read("plan-output.txt"), "plan wrote this\n", "plan-introduced file must become visible");
    assert_eq!(repo.read("tracked.txt"), "original\n");
}

/// A clean `main` checkout gets a plain hard reset: both tree and index
/// realign to the new commit.
#[tokio::test]
async fn update_branch_ref_hard_resets_a_clean_checked_out_branch() {
    let repo = TestRepo::new();
    repo.write("tracked.txt", "original\n");
    repo.git(&["add", "-A"]);
    repo.git(&["commit", "-m", "initial"]);

    let git = adapter();
    repo.git(&["checkout", "-b", "scratch"]);
    repo.write("tracked.txt", "updated-by-plan\n");
    repo.git(&["add", "-A"]);
    repo.git(&["commit", "-m", "plan work"]);
    let plan_commit = repo.head();
    repo.git(&["checkout", "main"]);

    git.repository
        .update_branch_ref(repo.path(), "main", &plan_commit, repo.path())
        .await
        .expect("update_branch_ref succeeds");

    assert_eq!(repo.read("tracked.txt"), "updated-by-plan\n");
    assert_eq!(repo.head(), plan_commit);
}

/// A branch the user is *not* currently on never has its working tree
/// touched, regardless of dirtiness elsewhere.
#[tokio::test]
async fn update_branch_ref_leaves_working_tree_alone_when_branch_not_checked_out() {
    let repo = TestRepo::new();
    repo.write("tracked.txt", "original\n");
    repo.git(&["add", "-A"]);
    repo.git(&["commit", "-m", "initial"]);
    repo.git(&["checkout", "-b", "other"]);
    repo.write("tracked.txt", "on another branch\n");
    repo.git(&["add", "-A"]);
    repo.git(&["commit", "-m", "other branch commit"]);
    repo.git(&["checkout", "main"]);

    let git = adapter();
    let main_head = repo.head();
    repo.write("tracked.txt", "user dirtied main\n");

    git.repository
        .update_branch_ref(repo.path(), "other", &main_head, repo.path())
        .await
        .expect("update_branch_ref succeeds");

    // Working tree is still on `main`, untouched.
    assert_eq!(repo.read("tracked.txt"), "user dirtied main\n");
}

/// S3 — `passes_file_count_ratio` is the guard the reverse-integration and
/// final-merge phases consult before moving any ref; confirm it against a
/// realistic large-tree shrink, independent of any particular merge.
#[tokio::test]
async fn file_count_ratio_guard_flags_a_merge_that_drops_most_of_a_large_tree() {
    use plan_engine::git::passes_file_count_ratio;

    // Target has 15 tracked files; the candidate merge result keeps only 2.
    assert!(!passes_file_count_ratio(2, 2, 15));
    // The same 2-file result against a small target (<=10) isn't flagged.
    assert!(passes_file_count_ratio(2, 2, 9));
}

/// The conflict path of `merge_without_checkout`: `git merge-tree
/// --write-tree` exits 1 and writes the conflicted tree's OID plus the
/// conflicted paths to *stdout*, not stderr. Confirms the adapter actually
/// surfaces a conflicted tree rather than reporting `has_conflicts: false`
/// with no tree (the bug this test guards against).
#[tokio::test]
async fn merge_without_checkout_reports_conflicts_and_a_usable_conflicted_tree() {
    let repo = TestRepo::new();
    repo.write("shared.txt", "base\n");
    repo.git(&["add", "-A"]);
    repo.git(&["commit", "-m", "seed"]);
    let base = repo.head();

    repo.git(&["checkout", "-b", "branch-x"]);
    repo.write("shared.txt", "base\nX\n");
    repo.git(&["add", "-A"]);
    repo.git(&["commit", "-m", "insert X"]);
    let source_sha = repo.head();

    repo.git(&["checkout", "main"]);
    assert_eq!(repo.head(), base);
    repo.write("shared.txt", "base\nY\n");
    repo.git(&["add", "-A"]);
    repo.git(&["commit", "-m", "insert Y"]);
    let target_sha = repo.head();

    let git = adapter();
    let merge_tree = git
        .merge
        .merge_without_checkout(repo.path(), &source_sha, &target_sha)
        .await
        .expect("merge-tree runs even when it reports conflicts");

    assert!(!merge_tree.success);
    assert!(merge_tree.has_conflicts, "conflicting edits to the same line must be reported as conflicts");
    assert_eq!(merge_tree.conflict_files, vec!["shared.txt".to_string()]);
    let tree = merge_tree.tree_sha.expect("the conflicted tree's OID must still come back so it can be resolved in-memory");

    let blob = git.merge.cat_file_from_tree(repo.path(), &tree, "shared.txt").await.unwrap().expect("conflicted blob exists in the tree");
    let text = String::from_utf8(blob).unwrap();
    assert!(text.contains("<<<<<<<"), "the conflicted tree's blob carries conflict markers to resolve: {text}");
}

/// `is_default_branch` with no remote and no `init.defaultBranch` set falls
/// back to the literal `main`/`master` names.
#[tokio::test]
async fn is_default_branch_falls_back_to_literal_names_without_remote_or_config() {
    let repo = TestRepo::new();
    repo.write("tracked.txt", "x\n");
    repo.git(&["add", "-A"]);
    repo.git(&["commit", "-m", "initial"]);
    repo.git(&["checkout", "-b", "feature"]);

    let git = adapter();
    assert!(git.branches.is_default_branch(repo.path(), "main").await.unwrap());
    assert!(!git.branches.is_default_branch(repo.path(), "feature").await.unwrap());
}

/// `create` rejects a branch name that already exists rather than silently
/// resetting it (that's what `create_or_reset` is for).
#[tokio::test]
async fn create_rejects_an_already_existing_branch() {
    let repo = TestRepo::new();
    repo.write("tracked.txt", "x\n");
    repo.git(&["add", "-A"]);
    repo.git(&["commit", "-m", "initial"]);
    let head = repo.head();

    let git = adapter();
    assert!(!git.branches.exists_local(repo.path(), "new-branch").await.unwrap());
    git.branches.create(repo.path(), "new-branch", &head).await.expect("first create succeeds");
    assert!(git.branches.exists_local(repo.path(), "new-branch").await.unwrap());
    assert!(git.branches.create(repo.path(), "new-branch", &head).await.is_err());
}

/// End-to-end version of the same guard: build a real repo with a 15-file
/// target tree, merge-tree a branch that deleted all but one of them, and
/// confirm the resulting tree really does fail the ratio the phase code
/// checks.
#[tokio::test]
async fn merge_tree_of_a_near_total_deletion_fails_the_ratio_guard_against_its_real_tree() {
    use plan_engine::git::passes_file_count_ratio;

    let repo = TestRepo::new();
    for i in 0..15 {
        repo.write(&format!("file-{i}.txt"), "content\n");
    }
    repo.git(&["add", "-A"]);
    repo.git(&["commit", "-m", "seed 15 files"]);
    let target_sha = repo.head();

    repo.git(&["checkout", "-b", "deletion-branch"]);
    for i in 1..15 {
        std::fs::remove_file(repo.path().join(format!("file-{i}.txt"))).unwrap();
    }
    repo.git(&["add", "-A"]);
    repo.git(&["commit", "-m", "delete almost everything"]);
    let source_sha = repo.head();
    repo.git(&["checkout", "main"]);

    let git = adapter();
    let merge_tree = git
        .merge
        .merge_without_checkout(repo.path(), &source_sha, &target_sha)
        .await
        .expect("merge-tree runs");
    assert!(!merge_tree.has_conflicts, "a clean deletion merges without conflict");
    let tree = merge_tree.tree_sha.expect("merge-tree produced a tree");

    let result_files = git.merge.tree_file_count(repo.path(), &tree).await.unwrap();
    let source_files = git.merge.tree_file_count(repo.path(), &source_sha).await.unwrap();
    let target_files = git.merge.tree_file_count(repo.path(), &target_sha).await.unwrap();

    assert_eq!(result_files, 1);
    assert_eq!(source_files, 1);
    assert_eq!(target_files, 15);
    assert!(
        !passes_file_count_ratio(result_files, source_files, target_files),
        "a merge collapsing 15 files down to 1 must fail the ratio guard"
    );
}
