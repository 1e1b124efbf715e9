//! Engine-level configuration: parallelism, worktree layout, conflict
//! resolution policy, snapshot branch naming, and final-merge retry bound.
//! Loadable from TOML via `serde`; every field has a default so an embedder
//! can run with `EngineConfig::default()`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Preference passed to the merge-fi conflict helper when structural
/// reconciliation isn't possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum MergeConflictPolicy {
    /// Prefer the dependency branch's side of a conflict.
    Ours,
    /// Prefer the incoming (merged-from) side of a conflict.
    Theirs,
}

impl Default for MergeConflictPolicy {
    fn default() -> Self {
        MergeConflictPolicy::Theirs
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct EngineConfig {
    /// Default `maxParallel` for a plan spec that doesn't set its own.
    pub default_max_parallel: usize,
    /// Template for per-node worktree paths, relative to the repo root.
    /// `{node-id}` is substituted with the node's UUID.
    pub worktree_root: String,
    /// Preference handed to the merge helper when a conflict can't be
    /// reconciled structurally.
    pub merge_conflict_policy: MergeConflictPolicy,
    /// Prefix for the per-plan snapshot branch, followed by the plan's UUID.
    pub snapshot_branch_prefix: String,
    /// Bounded retry count for the final-merge executor (§4.6).
    pub final_merge_max_attempts: u32,
    /// Push the target/snapshot branch to `origin` after a successful
    /// reverse-integration or final merge.
    pub push_on_merge_success: bool,
    /// Directory under the workspace root holding persisted plan state.
    pub state_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_parallel: 4,
            worktree_root: ".orchestrator/worktrees".to_string(),
            merge_conflict_policy: MergeConflictPolicy::default(),
            snapshot_branch_prefix: "orchestrator/snapshot/".to_string(),
            final_merge_max_attempts: 2,
            push_on_merge_success: false,
            state_dir: PathBuf::from(".orchestrator/plans"),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }

    pub fn snapshot_branch_name(&self, plan_id: &str) -> String {
        format!("{}{plan_id}", self.snapshot_branch_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.default_max_parallel, 4);
        assert_eq!(config.final_merge_max_attempts, 2);
        assert!(!config.push_on_merge_success);
    }

    #[test]
    fn parses_partial_toml_over_defaults() {
        let config = EngineConfig::from_toml_str("default-max-parallel = 8\n").unwrap();
        assert_eq!(config.default_max_parallel, 8);
        assert_eq!(config.worktree_root, EngineConfig::default().worktree_root);
    }

    #[test]
    fn snapshot_branch_name_uses_configured_prefix() {
        let config = EngineConfig::default();
        assert_eq!(config.snapshot_branch_name("abc123"), "orchestrator/snapshot/abc123");
    }
}
