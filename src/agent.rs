//! The Agent Delegator: the external collaborator that actually invokes an
//! AI coding agent subprocess. The engine models the interface only — the
//! concrete subprocess/API integration is out of scope.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("no agent delegator configured")]
    NotConfigured,
    #[error("agent invocation timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("agent invocation failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub worktree_path: PathBuf,
    pub job_id: String,
    pub instructions: String,
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub config_dir: Option<PathBuf>,
    pub allowed_folders: Vec<PathBuf>,
    pub allowed_urls: Vec<String>,
    pub timeout: Option<std::time::Duration>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub turns: u32,
    pub tool_calls: u32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub success: bool,
    pub session_id: Option<String>,
    pub exit_code: Option<i32>,
    pub combined_output: String,
    pub token_usage: Option<TokenUsage>,
    pub metrics: AgentMetrics,
}

/// A single collaborator interface for every agent invocation in the
/// engine: work-phase agent dispatch, the commit phase's no-change review,
/// the merge helper, and reverse-integration conflict resolution all go
/// through this one call shape.
#[async_trait]
pub trait AgentDelegator: Send + Sync {
    async fn run(&self, request: AgentRequest) -> Result<AgentResponse, AgentError>;
}

/// Always reports that no delegator is configured. Lets the engine compile
/// and exercise the non-agent code paths (e.g. the commit phase's
/// no-evidence failure, step 6) without a real agent subprocess available.
pub struct NullAgentDelegator;

#[async_trait]
impl AgentDelegator for NullAgentDelegator {
    async fn run(&self, _request: AgentRequest) -> Result<AgentResponse, AgentError> {
        Err(AgentError::NotConfigured)
    }
}
