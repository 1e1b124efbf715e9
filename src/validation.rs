//! Two-phase validator for plan-creation input (§9, "Duck-typed handler
//! inputs").
//!
//! The MCP tool-call handler layer (out of scope for this crate) hands the
//! engine a JSON-shaped payload for `create_copilot_plan`. Validation runs
//! in two passes that must never be conflated:
//!
//! 1. **Schema** — field presence, types, string patterns, integer ranges.
//!    Pure structural checks against [`CreatePlanRequest`], independent of
//!    any repository or existing plan state.
//! 2. **Semantic** — id uniqueness within scope, dependency resolution,
//!    cycle detection. Only runs once the schema pass has succeeded.
//!
//! [`validate`] runs both passes and, on success, returns a [`ValidatedPlan`]
//! with nodes and edges already resolved to [`NodeId`]s — the scheduler's
//! `enqueue` only has to pick branch names and hand the result to a `Plan`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Job, Node, NodeId, ProducerId, ShellKind, ShellKindDefault, WorkSpec};

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("schema: {0}")]
    Schema(#[from] SchemaError),
    #[error("semantic: {0}")]
    Semantic(#[from] SemanticError),
    /// `retry_copilot_plan`/`retry_node` target a node that isn't `failed`
    /// (including any node in a `canceled` plan — cancellation is a
    /// deliberate stop, not a recoverable fault).
    #[error("node {node} in plan {plan} is not retriable: status is {status}, only failed nodes can be retried")]
    NotRetriable {
        plan: crate::model::PlanId,
        node: crate::model::NodeId,
        status: crate::model::NodeStatus,
    },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("plan name must not be empty")]
    EmptyName,
    #[error("a plan must have at least one job")]
    NoJobs,
    #[error("job {0}: task must not be empty")]
    EmptyTask(String),
    #[error("invalid producer id segment: {0:?}")]
    InvalidProducerIdSegment(String),
    #[error("max_parallel must be at least 1, got {0}")]
    MaxParallelOutOfRange(u32),
    #[error("job {0}: dependency entries must not be empty strings")]
    EmptyDependency(String),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SemanticError {
    #[error("duplicate id {id:?} within scope {scope:?}")]
    DuplicateId { scope: String, id: String },
    #[error("job {job:?} references unknown group {group:?}")]
    UnknownGroup { job: String, group: String },
    #[error("group {group:?} has no declared ancestor {ancestor:?}")]
    UnknownAncestorGroup { group: String, ancestor: String },
    #[error("job {job:?} depends on unknown id {dependency:?}")]
    UnknownDependency { job: String, dependency: String },
    #[error("job {job:?} depends on itself")]
    SelfDependency { job: String },
    #[error("dependency cycle detected, starting at {0:?}")]
    Cycle(String),
}

/// Wire shape of one entry in `create_copilot_plan`'s `jobs[]` array.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RawJob {
    pub producer_id: String,
    pub task: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Fully-qualified path of the group this job is nested in, e.g.
    /// `"backend/db"`. `None` means the plan's root scope.
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub prechecks: Option<RawWorkInput>,
    #[serde(default)]
    pub work: Option<RawWorkInput>,
    #[serde(default)]
    pub postchecks: Option<RawWorkInput>,
    #[serde(default)]
    pub expects_no_changes: bool,
    #[serde(default)]
    pub base_branch_override: Option<String>,
}

/// Wire shape of one entry in `create_copilot_plan`'s `groups[]` array. `id`
/// is the group's own fully-qualified path; nested groups declare their
/// full ancestry (`"backend"`, then `"backend/db"`), never just the leaf.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RawGroup {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// A work spec as it arrives over the wire: either a bare instruction
/// string (normalized per [`WorkSpec::from_raw`]) or a fully-specified
/// tagged object.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(untagged)]
pub enum RawWorkInput {
    Raw(String),
    Spec(RawWork),
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RawWork {
    Shell {
        command: String,
        #[serde(default)]
        shell: Option<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        cwd: Option<String>,
    },
    Process {
        executable: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        cwd: Option<String>,
    },
    Agent {
        instructions: String,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        context_files: Vec<String>,
        #[serde(default)]
        max_turns: Option<u32>,
        #[serde(default)]
        allowed_folders: Vec<String>,
        #[serde(default)]
        allowed_urls: Vec<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
}

impl RawWorkInput {
    fn into_work_spec(self) -> WorkSpec {
        match self {
            RawWorkInput::Raw(raw) => WorkSpec::from_raw(&raw),
            RawWorkInput::Spec(spec) => spec.into_work_spec(),
        }
    }
}

impl RawWork {
    fn into_work_spec(self) -> WorkSpec {
        match self {
            RawWork::Shell { command, shell, env, timeout_ms, cwd } => WorkSpec::Shell {
                command,
                shell: ShellKindDefault(shell.and_then(|s| s.parse::<ShellKind>().ok()).unwrap_or(ShellKind::Auto)),
                env,
                timeout: timeout_ms.map(Duration::from_millis),
                cwd: cwd.map(PathBuf::from),
            },
            RawWork::Process { executable, args, env, timeout_ms, cwd } => WorkSpec::Process {
                executable,
                args,
                env,
                timeout: timeout_ms.map(Duration::from_millis),
                cwd: cwd.map(PathBuf::from),
            },
            RawWork::Agent { instructions, model, context_files, max_turns, allowed_folders, allowed_urls, session_id } => {
                WorkSpec::Agent {
                    instructions,
                    model,
                    context_files: context_files.into_iter().map(PathBuf::from).collect(),
                    max_turns,
                    allowed_folders: allowed_folders.into_iter().map(PathBuf::from).collect(),
                    allowed_urls,
                    session_id,
                }
            }
        }
    }
}

/// Wire shape of the `create_copilot_plan` tool call.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreatePlanRequest {
    pub name: String,
    pub jobs: Vec<RawJob>,
    #[serde(default)]
    pub groups: Vec<RawGroup>,
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub target_branch: Option<String>,
    #[serde(default)]
    pub max_parallel: Option<u32>,
    #[serde(default)]
    pub start_paused: bool,
}

/// The output of a successful two-phase validation: nodes built and
/// dependency/dependent edges already wired to [`NodeId`]s. The scheduler's
/// `enqueue` only has to resolve branch names and wrap this into a `Plan`.
pub struct ValidatedPlan {
    pub name: String,
    pub nodes: indexmap::IndexMap<NodeId, Node>,
    pub base_branch: Option<String>,
    pub target_branch: Option<String>,
    pub max_parallel: Option<u32>,
    pub start_paused: bool,
}

/// Run both validation passes. Schema errors are returned before any
/// semantic check runs, so a malformed request never produces a partially
/// resolved dependency graph.
pub fn validate(req: CreatePlanRequest) -> Result<ValidatedPlan, ValidationError> {
    validate_schema(&req)?;
    validate_semantics(req).map_err(ValidationError::from)
}

/// Phase 1: field presence, types (already enforced by `serde`'s
/// `Deserialize` before this function is reached), string patterns, and
/// integer ranges.
fn validate_schema(req: &CreatePlanRequest) -> Result<(), SchemaError> {
    if req.name.trim().is_empty() {
        return Err(SchemaError::EmptyName);
    }
    if req.jobs.is_empty() {
        return Err(SchemaError::NoJobs);
    }
    if let Some(max_parallel) = req.max_parallel
        && max_parallel < 1
    {
        return Err(SchemaError::MaxParallelOutOfRange(max_parallel));
    }
    for group in &req.groups {
        for segment in group.id.split('/') {
            if !ProducerId::validate(segment) {
                return Err(SchemaError::InvalidProducerIdSegment(segment.to_string()));
            }
        }
    }
    for job in &req.jobs {
        if job.task.trim().is_empty() {
            return Err(SchemaError::EmptyTask(job.producer_id.clone()));
        }
        if !ProducerId::validate(&job.producer_id) {
            return Err(SchemaError::InvalidProducerIdSegment(job.producer_id.clone()));
        }
        if let Some(group) = &job.group {
            for segment in group.split('/') {
                if !ProducerId::validate(segment) {
                    return Err(SchemaError::InvalidProducerIdSegment(segment.to_string()));
                }
            }
        }
        for dep in &job.dependencies {
            if dep.trim().is_empty() {
                return Err(SchemaError::EmptyDependency(job.producer_id.clone()));
            }
        }
    }
    Ok(())
}

/// Scopes to search for a bare dependency token, nearest first: the job's
/// own group, then each enclosing group up to and including the root
/// (`None`).
fn enclosing_scopes(group: Option<&str>) -> impl Iterator<Item = Option<&str>> {
    std::iter::successors(Some(group), |scope| match scope {
        Some(g) => Some(g.rsplit_once('/').map(|(parent, _)| parent)),
        None => None,
    })
}

/// Phase 2: id uniqueness within scope, group ancestry, dependency
/// resolution, self-dependency rejection, and cycle detection.
fn validate_semantics(req: CreatePlanRequest) -> Result<ValidatedPlan, SemanticError> {
    // Every declared group's parent chain must itself be declared.
    let declared_groups: HashSet<&str> = req.groups.iter().map(|g| g.id.as_str()).collect();
    for group in &req.groups {
        if let Some((ancestor, _)) = group.id.rsplit_once('/')
            && !declared_groups.contains(ancestor)
        {
            return Err(SemanticError::UnknownAncestorGroup { group: group.id.clone(), ancestor: ancestor.to_string() });
        }
    }
    for job in &req.jobs {
        if let Some(group) = &job.group
            && !declared_groups.contains(group.as_str())
        {
            return Err(SemanticError::UnknownGroup { job: job.producer_id.clone(), group: group.clone() });
        }
    }

    // Producer-id uniqueness within a scope: siblings only. A scope is
    // identified by its immediate parent's qualified path (`None` = root).
    let mut scope_ids: HashMap<Option<&str>, HashSet<&str>> = HashMap::new();
    for group in &req.groups {
        let (parent, local) = match group.id.rsplit_once('/') {
            Some((p, l)) => (Some(p), l),
            None => (None, group.id.as_str()),
        };
        if !scope_ids.entry(parent).or_default().insert(local) {
            return Err(SemanticError::DuplicateId { scope: parent.unwrap_or("<root>").to_string(), id: local.to_string() });
        }
    }
    for job in &req.jobs {
        let parent = job.group.as_deref();
        if !scope_ids.entry(parent).or_default().insert(job.producer_id.as_str()) {
            return Err(SemanticError::DuplicateId {
                scope: parent.unwrap_or("<root>").to_string(),
                id: job.producer_id.clone(),
            });
        }
    }

    // Build qualified ids and a lookup from qualified id -> job index.
    let qualified_id = |group: Option<&str>, producer_id: &str| -> String {
        match group {
            Some(g) => format!("{g}/{producer_id}"),
            None => producer_id.to_string(),
        }
    };
    let mut by_qualified_id: HashMap<String, usize> = HashMap::new();
    for (idx, job) in req.jobs.iter().enumerate() {
        by_qualified_id.insert(qualified_id(job.group.as_deref(), &job.producer_id), idx);
    }

    // Resolve dependencies: a bare token is looked up first as a sibling in
    // the job's own scope, then walking up each enclosing group's scope to
    // the root, so a bare token can also reach an ancestor scope's id
    // without needing the fully-qualified path; a slash-containing token is
    // always a fully-qualified path, looked up as-is.
    let mut dependency_indices: Vec<Vec<usize>> = vec![Vec::new(); req.jobs.len()];
    for (idx, job) in req.jobs.iter().enumerate() {
        for dep in &job.dependencies {
            let resolved = if dep.contains('/') {
                by_qualified_id.get(dep.as_str()).copied()
            } else {
                enclosing_scopes(job.group.as_deref())
                    .find_map(|scope| by_qualified_id.get(&qualified_id(scope, dep)).copied())
            };
            let Some(dep_idx) = resolved else {
                return Err(SemanticError::UnknownDependency { job: job.producer_id.clone(), dependency: dep.clone() });
            };
            if dep_idx == idx {
                return Err(SemanticError::SelfDependency { job: job.producer_id.clone() });
            }
            dependency_indices[idx].push(dep_idx);
        }
    }

    detect_cycle(&dependency_indices, &req.jobs)?;

    // Assign stable NodeIds and materialize Nodes, wiring dependents as the
    // inverse of the resolved dependency edges.
    let node_ids: Vec<NodeId> = (0..req.jobs.len()).map(|_| NodeId::new(Uuid::new_v4())).collect();
    let mut nodes: indexmap::IndexMap<NodeId, Node> = indexmap::IndexMap::new();
    for (idx, raw) in req.jobs.iter().enumerate() {
        let job = Job {
            task: raw.task.clone(),
            prechecks: raw.prechecks.clone().map(RawWorkInput::into_work_spec),
            work: raw.work.clone().map(RawWorkInput::into_work_spec),
            postchecks: raw.postchecks.clone().map(RawWorkInput::into_work_spec),
            expects_no_changes: raw.expects_no_changes,
            base_branch_override: raw.base_branch_override.clone(),
        };
        let display_name = qualified_id(raw.group.as_deref(), &raw.producer_id);
        let mut node = Node::new_job(node_ids[idx], ProducerId(raw.producer_id.clone()), display_name, job);
        node.dependencies = dependency_indices[idx].iter().map(|&dep_idx| node_ids[dep_idx]).collect();
        nodes.insert(node.id, node);
    }
    for idx in 0..req.jobs.len() {
        for &dep_idx in &dependency_indices[idx] {
            let dependent_id = node_ids[idx];
            nodes[&node_ids[dep_idx]].dependents.push(dependent_id);
        }
    }

    Ok(ValidatedPlan {
        name: req.name,
        nodes,
        base_branch: req.base_branch,
        target_branch: req.target_branch,
        max_parallel: req.max_parallel,
        start_paused: req.start_paused,
    })
}

/// DFS-based cycle detection over the resolved dependency edges. `jobs` is
/// only used to name the cycle's start node in the error.
fn detect_cycle(dependency_indices: &[Vec<usize>], jobs: &[RawJob]) -> Result<(), SemanticError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }
    let mut marks = vec![Mark::Unvisited; dependency_indices.len()];

    fn visit(node: usize, deps: &[Vec<usize>], marks: &mut [Mark], jobs: &[RawJob]) -> Result<(), SemanticError> {
        match marks[node] {
            Mark::Done => return Ok(()),
            Mark::InProgress => return Err(SemanticError::Cycle(jobs[node].producer_id.clone())),
            Mark::Unvisited => {}
        }
        marks[node] = Mark::InProgress;
        for &dep in &deps[node] {
            visit(dep, deps, marks, jobs)?;
        }
        marks[node] = Mark::Done;
        Ok(())
    }

    for node in 0..dependency_indices.len() {
        visit(node, dependency_indices, &mut marks, jobs)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(producer_id: &str, deps: &[&str]) -> RawJob {
        RawJob {
            producer_id: producer_id.to_string(),
            task: format!("do {producer_id}"),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            group: None,
            prechecks: None,
            work: None,
            postchecks: None,
            expects_no_changes: false,
            base_branch_override: None,
        }
    }

    fn request(jobs: Vec<RawJob>) -> CreatePlanRequest {
        CreatePlanRequest {
            name: "test plan".to_string(),
            jobs,
            groups: Vec::new(),
            base_branch: None,
            target_branch: None,
            max_parallel: None,
            start_paused: false,
        }
    }

    #[test]
    fn rejects_empty_name() {
        let mut req = request(vec![job("a", &[])]);
        req.name = "".to_string();
        assert!(matches!(validate(req), Err(ValidationError::Schema(SchemaError::EmptyName))));
    }

    #[test]
    fn rejects_zero_jobs() {
        let req = request(vec![]);
        assert!(matches!(validate(req), Err(ValidationError::Schema(SchemaError::NoJobs))));
    }

    #[test]
    fn rejects_max_parallel_below_one() {
        let mut req = request(vec![job("a", &[])]);
        req.max_parallel = Some(0);
        assert!(matches!(validate(req), Err(ValidationError::Schema(SchemaError::MaxParallelOutOfRange(0)))));
    }

    #[test]
    fn rejects_invalid_producer_id() {
        let req = request(vec![job("Bad_Id", &[])]);
        assert!(matches!(validate(req), Err(ValidationError::Schema(SchemaError::InvalidProducerIdSegment(_)))));
    }

    #[test]
    fn rejects_duplicate_producer_id_in_same_scope() {
        let req = request(vec![job("a", &[]), job("a", &[])]);
        assert!(matches!(validate(req), Err(ValidationError::Semantic(SemanticError::DuplicateId { .. }))));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let req = request(vec![job("a", &["ghost"])]);
        assert!(matches!(validate(req), Err(ValidationError::Semantic(SemanticError::UnknownDependency { .. }))));
    }

    #[test]
    fn rejects_self_dependency() {
        let req = request(vec![job("a", &["a"])]);
        assert!(matches!(validate(req), Err(ValidationError::Semantic(SemanticError::SelfDependency { .. }))));
    }

    #[test]
    fn rejects_dependency_cycle() {
        let req = request(vec![job("a", &["b"]), job("b", &["a"])]);
        assert!(matches!(validate(req), Err(ValidationError::Semantic(SemanticError::Cycle(_)))));
    }

    #[test]
    fn accepts_a_linear_chain_and_wires_dependents() {
        let req = request(vec![job("a", &[]), job("b", &["a"]), job("c", &["b"])]);
        let validated = validate(req).unwrap();
        assert_eq!(validated.nodes.len(), 3);
        let a = validated.nodes.values().find(|n| n.producer_id.0 == "a").unwrap();
        assert_eq!(a.dependents.len(), 1);
        let c = validated.nodes.values().find(|n| n.producer_id.0 == "c").unwrap();
        assert_eq!(c.dependencies.len(), 1);
    }

    #[test]
    fn siblings_in_different_groups_may_reuse_producer_ids() {
        let mut job_a = job("migrate", &[]);
        job_a.group = Some("backend".to_string());
        let mut job_b = job("migrate", &[]);
        job_b.group = Some("frontend".to_string());
        let mut req = request(vec![job_a, job_b]);
        req.groups = vec![
            RawGroup { id: "backend".to_string(), display_name: None },
            RawGroup { id: "frontend".to_string(), display_name: None },
        ];
        let validated = validate(req).unwrap();
        assert_eq!(validated.nodes.len(), 2);
    }

    #[test]
    fn ancestor_qualified_dependency_resolves_across_scopes() {
        let mut root = job("setup", &[]);
        root.group = None;
        let mut nested = job("migrate", &["setup"]);
        nested.group = Some("backend".to_string());
        let mut req = request(vec![root, nested]);
        req.groups = vec![RawGroup { id: "backend".to_string(), display_name: None }];
        let validated = validate(req).unwrap();
        let migrate = validated.nodes.values().find(|n| n.producer_id.0 == "migrate").unwrap();
        assert_eq!(migrate.dependencies.len(), 1);
    }

    #[test]
    fn unknown_group_reference_is_rejected() {
        let mut j = job("a", &[]);
        j.group = Some("ghost".to_string());
        let req = request(vec![j]);
        assert!(matches!(validate(req), Err(ValidationError::Semantic(SemanticError::UnknownGroup { .. }))));
    }
}
