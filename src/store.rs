//! The Plan Store: the external collaborator that persists plan state.
//! The engine models the interface and ships an in-process reference
//! implementation; a durable persistence format is out of scope.

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::model::{Plan, PlanId, PlanStatus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("plan {0} not found in store")]
    NotFound(PlanId),
    #[error("store backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn save_plan(&self, plan: &Plan) -> Result<(), StoreError>;
    async fn load_plan(&self, id: PlanId) -> Result<Plan, StoreError>;
    async fn list_plans(&self) -> Result<Vec<Plan>, StoreError>;
    async fn delete_plan(&self, id: PlanId) -> Result<(), StoreError>;

    async fn append_attempt_log(&self, plan: PlanId, node: crate::model::NodeId, line: &str) -> Result<(), StoreError>;
    async fn read_attempt_logs(&self, plan: PlanId, node: crate::model::NodeId) -> Result<Vec<String>, StoreError>;

    /// Cheap status lookup used by the resume-after-plan gate, which would
    /// otherwise pay for a full plan deserialization on every tick.
    async fn plan_status(&self, id: PlanId) -> Result<PlanStatus, StoreError> {
        Ok(self.load_plan(id).await?.status)
    }
}

/// Reference implementation backing tests and any embedder that doesn't
/// need plan state to outlive the process.
#[derive(Default)]
pub struct InMemoryPlanStore {
    plans: RwLock<indexmap::IndexMap<PlanId, Plan>>,
    logs: RwLock<std::collections::HashMap<(PlanId, crate::model::NodeId), Vec<String>>>,
}

impl InMemoryPlanStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PlanStore for InMemoryPlanStore {
    async fn save_plan(&self, plan: &Plan) -> Result<(), StoreError> {
        self.plans.write().await.insert(plan.id, plan.clone());
        Ok(())
    }

    async fn load_plan(&self, id: PlanId) -> Result<Plan, StoreError> {
        self.plans.read().await.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    async fn list_plans(&self) -> Result<Vec<Plan>, StoreError> {
        let mut plans: Vec<_> = self.plans.read().await.values().cloned().collect();
        plans.sort_by_key(|p| std::cmp::Reverse(p.created_at));
        Ok(plans)
    }

    async fn delete_plan(&self, id: PlanId) -> Result<(), StoreError> {
        self.plans.write().await.shift_remove(&id);
        self.logs.write().await.retain(|(p, _), _| *p != id);
        Ok(())
    }

    async fn append_attempt_log(&self, plan: PlanId, node: crate::model::NodeId, line: &str) -> Result<(), StoreError> {
        self.logs.write().await.entry((plan, node)).or_default().push(line.to_string());
        Ok(())
    }

    async fn read_attempt_logs(&self, plan: PlanId, node: crate::model::NodeId) -> Result<Vec<String>, StoreError> {
        Ok(self.logs.read().await.get(&(plan, node)).cloned().unwrap_or_default())
    }
}
