//! Data model: plans, nodes, work specs, and the identifiers that tie them
//! together. See the engine error and phase modules for the types that act
//! on this model.

mod ids;
mod node;
mod plan;
mod work;

pub use ids::{NodeId, PlanId, ProducerId};
pub use node::{Job, Node, NodeKind, NodeState, NodeStatus, StepStatus};
pub use plan::{Plan, PlanSpec, PlanStatus};
pub use work::{ShellKind, ShellKindDefault, WorkSpec};
