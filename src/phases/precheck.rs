//! Precheck and postcheck phases: same dispatch as the work phase, but
//! without session/metrics bookkeeping, and a missing spec always succeeds.

use async_trait::async_trait;

use super::work::dispatch;
use super::{Phase, PhaseContext, PhaseExecutor, PhaseOutcome};

pub struct PrecheckExecutor;

#[async_trait]
impl PhaseExecutor for PrecheckExecutor {
    async fn execute(&self, ctx: &mut PhaseContext<'_>) -> PhaseOutcome {
        let Some(spec) = ctx.job.prechecks.clone() else {
            return PhaseOutcome::ok();
        };
        dispatch(ctx, Phase::Precheck, &spec, false).await
    }
}

pub struct PostcheckExecutor;

#[async_trait]
impl PhaseExecutor for PostcheckExecutor {
    async fn execute(&self, ctx: &mut PhaseContext<'_>) -> PhaseOutcome {
        let Some(spec) = ctx.job.postchecks.clone() else {
            return PhaseOutcome::ok();
        };
        dispatch(ctx, Phase::Postcheck, &spec, false).await
    }
}
