//! Scale decision coordination
//!
//! Turns positive trigger evaluations into tracked scale operations and
//! drives them through their lifecycle using executor feedback.

mod operation;
mod state;

#[cfg(test)]
mod tests;

pub use operation::{
    ExecutionEvent, ExecutionOutcome, FailureReason, OperationHandle, OperationId, OperationPhase,
    Proposal, ScaleDecision, ScaleOperation,
};
pub use state::{
    CoordinatorConfig, ScaleDecisionCoordinator, DEFAULT_EXTERNAL_CALL_TIMEOUT,
    DEFAULT_HISTORY_LIMIT,
};

use crate::models::TargetRef;
use async_trait::async_trait;

/// Reports whether a target can accept a scale operation right now
#[async_trait]
pub trait ReadinessOracle: Send + Sync {
    async fn is_ready(&self, target: &TargetRef) -> bool;
}

/// Carries out scale operations outside the engine.
///
/// Completion is reported asynchronously as [`ExecutionEvent`]s.
#[async_trait]
pub trait ScaleExecutor: Send + Sync {
    async fn execute(&self, operation: &ScaleOperation) -> anyhow::Result<OperationHandle>;
}

/// Oracle that considers every target ready
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysReady;

#[async_trait]
impl ReadinessOracle for AlwaysReady {
    async fn is_ready(&self, _target: &TargetRef) -> bool {
        true
    }
}
