//! Executor for statically declared targets
//!
//! Applies proposals to the in-process [`StaticTarget`] state and reports
//! completion back to the controller over the executor event channel.

use anyhow::anyhow;
use async_trait::async_trait;
use scaler_lib::{
    coordinator::{ExecutionEvent, ExecutionOutcome, OperationHandle, ScaleExecutor, ScaleOperation},
    models::TargetRef,
    target::{ScalingTarget, StaticTarget},
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub struct StaticExecutor {
    targets: HashMap<TargetRef, Arc<StaticTarget>>,
    events: mpsc::Sender<ExecutionEvent>,
}

impl StaticExecutor {
    pub fn new(targets: &[Arc<StaticTarget>], events: mpsc::Sender<ExecutionEvent>) -> Self {
        Self {
            targets: targets
                .iter()
                .map(|target| (target.target_ref().clone(), Arc::clone(target)))
                .collect(),
            events,
        }
    }
}

#[async_trait]
impl ScaleExecutor for StaticExecutor {
    async fn execute(&self, operation: &ScaleOperation) -> anyhow::Result<OperationHandle> {
        let target = self
            .targets
            .get(operation.target())
            .cloned()
            .ok_or_else(|| anyhow!("no executor registered for {}", operation.target()))?;

        let operation_id = operation.id;
        let proposal = operation.decision.proposal.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let progress = ExecutionEvent {
                operation_id,
                outcome: ExecutionOutcome::InProgress,
            };
            if events.send(progress).await.is_err() {
                warn!(operation_id = %operation_id, "Controller stopped before operation started");
                return;
            }

            target.apply_proposal(&proposal).await;
            info!(operation_id = %operation_id, target = %target.target_ref(), "Applied scale proposal");

            let done = ExecutionEvent {
                operation_id,
                outcome: ExecutionOutcome::Succeeded,
            };
            if events.send(done).await.is_err() {
                warn!(operation_id = %operation_id, "Controller stopped before operation finished");
            }
        });

        Ok(OperationHandle(format!("static-{}", operation_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use scaler_lib::{
        coordinator::{OperationId, OperationPhase, Proposal, ScaleDecision},
        models::{ContainerResources, ResourceList, ResourceRequirements},
        policy::{ApplyOption, ScalingPolicy},
    };
    use std::time::Duration;

    fn create_test_operation(target: &TargetRef, cpu: u64) -> ScaleOperation {
        let mut resources = ContainerResources::new();
        resources.insert(
            "postgres".to_string(),
            ResourceRequirements {
                requests: ResourceList::new(cpu, 1 << 30),
                limits: ResourceList::default(),
            },
        );
        let now = Utc::now();
        ScaleOperation {
            id: OperationId(7),
            decision: ScaleDecision::new(target.clone(), Proposal::Compute(resources), "test"),
            phase: OperationPhase::Submitted,
            apply_option: ApplyOption::IfReady,
            timeout: Duration::from_secs(600),
            attempts: 1,
            last_error: None,
            failure_reason: None,
            handle: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_execute_applies_and_reports() {
        let target_ref = TargetRef::new("db", "pg-main");
        let target = Arc::new(StaticTarget::new(
            target_ref.clone(),
            ScalingPolicy::default(),
            ContainerResources::new(),
        ));
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let executor = StaticExecutor::new(&[target.clone()], events_tx);

        let handle = tokio_test::assert_ok!(
            executor
                .execute(&create_test_operation(&target_ref, 250))
                .await
        );
        assert_eq!(handle, OperationHandle("static-op-7".to_string()));

        let first = events_rx.recv().await.unwrap();
        assert_eq!(first.outcome, ExecutionOutcome::InProgress);
        let second = events_rx.recv().await.unwrap();
        assert_eq!(second.outcome, ExecutionOutcome::Succeeded);
        assert_eq!(second.operation_id, OperationId(7));

        let allocation = target.allocation().await;
        assert_eq!(allocation["postgres"].requests.cpu_millicores, Some(250));
    }

    #[tokio::test]
    async fn test_unknown_target_rejected() {
        let (events_tx, _events_rx) = mpsc::channel(8);
        let executor = StaticExecutor::new(&[], events_tx);

        let result = executor
            .execute(&create_test_operation(&TargetRef::new("db", "missing"), 250))
            .await;
        tokio_test::assert_err!(result);
    }
}
