//! Tests for the scale decision coordinator
//!
//! These tests verify:
//! - At most one in-flight operation per (target, kind)
//! - The apply gate and executor hand-off
//! - Executor feedback, cancellation and timeouts

use super::*;
use crate::error::CoordinatorError;
use crate::models::{ContainerResources, ResourceKind, ResourceList, ResourceRequirements};
use crate::policy::{ApplyOption, ExpansionMode, OpsRequestOptions};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Helper to create a target reference
fn create_test_target(name: &str) -> TargetRef {
    TargetRef::new("default", name)
}

fn compute_decision(target: &TargetRef, cpu: u64) -> ScaleDecision {
    let mut resources = ContainerResources::new();
    resources.insert(
        "postgres".to_string(),
        ResourceRequirements {
            requests: ResourceList::new(cpu, 1 << 30),
            limits: ResourceList::default(),
        },
    );
    ScaleDecision::new(target.clone(), Proposal::Compute(resources), "test")
}

fn storage_decision(target: &TargetRef) -> ScaleDecision {
    ScaleDecision::new(
        target.clone(),
        Proposal::Storage {
            capacity_bytes: 15 << 30,
            mode: ExpansionMode::Online,
        },
        "volume at 85%",
    )
}

fn ops() -> OpsRequestOptions {
    OpsRequestOptions::default().with_defaults()
}

struct FixedOracle(bool);

#[async_trait]
impl ReadinessOracle for FixedOracle {
    async fn is_ready(&self, _target: &TargetRef) -> bool {
        self.0
    }
}

struct SlowOracle;

#[async_trait]
impl ReadinessOracle for SlowOracle {
    async fn is_ready(&self, _target: &TargetRef) -> bool {
        tokio::time::sleep(Duration::from_secs(5)).await;
        true
    }
}

#[derive(Default)]
struct RecordingExecutor {
    fail: AtomicBool,
    executed: Mutex<Vec<OperationId>>,
}

#[async_trait]
impl ScaleExecutor for RecordingExecutor {
    async fn execute(&self, operation: &ScaleOperation) -> anyhow::Result<OperationHandle> {
        self.executed.lock().unwrap().push(operation.id);
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("resize rejected");
        }
        Ok(OperationHandle(format!("ops-{}", operation.id.0)))
    }
}

mod submit_tests {
    use super::*;

    #[test]
    fn test_submit_creates_pending_operation() {
        let coordinator = ScaleDecisionCoordinator::default();
        let target = create_test_target("pg");

        let id = coordinator.submit(compute_decision(&target, 500), &ops()).unwrap();
        let operation = coordinator.operation(id).unwrap();

        assert_eq!(operation.phase, OperationPhase::Pending);
        assert_eq!(operation.apply_option, ApplyOption::IfReady);
        assert_eq!(operation.attempts, 0);
        assert_eq!(coordinator.in_flight(&target, ResourceKind::Compute), Some(id));
    }

    #[test]
    fn test_second_submit_is_rejected() {
        let coordinator = ScaleDecisionCoordinator::default();
        let target = create_test_target("pg");

        let first = coordinator.submit(compute_decision(&target, 500), &ops()).unwrap();
        let second = coordinator.submit(compute_decision(&target, 800), &ops());

        assert_eq!(
            second,
            Err(CoordinatorError::AlreadyInFlight {
                target: target.clone(),
                kind: ResourceKind::Compute,
                operation_id: first,
            })
        );
    }

    #[test]
    fn test_slots_are_per_target_and_kind() {
        let coordinator = ScaleDecisionCoordinator::default();
        let pg = create_test_target("pg");
        let redis = create_test_target("redis");

        assert!(coordinator.submit(compute_decision(&pg, 500), &ops()).is_ok());
        assert!(coordinator.submit(storage_decision(&pg), &ops()).is_ok());
        assert!(coordinator.submit(compute_decision(&redis, 500), &ops()).is_ok());
        assert_eq!(coordinator.in_flight_count(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submit_mutual_exclusion() {
        let coordinator = Arc::new(ScaleDecisionCoordinator::default());
        let target = create_test_target("pg");

        let mut handles = Vec::new();
        for i in 0..16 {
            let coordinator = Arc::clone(&coordinator);
            let target = target.clone();
            handles.push(tokio::spawn(async move {
                coordinator.submit(compute_decision(&target, 100 + i), &ops())
            }));
        }

        let mut accepted = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => accepted += 1,
                Err(CoordinatorError::AlreadyInFlight { .. }) => rejected += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(accepted, 1);
        assert_eq!(rejected, 15);
        assert_eq!(coordinator.operations().len(), 1);
    }

    #[tokio::test]
    async fn test_slot_freed_after_terminal_phase() {
        let coordinator = ScaleDecisionCoordinator::default();
        let executor = RecordingExecutor::default();
        let target = create_test_target("pg");

        let first = coordinator.submit(compute_decision(&target, 500), &ops()).unwrap();
        coordinator.apply(first, &AlwaysReady, &executor).await.unwrap();
        coordinator.mark_succeeded(first).unwrap();

        let second = coordinator.submit(compute_decision(&target, 600), &ops()).unwrap();
        coordinator.apply(second, &AlwaysReady, &executor).await.unwrap();
        coordinator.mark_failed(second, "pod evicted").unwrap();

        assert!(coordinator.submit(compute_decision(&target, 700), &ops()).is_ok());
    }
}

mod apply_tests {
    use super::*;

    #[tokio::test]
    async fn test_apply_if_ready_waits_for_target() {
        let coordinator = ScaleDecisionCoordinator::default();
        let executor = RecordingExecutor::default();
        let target = create_test_target("pg");
        let id = coordinator.submit(compute_decision(&target, 500), &ops()).unwrap();

        let result = coordinator.apply(id, &FixedOracle(false), &executor).await;
        assert_eq!(result, Err(CoordinatorError::TargetNotReady(target.clone())));
        assert_eq!(coordinator.operation(id).unwrap().phase, OperationPhase::Pending);
        assert!(executor.executed.lock().unwrap().is_empty());

        // Retried on the next tick once the target is ready
        let phase = coordinator.apply(id, &FixedOracle(true), &executor).await.unwrap();
        assert_eq!(phase, OperationPhase::Submitted);
        let operation = coordinator.operation(id).unwrap();
        assert_eq!(operation.handle, Some(OperationHandle(format!("ops-{}", id.0))));
        assert_eq!(*executor.executed.lock().unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_apply_always_skips_readiness() {
        let coordinator = ScaleDecisionCoordinator::default();
        let executor = RecordingExecutor::default();
        let options = OpsRequestOptions {
            apply: ApplyOption::Always,
            ..ops()
        };
        let id = coordinator
            .submit(compute_decision(&create_test_target("pg"), 500), &options)
            .unwrap();

        let phase = coordinator.apply(id, &FixedOracle(false), &executor).await;
        tokio_test::assert_ok!(phase);
    }

    #[tokio::test]
    async fn test_readiness_timeout_keeps_pending() {
        let coordinator = ScaleDecisionCoordinator::new(CoordinatorConfig {
            external_call_timeout: Duration::from_millis(20),
            ..Default::default()
        });
        let executor = RecordingExecutor::default();
        let target = create_test_target("pg");
        let id = coordinator.submit(compute_decision(&target, 500), &ops()).unwrap();

        let result = coordinator.apply(id, &SlowOracle, &executor).await;
        assert_eq!(result, Err(CoordinatorError::TargetNotReady(target)));
        assert_eq!(coordinator.operation(id).unwrap().phase, OperationPhase::Pending);
    }

    #[tokio::test]
    async fn test_executor_error_fails_operation() {
        let coordinator = ScaleDecisionCoordinator::default();
        let executor = RecordingExecutor::default();
        executor.fail.store(true, Ordering::SeqCst);
        let target = create_test_target("pg");
        let id = coordinator.submit(compute_decision(&target, 500), &ops()).unwrap();

        let result = coordinator.apply(id, &AlwaysReady, &executor).await;
        assert!(matches!(result, Err(CoordinatorError::Executor(_))));

        let operation = coordinator.operation(id).unwrap();
        assert_eq!(operation.phase, OperationPhase::Failed);
        assert_eq!(operation.failure_reason, Some(FailureReason::ExecutorFailure));
        assert_eq!(operation.attempts, 1);
        assert_eq!(operation.last_error.as_deref(), Some("resize rejected"));
        assert_eq!(coordinator.in_flight(&target, ResourceKind::Compute), None);
    }

    #[tokio::test]
    async fn test_apply_twice_is_invalid() {
        let coordinator = ScaleDecisionCoordinator::default();
        let executor = RecordingExecutor::default();
        let id = coordinator
            .submit(compute_decision(&create_test_target("pg"), 500), &ops())
            .unwrap();

        coordinator.apply(id, &AlwaysReady, &executor).await.unwrap();
        let again = coordinator.apply(id, &AlwaysReady, &executor).await;
        assert_eq!(
            again,
            Err(CoordinatorError::InvalidTransition {
                id,
                from: OperationPhase::Submitted,
                to: OperationPhase::Submitted,
            })
        );
    }

    #[tokio::test]
    async fn test_apply_unknown_operation() {
        let coordinator = ScaleDecisionCoordinator::default();
        let executor = RecordingExecutor::default();
        let result = coordinator.apply(OperationId(42), &AlwaysReady, &executor).await;
        assert_eq!(result, Err(CoordinatorError::NotFound(OperationId(42))));
    }
}

mod lifecycle_tests {
    use super::*;

    async fn submitted(coordinator: &ScaleDecisionCoordinator, decision: ScaleDecision) -> OperationId {
        let id = coordinator.submit(decision, &ops()).unwrap();
        coordinator
            .apply(id, &AlwaysReady, &RecordingExecutor::default())
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn test_executor_events_drive_transitions() {
        let coordinator = ScaleDecisionCoordinator::default();
        let id = submitted(&coordinator, compute_decision(&create_test_target("pg"), 500)).await;

        let event = |outcome| ExecutionEvent {
            operation_id: id,
            outcome,
        };
        assert_eq!(
            coordinator.apply_event(event(ExecutionOutcome::InProgress)),
            Ok(OperationPhase::InProgress)
        );
        assert_eq!(
            coordinator.apply_event(event(ExecutionOutcome::InProgress)),
            Ok(OperationPhase::InProgress)
        );
        assert_eq!(
            coordinator.apply_event(event(ExecutionOutcome::Succeeded)),
            Ok(OperationPhase::Succeeded)
        );
        assert!(matches!(
            coordinator.apply_event(event(ExecutionOutcome::Failed("late".to_string()))),
            Err(CoordinatorError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_pending_cannot_progress_without_apply() {
        let coordinator = ScaleDecisionCoordinator::default();
        let id = coordinator
            .submit(compute_decision(&create_test_target("pg"), 500), &ops())
            .unwrap();

        assert!(matches!(
            coordinator.mark_in_progress(id),
            Err(CoordinatorError::InvalidTransition {
                from: OperationPhase::Pending,
                ..
            })
        ));
        assert!(coordinator.mark_succeeded(id).is_err());
    }

    #[tokio::test]
    async fn test_attempts_exhausted_for_repeated_proposal() {
        let coordinator = ScaleDecisionCoordinator::default();
        let target = create_test_target("pg");

        for attempt in 1..=3 {
            let id = submitted(&coordinator, compute_decision(&target, 500)).await;
            assert_eq!(coordinator.operation(id).unwrap().attempts, attempt - 1);
            coordinator.mark_failed(id, "eviction blocked").unwrap();
            assert_eq!(coordinator.operation(id).unwrap().attempts, attempt);
        }

        assert_eq!(
            coordinator.submit(compute_decision(&target, 500), &ops()),
            Err(CoordinatorError::AttemptsExhausted {
                target: target.clone(),
                kind: ResourceKind::Compute,
                attempts: 3,
            })
        );

        // A fresh proposal starts over
        let id = coordinator.submit(compute_decision(&target, 450), &ops()).unwrap();
        assert_eq!(coordinator.operation(id).unwrap().attempts, 0);
    }

    #[tokio::test]
    async fn test_success_resets_failure_history() {
        let coordinator = ScaleDecisionCoordinator::default();
        let target = create_test_target("pg");

        let failed = submitted(&coordinator, compute_decision(&target, 500)).await;
        coordinator.mark_failed(failed, "boom").unwrap();
        let ok = submitted(&coordinator, compute_decision(&target, 500)).await;
        assert_eq!(coordinator.operation(ok).unwrap().attempts, 1);
        coordinator.mark_succeeded(ok).unwrap();

        let next = coordinator.submit(compute_decision(&target, 500), &ops()).unwrap();
        assert_eq!(coordinator.operation(next).unwrap().attempts, 0);
    }

    #[tokio::test]
    async fn test_cancel_target_fails_in_flight_operations() {
        let coordinator = ScaleDecisionCoordinator::default();
        let target = create_test_target("pg");
        let other = create_test_target("redis");

        let compute = submitted(&coordinator, compute_decision(&target, 500)).await;
        let storage = coordinator.submit(storage_decision(&target), &ops()).unwrap();
        let untouched = coordinator.submit(storage_decision(&other), &ops()).unwrap();

        let mut cancelled = coordinator.cancel_target(&target);
        cancelled.sort();
        assert_eq!(cancelled, vec![compute, storage]);

        for id in [compute, storage] {
            let operation = coordinator.operation(id).unwrap();
            assert_eq!(operation.phase, OperationPhase::Failed);
            assert_eq!(operation.failure_reason, Some(FailureReason::TargetDeleted));
        }
        assert_eq!(coordinator.operation(untouched).unwrap().phase, OperationPhase::Pending);
        assert!(coordinator.submit(compute_decision(&target, 500), &ops()).is_ok());
    }

    #[test]
    fn test_expire_stale_operations() {
        let coordinator = ScaleDecisionCoordinator::default();
        let target = create_test_target("pg");
        let options = OpsRequestOptions {
            timeout: Duration::from_secs(60),
            ..ops()
        };
        let id = coordinator.submit(compute_decision(&target, 500), &options).unwrap();

        assert!(coordinator.expire_stale(Utc::now()).is_empty());

        let later = Utc::now() + chrono::Duration::seconds(61);
        assert_eq!(coordinator.expire_stale(later), vec![id]);
        let operation = coordinator.operation(id).unwrap();
        assert_eq!(operation.failure_reason, Some(FailureReason::Timeout));
        assert_eq!(coordinator.in_flight(&target, ResourceKind::Compute), None);
    }

    #[test]
    fn test_history_is_bounded() {
        let coordinator = ScaleDecisionCoordinator::new(CoordinatorConfig {
            history_limit: 2,
            ..Default::default()
        });
        let target = create_test_target("pg");

        for cpu in 0..5 {
            let id = coordinator.submit(compute_decision(&target, 100 + cpu), &ops()).unwrap();
            coordinator.cancel_target(&target);
            assert!(coordinator.operation(id).is_some());
        }
        coordinator.expire_stale(Utc::now());

        let remaining: Vec<u64> = coordinator.operations().iter().map(|op| op.id.0).collect();
        assert_eq!(remaining, vec![4, 5]);
    }

    #[test]
    fn test_status_lists_target_operations() {
        let coordinator = ScaleDecisionCoordinator::default();
        let target = create_test_target("pg");
        coordinator.submit(compute_decision(&target, 500), &ops()).unwrap();
        coordinator.submit(storage_decision(&target), &ops()).unwrap();
        coordinator
            .submit(compute_decision(&create_test_target("redis"), 500), &ops())
            .unwrap();

        let status = coordinator.status(&target);
        assert_eq!(status.len(), 2);
        assert_eq!(status[0].kind(), ResourceKind::Compute);
        assert_eq!(status[1].kind(), ResourceKind::Storage);
    }
}
