//! Scale decision coordinator
//!
//! Owns every scale operation and guarantees that at most one non-terminal
//! operation exists per (target, resource kind) slot. The slot check and
//! the creation of the operation happen under the slot's map entry, so
//! concurrent submissions for the same slot cannot both succeed.

use super::operation::{
    ExecutionEvent, ExecutionOutcome, FailureReason, OperationHandle, OperationId, OperationPhase,
    Proposal, ScaleDecision, ScaleOperation,
};
use super::{ReadinessOracle, ScaleExecutor};
use crate::error::CoordinatorError;
use crate::models::{ResourceKind, TargetRef};
use crate::policy::{ApplyOption, OpsRequestOptions};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Default bound on oracle and executor calls
pub const DEFAULT_EXTERNAL_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of finished operations kept for status queries
pub const DEFAULT_HISTORY_LIMIT: usize = 256;

/// Configuration for the coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Upper bound on a single readiness check or executor call
    pub external_call_timeout: Duration,
    /// Finished operations retained before the oldest are dropped
    pub history_limit: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            external_call_timeout: DEFAULT_EXTERNAL_CALL_TIMEOUT,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

type SlotKey = (TargetRef, ResourceKind);

#[derive(Debug, Default)]
struct Slot {
    in_flight: Option<OperationId>,
    last_failed_proposal: Option<Proposal>,
    consecutive_failures: u32,
}

/// State machine turning scale decisions into tracked operations
pub struct ScaleDecisionCoordinator {
    config: CoordinatorConfig,
    next_id: AtomicU64,
    operations: DashMap<OperationId, ScaleOperation>,
    slots: DashMap<SlotKey, Slot>,
}

impl ScaleDecisionCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            next_id: AtomicU64::new(1),
            operations: DashMap::new(),
            slots: DashMap::new(),
        }
    }

    /// Register a decision as a new `Pending` operation.
    ///
    /// Fails with `AlreadyInFlight` while the slot holds a non-terminal
    /// operation, and with `AttemptsExhausted` when this exact proposal has
    /// already failed `max_attempts` times in a row.
    pub fn submit(
        &self,
        decision: ScaleDecision,
        ops: &OpsRequestOptions,
    ) -> Result<OperationId, CoordinatorError> {
        let key = (decision.target.clone(), decision.kind);
        let mut slot = self.slots.entry(key).or_default();

        if let Some(operation_id) = slot.in_flight {
            return Err(CoordinatorError::AlreadyInFlight {
                target: decision.target,
                kind: decision.kind,
                operation_id,
            });
        }

        let repeated = slot.last_failed_proposal.as_ref() == Some(&decision.proposal);
        if repeated && slot.consecutive_failures >= ops.max_attempts {
            return Err(CoordinatorError::AttemptsExhausted {
                target: decision.target,
                kind: decision.kind,
                attempts: slot.consecutive_failures,
            });
        }

        let id = OperationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let now = Utc::now();
        info!(
            operation_id = %id,
            target = %decision.target,
            kind = %decision.kind,
            reason = %decision.reason,
            "Submitted scale operation"
        );

        self.operations.insert(
            id,
            ScaleOperation {
                id,
                decision,
                phase: OperationPhase::Pending,
                apply_option: ops.apply,
                timeout: ops.timeout,
                attempts: if repeated { slot.consecutive_failures } else { 0 },
                last_error: None,
                failure_reason: None,
                handle: None,
                created_at: now,
                updated_at: now,
            },
        );
        slot.in_flight = Some(id);

        Ok(id)
    }

    /// Pass the apply gate and hand a `Pending` operation to the executor.
    ///
    /// With `IfReady` a target that is not ready (or whose readiness check
    /// times out) leaves the operation `Pending` for the next tick. An
    /// executor error marks the operation `Failed`.
    pub async fn apply(
        &self,
        id: OperationId,
        oracle: &dyn ReadinessOracle,
        executor: &dyn ScaleExecutor,
    ) -> Result<OperationPhase, CoordinatorError> {
        let (target, apply_option) = {
            let operation = self.operations.get(&id).ok_or(CoordinatorError::NotFound(id))?;
            if operation.phase != OperationPhase::Pending {
                return Err(CoordinatorError::InvalidTransition {
                    id,
                    from: operation.phase,
                    to: OperationPhase::Submitted,
                });
            }
            (operation.target().clone(), operation.apply_option)
        };

        if apply_option == ApplyOption::IfReady {
            match timeout(self.config.external_call_timeout, oracle.is_ready(&target)).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(operation_id = %id, target = %target, "Target not ready, operation stays pending");
                    return Err(CoordinatorError::TargetNotReady(target));
                }
                Err(_) => {
                    warn!(operation_id = %id, target = %target, "Readiness check timed out");
                    return Err(CoordinatorError::TargetNotReady(target));
                }
            }
        }

        let snapshot = {
            let mut operation = self.operations.get_mut(&id).ok_or(CoordinatorError::NotFound(id))?;
            // The operation may have been cancelled while the oracle was consulted
            if operation.phase != OperationPhase::Pending {
                return Err(CoordinatorError::InvalidTransition {
                    id,
                    from: operation.phase,
                    to: OperationPhase::Submitted,
                });
            }
            operation.phase = OperationPhase::Submitted;
            operation.updated_at = Utc::now();
            operation.clone()
        };

        let message = match timeout(self.config.external_call_timeout, executor.execute(&snapshot)).await {
            Ok(Ok(handle)) => {
                self.attach_handle(id, handle);
                return Ok(OperationPhase::Submitted);
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!(
                "executor call timed out after {:?}",
                self.config.external_call_timeout
            ),
        };

        warn!(operation_id = %id, target = %target, error = %message, "Executor rejected scale operation");
        self.finish(
            id,
            OperationPhase::Failed,
            Some(FailureReason::ExecutorFailure),
            Some(message.clone()),
            &[OperationPhase::Submitted, OperationPhase::InProgress],
        )?;
        Err(CoordinatorError::Executor(message))
    }

    /// `Submitted -> InProgress`; repeated reports are accepted
    pub fn mark_in_progress(&self, id: OperationId) -> Result<OperationPhase, CoordinatorError> {
        let mut operation = self.operations.get_mut(&id).ok_or(CoordinatorError::NotFound(id))?;
        match operation.phase {
            OperationPhase::Submitted | OperationPhase::InProgress => {
                operation.phase = OperationPhase::InProgress;
                operation.updated_at = Utc::now();
                Ok(OperationPhase::InProgress)
            }
            from => Err(CoordinatorError::InvalidTransition {
                id,
                from,
                to: OperationPhase::InProgress,
            }),
        }
    }

    /// Terminal success; frees the slot and clears its failure history
    pub fn mark_succeeded(&self, id: OperationId) -> Result<OperationPhase, CoordinatorError> {
        self.finish(
            id,
            OperationPhase::Succeeded,
            None,
            None,
            &[OperationPhase::Submitted, OperationPhase::InProgress],
        )
    }

    /// Terminal failure reported by the executor.
    ///
    /// Records the error, bumps the attempt count and frees the slot. The
    /// coordinator never retries; the next evaluation decides afresh.
    pub fn mark_failed(
        &self,
        id: OperationId,
        error: impl Into<String>,
    ) -> Result<OperationPhase, CoordinatorError> {
        self.finish(
            id,
            OperationPhase::Failed,
            Some(FailureReason::ExecutorFailure),
            Some(error.into()),
            &[OperationPhase::Submitted, OperationPhase::InProgress],
        )
    }

    /// Route executor feedback to the matching transition
    pub fn apply_event(&self, event: ExecutionEvent) -> Result<OperationPhase, CoordinatorError> {
        match event.outcome {
            ExecutionOutcome::InProgress => self.mark_in_progress(event.operation_id),
            ExecutionOutcome::Succeeded => self.mark_succeeded(event.operation_id),
            ExecutionOutcome::Failed(error) => self.mark_failed(event.operation_id, error),
        }
    }

    /// Fail every in-flight operation of a deleted target and forget its slots
    pub fn cancel_target(&self, target: &TargetRef) -> Vec<OperationId> {
        let mut cancelled = Vec::new();
        for kind in [ResourceKind::Compute, ResourceKind::Storage] {
            let in_flight = self
                .slots
                .get(&(target.clone(), kind))
                .and_then(|slot| slot.in_flight);
            if let Some(id) = in_flight {
                if self
                    .finish(
                        id,
                        OperationPhase::Failed,
                        Some(FailureReason::TargetDeleted),
                        Some(format!("target {} deleted", target)),
                        NON_TERMINAL,
                    )
                    .is_ok()
                {
                    cancelled.push(id);
                }
            }
            self.slots.remove(&(target.clone(), kind));
        }

        if !cancelled.is_empty() {
            info!(target = %target, cancelled = cancelled.len(), "Cancelled scale operations of deleted target");
        }
        cancelled
    }

    /// Fail operations that outlived their timeout at `now`, then trim history
    pub fn expire_stale(&self, now: DateTime<Utc>) -> Vec<OperationId> {
        let expired: Vec<(OperationId, std::time::Duration)> = self
            .operations
            .iter()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| (entry.id, entry.timeout))
            .collect();

        let mut failed = Vec::new();
        for (id, limit) in expired {
            let result = self.finish(
                id,
                OperationPhase::Failed,
                Some(FailureReason::Timeout),
                Some(format!("operation did not finish within {:?}", limit)),
                NON_TERMINAL,
            );
            if result.is_ok() {
                warn!(operation_id = %id, "Scale operation timed out");
                failed.push(id);
            }
        }

        self.prune_history();
        failed
    }

    pub fn operation(&self, id: OperationId) -> Option<ScaleOperation> {
        self.operations.get(&id).map(|entry| entry.clone())
    }

    /// All tracked operations, oldest first
    pub fn operations(&self) -> Vec<ScaleOperation> {
        let mut operations: Vec<ScaleOperation> =
            self.operations.iter().map(|entry| entry.clone()).collect();
        operations.sort_by_key(|operation| operation.id);
        operations
    }

    /// Operations of one target, oldest first
    pub fn status(&self, target: &TargetRef) -> Vec<ScaleOperation> {
        let mut operations: Vec<ScaleOperation> = self
            .operations
            .iter()
            .filter(|entry| entry.target() == target)
            .map(|entry| entry.clone())
            .collect();
        operations.sort_by_key(|operation| operation.id);
        operations
    }

    /// Non-terminal operation occupying a slot, if any
    pub fn in_flight(&self, target: &TargetRef, kind: ResourceKind) -> Option<OperationId> {
        self.slots
            .get(&(target.clone(), kind))
            .and_then(|slot| slot.in_flight)
    }

    /// Number of non-terminal operations
    pub fn in_flight_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.in_flight.is_some()).count()
    }

    fn attach_handle(&self, id: OperationId, handle: OperationHandle) {
        if let Some(mut operation) = self.operations.get_mut(&id) {
            debug!(operation_id = %id, handle = %handle, "Executor accepted scale operation");
            operation.handle = Some(handle);
        }
    }

    /// Move an operation to a terminal phase and release its slot.
    ///
    /// The operation entry is released before the slot is touched; `submit`
    /// takes the two locks in the opposite order.
    fn finish(
        &self,
        id: OperationId,
        to: OperationPhase,
        reason: Option<FailureReason>,
        error: Option<String>,
        allowed_from: &[OperationPhase],
    ) -> Result<OperationPhase, CoordinatorError> {
        let (key, proposal, attempts) = {
            let mut operation = self.operations.get_mut(&id).ok_or(CoordinatorError::NotFound(id))?;
            if !allowed_from.contains(&operation.phase) {
                return Err(CoordinatorError::InvalidTransition {
                    id,
                    from: operation.phase,
                    to,
                });
            }

            operation.phase = to;
            operation.updated_at = Utc::now();
            if to == OperationPhase::Failed {
                operation.attempts += 1;
                operation.last_error = error;
                operation.failure_reason = reason;
            }
            (
                (operation.target().clone(), operation.kind()),
                operation.decision.proposal.clone(),
                operation.attempts,
            )
        };

        if let Some(mut slot) = self.slots.get_mut(&key) {
            if slot.in_flight == Some(id) {
                slot.in_flight = None;
            }
            match (to, reason) {
                (OperationPhase::Succeeded, _) => {
                    slot.consecutive_failures = 0;
                    slot.last_failed_proposal = None;
                }
                (OperationPhase::Failed, Some(FailureReason::TargetDeleted)) => {}
                (OperationPhase::Failed, _) => {
                    slot.consecutive_failures = attempts;
                    slot.last_failed_proposal = Some(proposal);
                }
                _ => {}
            }
        }

        info!(operation_id = %id, phase = to.as_str(), attempts, "Scale operation finished");
        Ok(to)
    }

    fn prune_history(&self) {
        let mut finished: Vec<OperationId> = self
            .operations
            .iter()
            .filter(|entry| entry.phase.is_terminal())
            .map(|entry| entry.id)
            .collect();
        if finished.len() <= self.config.history_limit {
            return;
        }
        finished.sort();
        let excess = finished.len() - self.config.history_limit;
        for id in finished.into_iter().take(excess) {
            self.operations.remove(&id);
        }
    }
}

impl Default for ScaleDecisionCoordinator {
    fn default() -> Self {
        Self::new(CoordinatorConfig::default())
    }
}

const NON_TERMINAL: &[OperationPhase] = &[
    OperationPhase::Pending,
    OperationPhase::Submitted,
    OperationPhase::InProgress,
];
