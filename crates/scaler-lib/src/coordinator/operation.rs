//! Scale decisions and the operations derived from them

use crate::models::{ContainerResources, ResourceKind, TargetRef};
use crate::policy::{ApplyOption, ExpansionMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Identifier of a scale operation, unique per coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// Lifecycle phase of a scale operation.
///
/// `Pending -> Submitted -> InProgress -> {Succeeded, Failed}`. Any
/// non-terminal phase can also fail on cancellation or timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationPhase {
    Pending,
    Submitted,
    InProgress,
    Succeeded,
    Failed,
}

impl OperationPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationPhase::Succeeded | OperationPhase::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationPhase::Pending => "pending",
            OperationPhase::Submitted => "submitted",
            OperationPhase::InProgress => "in_progress",
            OperationPhase::Succeeded => "succeeded",
            OperationPhase::Failed => "failed",
        }
    }
}

/// Why an operation ended in `Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    ExecutorFailure,
    Timeout,
    TargetDeleted,
}

/// Proposed change carried by a decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Proposal {
    /// New requirements per container
    Compute(ContainerResources),
    /// New volume capacity
    Storage { capacity_bytes: u64, mode: ExpansionMode },
}

impl Proposal {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Proposal::Compute(_) => ResourceKind::Compute,
            Proposal::Storage { .. } => ResourceKind::Storage,
        }
    }
}

/// Output of a positive trigger evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleDecision {
    pub target: TargetRef,
    pub kind: ResourceKind,
    pub proposal: Proposal,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl ScaleDecision {
    pub fn new(target: TargetRef, proposal: Proposal, reason: impl Into<String>) -> Self {
        Self {
            target,
            kind: proposal.kind(),
            proposal,
            reason: reason.into(),
            created_at: Utc::now(),
        }
    }
}

/// Executor-assigned reference to the work carrying out an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationHandle(pub String);

impl fmt::Display for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The single in-flight unit of work for one (target, kind) slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleOperation {
    pub id: OperationId,
    pub decision: ScaleDecision,
    pub phase: OperationPhase,
    pub apply_option: ApplyOption,
    #[serde(with = "crate::policy::duration_secs")]
    pub timeout: Duration,
    /// Failed attempts of this proposal, including earlier operations
    pub attempts: u32,
    pub last_error: Option<String>,
    pub failure_reason: Option<FailureReason>,
    pub handle: Option<OperationHandle>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScaleOperation {
    pub fn target(&self) -> &TargetRef {
        &self.decision.target
    }

    pub fn kind(&self) -> ResourceKind {
        self.decision.kind
    }

    /// Whether the operation outlived its timeout at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let Ok(timeout) = chrono::Duration::from_std(self.timeout) else {
            return false;
        };
        !self.phase.is_terminal() && now - self.created_at >= timeout
    }
}

/// Executor feedback for a submitted operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    InProgress,
    Succeeded,
    Failed(String),
}

/// Asynchronous notification from the executor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionEvent {
    pub operation_id: OperationId,
    pub outcome: ExecutionOutcome,
}
