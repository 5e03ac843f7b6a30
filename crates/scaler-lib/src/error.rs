//! Error types for the scaling engine
//!
//! Every error here is recoverable from the control loop's point of view:
//! it is either dropped with a reason, retried on the next tick, or
//! surfaced as operation status.

use crate::coordinator::{OperationId, OperationPhase};
use crate::models::{ResourceKind, TargetRef};
use thiserror::Error;

/// Errors raised by histogram checkpoints
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HistogramError {
    #[error("invalid sample: {0}")]
    InvalidSample(String),

    #[error("histogram has no data")]
    NoData,

    #[error("histograms use incompatible bucket options or half-life")]
    IncompatibleHistograms,
}

/// Errors raised while computing recommendations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecommendError {
    #[error("insufficient data for container {container} of {target}")]
    InsufficientData { target: TargetRef, container: String },

    #[error(transparent)]
    Histogram(#[from] HistogramError),
}

/// Errors raised by the scale decision coordinator
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoordinatorError {
    #[error("{kind} operation {operation_id} already in flight for {target}")]
    AlreadyInFlight {
        target: TargetRef,
        kind: ResourceKind,
        operation_id: OperationId,
    },

    #[error("target {0} is not ready")]
    TargetNotReady(TargetRef),

    #[error("{kind} proposal for {target} failed {attempts} times, waiting for a fresh recommendation")]
    AttemptsExhausted {
        target: TargetRef,
        kind: ResourceKind,
        attempts: u32,
    },

    #[error("operation {0} not found")]
    NotFound(OperationId),

    #[error("operation {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: OperationId,
        from: OperationPhase,
        to: OperationPhase,
    },

    #[error("executor failure: {0}")]
    Executor(String),
}

/// Errors raised while validating a scaling policy
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolicyError {
    #[error("{field} must be a percentage in (0, 100], got {value}")]
    InvalidPercentage { field: &'static str, value: u32 },

    #[error("invalid scaling rule: {0}")]
    InvalidScalingRule(String),

    #[error(transparent)]
    Quantity(#[from] QuantityError),
}

/// Errors raised while parsing resource quantities
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QuantityError {
    #[error("{0:?} is not a valid quantity")]
    Invalid(String),
}

/// Result type alias for checkpoint store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by checkpoint stores
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("checkpoint io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("checkpoint store timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Errors raised by the scaling controller
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("unknown scaling target {0}")]
    UnknownTarget(TargetRef),

    #[error("target {0} is already registered")]
    DuplicateTarget(TargetRef),

    #[error("snapshot of {target} failed: {message}")]
    Snapshot { target: TargetRef, message: String },

    #[error(transparent)]
    Policy(#[from] PolicyError),
}
