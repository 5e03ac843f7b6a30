//! Scale triggers
//!
//! Pure functions deciding whether a recommendation or a usage reading
//! differs enough from the current allocation to act on.

mod compute;
mod storage;

pub use compute::{evaluate_compute, scale_requirements, ComputeEvaluation, ResourceChange};
pub use storage::{
    evaluate_in_memory, evaluate_storage, storage_target_capacity, InMemoryEvaluation,
    StorageEvaluation,
};
