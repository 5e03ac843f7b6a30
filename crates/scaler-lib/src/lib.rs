//! Scaler library for database workload right-sizing
//!
//! This crate provides the core functionality for:
//! - Decayed usage histograms and resource recommendations
//! - Scale triggers for compute, storage and in-memory engines
//! - Coordination of scale operations with at most one in flight per target
//! - Histogram checkpoint persistence
//! - Health checks and observability

pub mod controller;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod histogram;
pub mod models;
pub mod observability;
pub mod policy;
pub mod quantity;
pub mod recommender;
pub mod store;
pub mod target;
pub mod trigger;

pub use controller::{ControllerConfig, EvaluationReport, ScalingController};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{ScalerMetrics, StructuredLogger};
