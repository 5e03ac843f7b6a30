//! Resource scaler daemon
//!
//! Wires the scaling engine to configuration, an executor for statically
//! declared targets, and the HTTP surface.

pub mod api;
pub mod config;
pub mod executor;
