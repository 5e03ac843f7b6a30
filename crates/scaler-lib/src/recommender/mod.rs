//! Usage-based resource recommendations
//!
//! Keeps one decayed histogram per (target, container, resource) and turns
//! them into per-container recommendations on demand.

mod usage;

pub use usage::UsageRecommender;

use crate::histogram::HistogramOptions;
use crate::models::{ResourceList, TargetRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default decay half-life of usage histograms (24 hours)
pub const DEFAULT_HALF_LIFE: Duration = Duration::from_secs(24 * 60 * 60);

/// Percentile used for the recommended target
pub const DEFAULT_TARGET_PERCENTILE: f64 = 0.5;

/// Percentile used for the lower bound
pub const DEFAULT_LOWER_BOUND_PERCENTILE: f64 = 0.05;

/// Percentile used for the upper bound
pub const DEFAULT_UPPER_BOUND_PERCENTILE: f64 = 0.95;

/// Configuration for the usage recommender
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommenderConfig {
    /// Time after which a sample's weight halves
    #[serde(with = "crate::policy::duration_secs")]
    pub half_life: Duration,
    pub target_percentile: f64,
    pub lower_bound_percentile: f64,
    pub upper_bound_percentile: f64,
    /// Bucket scale for CPU histograms (millicores)
    pub cpu_histogram: HistogramOptions,
    /// Bucket scale for memory histograms (bytes)
    pub memory_histogram: HistogramOptions,
}

impl Default for RecommenderConfig {
    fn default() -> Self {
        Self {
            half_life: DEFAULT_HALF_LIFE,
            target_percentile: DEFAULT_TARGET_PERCENTILE,
            lower_bound_percentile: DEFAULT_LOWER_BOUND_PERCENTILE,
            upper_bound_percentile: DEFAULT_UPPER_BOUND_PERCENTILE,
            cpu_histogram: HistogramOptions::cpu(),
            memory_histogram: HistogramOptions::memory(),
        }
    }
}

impl RecommenderConfig {
    pub fn with_half_life(mut self, half_life: Duration) -> Self {
        self.half_life = half_life;
        self
    }

    pub fn with_percentiles(mut self, lower: f64, target: f64, upper: f64) -> Self {
        self.lower_bound_percentile = lower;
        self.target_percentile = target;
        self.upper_bound_percentile = upper;
        self
    }
}

/// Resource recommendation for one container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub target_ref: TargetRef,
    pub container: String,
    /// Recommended requests, clamped to the policy bounds
    pub target: ResourceList,
    pub lower_bound: ResourceList,
    pub upper_bound: ResourceList,
    /// Recommended requests before clamping
    pub uncapped_target: ResourceList,
    /// Memory handed to an in-memory storage engine, when the target runs one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_memory_size_target: Option<u64>,
    /// Days of evidence behind the recommendation
    pub confidence: f64,
    /// Timestamp of the newest sample the recommendation reflects
    pub generated_at: DateTime<Utc>,
}
