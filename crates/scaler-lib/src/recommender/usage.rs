//! Histogram-backed usage recommender

use super::{Recommendation, RecommenderConfig};
use crate::error::{HistogramError, RecommendError};
use crate::histogram::HistogramCheckpoint;
use crate::models::{CheckpointKey, ResourceList, ResourceName, TargetRef};
use crate::policy::ComputePolicy;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

/// Weight given to every observed sample
const SAMPLE_WEIGHT: f64 = 1.0;

/// Maintains decayed usage histograms and derives recommendations from them
pub struct UsageRecommender {
    config: RecommenderConfig,
    checkpoints: DashMap<CheckpointKey, HistogramCheckpoint>,
}

impl UsageRecommender {
    pub fn new(config: RecommenderConfig) -> Self {
        Self {
            config,
            checkpoints: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RecommenderConfig {
        &self.config
    }

    /// Record one usage observation for a container.
    ///
    /// Feeds both the CPU and the memory histogram. An invalid value leaves
    /// both histograms untouched.
    pub fn observe(
        &self,
        target: &TargetRef,
        container: &str,
        cpu_millicores: f64,
        memory_bytes: f64,
        at: DateTime<Utc>,
    ) -> Result<(), HistogramError> {
        for (resource, value) in [
            (ResourceName::Cpu, cpu_millicores),
            (ResourceName::Memory, memory_bytes),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(HistogramError::InvalidSample(format!(
                    "{} usage {} for {}/{} is negative or not finite",
                    resource, value, target, container
                )));
            }
        }

        for (resource, value) in [
            (ResourceName::Cpu, cpu_millicores),
            (ResourceName::Memory, memory_bytes),
        ] {
            self.checkpoints
                .entry(CheckpointKey::new(target, container, resource))
                .or_insert_with(|| self.empty_checkpoint(resource))
                .add_sample(value, SAMPLE_WEIGHT, at)?;
        }
        Ok(())
    }

    /// Compute the recommendation for one container under `policy`.
    ///
    /// Without new samples, repeated calls return identical results.
    pub fn recommend(
        &self,
        target: &TargetRef,
        container: &str,
        policy: &ComputePolicy,
    ) -> Result<Recommendation, RecommendError> {
        let mut recommended = ResourceList::default();
        let mut lower_bound = ResourceList::default();
        let mut upper_bound = ResourceList::default();
        let mut uncapped = ResourceList::default();
        let mut confidence: Option<f64> = None;
        let mut generated_at: Option<DateTime<Utc>> = None;

        for resource in ResourceName::ALL {
            let key = CheckpointKey::new(target, container, resource);
            let Some(histogram) = self.checkpoints.get(&key) else {
                continue;
            };
            if histogram.is_empty() {
                continue;
            }

            let raw_target = histogram.percentile(self.config.target_percentile)?.ceil() as u64;
            let raw_lower = histogram.percentile(self.config.lower_bound_percentile)?.ceil() as u64;
            let raw_upper = histogram.percentile(self.config.upper_bound_percentile)?.ceil() as u64;

            let min = policy.min_allowed.get(resource);
            let max = policy.max_allowed.get(resource);

            let value = clamp(raw_target, min, max);
            let lower = clamp(raw_lower, min, max).min(value);
            let upper = clamp(raw_upper, min, max).max(value);

            recommended.set(resource, value);
            lower_bound.set(resource, lower);
            upper_bound.set(resource, upper);
            uncapped.set(resource, raw_target);

            let histogram_confidence = histogram.confidence();
            confidence = Some(confidence.map_or(histogram_confidence, |c| c.min(histogram_confidence)));
            generated_at = generated_at.max(histogram.last_sample_start());
        }

        let (Some(confidence), Some(generated_at)) = (confidence, generated_at) else {
            return Err(RecommendError::InsufficientData {
                target: target.clone(),
                container: container.to_string(),
            });
        };

        let in_memory_size_target = match (policy.in_memory_storage, recommended.memory_bytes) {
            (Some(in_memory), Some(memory)) => {
                Some(memory * u64::from(in_memory.usage_threshold_percentage) / 100)
            }
            _ => None,
        };

        debug!(
            target = %target,
            container = %container,
            cpu_millicores = ?recommended.cpu_millicores,
            memory_bytes = ?recommended.memory_bytes,
            confidence,
            "Computed recommendation"
        );

        Ok(Recommendation {
            target_ref: target.clone(),
            container: container.to_string(),
            target: recommended,
            lower_bound,
            upper_bound,
            uncapped_target: uncapped,
            in_memory_size_target,
            confidence,
            generated_at,
        })
    }

    /// Containers of `target` with at least one histogram, sorted by name
    pub fn containers(&self, target: &TargetRef) -> Vec<String> {
        let mut containers: Vec<String> = self
            .checkpoints
            .iter()
            .filter(|entry| &entry.key().target == target)
            .map(|entry| entry.key().container.clone())
            .collect();
        containers.sort();
        containers.dedup();
        containers
    }

    /// Snapshot of every histogram belonging to `target`
    pub fn checkpoints_for(&self, target: &TargetRef) -> Vec<(CheckpointKey, HistogramCheckpoint)> {
        self.checkpoints
            .iter()
            .filter(|entry| &entry.key().target == target)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Fold a persisted checkpoint into live state.
    ///
    /// Checkpoints built with a different bucket scale or half-life than the
    /// current configuration are rejected.
    pub fn restore(
        &self,
        key: CheckpointKey,
        checkpoint: &HistogramCheckpoint,
    ) -> Result<(), HistogramError> {
        let expected = self.empty_checkpoint(key.resource);
        if checkpoint.options() != expected.options() || checkpoint.half_life() != expected.half_life()
        {
            return Err(HistogramError::IncompatibleHistograms);
        }

        self.checkpoints
            .entry(key)
            .or_insert(expected)
            .merge(checkpoint)
    }

    /// Drop every histogram of `target`, returning the removed keys
    pub fn forget_target(&self, target: &TargetRef) -> Vec<CheckpointKey> {
        let keys: Vec<CheckpointKey> = self
            .checkpoints
            .iter()
            .filter(|entry| &entry.key().target == target)
            .map(|entry| entry.key().clone())
            .collect();
        for key in &keys {
            self.checkpoints.remove(key);
        }
        keys
    }

    /// Number of live histograms
    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    fn empty_checkpoint(&self, resource: ResourceName) -> HistogramCheckpoint {
        let options = match resource {
            ResourceName::Cpu => self.config.cpu_histogram,
            ResourceName::Memory => self.config.memory_histogram,
        };
        HistogramCheckpoint::new(options, self.config.half_life)
    }
}

/// Clamp into `[min, max]`; the minimum wins when the bounds cross
fn clamp(value: u64, min: Option<u64>, max: Option<u64>) -> u64 {
    let value = max.map_or(value, |max| value.min(max));
    min.map_or(value, |min| value.max(min))
}
