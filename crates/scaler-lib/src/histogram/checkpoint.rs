//! Decayed weighted-bucket histogram
//!
//! Samples are added to sparse exponential buckets. Before each new sample
//! every existing weight is multiplied by `2^(-Δt / half_life)`, so recent
//! usage dominates percentile queries.

use super::HistogramOptions;
use crate::error::HistogramError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f64::consts::LN_2;
use std::time::Duration;

/// Buckets decayed below this weight are dropped
const MIN_BUCKET_WEIGHT: f64 = 1e-9;

/// Samples per day at which confidence saturates for sample count (one per minute)
const SAMPLES_PER_DAY: f64 = 24.0 * 60.0;

/// Tolerance used when checking `total_weight` against the bucket sum
pub const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Persistable decayed histogram for one (target, container, resource) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramCheckpoint {
    options: HistogramOptions,
    half_life: Duration,
    reference_timestamp: Option<DateTime<Utc>>,
    bucket_weights: BTreeMap<usize, f64>,
    total_weight: f64,
    first_sample_start: Option<DateTime<Utc>>,
    last_sample_start: Option<DateTime<Utc>>,
    total_samples_count: u64,
}

impl HistogramCheckpoint {
    /// Create an empty histogram
    pub fn new(options: HistogramOptions, half_life: Duration) -> Self {
        Self {
            options,
            half_life,
            reference_timestamp: None,
            bucket_weights: BTreeMap::new(),
            total_weight: 0.0,
            first_sample_start: None,
            last_sample_start: None,
            total_samples_count: 0,
        }
    }

    /// Add a weighted sample observed at `timestamp`.
    ///
    /// Existing weights are decayed to `timestamp` first. A sample older than
    /// the current reference is decayed itself instead, so history is never
    /// re-weighted upward.
    pub fn add_sample(
        &mut self,
        value: f64,
        weight: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<(), HistogramError> {
        if !value.is_finite() || value < 0.0 {
            return Err(HistogramError::InvalidSample(format!("value {} is negative or not finite", value)));
        }
        if !weight.is_finite() || weight <= 0.0 {
            return Err(HistogramError::InvalidSample(format!("weight {} must be positive", weight)));
        }

        let mut weight = weight;
        match self.reference_timestamp {
            Some(reference) if timestamp < reference => {
                weight *= self.decay_factor(reference - timestamp);
            }
            _ => self.decay_to(timestamp),
        }

        let index = self.options.bucket_index(value);
        *self.bucket_weights.entry(index).or_insert(0.0) += weight;
        self.total_weight += weight;

        self.first_sample_start = Some(match self.first_sample_start {
            Some(first) => first.min(timestamp),
            None => timestamp,
        });
        self.last_sample_start = Some(match self.last_sample_start {
            Some(last) => last.max(timestamp),
            None => timestamp,
        });
        self.total_samples_count += 1;

        Ok(())
    }

    /// Value below which `p` (in `[0, 1]`) of the decayed weight lies.
    ///
    /// Reports the midpoint of the bucket where the cumulative weight first
    /// reaches `p`.
    pub fn percentile(&self, p: f64) -> Result<f64, HistogramError> {
        if self.is_empty() {
            return Err(HistogramError::NoData);
        }

        let threshold = p.clamp(0.0, 1.0) * self.total_weight;
        let mut cumulative = 0.0;
        let mut last_index = 0;

        for (&index, &weight) in &self.bucket_weights {
            cumulative += weight;
            last_index = index;
            if cumulative >= threshold {
                return Ok(self.options.bucket_value(index));
            }
        }

        Ok(self.options.bucket_value(last_index))
    }

    /// Fold `other` into this histogram.
    ///
    /// Both sides are aligned on the later reference timestamp before their
    /// weights are summed, so a stale checkpoint does not outweigh live data.
    pub fn merge(&mut self, other: &HistogramCheckpoint) -> Result<(), HistogramError> {
        if self.options != other.options || self.half_life != other.half_life {
            return Err(HistogramError::IncompatibleHistograms);
        }
        if other.is_empty() {
            return Ok(());
        }

        let mut other = other.clone();
        let aligned = match (self.reference_timestamp, other.reference_timestamp) {
            (Some(a), Some(b)) => a.max(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => return Ok(()),
        };
        self.decay_to(aligned);
        other.decay_to(aligned);

        for (index, weight) in other.bucket_weights {
            *self.bucket_weights.entry(index).or_insert(0.0) += weight;
        }
        self.total_weight = self.bucket_weights.values().sum();

        self.first_sample_start = min_opt(self.first_sample_start, other.first_sample_start);
        self.last_sample_start = max_opt(self.last_sample_start, other.last_sample_start);
        self.total_samples_count += other.total_samples_count;

        Ok(())
    }

    /// Confidence in the histogram, in days of evidence.
    ///
    /// The smaller of the observed lifespan in days and the sample count
    /// divided by one sample per minute for a day.
    pub fn confidence(&self) -> f64 {
        let (Some(first), Some(last)) = (self.first_sample_start, self.last_sample_start) else {
            return 0.0;
        };
        let lifespan_days = (last - first).num_seconds().max(0) as f64 / 86_400.0;
        let sample_days = self.total_samples_count as f64 / SAMPLES_PER_DAY;
        lifespan_days.min(sample_days)
    }

    pub fn is_empty(&self) -> bool {
        self.bucket_weights.is_empty() || self.total_weight <= 0.0
    }

    pub fn options(&self) -> &HistogramOptions {
        &self.options
    }

    pub fn half_life(&self) -> Duration {
        self.half_life
    }

    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    pub fn reference_timestamp(&self) -> Option<DateTime<Utc>> {
        self.reference_timestamp
    }

    pub fn first_sample_start(&self) -> Option<DateTime<Utc>> {
        self.first_sample_start
    }

    pub fn last_sample_start(&self) -> Option<DateTime<Utc>> {
        self.last_sample_start
    }

    pub fn total_samples_count(&self) -> u64 {
        self.total_samples_count
    }

    /// Non-zero bucket weights in increasing bucket order
    pub fn bucket_weights(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.bucket_weights.iter().map(|(&i, &w)| (i, w))
    }

    /// Checks `total_weight == sum(bucket_weights)` within tolerance
    pub fn is_consistent(&self) -> bool {
        let sum: f64 = self.bucket_weights.values().sum();
        (sum - self.total_weight).abs() <= WEIGHT_TOLERANCE * self.total_weight.max(1.0)
    }

    fn decay_factor(&self, elapsed: chrono::Duration) -> f64 {
        let half_life = self.half_life.as_secs_f64();
        if half_life <= 0.0 {
            return 1.0;
        }
        let elapsed = elapsed.num_milliseconds().max(0) as f64 / 1000.0;
        (-elapsed / half_life * LN_2).exp()
    }

    fn decay_to(&mut self, timestamp: DateTime<Utc>) {
        let Some(reference) = self.reference_timestamp else {
            self.reference_timestamp = Some(timestamp);
            return;
        };
        if timestamp <= reference {
            return;
        }

        let factor = self.decay_factor(timestamp - reference);
        for weight in self.bucket_weights.values_mut() {
            *weight *= factor;
        }
        self.bucket_weights.retain(|_, w| *w >= MIN_BUCKET_WEIGHT);
        self.total_weight = self.bucket_weights.values().sum();
        self.reference_timestamp = Some(timestamp);
    }
}

fn min_opt(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn max_opt(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}
