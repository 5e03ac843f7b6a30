//! Exponential bucket scale shared by all usage histograms

use serde::{Deserialize, Serialize};

/// Growth ratio between consecutive bucket sizes
pub const DEFAULT_BUCKET_RATIO: f64 = 1.05;

/// Smallest CPU bucket, in millicores
pub const CPU_FIRST_BUCKET_MILLICORES: f64 = 10.0;

/// Largest CPU value tracked, in millicores (1000 cores)
pub const CPU_MAX_MILLICORES: f64 = 1_000_000.0;

/// Smallest memory bucket, in bytes (10MB)
pub const MEMORY_FIRST_BUCKET_BYTES: f64 = 1e7;

/// Largest memory value tracked, in bytes (1TB)
pub const MEMORY_MAX_BYTES: f64 = 1e12;

/// Describes an exponential bucket scale.
///
/// Bucket `i` covers `[start(i), start(i + 1))` where
/// `start(i) = first_bucket_size * (ratio^i - 1) / (ratio - 1)`, so every
/// bucket is `ratio` times wider than the previous one and bucket 0 starts
/// at zero. Values beyond the last bucket land in the last bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistogramOptions {
    pub first_bucket_size: f64,
    pub ratio: f64,
    pub num_buckets: usize,
}

impl HistogramOptions {
    /// Build a scale that covers `[0, max_value]`
    pub fn exponential(max_value: f64, first_bucket_size: f64, ratio: f64) -> Self {
        let first_bucket_size = first_bucket_size.max(f64::MIN_POSITIVE);
        let ratio = ratio.max(1.0 + f64::EPSILON);
        let num_buckets = ((max_value * (ratio - 1.0) / first_bucket_size + 1.0).ln() / ratio.ln())
            .ceil()
            .max(1.0) as usize;

        Self {
            first_bucket_size,
            ratio,
            num_buckets,
        }
    }

    /// Bucket scale for CPU usage in millicores
    pub fn cpu() -> Self {
        Self::exponential(CPU_MAX_MILLICORES, CPU_FIRST_BUCKET_MILLICORES, DEFAULT_BUCKET_RATIO)
    }

    /// Bucket scale for memory usage in bytes
    pub fn memory() -> Self {
        Self::exponential(MEMORY_MAX_BYTES, MEMORY_FIRST_BUCKET_BYTES, DEFAULT_BUCKET_RATIO)
    }

    /// Index of the bucket containing `value`
    pub fn bucket_index(&self, value: f64) -> usize {
        if value <= 0.0 {
            return 0;
        }
        let raw = (value * (self.ratio - 1.0) / self.first_bucket_size + 1.0).ln() / self.ratio.ln();
        let index = raw.floor().max(0.0) as usize;

        // Guard against float rounding at exact bucket boundaries
        let index = if index + 1 < self.num_buckets && value >= self.bucket_start(index + 1) {
            index + 1
        } else if index > 0 && value < self.bucket_start(index) {
            index - 1
        } else {
            index
        };
        index.min(self.num_buckets - 1)
    }

    /// Lower bound of bucket `index`
    pub fn bucket_start(&self, index: usize) -> f64 {
        self.first_bucket_size * (self.ratio.powi(index as i32) - 1.0) / (self.ratio - 1.0)
    }

    /// Value reported for a bucket by percentile queries.
    ///
    /// The midpoint of the bucket; the last bucket is open-ended and reports
    /// its lower bound.
    pub fn bucket_value(&self, index: usize) -> f64 {
        if index + 1 >= self.num_buckets {
            return self.bucket_start(index);
        }
        (self.bucket_start(index) + self.bucket_start(index + 1)) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_zero_starts_at_zero() {
        let options = HistogramOptions::memory();
        assert_eq!(options.bucket_start(0), 0.0);
        assert_eq!(options.bucket_index(0.0), 0);
        assert_eq!(options.bucket_index(MEMORY_FIRST_BUCKET_BYTES / 2.0), 0);
    }

    #[test]
    fn test_bucket_index_contains_value() {
        let options = HistogramOptions::memory();
        for value in [1e7, 3.3e8, 1_073_741_824.0, 2_147_483_648.0, 5e11] {
            let index = options.bucket_index(value);
            assert!(options.bucket_start(index) <= value, "value {} below bucket {}", value, index);
            assert!(options.bucket_start(index + 1) > value, "value {} above bucket {}", value, index);
        }
    }

    #[test]
    fn test_bucket_values_are_monotonic() {
        let options = HistogramOptions::cpu();
        let mut previous = -1.0;
        for index in 0..options.num_buckets {
            let value = options.bucket_value(index);
            assert!(value > previous);
            previous = value;
        }
    }

    #[test]
    fn test_values_beyond_max_land_in_last_bucket() {
        let options = HistogramOptions::cpu();
        assert_eq!(options.bucket_index(CPU_MAX_MILLICORES * 10.0), options.num_buckets - 1);
    }

    #[test]
    fn test_bucket_midpoint_is_close_to_value() {
        let options = HistogramOptions::memory();
        let one_gib = 1_073_741_824.0;
        let reported = options.bucket_value(options.bucket_index(one_gib));
        assert!((reported - one_gib).abs() / one_gib < DEFAULT_BUCKET_RATIO - 1.0);
    }
}
