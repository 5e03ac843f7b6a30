//! Decayed usage histograms
//!
//! A [`HistogramCheckpoint`] summarizes the usage history of one resource of
//! one container. It is the unit of persistence for the checkpoint store.

mod checkpoint;
mod options;

pub use checkpoint::{HistogramCheckpoint, WEIGHT_TOLERANCE};
pub use options::{
    HistogramOptions, CPU_FIRST_BUCKET_MILLICORES, CPU_MAX_MILLICORES, DEFAULT_BUCKET_RATIO,
    MEMORY_FIRST_BUCKET_BYTES, MEMORY_MAX_BYTES,
};
