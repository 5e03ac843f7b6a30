//! Scaling control loop
//!
//! Routes usage samples into the recommender, evaluates every target
//! (recommend, trigger, submit, apply) on a fixed period and shortly after
//! its samples arrive, feeds executor events back to the coordinator and
//! persists histogram checkpoints.

mod scaling;


pub use scaling::{EvaluationReport, ScalingController};

use crate::coordinator::{ExecutionEvent, DEFAULT_EXTERNAL_CALL_TIMEOUT, DEFAULT_HISTORY_LIMIT};
use crate::models::UsageSample;
use crate::recommender::RecommenderConfig;
use std::time::Duration;
use tokio::sync::mpsc;

/// Default interval between target evaluations
pub const DEFAULT_EVALUATION_INTERVAL: Duration = Duration::from_secs(60);

/// Default interval between checkpoint flushes
pub const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Default delay between a sample arriving and its target being evaluated
pub const DEFAULT_SAMPLE_DEBOUNCE: Duration = Duration::from_secs(1);

/// Shortest ticker period the controller accepts
pub const MIN_TICK: Duration = Duration::from_millis(1);

/// Configuration for the scaling controller
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub evaluation_interval: Duration,
    pub checkpoint_interval: Duration,
    /// Samples arriving within this window coalesce into one evaluation
    pub sample_debounce: Duration,
    /// Upper bound on snapshot, readiness, executor and store calls
    pub external_call_timeout: Duration,
    /// Finished operations kept for status queries
    pub operation_history: usize,
    /// Capacity of the sample and event channels
    pub channel_capacity: usize,
    pub recommender: RecommenderConfig,
    /// Identifies this instance in structured logs
    pub instance_name: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            evaluation_interval: DEFAULT_EVALUATION_INTERVAL,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            sample_debounce: DEFAULT_SAMPLE_DEBOUNCE,
            external_call_timeout: DEFAULT_EXTERNAL_CALL_TIMEOUT,
            operation_history: DEFAULT_HISTORY_LIMIT,
            channel_capacity: 1024,
            recommender: RecommenderConfig::default(),
            instance_name: "resource-scaler".to_string(),
        }
    }
}

impl ControllerConfig {
    /// Clamp values the runtime cannot accept: zero ticker periods and
    /// zero-capacity channels
    pub fn sanitized(mut self) -> Self {
        self.evaluation_interval = self.evaluation_interval.max(MIN_TICK);
        self.checkpoint_interval = self.checkpoint_interval.max(MIN_TICK);
        self.channel_capacity = self.channel_capacity.max(1);
        self
    }
}

/// Sending side of the controller inputs
#[derive(Debug, Clone)]
pub struct ControllerInputs {
    pub samples: mpsc::Sender<UsageSample>,
    pub events: mpsc::Sender<ExecutionEvent>,
}

/// Receiving side of the controller inputs, consumed by [`ScalingController::run`]
#[derive(Debug)]
pub struct ControllerStreams {
    pub samples: mpsc::Receiver<UsageSample>,
    pub events: mpsc::Receiver<ExecutionEvent>,
}

/// Create the sample and executor-event channels; a zero capacity is raised to one
pub fn channels(capacity: usize) -> (ControllerInputs, ControllerStreams) {
    let capacity = capacity.max(1);
    let (sample_tx, sample_rx) = mpsc::channel(capacity);
    let (event_tx, event_rx) = mpsc::channel(capacity);
    (
        ControllerInputs {
            samples: sample_tx,
            events: event_tx,
        },
        ControllerStreams {
            samples: sample_rx,
            events: event_rx,
        },
    )
}
