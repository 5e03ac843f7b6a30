//! Observability for the resource scaler
//!
//! Provides:
//! - Prometheus metrics (evaluation latency, samples, decisions, operations, checkpoints)
//! - Named structured log events with tracing

use crate::coordinator::{OperationPhase, ScaleOperation};
use crate::models::{ResourceKind, TargetRef};
use crate::recommender::Recommendation;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for evaluation latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ScalerMetricsInner> = OnceLock::new();

struct ScalerMetricsInner {
    evaluation_latency_seconds: Histogram,
    targets_tracked: IntGauge,
    histograms_tracked: IntGauge,
    samples_observed: IntCounter,
    invalid_samples: IntCounter,
    decisions_submitted: IntCounterVec,
    operations_finished: IntCounterVec,
    operations_in_flight: IntGauge,
    checkpoints_saved: IntCounter,
    checkpoint_save_errors: IntCounter,
}

impl ScalerMetricsInner {
    fn new() -> Self {
        Self {
            evaluation_latency_seconds: register_histogram!(
                "resource_scaler_evaluation_latency_seconds",
                "Time spent evaluating one target",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register evaluation_latency_seconds"),

            targets_tracked: register_int_gauge!(
                "resource_scaler_targets_tracked",
                "Number of scaling targets under management"
            )
            .expect("Failed to register targets_tracked"),

            histograms_tracked: register_int_gauge!(
                "resource_scaler_histograms_tracked",
                "Number of live usage histograms"
            )
            .expect("Failed to register histograms_tracked"),

            samples_observed: register_int_counter!(
                "resource_scaler_samples_observed_total",
                "Usage samples folded into histograms"
            )
            .expect("Failed to register samples_observed"),

            invalid_samples: register_int_counter!(
                "resource_scaler_invalid_samples_total",
                "Usage samples dropped as invalid"
            )
            .expect("Failed to register invalid_samples"),

            decisions_submitted: register_int_counter_vec!(
                "resource_scaler_decisions_submitted_total",
                "Scale decisions accepted by the coordinator",
                &["kind"]
            )
            .expect("Failed to register decisions_submitted"),

            operations_finished: register_int_counter_vec!(
                "resource_scaler_operations_finished_total",
                "Scale operations that reached a terminal phase",
                &["kind", "phase"]
            )
            .expect("Failed to register operations_finished"),

            operations_in_flight: register_int_gauge!(
                "resource_scaler_operations_in_flight",
                "Scale operations not yet in a terminal phase"
            )
            .expect("Failed to register operations_in_flight"),

            checkpoints_saved: register_int_counter!(
                "resource_scaler_checkpoints_saved_total",
                "Histogram checkpoints written to the store"
            )
            .expect("Failed to register checkpoints_saved"),

            checkpoint_save_errors: register_int_counter!(
                "resource_scaler_checkpoint_save_errors_total",
                "Histogram checkpoints that failed to persist"
            )
            .expect("Failed to register checkpoint_save_errors"),
        }
    }
}

/// Scaler metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct ScalerMetrics {
    _private: (),
}

impl Default for ScalerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ScalerMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ScalerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ScalerMetricsInner {
        GLOBAL_METRICS.get_or_init(ScalerMetricsInner::new)
    }

    pub fn observe_evaluation_latency(&self, duration_secs: f64) {
        self.inner().evaluation_latency_seconds.observe(duration_secs);
    }

    pub fn set_targets_tracked(&self, count: usize) {
        self.inner().targets_tracked.set(count as i64);
    }

    pub fn set_histograms_tracked(&self, count: usize) {
        self.inner().histograms_tracked.set(count as i64);
    }

    pub fn inc_samples_observed(&self) {
        self.inner().samples_observed.inc();
    }

    pub fn inc_invalid_samples(&self) {
        self.inner().invalid_samples.inc();
    }

    pub fn inc_decisions_submitted(&self, kind: ResourceKind) {
        self.inner()
            .decisions_submitted
            .with_label_values(&[&kind.to_string()])
            .inc();
    }

    pub fn inc_operations_finished(&self, kind: ResourceKind, phase: OperationPhase) {
        self.inner()
            .operations_finished
            .with_label_values(&[&kind.to_string(), phase.as_str()])
            .inc();
    }

    pub fn set_operations_in_flight(&self, count: usize) {
        self.inner().operations_in_flight.set(count as i64);
    }

    pub fn inc_checkpoints_saved(&self) {
        self.inner().checkpoints_saved.inc();
    }

    pub fn inc_checkpoint_save_errors(&self) {
        self.inner().checkpoint_save_errors.inc();
    }
}

/// Structured logger for scaler events
///
/// Every event carries a stable `event` field so log pipelines can filter
/// on it.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn log_recommendation(&self, recommendation: &Recommendation) {
        info!(
            event = "recommendation_computed",
            instance = %self.instance,
            target = %recommendation.target_ref,
            container = %recommendation.container,
            cpu_millicores = ?recommendation.target.cpu_millicores,
            memory_bytes = ?recommendation.target.memory_bytes,
            cpu_upper_millicores = ?recommendation.upper_bound.cpu_millicores,
            memory_upper_bytes = ?recommendation.upper_bound.memory_bytes,
            in_memory_size_bytes = ?recommendation.in_memory_size_target,
            confidence = recommendation.confidence,
            "Computed resource recommendation"
        );
    }

    pub fn log_decision_submitted(&self, operation: &ScaleOperation) {
        info!(
            event = "scale_decision_submitted",
            instance = %self.instance,
            operation_id = %operation.id,
            target = %operation.target(),
            kind = %operation.kind(),
            reason = %operation.decision.reason,
            attempts = operation.attempts,
            "Scale decision submitted"
        );
    }

    pub fn log_operation_finished(&self, operation: &ScaleOperation) {
        match operation.phase {
            OperationPhase::Succeeded => {
                info!(
                    event = "scale_operation_finished",
                    instance = %self.instance,
                    operation_id = %operation.id,
                    target = %operation.target(),
                    kind = %operation.kind(),
                    phase = operation.phase.as_str(),
                    "Scale operation succeeded"
                );
            }
            _ => {
                warn!(
                    event = "scale_operation_finished",
                    instance = %self.instance,
                    operation_id = %operation.id,
                    target = %operation.target(),
                    kind = %operation.kind(),
                    phase = operation.phase.as_str(),
                    failure_reason = ?operation.failure_reason,
                    error = ?operation.last_error,
                    attempts = operation.attempts,
                    "Scale operation failed"
                );
            }
        }
    }

    pub fn log_checkpoints_persisted(&self, saved: usize, failed: usize) {
        if failed == 0 {
            info!(
                event = "checkpoint_persisted",
                instance = %self.instance,
                saved = saved,
                "Persisted histogram checkpoints"
            );
        } else {
            warn!(
                event = "checkpoint_persisted",
                instance = %self.instance,
                saved = saved,
                failed = failed,
                "Some histogram checkpoints failed to persist, retrying next interval"
            );
        }
    }

    pub fn log_target_removed(&self, target: &TargetRef, cancelled: usize, checkpoints: usize) {
        info!(
            event = "target_removed",
            instance = %self.instance,
            target = %target,
            cancelled_operations = cancelled,
            deleted_checkpoints = checkpoints,
            "Scaling target removed"
        );
    }

    pub fn log_startup(&self, version: &str, targets: usize) {
        info!(
            event = "scaler_started",
            instance = %self.instance,
            scaler_version = %version,
            targets = targets,
            "Resource scaler started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "scaler_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Resource scaler shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaler_metrics_handles_share_registry() {
        let metrics = ScalerMetrics::new();
        let other = metrics.clone();

        metrics.observe_evaluation_latency(0.002);
        metrics.set_targets_tracked(3);
        metrics.inc_decisions_submitted(ResourceKind::Storage);
        other.inc_operations_finished(ResourceKind::Compute, OperationPhase::Failed);

        let families = prometheus::gather();
        let names: Vec<&str> = families.iter().map(|family| family.get_name()).collect();
        assert!(names.contains(&"resource_scaler_targets_tracked"));
        assert!(names.contains(&"resource_scaler_operations_finished_total"));
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("scaler-0");
        assert_eq!(logger.instance, "scaler-0");
    }
}
