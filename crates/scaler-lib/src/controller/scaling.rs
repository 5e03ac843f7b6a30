//! Scaling controller
//!
//! Work for one target is serialized behind that target's mutex; different
//! targets are evaluated in parallel. Every call that leaves the process
//! (snapshot, readiness, executor, checkpoint store) is bounded by
//! `external_call_timeout`.

use super::{ControllerConfig, ControllerStreams};
use crate::coordinator::{
    CoordinatorConfig, ExecutionEvent, OperationId, OperationPhase, Proposal, ReadinessOracle,
    ScaleDecision, ScaleDecisionCoordinator, ScaleExecutor,
};
use crate::error::{ControllerError, CoordinatorError, RecommendError, StoreError, StoreResult};
use crate::health::{components, HealthRegistry};
use crate::models::{ResourceList, TargetRef, UsageSample};
use crate::observability::{ScalerMetrics, StructuredLogger};
use crate::policy::{ComputePolicy, OpsRequestOptions, ScalingPolicy};
use crate::quantity::format_bytes;
use crate::recommender::{Recommendation, UsageRecommender};
use crate::store::CheckpointStore;
use crate::target::{ScalingTarget, TargetSnapshot};
use crate::trigger::{evaluate_compute, evaluate_in_memory, evaluate_storage, storage_target_capacity};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinSet;
use tokio::time::{self, interval, timeout};
use tracing::{debug, info, warn};

struct TargetEntry {
    target: Arc<dyn ScalingTarget>,
    /// Declared policy with defaults resolved and validated
    policy: ScalingPolicy,
    lock: Mutex<()>,
}

/// What one evaluation of a target did
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    pub target: TargetRef,
    pub recommendations: Vec<Recommendation>,
    /// Operations created by this evaluation
    pub submitted: Vec<OperationId>,
    /// Operations handed to the executor by this evaluation
    pub applied: Vec<OperationId>,
    /// Why nothing happened for a container, resource kind or operation
    pub skipped: Vec<String>,
    #[serde(skip)]
    recommend_failures: usize,
}

impl EvaluationReport {
    fn new(target: TargetRef) -> Self {
        Self {
            target,
            recommendations: Vec::new(),
            submitted: Vec::new(),
            applied: Vec::new(),
            skipped: Vec::new(),
            recommend_failures: 0,
        }
    }
}

/// Drives recommendation, triggering and coordination for all targets
pub struct ScalingController {
    config: ControllerConfig,
    recommender: UsageRecommender,
    coordinator: ScaleDecisionCoordinator,
    store: Arc<dyn CheckpointStore>,
    oracle: Arc<dyn ReadinessOracle>,
    executor: Arc<dyn ScaleExecutor>,
    targets: DashMap<TargetRef, Arc<TargetEntry>>,
    health: HealthRegistry,
    metrics: ScalerMetrics,
    logger: StructuredLogger,
    /// Held for the duration of a checkpoint flush
    persist_lock: Mutex<()>,
}

impl ScalingController {
    pub fn new(
        config: ControllerConfig,
        store: Arc<dyn CheckpointStore>,
        oracle: Arc<dyn ReadinessOracle>,
        executor: Arc<dyn ScaleExecutor>,
        health: HealthRegistry,
    ) -> Self {
        let config = config.sanitized();
        let coordinator = ScaleDecisionCoordinator::new(CoordinatorConfig {
            external_call_timeout: config.external_call_timeout,
            history_limit: config.operation_history,
        });
        Self {
            recommender: UsageRecommender::new(config.recommender.clone()),
            coordinator,
            store,
            oracle,
            executor,
            targets: DashMap::new(),
            health,
            metrics: ScalerMetrics::new(),
            logger: StructuredLogger::new(config.instance_name.clone()),
            persist_lock: Mutex::new(()),
            config,
        }
    }

    pub fn recommender(&self) -> &UsageRecommender {
        &self.recommender
    }

    pub fn coordinator(&self) -> &ScaleDecisionCoordinator {
        &self.coordinator
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    /// Registered targets, sorted
    pub fn targets(&self) -> Vec<TargetRef> {
        let mut targets: Vec<TargetRef> = self.targets.iter().map(|entry| entry.key().clone()).collect();
        targets.sort();
        targets
    }

    /// Register a target; its policy is defaulted and validated once here
    pub fn add_target(&self, target: Arc<dyn ScalingTarget>) -> Result<(), ControllerError> {
        let target_ref = target.target_ref().clone();
        let policy = target
            .policy()
            .with_defaults()
            .for_storage_engine(target.storage_engine());
        policy.validate()?;

        match self.targets.entry(target_ref.clone()) {
            Entry::Occupied(_) => return Err(ControllerError::DuplicateTarget(target_ref)),
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(TargetEntry {
                    target,
                    policy,
                    lock: Mutex::new(()),
                }));
            }
        }

        self.metrics.set_targets_tracked(self.targets.len());
        info!(target = %target_ref, "Registered scaling target");
        Ok(())
    }

    /// Unregister a target: cancel its operations and delete its checkpoints
    pub async fn remove_target(&self, target_ref: &TargetRef) -> Result<(), ControllerError> {
        let (_, entry) = self
            .targets
            .remove(target_ref)
            .ok_or_else(|| ControllerError::UnknownTarget(target_ref.clone()))?;
        let _guard = entry.lock.lock().await;

        let cancelled = self.coordinator.cancel_target(target_ref);
        for id in &cancelled {
            self.record_finished(*id);
        }

        let mut deleted = 0;
        for key in self.recommender.forget_target(target_ref) {
            match self.bounded(self.store.delete(&key)).await {
                Ok(()) => deleted += 1,
                Err(e) => warn!(key = %key, error = %e, "Failed to delete checkpoint"),
            }
        }

        self.metrics.set_targets_tracked(self.targets.len());
        self.logger
            .log_target_removed(target_ref, cancelled.len(), deleted);
        Ok(())
    }

    /// Fold a usage sample into its target's histograms.
    ///
    /// Samples for unknown targets and invalid samples are dropped; returns
    /// whether the sample was recorded.
    pub async fn ingest(&self, sample: UsageSample) -> bool {
        let Ok(entry) = self.entry(&sample.target) else {
            debug!(target = %sample.target, "Dropping sample for unknown target");
            return false;
        };
        let _guard = entry.lock.lock().await;
        if !self.is_registered(&sample.target, &entry) {
            debug!(target = %sample.target, "Dropping sample for removed target");
            return false;
        }

        match self.recommender.observe(
            &sample.target,
            &sample.container,
            sample.cpu_millicores,
            sample.memory_bytes,
            sample.timestamp,
        ) {
            Ok(()) => {
                self.metrics.inc_samples_observed();
                true
            }
            Err(e) => {
                self.metrics.inc_invalid_samples();
                debug!(target = %sample.target, container = %sample.container, error = %e, "Dropping invalid sample");
                false
            }
        }
    }

    /// Current recommendations for every observed container of a target
    pub fn recommendations(&self, target_ref: &TargetRef) -> Result<Vec<Recommendation>, ControllerError> {
        let entry = self.entry(target_ref)?;
        let policy = entry
            .policy
            .compute
            .clone()
            .unwrap_or_else(|| ComputePolicy::default().with_defaults());

        Ok(self
            .recommender
            .containers(target_ref)
            .iter()
            .filter_map(|container| self.recommender.recommend(target_ref, container, &policy).ok())
            .collect())
    }

    /// Run one evaluation: recommend, trigger, submit and apply
    pub async fn evaluate_target(&self, target_ref: &TargetRef) -> Result<EvaluationReport, ControllerError> {
        let started = Instant::now();
        let entry = self.entry(target_ref)?;
        let _guard = entry.lock.lock().await;
        if !self.is_registered(target_ref, &entry) {
            return Err(ControllerError::UnknownTarget(target_ref.clone()));
        }

        let snapshot = match timeout(self.config.external_call_timeout, entry.target.snapshot()).await {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => {
                return Err(ControllerError::Snapshot {
                    target: target_ref.clone(),
                    message: e.to_string(),
                })
            }
            Err(_) => {
                return Err(ControllerError::Snapshot {
                    target: target_ref.clone(),
                    message: format!("timed out after {:?}", self.config.external_call_timeout),
                })
            }
        };

        let mut report = EvaluationReport::new(target_ref.clone());

        // Operations a previous tick left waiting for readiness
        let pending: Vec<OperationId> = self
            .coordinator
            .status(target_ref)
            .into_iter()
            .filter(|operation| operation.phase == OperationPhase::Pending)
            .map(|operation| operation.id)
            .collect();

        let decisions = [
            self.decide_compute(target_ref, &entry.policy, &snapshot, &mut report),
            self.decide_storage(target_ref, &entry.policy, &snapshot, &mut report),
        ];
        for decision in decisions.into_iter().flatten() {
            if let Some(id) = self.submit(decision, &entry.policy.ops, &mut report) {
                report.submitted.push(id);
            }
        }

        if report.recommend_failures > 0 {
            self.health
                .report_failure(
                    components::RECOMMENDER,
                    format!("{} recommendations failed for {}", report.recommend_failures, target_ref),
                )
                .await;
        } else if !report.recommendations.is_empty() {
            self.health.report_success(components::RECOMMENDER).await;
        }

        let to_apply: Vec<OperationId> = pending.into_iter().chain(report.submitted.clone()).collect();
        for id in to_apply {
            self.apply_operation(id, &mut report).await;
        }

        self.metrics
            .observe_evaluation_latency(started.elapsed().as_secs_f64());
        debug!(
            target = %target_ref,
            recommendations = report.recommendations.len(),
            submitted = report.submitted.len(),
            applied = report.applied.len(),
            "Evaluated target"
        );
        Ok(report)
    }

    /// Evaluate every target in parallel, returning how many succeeded
    pub async fn evaluate_all(self: &Arc<Self>) -> usize {
        for id in self.coordinator.expire_stale(Utc::now()) {
            self.record_finished(id);
        }
        self.evaluate_targets(self.targets()).await
    }

    /// Evaluate the given targets in parallel, returning how many succeeded
    pub async fn evaluate_targets(self: &Arc<Self>, targets: Vec<TargetRef>) -> usize {
        let mut set = JoinSet::new();
        for target in targets {
            let this = Arc::clone(self);
            set.spawn(async move {
                let result = this.evaluate_target(&target).await;
                (target, result)
            });
        }

        let mut evaluated = 0;
        let mut failed = 0;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(_))) => evaluated += 1,
                Ok((target, Err(e))) => {
                    failed += 1;
                    warn!(target = %target, error = %e, "Target evaluation failed");
                }
                Err(e) => {
                    failed += 1;
                    warn!(error = %e, "Target evaluation task aborted");
                }
            }
        }

        self.metrics
            .set_operations_in_flight(self.coordinator.in_flight_count());
        self.metrics.set_histograms_tracked(self.recommender.len());
        if failed == 0 {
            self.health.report_success(components::CONTROLLER).await;
        } else {
            self.health
                .report_failure(
                    components::CONTROLLER,
                    format!("{} of {} target evaluations failed", failed, failed + evaluated),
                )
                .await;
        }
        evaluated
    }

    /// Feed executor feedback to the coordinator
    pub async fn handle_event(&self, event: ExecutionEvent) {
        let id = event.operation_id;
        match self.coordinator.apply_event(event) {
            Ok(phase) if phase.is_terminal() => {
                self.record_finished(id);
                self.health.report_success(components::COORDINATOR).await;
            }
            Ok(_) => {}
            Err(e) => warn!(operation_id = %id, error = %e, "Ignoring executor event"),
        }
    }

    /// Save every live histogram, returning (saved, failed).
    ///
    /// Failures are logged and retried on the next interval. Flushes never
    /// overlap; a caller waits for the running one to finish.
    pub async fn persist_checkpoints(&self) -> (usize, usize) {
        let _flush = self.persist_lock.lock().await;
        let mut saved = 0;
        let mut failed = 0;

        for target in self.targets() {
            for (key, checkpoint) in self.recommender.checkpoints_for(&target) {
                match self.bounded(self.store.save(&key, &checkpoint)).await {
                    Ok(()) => {
                        saved += 1;
                        self.metrics.inc_checkpoints_saved();
                    }
                    Err(e) => {
                        failed += 1;
                        self.metrics.inc_checkpoint_save_errors();
                        debug!(key = %key, error = %e, "Failed to save checkpoint");
                    }
                }
            }
        }

        self.logger.log_checkpoints_persisted(saved, failed);
        if failed == 0 {
            self.health.report_success(components::CHECKPOINT_STORE).await;
        } else {
            self.health
                .report_failure(
                    components::CHECKPOINT_STORE,
                    format!("{} checkpoints failed to persist", failed),
                )
                .await;
        }
        (saved, failed)
    }

    /// Load persisted checkpoints of registered targets and mark the
    /// process ready. Returns the number of checkpoints restored.
    pub async fn restore_checkpoints(&self) -> usize {
        let keys = match self.bounded(self.store.list_keys()).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Failed to list checkpoints, starting from empty histograms");
                self.health
                    .report_failure(components::CHECKPOINT_STORE, e.to_string())
                    .await;
                self.health.set_ready(true);
                return 0;
            }
        };

        let mut restored = 0;
        for key in keys {
            if !self.targets.contains_key(&key.target) {
                debug!(key = %key, "Skipping checkpoint of unknown target");
                continue;
            }
            match self.bounded(self.store.load(&key)).await {
                Ok(Some(checkpoint)) => match self.recommender.restore(key.clone(), &checkpoint) {
                    Ok(()) => restored += 1,
                    Err(e) => {
                        warn!(key = %key, error = %e, "Discarding incompatible checkpoint");
                        self.health
                            .report_failure(components::RECOMMENDER, format!("checkpoint {}: {}", key, e))
                            .await;
                    }
                },
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "Failed to load checkpoint"),
            }
        }

        self.metrics.set_histograms_tracked(self.recommender.len());
        info!(restored, "Restored histogram checkpoints");
        self.health.set_ready(true);
        restored
    }

    /// Run the control loop until shutdown, then flush checkpoints
    pub async fn run(self: Arc<Self>, streams: ControllerStreams, mut shutdown: broadcast::Receiver<()>) {
        info!(
            evaluation_interval_secs = self.config.evaluation_interval.as_secs(),
            checkpoint_interval_secs = self.config.checkpoint_interval.as_secs(),
            sample_debounce_ms = self.config.sample_debounce.as_millis() as u64,
            targets = self.targets.len(),
            "Starting scaling controller"
        );

        let ControllerStreams {
            mut samples,
            mut events,
        } = streams;
        let mut samples_open = true;
        let mut events_open = true;

        let mut evaluation_ticker = interval(self.config.evaluation_interval);
        let mut checkpoint_ticker = interval(self.config.checkpoint_interval);
        // The first tick completes immediately; nothing to flush yet
        checkpoint_ticker.tick().await;

        // Targets with samples since their last evaluation
        let mut dirty: HashSet<TargetRef> = HashSet::new();
        let debounce = time::sleep(self.config.sample_debounce);
        tokio::pin!(debounce);

        loop {
            tokio::select! {
                _ = evaluation_ticker.tick() => {
                    dirty.clear();
                    self.evaluate_all().await;
                }
                _ = &mut debounce, if !dirty.is_empty() => {
                    let targets: Vec<TargetRef> = dirty.drain().collect();
                    debug!(targets = targets.len(), "Evaluating targets with new samples");
                    self.evaluate_targets(targets).await;
                }
                _ = checkpoint_ticker.tick() => {
                    self.spawn_persist();
                }
                sample = samples.recv(), if samples_open => match sample {
                    Some(sample) => {
                        let target = sample.target.clone();
                        let idle = dirty.is_empty();
                        if self.ingest(sample).await {
                            dirty.insert(target);
                            if idle {
                                debounce
                                    .as_mut()
                                    .reset(time::Instant::now() + self.config.sample_debounce);
                            }
                        }
                    }
                    None => {
                        debug!("Sample stream closed");
                        samples_open = false;
                    }
                },
                event = events.recv(), if events_open => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        debug!("Executor event stream closed");
                        events_open = false;
                    }
                },
                _ = shutdown.recv() => {
                    info!("Shutting down scaling controller");
                    break;
                }
            }
        }

        let (saved, failed) = self.persist_checkpoints().await;
        info!(saved, failed, "Final checkpoint flush complete");
    }

    /// Persist in the background so a slow store never stalls the loop
    fn spawn_persist(self: &Arc<Self>) {
        if self.persist_lock.try_lock().is_err() {
            debug!("Previous checkpoint flush still running, skipping");
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.persist_checkpoints().await;
        });
    }

    fn entry(&self, target_ref: &TargetRef) -> Result<Arc<TargetEntry>, ControllerError> {
        self.targets
            .get(target_ref)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ControllerError::UnknownTarget(target_ref.clone()))
    }

    /// Whether `entry` is still the registered entry, checked after waiting
    /// on its lock since `remove_target` may have run meanwhile
    fn is_registered(&self, target_ref: &TargetRef, entry: &Arc<TargetEntry>) -> bool {
        self.targets
            .get(target_ref)
            .map_or(false, |current| Arc::ptr_eq(current.value(), entry))
    }

    fn decide_compute(
        &self,
        target_ref: &TargetRef,
        policy: &ScalingPolicy,
        snapshot: &TargetSnapshot,
        report: &mut EvaluationReport,
    ) -> Option<ScaleDecision> {
        let compute = policy.compute.as_ref()?;

        let mut recommended: BTreeMap<String, ResourceList> = BTreeMap::new();
        for container in snapshot.managed_containers() {
            match self.recommender.recommend(target_ref, &container, compute) {
                Ok(recommendation) => {
                    self.logger.log_recommendation(&recommendation);
                    recommended.insert(container, recommendation.target);
                    report.recommendations.push(recommendation);
                }
                Err(RecommendError::InsufficientData { .. }) => {
                    report
                        .skipped
                        .push(format!("{}: insufficient usage data", container));
                }
                Err(e) => {
                    warn!(target = %target_ref, container = %container, error = %e, "Recommendation failed");
                    report.recommend_failures += 1;
                    report.skipped.push(format!("{}: {}", container, e));
                }
            }
        }

        if let Some(usage) = snapshot.in_memory_usage_percentage {
            let pressure = evaluate_in_memory(usage, compute);
            if pressure.should_scale {
                for (container, recommendation) in recommended.iter_mut() {
                    let Some(current) = snapshot
                        .current_allocation
                        .get(container)
                        .and_then(|requirements| requirements.requests.memory_bytes)
                    else {
                        continue;
                    };
                    let grown = (current as f64 * pressure.multiplier).ceil() as u64;
                    let grown = compute.max_allowed.memory_bytes.map_or(grown, |max| grown.min(max));
                    recommendation.memory_bytes =
                        Some(recommendation.memory_bytes.map_or(grown, |memory| memory.max(grown)));
                }
            }
        }

        if recommended.is_empty() {
            return None;
        }

        let evaluation = evaluate_compute(
            &snapshot.current_allocation,
            &recommended,
            compute,
            snapshot.pod_age,
        );
        if !evaluation.should_scale {
            debug!(target = %target_ref, reason = %evaluation.reason, "Compute scale not triggered");
            report.skipped.push(format!("compute: {}", evaluation.reason));
            return None;
        }

        Some(ScaleDecision::new(
            target_ref.clone(),
            Proposal::Compute(evaluation.proposal),
            format!("{} ({:?} topology)", evaluation.reason, snapshot.topology),
        ))
    }

    fn decide_storage(
        &self,
        target_ref: &TargetRef,
        policy: &ScalingPolicy,
        snapshot: &TargetSnapshot,
        report: &mut EvaluationReport,
    ) -> Option<ScaleDecision> {
        let storage = policy.storage.as_ref()?;
        let usage = snapshot.storage_usage?;

        let used = usage.used_percentage();
        let evaluation = evaluate_storage(used, storage);
        if !evaluation.should_expand {
            return None;
        }

        let capacity = match storage_target_capacity(usage.capacity_bytes, storage) {
            Ok(capacity) => capacity,
            Err(e) => {
                warn!(target = %target_ref, error = %e, "Invalid storage scaling rules");
                report.skipped.push(format!("storage: {}", e));
                return None;
            }
        };
        if capacity <= usage.capacity_bytes {
            report
                .skipped
                .push("storage: volume already at its upper bound".to_string());
            return None;
        }

        Some(ScaleDecision::new(
            target_ref.clone(),
            Proposal::Storage {
                capacity_bytes: capacity,
                mode: evaluation.mode,
            },
            format!(
                "volume {:.1}% used, expanding {} to {}",
                used,
                format_bytes(usage.capacity_bytes),
                format_bytes(capacity)
            ),
        ))
    }

    fn submit(
        &self,
        decision: ScaleDecision,
        ops: &OpsRequestOptions,
        report: &mut EvaluationReport,
    ) -> Option<OperationId> {
        let kind = decision.kind;
        match self.coordinator.submit(decision, ops) {
            Ok(id) => {
                self.metrics.inc_decisions_submitted(kind);
                if let Some(operation) = self.coordinator.operation(id) {
                    self.logger.log_decision_submitted(&operation);
                }
                Some(id)
            }
            Err(e @ CoordinatorError::AlreadyInFlight { .. }) => {
                debug!(error = %e, "Scale decision deferred");
                report.skipped.push(e.to_string());
                None
            }
            Err(e) => {
                warn!(error = %e, "Scale decision rejected");
                report.skipped.push(e.to_string());
                None
            }
        }
    }

    async fn apply_operation(&self, id: OperationId, report: &mut EvaluationReport) {
        match self
            .coordinator
            .apply(id, self.oracle.as_ref(), self.executor.as_ref())
            .await
        {
            Ok(_) => report.applied.push(id),
            Err(CoordinatorError::TargetNotReady(target)) => {
                report
                    .skipped
                    .push(format!("{} waiting for {} to become ready", id, target));
            }
            Err(CoordinatorError::Executor(message)) => {
                self.record_finished(id);
                self.health
                    .report_failure(components::COORDINATOR, message)
                    .await;
            }
            Err(e) => debug!(operation_id = %id, error = %e, "Operation not applied"),
        }
    }

    fn record_finished(&self, id: OperationId) {
        if let Some(operation) = self.coordinator.operation(id) {
            if operation.phase.is_terminal() {
                self.metrics
                    .inc_operations_finished(operation.kind(), operation.phase);
                self.logger.log_operation_finished(&operation);
            }
        }
    }

    async fn bounded<T>(&self, call: impl Future<Output = StoreResult<T>>) -> StoreResult<T> {
        match timeout(self.config.external_call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.config.external_call_timeout)),
        }
    }
}
