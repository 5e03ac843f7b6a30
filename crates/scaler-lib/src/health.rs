//! Health tracking for the scaler components
//!
//! Components report successes and failures as they run. A single failure
//! degrades a component; repeated failures in a row mark it unhealthy,
//! which also takes the process out of readiness.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Consecutive failures after which a degraded component turns unhealthy
pub const UNHEALTHY_AFTER_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Failing intermittently, still doing useful work
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        matches!(self, ComponentStatus::Healthy | ComponentStatus::Degraded)
    }
}

/// Last known state of one component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub consecutive_failures: u32,
    pub updated_at: DateTime<Utc>,
}

impl ComponentHealth {
    pub fn healthy() -> Self {
        Self {
            status: ComponentStatus::Healthy,
            message: None,
            consecutive_failures: 0,
            updated_at: Utc::now(),
        }
    }

    fn failed(previous_failures: u32, message: String) -> Self {
        let consecutive_failures = previous_failures + 1;
        Self {
            status: if consecutive_failures >= UNHEALTHY_AFTER_FAILURES {
                ComponentStatus::Unhealthy
            } else {
                ComponentStatus::Degraded
            },
            message: Some(message),
            consecutive_failures,
            updated_at: Utc::now(),
        }
    }
}

/// Body of the liveness endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status across all components
    pub fn compute_status(components: &BTreeMap<String, ComponentHealth>) -> ComponentStatus {
        components
            .values()
            .map(|health| health.status)
            .fold(ComponentStatus::Healthy, |worst, status| match (worst, status) {
                (ComponentStatus::Unhealthy, _) | (_, ComponentStatus::Unhealthy) => {
                    ComponentStatus::Unhealthy
                }
                (ComponentStatus::Degraded, _) | (_, ComponentStatus::Degraded) => {
                    ComponentStatus::Degraded
                }
                _ => ComponentStatus::Healthy,
            })
    }
}

/// Body of the readiness endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const RECOMMENDER: &str = "recommender";
    pub const COORDINATOR: &str = "coordinator";
    pub const CHECKPOINT_STORE: &str = "checkpoint_store";
    pub const CONTROLLER: &str = "controller";

    pub const ALL: [&str; 4] = [RECOMMENDER, COORDINATOR, CHECKPOINT_STORE, CONTROLLER];
}

/// Shared registry of component health
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<BTreeMap<String, ComponentHealth>>>,
    ready: Arc<AtomicBool>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every scaler component registered as healthy
    pub async fn with_scaler_components() -> Self {
        let registry = Self::new();
        for name in components::ALL {
            registry.register(name).await;
        }
        registry
    }

    pub async fn register(&self, name: &str) {
        self.components
            .write()
            .await
            .insert(name.to_string(), ComponentHealth::healthy());
    }

    /// Record a successful run, clearing any failure streak
    pub async fn report_success(&self, name: &str) {
        let mut components = self.components.write().await;
        let already_healthy = components
            .get(name)
            .map(|health| health.status == ComponentStatus::Healthy)
            .unwrap_or(false);
        if !already_healthy {
            components.insert(name.to_string(), ComponentHealth::healthy());
        }
    }

    /// Record a failed run; the component degrades, then turns unhealthy
    pub async fn report_failure(&self, name: &str, message: impl Into<String>) {
        let mut components = self.components.write().await;
        let previous = components
            .get(name)
            .map(|health| health.consecutive_failures)
            .unwrap_or(0);
        components.insert(
            name.to_string(),
            ComponentHealth::failed(previous, message.into()),
        );
    }

    pub async fn component(&self, name: &str) -> Option<ComponentHealth> {
        self.components.read().await.get(name).cloned()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = HealthResponse::compute_status(&components);
        HealthResponse { status, components }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        if !self.ready.load(Ordering::SeqCst) {
            return ReadinessResponse {
                ready: false,
                reason: Some("Checkpoints not yet restored".to_string()),
            };
        }

        let unhealthy: Vec<String> = self
            .components
            .read()
            .await
            .iter()
            .filter(|(_, health)| !health.status.is_operational())
            .map(|(name, _)| name.clone())
            .collect();

        if unhealthy.is_empty() {
            ReadinessResponse {
                ready: true,
                reason: None,
            }
        } else {
            ReadinessResponse {
                ready: false,
                reason: Some(format!("Unhealthy components: {}", unhealthy.join(", "))),
            }
        }
    }
}
