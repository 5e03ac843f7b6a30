//! Scaling targets
//!
//! The engine never branches on the kind of workload it scales. Every
//! workload is reached through [`ScalingTarget`], which exposes the
//! workload's allocation, topology and storage state as a snapshot.

use crate::coordinator::Proposal;
use crate::models::{ContainerResources, StorageEngine, StorageUsage, TargetRef};
use crate::policy::ScalingPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::RwLock;

/// Shape of the workload behind a target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum Topology {
    #[default]
    Standalone,
    Replicated { replicas: u32 },
    Sharded { shards: u32, replicas_per_shard: u32 },
}

impl Topology {
    /// Number of pods the workload runs
    pub fn pod_count(&self) -> u32 {
        match self {
            Topology::Standalone => 1,
            Topology::Replicated { replicas } => *replicas,
            Topology::Sharded {
                shards,
                replicas_per_shard,
            } => shards * replicas_per_shard,
        }
    }
}

/// Point-in-time view of a target
#[derive(Debug, Clone, PartialEq)]
pub struct TargetSnapshot {
    pub current_allocation: ContainerResources,
    /// Containers the engine manages; empty means all of them
    pub controlled_containers: Vec<String>,
    pub topology: Topology,
    /// Age of the youngest pod
    pub pod_age: Duration,
    pub storage_usage: Option<StorageUsage>,
    /// In-memory engine usage as a percentage of its memory share
    pub in_memory_usage_percentage: Option<f64>,
}

impl TargetSnapshot {
    pub fn managed_containers(&self) -> Vec<String> {
        if self.controlled_containers.is_empty() {
            self.current_allocation.keys().cloned().collect()
        } else {
            self.controlled_containers.clone()
        }
    }
}

/// A workload the engine can scale
#[async_trait]
pub trait ScalingTarget: Send + Sync {
    fn target_ref(&self) -> &TargetRef;

    /// Declared policy, before defaults are applied
    fn policy(&self) -> &ScalingPolicy;

    fn storage_engine(&self) -> StorageEngine;

    /// Current allocation, topology and usage
    async fn snapshot(&self) -> anyhow::Result<TargetSnapshot>;
}

#[derive(Debug)]
struct StaticState {
    allocation: ContainerResources,
    storage: Option<StorageUsage>,
    in_memory_usage_percentage: Option<f64>,
    started_at: DateTime<Utc>,
}

/// Target whose state is declared up front and updated in process.
///
/// Useful for statically configured workloads and for tests; applying a
/// proposal restarts the pods, resetting the pod age.
#[derive(Debug)]
pub struct StaticTarget {
    target_ref: TargetRef,
    policy: ScalingPolicy,
    engine: StorageEngine,
    topology: Topology,
    controlled_containers: Vec<String>,
    state: RwLock<StaticState>,
}

impl StaticTarget {
    pub fn new(target_ref: TargetRef, policy: ScalingPolicy, allocation: ContainerResources) -> Self {
        Self {
            target_ref,
            policy,
            engine: StorageEngine::default(),
            topology: Topology::default(),
            controlled_containers: Vec::new(),
            state: RwLock::new(StaticState {
                allocation,
                storage: None,
                in_memory_usage_percentage: None,
                started_at: Utc::now(),
            }),
        }
    }

    pub fn with_engine(mut self, engine: StorageEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_controlled_containers(mut self, containers: Vec<String>) -> Self {
        self.controlled_containers = containers;
        self
    }

    pub fn with_storage(mut self, usage: StorageUsage) -> Self {
        self.state.get_mut().storage = Some(usage);
        self
    }

    /// Pretend the pods started at `started_at`
    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.state.get_mut().started_at = started_at;
        self
    }

    pub async fn set_storage_usage(&self, usage: StorageUsage) {
        self.state.write().await.storage = Some(usage);
    }

    pub async fn set_in_memory_usage(&self, percentage: f64) {
        self.state.write().await.in_memory_usage_percentage = Some(percentage);
    }

    pub async fn allocation(&self) -> ContainerResources {
        self.state.read().await.allocation.clone()
    }

    /// Apply a proposal as if an executor had carried it out
    pub async fn apply_proposal(&self, proposal: &Proposal) {
        let mut state = self.state.write().await;
        match proposal {
            Proposal::Compute(resources) => {
                for (container, requirements) in resources {
                    state.allocation.insert(container.clone(), *requirements);
                }
                state.started_at = Utc::now();
            }
            Proposal::Storage { capacity_bytes, .. } => {
                if let Some(storage) = state.storage.as_mut() {
                    storage.capacity_bytes = *capacity_bytes;
                }
            }
        }
    }
}

#[async_trait]
impl ScalingTarget for StaticTarget {
    fn target_ref(&self) -> &TargetRef {
        &self.target_ref
    }

    fn policy(&self) -> &ScalingPolicy {
        &self.policy
    }

    fn storage_engine(&self) -> StorageEngine {
        self.engine
    }

    async fn snapshot(&self) -> anyhow::Result<TargetSnapshot> {
        let state = self.state.read().await;
        let pod_age = (Utc::now() - state.started_at).to_std().unwrap_or_default();
        Ok(TargetSnapshot {
            current_allocation: state.allocation.clone(),
            controlled_containers: self.controlled_containers.clone(),
            topology: self.topology,
            pod_age,
            storage_usage: state.storage,
            in_memory_usage_percentage: state.in_memory_usage_percentage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ResourceList, ResourceRequirements};
    use crate::policy::ExpansionMode;

    fn allocation() -> ContainerResources {
        let mut allocation = ContainerResources::new();
        allocation.insert(
            "postgres".to_string(),
            ResourceRequirements {
                requests: ResourceList::new(500, 1 << 30),
                limits: ResourceList::new(1000, 2 << 30),
            },
        );
        allocation.insert("exporter".to_string(), ResourceRequirements::default());
        allocation
    }

    #[tokio::test]
    async fn test_snapshot_reports_pod_age() {
        let started = Utc::now() - chrono::Duration::hours(13);
        let target = StaticTarget::new(TargetRef::new("db", "pg"), ScalingPolicy::default(), allocation())
            .with_started_at(started);

        let snapshot = target.snapshot().await.unwrap();
        assert!(snapshot.pod_age >= Duration::from_secs(13 * 3600));
        assert_eq!(snapshot.topology, Topology::Standalone);
        assert_eq!(snapshot.managed_containers(), vec!["exporter", "postgres"]);
    }

    #[tokio::test]
    async fn test_controlled_containers_restrict_management() {
        let target = StaticTarget::new(TargetRef::new("db", "pg"), ScalingPolicy::default(), allocation())
            .with_controlled_containers(vec!["postgres".to_string()]);
        let snapshot = target.snapshot().await.unwrap();
        assert_eq!(snapshot.managed_containers(), vec!["postgres"]);
    }

    #[tokio::test]
    async fn test_apply_proposal_updates_state() {
        let target = StaticTarget::new(TargetRef::new("db", "pg"), ScalingPolicy::default(), allocation())
            .with_storage(StorageUsage {
                capacity_bytes: 10 << 30,
                used_bytes: 9 << 30,
            })
            .with_started_at(Utc::now() - chrono::Duration::days(1));

        let mut resized = ContainerResources::new();
        resized.insert(
            "postgres".to_string(),
            ResourceRequirements {
                requests: ResourceList::new(250, 1 << 30),
                limits: ResourceList::new(500, 2 << 30),
            },
        );
        target.apply_proposal(&Proposal::Compute(resized)).await;
        target
            .apply_proposal(&Proposal::Storage {
                capacity_bytes: 15 << 30,
                mode: ExpansionMode::Online,
            })
            .await;

        let snapshot = target.snapshot().await.unwrap();
        assert_eq!(
            snapshot.current_allocation["postgres"].requests.cpu_millicores,
            Some(250)
        );
        assert_eq!(snapshot.storage_usage.unwrap().capacity_bytes, 15 << 30);
        assert!(snapshot.pod_age < Duration::from_secs(60));
    }

    #[test]
    fn test_topology_pod_count() {
        assert_eq!(Topology::Standalone.pod_count(), 1);
        assert_eq!(Topology::Replicated { replicas: 3 }.pod_count(), 3);
        assert_eq!(
            Topology::Sharded {
                shards: 2,
                replicas_per_shard: 3
            }
            .pod_count(),
            6
        );
    }
}
