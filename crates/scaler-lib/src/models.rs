//! Core data models for the resource scaler

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Stable identity of a scaling target (a stateful workload)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetRef {
    pub namespace: String,
    pub name: String,
}

impl TargetRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Compute resource tracked by a usage histogram
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceName {
    /// CPU, measured in millicores
    Cpu,
    /// Memory, measured in bytes
    Memory,
}

impl ResourceName {
    pub const ALL: [ResourceName; 2] = [ResourceName::Cpu, ResourceName::Memory];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceName::Cpu => "cpu",
            ResourceName::Memory => "memory",
        }
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which family of resources a scale decision touches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Compute,
    Storage,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Compute => f.write_str("compute"),
            ResourceKind::Storage => f.write_str("storage"),
        }
    }
}

/// CPU millicores and memory bytes. A missing entry means "not set".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceList {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_millicores: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
}

impl ResourceList {
    pub fn new(cpu_millicores: u64, memory_bytes: u64) -> Self {
        Self {
            cpu_millicores: Some(cpu_millicores),
            memory_bytes: Some(memory_bytes),
        }
    }

    pub fn get(&self, resource: ResourceName) -> Option<u64> {
        match resource {
            ResourceName::Cpu => self.cpu_millicores,
            ResourceName::Memory => self.memory_bytes,
        }
    }

    pub fn set(&mut self, resource: ResourceName, value: u64) {
        match resource {
            ResourceName::Cpu => self.cpu_millicores = Some(value),
            ResourceName::Memory => self.memory_bytes = Some(value),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cpu_millicores.is_none() && self.memory_bytes.is_none()
    }
}

/// Requests and limits of a single container
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub requests: ResourceList,
    #[serde(default)]
    pub limits: ResourceList,
}

/// Per-container resource requirements, keyed by container name
pub type ContainerResources = BTreeMap<String, ResourceRequirements>;

/// A single usage observation for one container of a target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSample {
    pub target: TargetRef,
    pub container: String,
    pub cpu_millicores: f64,
    pub memory_bytes: f64,
    pub timestamp: DateTime<Utc>,
}

/// Volume capacity and usage of a target's data volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageUsage {
    pub capacity_bytes: u64,
    pub used_bytes: u64,
}

impl StorageUsage {
    /// Used space as a percentage of capacity
    pub fn used_percentage(&self) -> f64 {
        if self.capacity_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.capacity_bytes as f64 * 100.0
    }
}

/// Storage engine declared by a target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageEngine {
    #[default]
    OnDisk,
    InMemory,
}

/// Identity of one persisted histogram: (target, container, resource)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckpointKey {
    pub target: TargetRef,
    pub container: String,
    pub resource: ResourceName,
}

impl CheckpointKey {
    pub fn new(target: &TargetRef, container: &str, resource: ResourceName) -> Self {
        Self {
            target: target.clone(),
            container: container.to_string(),
            resource,
        }
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.target, self.container, self.resource)
    }
}
