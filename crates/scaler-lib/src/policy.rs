//! Scaling policy consumed by the trigger and the coordinator
//!
//! Policies arrive from configuration with zero values meaning "use the
//! default". [`ScalingPolicy::with_defaults`] resolves them once at the
//! configuration boundary and returns a new value; the evaluation loop only
//! ever sees defaulted policies.

use crate::error::PolicyError;
use crate::models::{ResourceList, ResourceName, StorageEngine};
use crate::quantity::{parse_bytes, parse_percentage};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Minimum percentage delta between allocation and recommendation
pub const DEFAULT_RESOURCE_DIFF_PERCENTAGE: u32 = 10;

/// Minimum pod age before an upscale may evict it
pub const DEFAULT_POD_LIFETIME_THRESHOLD: Duration = Duration::from_secs(12 * 60 * 60);

/// Volume usage percentage that triggers expansion
pub const DEFAULT_STORAGE_USAGE_THRESHOLD: u32 = 80;

/// Percentage by which a volume grows on expansion
pub const DEFAULT_STORAGE_SCALING_THRESHOLD: u32 = 50;

/// Share of memory handed to an in-memory storage engine
pub const DEFAULT_IN_MEMORY_USAGE_THRESHOLD: u32 = 70;

/// Memory growth applied when an in-memory engine runs hot
pub const DEFAULT_IN_MEMORY_SCALING_FACTOR: u32 = 50;

/// Deadline for a submitted operation to reach a terminal phase
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(600);

/// Consecutive failures of one proposal before it is abandoned
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trigger {
    On,
    #[default]
    Off,
}

/// Which container values a compute scale rewrites
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerControlledValues {
    RequestsOnly,
    #[default]
    RequestsAndLimits,
}

/// Whether an operation waits for the target to report ready
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyOption {
    #[default]
    IfReady,
    Always,
}

/// How a volume expansion is carried out by the executor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpansionMode {
    #[default]
    Online,
    Offline,
}

/// In-memory storage engine sizing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InMemoryStoragePolicy {
    /// Share of the memory target given to the in-memory engine
    pub usage_threshold_percentage: u32,
    /// Memory growth when the engine's usage crosses its share
    pub scaling_factor_percentage: u32,
}

/// Compute (CPU/memory) autoscaling policy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputePolicy {
    pub trigger: Trigger,
    pub controlled_resources: Vec<ResourceName>,
    pub container_controlled_values: ContainerControlledValues,
    pub min_allowed: ResourceList,
    pub max_allowed: ResourceList,
    pub resource_diff_percentage: u32,
    #[serde(with = "duration_secs")]
    pub pod_life_time_threshold: Duration,
    pub disable_scale_down: bool,
    pub in_memory_storage: Option<InMemoryStoragePolicy>,
}

/// Volume expansion rule: volumes up to `applies_upto` grow by `threshold`.
///
/// `threshold` is either a percentage (`"50%"`, `"50pc"`) or an absolute
/// quantity (`"10Gi"`). An empty `applies_upto` is the catch-all rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageScalingRule {
    pub applies_upto: String,
    pub threshold: String,
}

/// Growth prescribed by a scaling rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleThreshold {
    Percentage(u32),
    Bytes(u64),
}

impl StorageScalingRule {
    pub fn parsed_threshold(&self) -> Result<RuleThreshold, PolicyError> {
        if let Some(pct) = parse_percentage(&self.threshold) {
            return Ok(RuleThreshold::Percentage(pct));
        }
        if self.threshold.trim_end().ends_with('%') || self.threshold.trim_end().ends_with("pc") {
            return Err(PolicyError::InvalidScalingRule(format!(
                "{} is not a valid percentage value",
                self.threshold
            )));
        }
        Ok(RuleThreshold::Bytes(parse_bytes(&self.threshold)?))
    }

    /// Upper capacity bound, `None` for the catch-all rule
    pub fn applies_upto_bytes(&self) -> Result<Option<u64>, PolicyError> {
        if self.applies_upto.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(parse_bytes(&self.applies_upto)?))
    }
}

/// Storage autoscaling policy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoragePolicy {
    pub trigger: Trigger,
    pub usage_threshold: u32,
    pub scaling_threshold: u32,
    pub scaling_rules: Vec<StorageScalingRule>,
    pub expansion_mode: ExpansionMode,
    /// Capacity a volume is never expanded beyond, as a quantity
    pub upper_bound: Option<String>,
}

impl StoragePolicy {
    pub fn upper_bound_bytes(&self) -> Result<Option<u64>, PolicyError> {
        match &self.upper_bound {
            Some(q) => Ok(Some(parse_bytes(q)?)),
            None => Ok(None),
        }
    }
}

/// How scale operations derived from this policy are applied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpsRequestOptions {
    pub apply: ApplyOption,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub max_attempts: u32,
}

/// Complete autoscaling policy of one target
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingPolicy {
    pub compute: Option<ComputePolicy>,
    pub storage: Option<StoragePolicy>,
    pub ops: OpsRequestOptions,
}

impl ScalingPolicy {
    /// Resolve zero values to defaults, returning a new policy
    pub fn with_defaults(&self) -> Self {
        Self {
            compute: self.compute.as_ref().map(ComputePolicy::with_defaults),
            storage: self.storage.as_ref().map(StoragePolicy::with_defaults),
            ops: self.ops.with_defaults(),
        }
    }

    /// Fill in-memory engine defaults when the target runs one
    pub fn for_storage_engine(&self, engine: StorageEngine) -> Self {
        let mut policy = self.clone();
        if engine == StorageEngine::InMemory {
            if let Some(compute) = policy.compute.as_mut() {
                let in_memory = compute.in_memory_storage.unwrap_or_default();
                compute.in_memory_storage = Some(in_memory.with_defaults());
            }
        }
        policy
    }

    /// Check that every percentage is in (0, 100] and rules are well formed
    pub fn validate(&self) -> Result<(), PolicyError> {
        if let Some(compute) = &self.compute {
            check_percentage("resource_diff_percentage", compute.resource_diff_percentage)?;
            if let Some(in_memory) = &compute.in_memory_storage {
                check_percentage(
                    "in_memory_storage.usage_threshold_percentage",
                    in_memory.usage_threshold_percentage,
                )?;
                check_percentage(
                    "in_memory_storage.scaling_factor_percentage",
                    in_memory.scaling_factor_percentage,
                )?;
            }
        }

        if let Some(storage) = &self.storage {
            check_percentage("usage_threshold", storage.usage_threshold)?;
            check_percentage("scaling_threshold", storage.scaling_threshold)?;
            storage.upper_bound_bytes()?;

            let mut catch_all = 0;
            for rule in &storage.scaling_rules {
                if rule.applies_upto_bytes()?.is_none() {
                    catch_all += 1;
                }
                rule.parsed_threshold()?;
            }
            if catch_all > 1 {
                return Err(PolicyError::InvalidScalingRule(format!(
                    "{} rules have an empty applies_upto",
                    catch_all
                )));
            }
        }

        Ok(())
    }
}

impl ComputePolicy {
    pub fn with_defaults(&self) -> Self {
        let mut policy = self.clone();
        if policy.controlled_resources.is_empty() {
            policy.controlled_resources = ResourceName::ALL.to_vec();
        }
        if policy.resource_diff_percentage == 0 {
            policy.resource_diff_percentage = DEFAULT_RESOURCE_DIFF_PERCENTAGE;
        }
        if policy.pod_life_time_threshold.is_zero() {
            policy.pod_life_time_threshold = DEFAULT_POD_LIFETIME_THRESHOLD;
        }
        policy.in_memory_storage = policy.in_memory_storage.map(|m| m.with_defaults());
        policy
    }

    pub fn controls(&self, resource: ResourceName) -> bool {
        self.controlled_resources.contains(&resource)
    }
}

impl InMemoryStoragePolicy {
    pub fn with_defaults(&self) -> Self {
        Self {
            usage_threshold_percentage: non_zero_or(
                self.usage_threshold_percentage,
                DEFAULT_IN_MEMORY_USAGE_THRESHOLD,
            ),
            scaling_factor_percentage: non_zero_or(
                self.scaling_factor_percentage,
                DEFAULT_IN_MEMORY_SCALING_FACTOR,
            ),
        }
    }
}

impl StoragePolicy {
    /// Resolve defaults and order rules by `applies_upto`, catch-all last
    pub fn with_defaults(&self) -> Self {
        let mut policy = self.clone();
        policy.usage_threshold = non_zero_or(policy.usage_threshold, DEFAULT_STORAGE_USAGE_THRESHOLD);
        policy.scaling_threshold =
            non_zero_or(policy.scaling_threshold, DEFAULT_STORAGE_SCALING_THRESHOLD);
        policy.scaling_rules.sort_by_key(|rule| match rule.applies_upto_bytes() {
            Ok(None) => (1, 0),
            Ok(Some(bytes)) => (0, bytes),
            Err(_) => (0, u64::MAX),
        });
        policy
    }
}

impl OpsRequestOptions {
    pub fn with_defaults(&self) -> Self {
        Self {
            apply: self.apply,
            timeout: if self.timeout.is_zero() {
                DEFAULT_OPERATION_TIMEOUT
            } else {
                self.timeout
            },
            max_attempts: non_zero_or(self.max_attempts, DEFAULT_MAX_ATTEMPTS),
        }
    }
}

fn non_zero_or(value: u32, default: u32) -> u32 {
    if value == 0 {
        default
    } else {
        value
    }
}

fn check_percentage(field: &'static str, value: u32) -> Result<(), PolicyError> {
    if value == 0 || value > 100 {
        return Err(PolicyError::InvalidPercentage { field, value });
    }
    Ok(())
}

/// Serde adapter storing durations as whole seconds
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(applies_upto: &str, threshold: &str) -> StorageScalingRule {
        StorageScalingRule {
            applies_upto: applies_upto.to_string(),
            threshold: threshold.to_string(),
        }
    }

    #[test]
    fn test_zero_values_become_defaults() {
        let policy = ScalingPolicy {
            compute: Some(ComputePolicy::default()),
            storage: Some(StoragePolicy::default()),
            ops: OpsRequestOptions::default(),
        }
        .with_defaults();

        let compute = policy.compute.unwrap();
        assert_eq!(compute.trigger, Trigger::Off);
        assert_eq!(compute.resource_diff_percentage, DEFAULT_RESOURCE_DIFF_PERCENTAGE);
        assert_eq!(compute.pod_life_time_threshold, DEFAULT_POD_LIFETIME_THRESHOLD);
        assert_eq!(compute.controlled_resources, vec![ResourceName::Cpu, ResourceName::Memory]);
        assert_eq!(
            compute.container_controlled_values,
            ContainerControlledValues::RequestsAndLimits
        );

        let storage = policy.storage.unwrap();
        assert_eq!(storage.usage_threshold, 80);
        assert_eq!(storage.scaling_threshold, 50);
        assert_eq!(storage.expansion_mode, ExpansionMode::Online);

        assert_eq!(policy.ops.apply, ApplyOption::IfReady);
        assert_eq!(policy.ops.timeout, DEFAULT_OPERATION_TIMEOUT);
        assert_eq!(policy.ops.max_attempts, DEFAULT_MAX_ATTEMPTS);
    }

    #[test]
    fn test_with_defaults_keeps_explicit_values_and_input() {
        let original = ScalingPolicy {
            compute: Some(ComputePolicy {
                trigger: Trigger::On,
                resource_diff_percentage: 25,
                pod_life_time_threshold: Duration::from_secs(60),
                controlled_resources: vec![ResourceName::Memory],
                ..Default::default()
            }),
            ..Default::default()
        };
        let defaulted = original.with_defaults();

        let compute = defaulted.compute.unwrap();
        assert_eq!(compute.resource_diff_percentage, 25);
        assert_eq!(compute.pod_life_time_threshold, Duration::from_secs(60));
        assert_eq!(compute.controlled_resources, vec![ResourceName::Memory]);
        // The input policy is untouched
        assert_eq!(original.compute.unwrap().controlled_resources.len(), 1);
        assert_eq!(original.ops.timeout, Duration::ZERO);
    }

    #[test]
    fn test_in_memory_defaults_only_for_in_memory_engine() {
        let policy = ScalingPolicy {
            compute: Some(ComputePolicy::default()),
            ..Default::default()
        }
        .with_defaults();

        let on_disk = policy.for_storage_engine(StorageEngine::OnDisk);
        assert!(on_disk.compute.unwrap().in_memory_storage.is_none());

        let in_memory = policy.for_storage_engine(StorageEngine::InMemory);
        let sizing = in_memory.compute.unwrap().in_memory_storage.unwrap();
        assert_eq!(sizing.usage_threshold_percentage, DEFAULT_IN_MEMORY_USAGE_THRESHOLD);
        assert_eq!(sizing.scaling_factor_percentage, DEFAULT_IN_MEMORY_SCALING_FACTOR);
    }

    #[test]
    fn test_scaling_rules_sorted_with_catch_all_last() {
        let storage = StoragePolicy {
            scaling_rules: vec![rule("", "20%"), rule("100Gi", "30%"), rule("10Gi", "50%")],
            ..Default::default()
        }
        .with_defaults();

        let order: Vec<&str> = storage.scaling_rules.iter().map(|r| r.applies_upto.as_str()).collect();
        assert_eq!(order, vec!["10Gi", "100Gi", ""]);
    }

    #[test]
    fn test_validate_rejects_out_of_range_percentages() {
        let policy = ScalingPolicy {
            storage: Some(StoragePolicy {
                usage_threshold: 150,
                ..Default::default()
            }),
            ..Default::default()
        }
        .with_defaults();

        assert_eq!(
            policy.validate(),
            Err(PolicyError::InvalidPercentage {
                field: "usage_threshold",
                value: 150
            })
        );
    }

    #[test]
    fn test_validate_rejects_bad_rules() {
        let two_catch_alls = ScalingPolicy {
            storage: Some(StoragePolicy {
                scaling_rules: vec![rule("", "20%"), rule("", "30%")],
                ..Default::default()
            }),
            ..Default::default()
        }
        .with_defaults();
        assert!(matches!(
            two_catch_alls.validate(),
            Err(PolicyError::InvalidScalingRule(_))
        ));

        let bad_percentage = ScalingPolicy {
            storage: Some(StoragePolicy {
                scaling_rules: vec![rule("10Gi", "abc%")],
                ..Default::default()
            }),
            ..Default::default()
        }
        .with_defaults();
        assert!(bad_percentage.validate().is_err());

        let bad_quantity = ScalingPolicy {
            storage: Some(StoragePolicy {
                scaling_rules: vec![rule("lots", "10Gi")],
                ..Default::default()
            }),
            ..Default::default()
        }
        .with_defaults();
        assert!(bad_quantity.validate().is_err());
    }

    #[test]
    fn test_defaulted_policy_validates() {
        let policy = ScalingPolicy {
            compute: Some(ComputePolicy::default()),
            storage: Some(StoragePolicy {
                scaling_rules: vec![rule("50Gi", "10Gi"), rule("", "25pc")],
                upper_bound: Some("1Ti".to_string()),
                ..Default::default()
            }),
            ops: OpsRequestOptions::default(),
        }
        .with_defaults()
        .for_storage_engine(StorageEngine::InMemory);

        assert_eq!(policy.validate(), Ok(()));
    }

    #[test]
    fn test_policy_deserializes_from_json() {
        let json = r#"{
            "compute": {
                "trigger": "On",
                "pod_life_time_threshold": 3600,
                "max_allowed": { "cpu_millicores": 4000, "memory_bytes": 8589934592 }
            },
            "ops": { "apply": "Always", "timeout": 120 }
        }"#;
        let policy: ScalingPolicy = serde_json::from_str(json).unwrap();
        let policy = policy.with_defaults();

        let compute = policy.compute.unwrap();
        assert_eq!(compute.trigger, Trigger::On);
        assert_eq!(compute.pod_life_time_threshold, Duration::from_secs(3600));
        assert_eq!(compute.max_allowed.cpu_millicores, Some(4000));
        assert_eq!(policy.ops.apply, ApplyOption::Always);
        assert_eq!(policy.ops.timeout, Duration::from_secs(120));
        assert!(policy.storage.is_none());
    }
}
