//! Storage and in-memory engine triggers
//!
//! Volume expansion has no lifetime gate: a full volume fails writes, which
//! costs more than the churn of an expansion.

use crate::error::PolicyError;
use crate::policy::{ComputePolicy, ExpansionMode, RuleThreshold, StoragePolicy, Trigger};

/// Outcome of a storage evaluation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StorageEvaluation {
    pub should_expand: bool,
    /// Factor applied to the current capacity when no scaling rule matches
    pub multiplier: f64,
    /// Passed through from the policy
    pub mode: ExpansionMode,
}

/// Decide whether a volume at `used_percentage` should grow
pub fn evaluate_storage(used_percentage: f64, policy: &StoragePolicy) -> StorageEvaluation {
    let should_expand =
        policy.trigger == Trigger::On && used_percentage >= f64::from(policy.usage_threshold);

    StorageEvaluation {
        should_expand,
        multiplier: if should_expand {
            1.0 + f64::from(policy.scaling_threshold) / 100.0
        } else {
            1.0
        },
        mode: policy.expansion_mode,
    }
}

/// New capacity for a volume of `capacity_bytes` that must expand.
///
/// The first scaling rule whose `applies_upto` covers the capacity decides
/// the growth, falling back to the catch-all rule and then to
/// `scaling_threshold`. The result never exceeds `upper_bound` and never
/// shrinks the volume.
pub fn storage_target_capacity(
    capacity_bytes: u64,
    policy: &StoragePolicy,
) -> Result<u64, PolicyError> {
    let mut growth = RuleThreshold::Percentage(policy.scaling_threshold);
    let mut catch_all = None;
    let mut matched = false;

    for rule in &policy.scaling_rules {
        match rule.applies_upto_bytes()? {
            Some(upto) if capacity_bytes <= upto => {
                growth = rule.parsed_threshold()?;
                matched = true;
                break;
            }
            Some(_) => {}
            None => catch_all = Some(rule),
        }
    }
    if !matched {
        if let Some(rule) = catch_all {
            growth = rule.parsed_threshold()?;
        }
    }

    let capacity = u128::from(capacity_bytes);
    let expanded = match growth {
        RuleThreshold::Percentage(pct) => capacity * (100 + u128::from(pct)) / 100,
        RuleThreshold::Bytes(bytes) => capacity + u128::from(bytes),
    };
    let mut expanded = u64::try_from(expanded).unwrap_or(u64::MAX);

    if let Some(upper) = policy.upper_bound_bytes()? {
        expanded = expanded.min(upper);
    }
    Ok(expanded.max(capacity_bytes))
}

/// Outcome of an in-memory engine evaluation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InMemoryEvaluation {
    pub should_scale: bool,
    /// Factor applied to the current memory
    pub multiplier: f64,
}

/// Decide whether an in-memory storage engine needs more memory.
///
/// `used_percentage` is the engine's usage relative to its share of the
/// container memory. Only applies to policies with in-memory settings.
pub fn evaluate_in_memory(used_percentage: f64, policy: &ComputePolicy) -> InMemoryEvaluation {
    match policy.in_memory_storage {
        Some(in_memory)
            if policy.trigger == Trigger::On
                && used_percentage >= f64::from(in_memory.usage_threshold_percentage) =>
        {
            InMemoryEvaluation {
                should_scale: true,
                multiplier: 1.0 + f64::from(in_memory.scaling_factor_percentage) / 100.0,
            }
        }
        _ => InMemoryEvaluation {
            should_scale: false,
            multiplier: 1.0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{InMemoryStoragePolicy, StorageScalingRule};

    const GIB: u64 = 1 << 30;

    fn active_policy() -> StoragePolicy {
        StoragePolicy {
            trigger: Trigger::On,
            ..Default::default()
        }
        .with_defaults()
    }

    fn rule(applies_upto: &str, threshold: &str) -> StorageScalingRule {
        StorageScalingRule {
            applies_upto: applies_upto.to_string(),
            threshold: threshold.to_string(),
        }
    }

    #[test]
    fn test_storage_threshold_boundary() {
        let policy = active_policy();

        let below = evaluate_storage(79.0, &policy);
        assert!(!below.should_expand);
        assert_eq!(below.multiplier, 1.0);

        let at = evaluate_storage(80.0, &policy);
        assert!(at.should_expand);
        assert_eq!(at.multiplier, 1.5);
        assert_eq!(at.mode, ExpansionMode::Online);
    }

    #[test]
    fn test_storage_trigger_off() {
        let policy = StoragePolicy::default().with_defaults();
        assert!(!evaluate_storage(99.0, &policy).should_expand);
    }

    #[test]
    fn test_expansion_mode_passed_through() {
        let policy = StoragePolicy {
            expansion_mode: ExpansionMode::Offline,
            ..active_policy()
        };
        assert_eq!(evaluate_storage(90.0, &policy).mode, ExpansionMode::Offline);
    }

    #[test]
    fn test_target_capacity_uses_scaling_threshold() {
        let policy = active_policy();
        assert_eq!(storage_target_capacity(10 * GIB, &policy).unwrap(), 15 * GIB);
    }

    #[test]
    fn test_target_capacity_uses_matching_rule() {
        let policy = StoragePolicy {
            scaling_rules: vec![rule("", "20%"), rule("100Gi", "10Gi"), rule("10Gi", "100%")],
            ..active_policy()
        }
        .with_defaults();

        assert_eq!(storage_target_capacity(5 * GIB, &policy).unwrap(), 10 * GIB);
        assert_eq!(storage_target_capacity(10 * GIB, &policy).unwrap(), 20 * GIB);
        assert_eq!(storage_target_capacity(50 * GIB, &policy).unwrap(), 60 * GIB);
        assert_eq!(storage_target_capacity(200 * GIB, &policy).unwrap(), 240 * GIB);
    }

    #[test]
    fn test_target_capacity_capped_by_upper_bound() {
        let policy = StoragePolicy {
            upper_bound: Some("12Gi".to_string()),
            ..active_policy()
        };
        assert_eq!(storage_target_capacity(10 * GIB, &policy).unwrap(), 12 * GIB);
        // Already past the bound: never shrink
        assert_eq!(storage_target_capacity(20 * GIB, &policy).unwrap(), 20 * GIB);
    }

    #[test]
    fn test_in_memory_pressure() {
        let policy = ComputePolicy {
            trigger: Trigger::On,
            in_memory_storage: Some(InMemoryStoragePolicy::default()),
            ..Default::default()
        }
        .with_defaults();

        assert!(!evaluate_in_memory(69.0, &policy).should_scale);
        let hot = evaluate_in_memory(70.0, &policy);
        assert!(hot.should_scale);
        assert_eq!(hot.multiplier, 1.5);

        let on_disk = ComputePolicy {
            in_memory_storage: None,
            ..policy
        };
        assert!(!evaluate_in_memory(99.0, &on_disk).should_scale);
    }
}
