//! Compute (CPU/memory) trigger
//!
//! A resource is eligible for change once its recommendation differs from
//! the current request by at least `resource_diff_percentage`. Downscales
//! are applied immediately while upscales wait until the pod has lived for
//! `pod_life_time_threshold`: upscales ride along with natural pod churn,
//! downscales release resources or relieve starvation without delay.

use crate::models::{ContainerResources, ResourceList, ResourceName, ResourceRequirements};
use crate::policy::{ComputePolicy, ContainerControlledValues, Trigger};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// One resource change accepted by the trigger
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceChange {
    pub container: String,
    pub resource: ResourceName,
    /// Current request, `None` when the container has no request set
    pub current: Option<u64>,
    pub recommended: u64,
    pub diff_percentage: f64,
}

impl ResourceChange {
    pub fn is_downscale(&self) -> bool {
        matches!(self.current, Some(current) if self.recommended < current)
    }
}

impl fmt::Display for ResourceChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = if self.is_downscale() { "down" } else { "up" };
        write!(
            f,
            "{} {} {} by {:.1}% to {}",
            self.container, self.resource, direction, self.diff_percentage, self.recommended
        )
    }
}

/// Outcome of a compute evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct ComputeEvaluation {
    pub should_scale: bool,
    pub reason: String,
    /// Accepted changes
    pub changes: Vec<ResourceChange>,
    /// New requirements for every container with an accepted change
    pub proposal: ContainerResources,
}

impl ComputeEvaluation {
    fn skip(reason: impl Into<String>) -> Self {
        Self {
            should_scale: false,
            reason: reason.into(),
            changes: Vec::new(),
            proposal: ContainerResources::new(),
        }
    }
}

/// Decide whether recommended requests warrant a compute scale.
///
/// `recommended` maps container names to recommended requests. Containers
/// missing from `current` are ignored, as are resources outside the
/// policy's controlled set. A container without a current request for a
/// resource counts as an upscale.
pub fn evaluate_compute(
    current: &ContainerResources,
    recommended: &BTreeMap<String, ResourceList>,
    policy: &ComputePolicy,
    pod_age: Duration,
) -> ComputeEvaluation {
    if policy.trigger == Trigger::Off {
        return ComputeEvaluation::skip("compute trigger is off");
    }

    let threshold = f64::from(policy.resource_diff_percentage);
    let lifetime_elapsed = pod_age >= policy.pod_life_time_threshold;
    let mut accepted = Vec::new();
    let mut held = Vec::new();

    for (container, recommendation) in recommended {
        let Some(requirements) = current.get(container) else {
            continue;
        };
        for &resource in &policy.controlled_resources {
            let Some(target) = recommendation.get(resource) else {
                continue;
            };
            let current_request = requirements.requests.get(resource).filter(|v| *v > 0);
            let diff_percentage = match current_request {
                Some(cur) => (target as f64 - cur as f64).abs() * 100.0 / cur as f64,
                None => f64::INFINITY,
            };
            if diff_percentage < threshold {
                continue;
            }

            let change = ResourceChange {
                container: container.clone(),
                resource,
                current: current_request,
                recommended: target,
                diff_percentage,
            };
            let allowed = if change.is_downscale() {
                !policy.disable_scale_down
            } else {
                lifetime_elapsed
            };
            if allowed {
                accepted.push(change);
            } else {
                held.push(change);
            }
        }
    }

    if accepted.is_empty() {
        return match held.first() {
            Some(change) if change.is_downscale() => {
                ComputeEvaluation::skip(format!("scale down disabled, holding {}", change))
            }
            Some(change) => ComputeEvaluation::skip(format!(
                "pod age {}s below lifetime threshold {}s, holding {}",
                pod_age.as_secs(),
                policy.pod_life_time_threshold.as_secs(),
                change
            )),
            None => ComputeEvaluation::skip(format!(
                "all controlled resources within {}% of recommendation",
                policy.resource_diff_percentage
            )),
        };
    }

    let mut proposal = ContainerResources::new();
    for change in &accepted {
        let Some(requirements) = current.get(&change.container) else {
            continue;
        };
        let entry = proposal
            .entry(change.container.clone())
            .or_insert(*requirements);
        let mut requests = entry.requests;
        requests.set(change.resource, change.recommended);
        *entry = scale_requirements(requirements, &requests, policy.container_controlled_values);
    }

    let reason = accepted
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");

    ComputeEvaluation {
        should_scale: true,
        reason,
        changes: accepted,
        proposal,
    }
}

/// Apply new requests to a container's requirements.
///
/// With `RequestsOnly` limits are left as they are. With
/// `RequestsAndLimits` every limit moves by the same ratio as its request,
/// keeping the request:limit ratio of `current`.
pub fn scale_requirements(
    current: &ResourceRequirements,
    new_requests: &ResourceList,
    controlled_values: ContainerControlledValues,
) -> ResourceRequirements {
    let mut scaled = *current;

    for resource in ResourceName::ALL {
        let Some(request) = new_requests.get(resource) else {
            continue;
        };
        scaled.requests.set(resource, request);

        if controlled_values == ContainerControlledValues::RequestsOnly {
            continue;
        }
        if let (Some(old_request), Some(old_limit)) = (
            current.requests.get(resource).filter(|v| *v > 0),
            current.limits.get(resource),
        ) {
            let limit = u128::from(old_limit) * u128::from(request) / u128::from(old_request);
            scaled.limits.set(resource, u64::try_from(limit).unwrap_or(u64::MAX));
        }
    }

    scaled
}
