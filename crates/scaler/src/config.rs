//! Scaler configuration

use anyhow::{bail, Context, Result};
use scaler_lib::{
    controller::ControllerConfig,
    models::{ContainerResources, ResourceList, ResourceRequirements, StorageEngine, StorageUsage, TargetRef},
    policy::ScalingPolicy,
    quantity::{parse_bytes, parse_millicores},
    recommender::RecommenderConfig,
    target::{StaticTarget, Topology},
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming an optional configuration file
pub const CONFIG_FILE_ENV: &str = "SCALER_CONFIG";

/// Scaler configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ScalerConfig {
    /// Instance name reported in structured logs
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// API server port for health/metrics/status
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Target evaluation interval in seconds
    #[serde(default = "default_evaluation_interval")]
    pub evaluation_interval_secs: u64,

    /// Checkpoint flush interval in seconds
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval_secs: u64,

    /// Delay between a sample arriving and its target being evaluated, in milliseconds
    #[serde(default = "default_sample_debounce")]
    pub sample_debounce_millis: u64,

    /// Timeout for readiness, executor, snapshot and store calls in seconds
    #[serde(default = "default_external_call_timeout")]
    pub external_call_timeout_secs: u64,

    /// Half-life of usage sample weights in hours
    #[serde(default = "default_half_life_hours")]
    pub half_life_hours: u64,

    /// Directory holding histogram checkpoints
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,

    /// Capacity of the sample and executor event channels
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Policy for targets that do not declare their own
    #[serde(default)]
    pub default_policy: ScalingPolicy,

    /// Statically declared targets
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

/// One statically declared target
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub policy: Option<ScalingPolicy>,
    #[serde(default)]
    pub storage_engine: StorageEngine,
    #[serde(default)]
    pub topology: Topology,
    #[serde(default)]
    pub controlled_containers: Vec<String>,
    /// Current allocation per container
    pub containers: BTreeMap<String, ContainerConfig>,
    #[serde(default)]
    pub storage: Option<VolumeConfig>,
}

/// Requests and limits written as quantities (`500m`, `2Gi`)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerConfig {
    #[serde(default)]
    pub requests: QuantityConfig,
    #[serde(default)]
    pub limits: QuantityConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QuantityConfig {
    pub cpu: Option<String>,
    pub memory: Option<String>,
}

/// Data volume size and usage
#[derive(Debug, Clone, Deserialize)]
pub struct VolumeConfig {
    pub capacity: String,
    #[serde(default = "default_volume_used")]
    pub used: String,
}

fn default_instance_name() -> String {
    std::env::var("POD_NAME").unwrap_or_else(|_| "resource-scaler".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_evaluation_interval() -> u64 {
    60
}

fn default_checkpoint_interval() -> u64 {
    600
}

fn default_sample_debounce() -> u64 {
    1000
}

fn default_external_call_timeout() -> u64 {
    5
}

fn default_half_life_hours() -> u64 {
    24
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("/var/lib/resource-scaler/checkpoints")
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_volume_used() -> String {
    "0".to_string()
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            api_port: default_api_port(),
            evaluation_interval_secs: default_evaluation_interval(),
            checkpoint_interval_secs: default_checkpoint_interval(),
            sample_debounce_millis: default_sample_debounce(),
            external_call_timeout_secs: default_external_call_timeout(),
            half_life_hours: default_half_life_hours(),
            checkpoint_dir: default_checkpoint_dir(),
            channel_capacity: default_channel_capacity(),
            default_policy: ScalingPolicy::default(),
            targets: Vec::new(),
        }
    }
}

impl ScalerConfig {
    /// Load configuration from the optional `SCALER_CONFIG` file and
    /// `SCALER__*` environment variables, the environment winning
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            builder = builder.add_source(config::File::with_name(&path));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("SCALER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config
            .try_deserialize()
            .context("Invalid scaler configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a string in the given format
    pub fn parse(source: &str, format: config::FileFormat) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from_str(source, format))
            .build()?;
        let config: Self = config
            .try_deserialize()
            .context("Invalid scaler configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the control loop cannot run with
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("evaluation_interval_secs", self.evaluation_interval_secs),
            ("checkpoint_interval_secs", self.checkpoint_interval_secs),
            ("external_call_timeout_secs", self.external_call_timeout_secs),
            ("half_life_hours", self.half_life_hours),
            ("channel_capacity", self.channel_capacity as u64),
        ];
        for (field, value) in positive {
            if value == 0 {
                bail!("Invalid scaler configuration: {} must be greater than zero", field);
            }
        }
        Ok(())
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            evaluation_interval: Duration::from_secs(self.evaluation_interval_secs),
            checkpoint_interval: Duration::from_secs(self.checkpoint_interval_secs),
            sample_debounce: Duration::from_millis(self.sample_debounce_millis),
            external_call_timeout: Duration::from_secs(self.external_call_timeout_secs),
            channel_capacity: self.channel_capacity,
            recommender: RecommenderConfig::default()
                .with_half_life(Duration::from_secs(self.half_life_hours * 3600)),
            instance_name: self.instance_name.clone(),
            ..ControllerConfig::default()
        }
    }

    /// Build the declared targets; targets without a policy get the default
    pub fn build_targets(&self) -> Result<Vec<StaticTarget>> {
        self.targets
            .iter()
            .map(|target| {
                target
                    .build(&self.default_policy)
                    .with_context(|| format!("Invalid target {}/{}", target.namespace, target.name))
            })
            .collect()
    }
}

impl TargetConfig {
    fn build(&self, default_policy: &ScalingPolicy) -> Result<StaticTarget> {
        let mut allocation = ContainerResources::new();
        for (name, container) in &self.containers {
            allocation.insert(
                name.clone(),
                ResourceRequirements {
                    requests: container.requests.parse()?,
                    limits: container.limits.parse()?,
                },
            );
        }

        let policy = self.policy.clone().unwrap_or_else(|| default_policy.clone());
        let mut target = StaticTarget::new(TargetRef::new(&self.namespace, &self.name), policy, allocation)
            .with_engine(self.storage_engine)
            .with_topology(self.topology)
            .with_controlled_containers(self.controlled_containers.clone());

        if let Some(volume) = &self.storage {
            target = target.with_storage(StorageUsage {
                capacity_bytes: parse_bytes(&volume.capacity)?,
                used_bytes: parse_bytes(&volume.used)?,
            });
        }
        Ok(target)
    }
}

impl QuantityConfig {
    fn parse(&self) -> Result<ResourceList> {
        Ok(ResourceList {
            cpu_millicores: self.cpu.as_deref().map(parse_millicores).transpose()?,
            memory_bytes: self.memory.as_deref().map(parse_bytes).transpose()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scaler_lib::policy::Trigger;
    use scaler_lib::target::ScalingTarget;

    const CONFIG: &str = r#"{
        "api_port": 9100,
        "half_life_hours": 12,
        "default_policy": {
            "compute": { "trigger": "On" }
        },
        "targets": [
            {
                "namespace": "db",
                "name": "pg-main",
                "topology": { "mode": "replicated", "replicas": 3 },
                "containers": {
                    "postgres": {
                        "requests": { "cpu": "500m", "memory": "1Gi" },
                        "limits": { "cpu": "1", "memory": "2Gi" }
                    }
                },
                "storage": { "capacity": "10Gi", "used": "8Gi" }
            }
        ]
    }"#;

    #[test]
    fn test_defaults() {
        let config = ScalerConfig::parse("{}", config::FileFormat::Json).unwrap();
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.evaluation_interval_secs, 60);
        assert!(config.targets.is_empty());

        let controller = config.controller_config();
        assert_eq!(controller.checkpoint_interval, Duration::from_secs(600));
        assert_eq!(controller.sample_debounce, Duration::from_secs(1));
        assert_eq!(controller.recommender.half_life, Duration::from_secs(24 * 3600));
    }

    #[tokio::test]
    async fn test_targets_built_from_quantities() {
        let config = ScalerConfig::parse(CONFIG, config::FileFormat::Json).unwrap();
        assert_eq!(config.api_port, 9100);
        assert_eq!(
            config.controller_config().recommender.half_life,
            Duration::from_secs(12 * 3600)
        );

        let targets = config.build_targets().unwrap();
        assert_eq!(targets.len(), 1);
        let target = &targets[0];
        assert_eq!(target.target_ref(), &TargetRef::new("db", "pg-main"));
        assert_eq!(
            target.policy().compute.as_ref().map(|compute| compute.trigger),
            Some(Trigger::On)
        );

        let snapshot = target.snapshot().await.unwrap();
        let postgres = snapshot.current_allocation["postgres"];
        assert_eq!(postgres.requests, ResourceList::new(500, 1 << 30));
        assert_eq!(postgres.limits, ResourceList::new(1000, 2 << 30));
        assert_eq!(snapshot.topology, Topology::Replicated { replicas: 3 });
        assert_eq!(snapshot.storage_usage.unwrap().capacity_bytes, 10 << 30);
    }

    #[test]
    fn test_zero_intervals_rejected() {
        for source in [
            r#"{ "evaluation_interval_secs": 0 }"#,
            r#"{ "checkpoint_interval_secs": 0 }"#,
            r#"{ "channel_capacity": 0 }"#,
        ] {
            let error = ScalerConfig::parse(source, config::FileFormat::Json).unwrap_err();
            assert!(error.to_string().contains("greater than zero"), "{}", error);
        }

        let config = ScalerConfig {
            evaluation_interval_secs: 0,
            ..ScalerConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(ScalerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_quantity_rejected() {
        let source = r#"{
            "targets": [
                {
                    "namespace": "db",
                    "name": "pg-main",
                    "containers": { "postgres": { "requests": { "cpu": "lots" } } }
                }
            ]
        }"#;
        let config = ScalerConfig::parse(source, config::FileFormat::Json).unwrap();
        let error = config.build_targets().unwrap_err();
        assert!(error.to_string().contains("db/pg-main"));
    }
}
