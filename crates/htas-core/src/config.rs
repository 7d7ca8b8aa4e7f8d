//! htas.toml configuration parser.
//!
//! Every section has defaults; only `[[pool]]` and `[[instance_type]]`
//! tables must be supplied. Durations are strings (`"30s"`, `"5m"`) and
//! resource quantities use Kubernetes notation (`"500m"`, `"4Gi"`).

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::clock::duration_str;
use crate::resources::{parse_cpu_millis, parse_memory_mib_floor};
use crate::workload::WorkloadKind;

/// Errors raised while loading or validating `htas.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HtasConfig {
    #[serde(default)]
    pub profiler: ProfilerConfig,
    #[serde(default)]
    pub packer: PackerConfig,
    #[serde(default)]
    pub autoscaler: AutoscalerConfig,
    #[serde(default)]
    pub cleaner: CleanerConfig,
    #[serde(default)]
    pub cloud: CloudConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub kube: KubeConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(rename = "pool", default)]
    pub pools: Vec<PoolConfig>,
    #[serde(rename = "instance_type", default)]
    pub instance_types: Vec<InstanceTypeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    #[serde(with = "duration_str")]
    pub poll_interval: Duration,
    /// Profiles older than this are flagged stale when the API is unreachable.
    #[serde(with = "duration_str")]
    pub stale_ttl: Duration,
    /// List attempts per poll before giving up until the next cycle.
    pub retry_attempts: u32,
    #[serde(with = "duration_str")]
    pub retry_base: Duration,
    #[serde(with = "duration_str")]
    pub retry_max: Duration,
    /// Utilization samples kept per node.
    pub history_len: usize,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(20),
            stale_ttl: Duration::from_secs(120),
            retry_attempts: 3,
            retry_base: Duration::from_secs(1),
            retry_max: Duration::from_secs(30),
            history_len: 12,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackerConfig {
    #[serde(with = "duration_str")]
    pub interval: Duration,
    /// Only pods requesting this scheduler are packed.
    pub scheduler_name: String,
    #[serde(with = "duration_str")]
    pub batch_horizon: Duration,
    #[serde(with = "duration_str")]
    pub bin_width: Duration,
    /// Runtime assumed for batch pods that carry no estimate.
    #[serde(with = "duration_str")]
    pub default_batch_runtime: Duration,
}

impl Default for PackerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(20),
            scheduler_name: "htas-scheduler".to_string(),
            batch_horizon: Duration::from_secs(3600),
            bin_width: Duration::from_secs(300),
            default_batch_runtime: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscalerConfig {
    #[serde(with = "duration_str")]
    pub interval: Duration,
    /// How long an intent may stay unacknowledged before one retry.
    #[serde(with = "duration_str")]
    pub intent_timeout: Duration,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            intent_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanerConfig {
    #[serde(with = "duration_str")]
    pub interval: Duration,
    /// Pods migrated per node per cycle; the rest wait for the next cycle.
    pub max_migrations_per_step: usize,
    /// Termination attempts before reverting the node to ACTIVE.
    pub termination_retries: u32,
    #[serde(with = "duration_str")]
    pub termination_backoff: Duration,
    #[serde(with = "duration_str")]
    pub termination_backoff_max: Duration,
    /// A termination intent still pending after this counts as a failed attempt.
    #[serde(with = "duration_str")]
    pub termination_timeout: Duration,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_migrations_per_step: 5,
            termination_retries: 3,
            termination_backoff: Duration::from_secs(30),
            termination_backoff_max: Duration::from_secs(600),
            termination_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// Fallback poll interval for the intent queue (it also wakes on store events).
    #[serde(with = "duration_str")]
    pub interval: Duration,
    /// Command template run to create a node; stdout is the node name.
    pub create_command: Option<String>,
    /// Command template run to delete a node.
    pub delete_command: Option<String>,
    /// Command template run to checkpoint a pod; stdout is the snapshot handle.
    pub checkpoint_command: Option<String>,
    /// Command template run to restore a snapshot; stdout is the new pod id.
    pub restore_command: Option<String>,
    #[serde(with = "duration_str")]
    pub command_timeout: Duration,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            create_command: None,
            delete_command: None,
            checkpoint_command: None,
            restore_command: None,
            command_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Utilization below which a node counts as underused.
    pub drain_low_water: f64,
    /// Utilization the remaining nodes may not exceed after a removal.
    pub autoscale_high_water: f64,
    /// Consecutive low samples before a drain or scale-down.
    pub sustained_samples: usize,
    /// Sliding window (samples) for pool mean utilization.
    pub utilization_window: usize,
    /// Minimum spacing between structural changes of one pool.
    #[serde(with = "duration_str")]
    pub structural_cooldown: Duration,
    pub cpu_cost_weight: f64,
    pub memory_cost_weight: f64,
    /// Read-modify-write attempts on a version conflict.
    pub conflict_retries: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            drain_low_water: 0.5,
            autoscale_high_water: 0.8,
            sustained_samples: 5,
            utilization_window: 10,
            structural_cooldown: Duration::from_secs(300),
            cpu_cost_weight: 0.5,
            memory_cost_weight: 0.5,
            conflict_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KubeConfig {
    /// Node label naming the pool a node belongs to.
    pub pool_label: String,
    /// Pod label carrying the workload kind.
    pub workload_label: String,
    /// Pod annotation carrying the estimated runtime in seconds.
    pub runtime_annotation: String,
    /// Restrict pod listing to one namespace.
    pub namespace: Option<String>,
}

impl Default for KubeConfig {
    fn default() -> Self {
        Self {
            pool_label: "htas.cloud/pool".to_string(),
            workload_label: "workload-type".to_string(),
            runtime_annotation: "runtime".to_string(),
            namespace: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    pub workload: WorkloadKind,
    #[serde(default)]
    pub min_nodes: u32,
    pub max_nodes: u32,
    /// Instance types this pool may grow with; the first is the pool default.
    pub instance_types: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceTypeConfig {
    pub name: String,
    /// Cores as a number, or a quantity string such as `"1500m"`.
    #[serde(rename = "cpu", deserialize_with = "cpu_quantity", serialize_with = "cpu_string")]
    pub cpu_millis: u64,
    /// MiB as a number, or a quantity string such as `"8Gi"`.
    #[serde(rename = "memory", deserialize_with = "memory_quantity", serialize_with = "memory_string")]
    pub memory_mib: u64,
    pub hourly_cost: f64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Quantity {
    Number(f64),
    Text(String),
}

fn cpu_quantity<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    match Quantity::deserialize(deserializer)? {
        Quantity::Number(cores) if cores >= 0.0 => Ok((cores * 1000.0).round() as u64),
        Quantity::Number(cores) => Err(serde::de::Error::custom(format!(
            "negative cpu quantity {cores}"
        ))),
        Quantity::Text(s) => parse_cpu_millis(&s).map_err(serde::de::Error::custom),
    }
}

fn memory_quantity<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    match Quantity::deserialize(deserializer)? {
        // A bare number is MiB, matching the serialized form.
        Quantity::Number(mib) if mib >= 0.0 => Ok(mib.round() as u64),
        Quantity::Number(mib) => Err(serde::de::Error::custom(format!(
            "negative memory quantity {mib}"
        ))),
        Quantity::Text(s) => parse_memory_mib_floor(&s).map_err(serde::de::Error::custom),
    }
}

fn cpu_string<S: serde::Serializer>(millis: &u64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{millis}m"))
}

fn memory_string<S: serde::Serializer>(mib: &u64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{mib}Mi"))
}

impl HtasConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: HtasConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Check cross references and value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.pools.is_empty() {
            return invalid("at least one [[pool]] is required".to_string());
        }

        let mut type_names = HashSet::new();
        for t in &self.instance_types {
            if !type_names.insert(t.name.as_str()) {
                return invalid(format!("duplicate instance type {:?}", t.name));
            }
            if t.cpu_millis == 0 || t.memory_mib == 0 {
                return invalid(format!("instance type {:?} has zero capacity", t.name));
            }
            if !(t.hourly_cost > 0.0) {
                return invalid(format!("instance type {:?} needs a positive hourly_cost", t.name));
            }
        }

        let mut pool_names = HashSet::new();
        for p in &self.pools {
            if !pool_names.insert(p.name.as_str()) {
                return invalid(format!("duplicate pool {:?}", p.name));
            }
            if p.min_nodes > p.max_nodes {
                return invalid(format!(
                    "pool {:?}: min_nodes {} exceeds max_nodes {}",
                    p.name, p.min_nodes, p.max_nodes
                ));
            }
            if p.instance_types.is_empty() {
                return invalid(format!("pool {:?} lists no instance types", p.name));
            }
            for t in &p.instance_types {
                if !type_names.contains(t.as_str()) {
                    return invalid(format!("pool {:?} references unknown instance type {t:?}", p.name));
                }
            }
        }

        let policy = &self.policy;
        let in_unit = |v: f64| v > 0.0 && v <= 1.0;
        if !in_unit(policy.drain_low_water) || !in_unit(policy.autoscale_high_water) {
            return invalid("thresholds must lie in (0, 1]".to_string());
        }
        if policy.drain_low_water >= policy.autoscale_high_water {
            return invalid(format!(
                "drain_low_water {} must be below autoscale_high_water {}",
                policy.drain_low_water, policy.autoscale_high_water
            ));
        }
        if policy.sustained_samples == 0 || policy.utilization_window == 0 {
            return invalid("sustained_samples and utilization_window must be positive".to_string());
        }
        if self.profiler.history_len < policy.sustained_samples.max(policy.utilization_window) {
            return invalid(format!(
                "profiler.history_len {} must hold the sustain window",
                self.profiler.history_len
            ));
        }
        if policy.cpu_cost_weight < 0.0
            || policy.memory_cost_weight < 0.0
            || policy.cpu_cost_weight + policy.memory_cost_weight <= 0.0
        {
            return invalid("cost weights must be non-negative and not both zero".to_string());
        }

        let packer = &self.packer;
        if packer.bin_width.as_secs() == 0 {
            return invalid("packer.bin_width must be at least one second".to_string());
        }
        if packer.bin_width > packer.batch_horizon {
            return invalid("packer.bin_width must not exceed batch_horizon".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE: &str = r#"
[packer]
bin_width = "5m"
batch_horizon = "1h"

[policy]
drain_low_water = 0.5
autoscale_high_water = 0.8

[[pool]]
name = "batch-pool"
workload = "batch"
min_nodes = 1
max_nodes = 10
instance_types = ["e2-standard-2", "e2-micro"]

[[pool]]
name = "longrunning-pool"
workload = "long-running"
max_nodes = 4
instance_types = ["e2-standard-2"]

[[instance_type]]
name = "e2-micro"
cpu = "2"
memory = "1Gi"
hourly_cost = 0.006

[[instance_type]]
name = "e2-standard-2"
cpu = 2
memory = "8Gi"
hourly_cost = 0.0686
"#;

    #[test]
    fn parses_sample() {
        let config = HtasConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.pools.len(), 2);
        assert_eq!(config.pools[0].workload, WorkloadKind::Batch);
        assert_eq!(config.pools[1].min_nodes, 0);
        assert_eq!(config.instance_types[0].cpu_millis, 2000);
        assert_eq!(config.instance_types[0].memory_mib, 1024);
        assert_eq!(config.instance_types[1].memory_mib, 8192);
        assert_eq!(config.packer.bin_width, Duration::from_secs(300));
        assert_eq!(config.profiler.poll_interval, Duration::from_secs(20));
        assert_eq!(config.cloud.interval, Duration::from_secs(10));
    }

    #[test]
    fn rejects_unknown_instance_type() {
        let broken = SAMPLE.replace("[\"e2-standard-2\"]", "[\"n2-huge\"]");
        let err = HtasConfig::from_toml_str(&broken).unwrap_err();
        assert!(err.to_string().contains("n2-huge"));
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let broken = SAMPLE.replace("drain_low_water = 0.5", "drain_low_water = 0.9");
        assert!(matches!(
            HtasConfig::from_toml_str(&broken),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_bin_wider_than_horizon() {
        let broken = SAMPLE.replace("bin_width = \"5m\"", "bin_width = \"2h\"");
        assert!(HtasConfig::from_toml_str(&broken).is_err());
    }

    #[test]
    fn requires_a_pool() {
        assert!(HtasConfig::from_toml_str("").is_err());
    }

    #[test]
    fn serializes_back_to_toml() {
        let config = HtasConfig::from_toml_str(SAMPLE).unwrap();
        let rendered = config.to_toml_string().unwrap();
        let reparsed = HtasConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(reparsed.pools.len(), 2);
        assert_eq!(reparsed.instance_types[1].memory_mib, 8192);
        assert_eq!(reparsed.packer.batch_horizon, Duration::from_secs(3600));
    }
}
