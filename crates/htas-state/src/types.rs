//! Domain types for the HTAS state store.
//!
//! Field ownership is partitioned by writer: the profiler owns capacity,
//! usage, history and staleness of a [`NodeProfile`]; the packer owns
//! [`Placement`] and [`PendingDemand`]; the autoscaler and cleaner own
//! [`ScalingIntent`], [`PoolState`] and a profile's lifecycle and drain
//! record.

use std::ops::Deref;

use htas_core::{Resources, WorkloadKind, utilization};
use serde::{Deserialize, Serialize};

/// Name of a node, as the orchestrator reports it.
pub type NodeName = String;

/// Unique identifier for a pod (`{namespace}/{name}` for Kubernetes).
pub type PodId = String;

/// Name of a node pool.
pub type PoolName = String;

// ── Versioning ─────────────────────────────────────────────────────

/// A stored record and the version it was read at.
///
/// Versions start at 1 and grow by one with every committed write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

impl<T> Versioned<T> {
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> Deref for Versioned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

// ── Node profiles ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Lifecycle {
    Active,
    Draining,
    Terminating,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lifecycle::Active => write!(f, "ACTIVE"),
            Lifecycle::Draining => write!(f, "DRAINING"),
            Lifecycle::Terminating => write!(f, "TERMINATING"),
        }
    }
}

/// Bounded ring of utilization samples, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtilizationHistory {
    samples: Vec<f64>,
    capacity: usize,
}

impl UtilizationHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, sample: f64) {
        if self.samples.len() >= self.capacity {
            let excess = self.samples.len() + 1 - self.capacity;
            self.samples.drain(..excess);
        }
        self.samples.push(sample);
    }

    /// Change the bound, dropping the oldest samples if it shrinks.
    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        if self.samples.len() > self.capacity {
            let excess = self.samples.len() - self.capacity;
            self.samples.drain(..excess);
        }
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.samples
    }

    pub fn latest(&self) -> Option<f64> {
        self.samples.last().copied()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Per-node view published by the profiler.
///
/// Serializes with the external profile schema
/// (`instanceName`, `cpuCapacity`, `memoryAvailable`, `runtime`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeProfile {
    pub instance_name: NodeName,
    pub instance_type: String,
    pub pool: PoolName,
    /// Millicores.
    pub cpu_capacity: u64,
    /// MiB.
    pub memory_capacity: u64,
    pub cpu_available: u64,
    pub memory_available: u64,
    /// Longest remaining estimated runtime of batch work on the node.
    #[serde(rename = "runtime")]
    pub runtime_seconds: u64,
    pub last_updated: u64,
    pub stale: bool,
    pub utilization_history: UtilizationHistory,
    pub lifecycle: Lifecycle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drain: Option<DrainRecord>,
}

impl NodeProfile {
    pub fn new(
        instance_name: impl Into<String>,
        instance_type: impl Into<String>,
        pool: impl Into<String>,
        capacity: Resources,
        history_len: usize,
    ) -> Self {
        Self {
            instance_name: instance_name.into(),
            instance_type: instance_type.into(),
            pool: pool.into(),
            cpu_capacity: capacity.cpu_millis,
            memory_capacity: capacity.memory_mib,
            cpu_available: capacity.cpu_millis,
            memory_available: capacity.memory_mib,
            runtime_seconds: 0,
            last_updated: 0,
            stale: false,
            utilization_history: UtilizationHistory::new(history_len),
            lifecycle: Lifecycle::Active,
            drain: None,
        }
    }

    pub fn capacity(&self) -> Resources {
        Resources::new(self.cpu_capacity, self.memory_capacity)
    }

    pub fn available(&self) -> Resources {
        Resources::new(self.cpu_available, self.memory_available)
    }

    pub fn used(&self) -> Resources {
        self.capacity().saturating_sub(self.available())
    }

    /// Set capacity and availability, clamping availability to capacity.
    pub fn set_resources(&mut self, capacity: Resources, available: Resources) {
        let available = available.min(capacity);
        self.cpu_capacity = capacity.cpu_millis;
        self.memory_capacity = capacity.memory_mib;
        self.cpu_available = available.cpu_millis;
        self.memory_available = available.memory_mib;
    }

    pub fn utilization(&self) -> f64 {
        utilization(self.used(), self.capacity())
    }

    /// Only active, fresh nodes receive new work.
    pub fn is_schedulable(&self) -> bool {
        self.lifecycle == Lifecycle::Active && !self.stale
    }

    /// Draining and terminating nodes count as "being removed".
    pub fn is_leaving(&self) -> bool {
        self.lifecycle != Lifecycle::Active
    }
}

// ── Drain records ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainOrigin {
    /// The cleaner found the node underused.
    Cleaner,
    /// The autoscaler nominated the node for a pool scale-down.
    ScaleDown,
}

/// A pod moved off a draining node by checkpoint/restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Migration {
    pub pod: PodId,
    pub restored_as: PodId,
    pub target: NodeName,
    pub at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationFailure {
    pub pod: PodId,
    pub error: String,
    pub at: u64,
}

/// Migration failures kept per drain; older ones are dropped.
pub const MAX_DRAIN_FAILURES: usize = 16;

/// Persisted progress of a drain, so an interrupted drain resumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrainRecord {
    pub origin: DrainOrigin,
    pub started_at: u64,
    /// The node has been marked unschedulable in the orchestrator.
    #[serde(default)]
    pub cordoned: bool,
    /// Set before the first checkpoint; a started drain cannot be cancelled.
    pub migration_started: bool,
    #[serde(default)]
    pub migrated: Vec<Migration>,
    /// Pods that fell back to plain eviction.
    #[serde(default)]
    pub evicted: Vec<PodId>,
    /// The most recent [`MAX_DRAIN_FAILURES`] failures, oldest first.
    #[serde(default)]
    pub failures: Vec<MigrationFailure>,
    #[serde(default)]
    pub termination_attempts: u32,
    /// Earliest time the next termination intent may be issued.
    #[serde(default)]
    pub next_attempt_at: Option<u64>,
}

impl DrainRecord {
    pub fn new(origin: DrainOrigin, started_at: u64) -> Self {
        Self {
            origin,
            started_at,
            cordoned: false,
            migration_started: false,
            migrated: Vec::new(),
            evicted: Vec::new(),
            failures: Vec::new(),
            termination_attempts: 0,
            next_attempt_at: None,
        }
    }

    pub fn record_failure(&mut self, failure: MigrationFailure) {
        self.failures.push(failure);
        if self.failures.len() > MAX_DRAIN_FAILURES {
            let excess = self.failures.len() - MAX_DRAIN_FAILURES;
            self.failures.drain(..excess);
        }
    }

    /// Whether `pod` was already handled by this drain.
    pub fn handled(&self, pod: &str) -> bool {
        self.migrated.iter().any(|m| m.pod == pod) || self.evicted.iter().any(|p| p == pod)
    }
}

// ── Placements ─────────────────────────────────────────────────────

/// A bind decision: pod → node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub pod_id: PodId,
    pub node: NodeName,
    pub pool: PoolName,
    pub resources: Resources,
    pub kind: WorkloadKind,
    pub bound_at: u64,
    /// Batch only: `bound_at + estimated runtime`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_end: Option<u64>,
}

// ── Scaling intents ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentOrigin {
    Autoscaler,
    Cleaner,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum IntentStatus {
    Pending,
    /// Claimed by the cloud adaptor; the provider call is running.
    InProgress,
    Acknowledged { nodes: Vec<NodeName> },
    Failed { error: String },
}

/// A request to the cloud adaptor to grow or shrink a pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingIntent {
    pub pool: PoolName,
    pub delta: i32,
    pub instance_type: String,
    /// Node-scoped termination when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeName>,
    pub reason: String,
    pub origin: IntentOrigin,
    pub created_at: u64,
    pub status: IntentStatus,
    /// Set after the one permitted retry.
    #[serde(default)]
    pub retried: bool,
}

impl ScalingIntent {
    pub fn scale_up(pool: &str, count: u32, instance_type: &str, reason: String, now: u64) -> Self {
        Self {
            pool: pool.to_string(),
            delta: i32::try_from(count).unwrap_or(i32::MAX),
            instance_type: instance_type.to_string(),
            node: None,
            reason,
            origin: IntentOrigin::Autoscaler,
            created_at: now,
            status: IntentStatus::Pending,
            retried: false,
        }
    }

    pub fn terminate(profile: &NodeProfile, reason: String, now: u64) -> Self {
        Self {
            pool: profile.pool.clone(),
            delta: -1,
            instance_type: profile.instance_type.clone(),
            node: Some(profile.instance_name.clone()),
            reason,
            origin: IntentOrigin::Cleaner,
            created_at: now,
            status: IntentStatus::Pending,
            retried: false,
        }
    }

    pub fn is_scale_up(&self) -> bool {
        self.delta > 0
    }

    pub fn is_pending(&self) -> bool {
        self.status == IntentStatus::Pending
    }

    pub fn is_in_progress(&self) -> bool {
        self.status == IntentStatus::InProgress
    }
}

// ── Pool bookkeeping ───────────────────────────────────────────────

/// Demand the packer could not place this pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDemand {
    pub pool: PoolName,
    pub tasks: u32,
    /// Sum of the pending requests.
    pub resources: Resources,
    /// Largest single pending request, per dimension.
    pub largest: Resources,
    pub oldest_arrival: Option<u64>,
    pub updated_at: u64,
}

impl PendingDemand {
    pub fn empty(pool: &str, now: u64) -> Self {
        Self {
            pool: pool.to_string(),
            tasks: 0,
            resources: Resources::ZERO,
            largest: Resources::ZERO,
            oldest_arrival: None,
            updated_at: now,
        }
    }

    pub fn add(&mut self, request: Resources, arrival: u64) {
        self.tasks += 1;
        self.resources += request;
        self.largest = self.largest.max(request);
        self.oldest_arrival = Some(self.oldest_arrival.map_or(arrival, |o| o.min(arrival)));
    }
}

/// A node the cloud created that the profiler has not seen yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningNode {
    pub name: NodeName,
    pub instance_type: String,
    pub requested_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolState {
    pub pool: PoolName,
    pub last_change_at: Option<u64>,
    #[serde(default)]
    pub provisioning: Vec<ProvisioningNode>,
}

impl PoolState {
    pub fn new(pool: &str) -> Self {
        Self {
            pool: pool.to_string(),
            last_change_at: None,
            provisioning: Vec::new(),
        }
    }
}

// ── Alerts and tombstones ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Loop that raised it (`autoscaler`, `cleaner`, ...).
    pub source: String,
    /// Pool or node the alert is about.
    pub subject: String,
    pub severity: Severity,
    pub message: String,
    pub raised_at: u64,
}

impl Alert {
    pub fn table_key(&self) -> String {
        format!("{:020}/{}/{}", self.raised_at, self.source, self.subject)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    pub node: NodeName,
    pub removed_at: u64,
}
