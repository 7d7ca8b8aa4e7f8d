//! Collaborator traits and the observed cluster types they exchange.

use async_trait::async_trait;
use htas_core::{Resources, WorkloadKind};
use serde::Serialize;
use thiserror::Error;

/// Errors returned by collaborators.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("api unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("command failed: {0}")]
    Command(String),

    #[error("timed out: {0}")]
    Timeout(String),
}

impl ClusterError {
    /// Worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClusterError::Unavailable(_) | ClusterError::Timeout(_))
    }
}

pub type ClusterResult<T> = Result<T, ClusterError>;

// ── Observed state ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservedNode {
    pub name: String,
    /// Value of the pool label; unlabeled nodes are not profiled.
    pub pool: Option<String>,
    pub instance_type: String,
    pub capacity: Resources,
    pub allocatable: Resources,
    /// False while cordoned.
    pub schedulable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservedPod {
    pub id: String,
    pub node: Option<String>,
    pub phase: PodPhase,
    pub requests: Resources,
    pub kind: WorkloadKind,
    /// Estimated runtime in seconds (batch only).
    pub estimated_runtime: Option<u64>,
    pub created_at: u64,
    pub started_at: Option<u64>,
    /// Explicit pool requested by the pod.
    pub pool: Option<String>,
    pub scheduler_name: Option<String>,
    /// Bound to its node for the node's lifetime (daemon and mirror pods).
    /// Never migrated; it goes away with the node.
    pub pinned: bool,
}

impl ObservedPod {
    /// An unbound pod, as submitted.
    pub fn pending(id: impl Into<String>, requests: Resources, kind: WorkloadKind, created_at: u64) -> Self {
        Self {
            id: id.into(),
            node: None,
            phase: PodPhase::Pending,
            requests,
            kind,
            estimated_runtime: None,
            created_at,
            started_at: None,
            pool: None,
            scheduler_name: None,
            pinned: false,
        }
    }

    pub fn with_runtime(mut self, seconds: u64) -> Self {
        self.estimated_runtime = Some(seconds);
        self
    }

    pub fn with_scheduler(mut self, name: &str) -> Self {
        self.scheduler_name = Some(name.to_string());
        self
    }

    pub fn pinned(mut self) -> Self {
        self.pinned = true;
        self
    }

    pub fn with_pool(mut self, pool: &str) -> Self {
        self.pool = Some(pool.to_string());
        self
    }

    /// Waiting for a node.
    pub fn is_unbound(&self) -> bool {
        self.node.is_none() && self.phase == PodPhase::Pending
    }

    /// Holding resources on `node`.
    pub fn occupies(&self, node: &str) -> bool {
        self.node.as_deref() == Some(node) && !self.phase.is_terminal()
    }

    /// Holding resources on `node` and movable off it.
    pub fn must_leave(&self, node: &str) -> bool {
        self.occupies(node) && !self.pinned
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindOutcome {
    Bound,
    /// The pod was already bound to the requested node.
    AlreadyBound,
    /// The orchestrator refused; the pod stays pending.
    Conflict(String),
}

/// Opaque handle to a pod checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SnapshotHandle(pub String);

impl std::fmt::Display for SnapshotHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Collaborators ──────────────────────────────────────────────────

/// The container orchestrator's scheduling extension point.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn list_nodes(&self) -> ClusterResult<Vec<ObservedNode>>;

    async fn list_pods(&self) -> ClusterResult<Vec<ObservedPod>>;

    async fn bind(&self, pod: &str, node: &str) -> ClusterResult<BindOutcome>;

    /// Evict a pod so its controller reschedules it fresh.
    async fn evict(&self, pod: &str) -> ClusterResult<()>;

    async fn delete_pod(&self, pod: &str) -> ClusterResult<()>;

    /// Mark a node (un)schedulable.
    async fn cordon(&self, node: &str, cordoned: bool) -> ClusterResult<()>;
}

/// The cloud provider's VM lifecycle API.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Create a node in `pool`; returns its node name.
    async fn create_node(&self, pool: &str, instance_type: &str) -> ClusterResult<String>;

    async fn delete_node(&self, node: &str) -> ClusterResult<()>;
}

/// Pod checkpoint/restore.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    async fn checkpoint(&self, pod: &str) -> ClusterResult<SnapshotHandle>;

    /// Restore a checkpoint on `node`; returns the restored pod's id.
    async fn restore(&self, snapshot: &SnapshotHandle, node: &str) -> ClusterResult<String>;
}

/// Used when no checkpoint mechanism is configured: every migration
/// degrades to eviction.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledCheckpointer;

#[async_trait]
impl Checkpointer for DisabledCheckpointer {
    async fn checkpoint(&self, pod: &str) -> ClusterResult<SnapshotHandle> {
        Err(ClusterError::Rejected(format!(
            "checkpointing disabled, cannot checkpoint {pod}"
        )))
    }

    async fn restore(&self, snapshot: &SnapshotHandle, _node: &str) -> ClusterResult<String> {
        Err(ClusterError::Rejected(format!(
            "checkpointing disabled, cannot restore {snapshot}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_occupancy() {
        let mut pod = ObservedPod::pending("default/a", Resources::new(100, 64), WorkloadKind::Batch, 0);
        assert!(pod.is_unbound());
        assert!(!pod.occupies("n1"));
        pod.node = Some("n1".into());
        pod.phase = PodPhase::Running;
        assert!(pod.occupies("n1"));
        pod.phase = PodPhase::Succeeded;
        assert!(!pod.occupies("n1"));
    }

    #[tokio::test]
    async fn disabled_checkpointer_always_fails() {
        let c = DisabledCheckpointer;
        assert!(c.checkpoint("default/a").await.is_err());
        assert!(c.restore(&SnapshotHandle("s".into()), "n1").await.is_err());
    }

    #[test]
    fn transient_errors() {
        assert!(ClusterError::Unavailable("down".into()).is_transient());
        assert!(!ClusterError::NotFound("pod".into()).is_transient());
    }
}
