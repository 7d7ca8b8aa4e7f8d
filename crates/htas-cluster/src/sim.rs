//! In-process simulated cluster with fault injection.
//!
//! Implements [`Orchestrator`], [`CloudProvider`] and [`Checkpointer`]
//! over one shared state. Binds and restores respect allocatable capacity,
//! and deleting a node that still holds pods marks those pods as lost so
//! tests can assert nothing was terminated underneath a workload.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use htas_core::{PoolPolicy, Resources, epoch_secs};
use tokio::sync::Mutex;
use tracing::debug;

use crate::api::*;

/// Failures to inject into the next calls.
#[derive(Debug, Default, Clone)]
pub struct Faults {
    /// Fail this many upcoming `list_nodes`/`list_pods` calls.
    pub list_failures: u32,
    /// Fail this many upcoming `create_node` calls.
    pub create_failures: u32,
    /// Fail this many upcoming `delete_node` calls.
    pub delete_failures: u32,
    /// Pods whose checkpoint always fails.
    pub checkpoint_failures: BTreeSet<String>,
    /// Fail this many upcoming `restore` calls.
    pub restore_failures: u32,
}

#[derive(Debug, Default)]
struct SimState {
    nodes: BTreeMap<String, ObservedNode>,
    pods: BTreeMap<String, ObservedPod>,
    snapshots: BTreeMap<String, ObservedPod>,
    next_index: BTreeMap<String, u32>,
    sequence: u64,
    lost: Vec<String>,
    faults: Faults,
    /// Fixed time for tests; wall clock otherwise.
    clock: Option<u64>,
}

impl SimState {
    fn used_on(&self, node: &str) -> Resources {
        self.pods
            .values()
            .filter(|p| p.occupies(node))
            .map(|p| p.requests)
            .sum()
    }

    fn fits(&self, node: &ObservedNode, requests: Resources) -> bool {
        (self.used_on(&node.name) + requests).fits_within(&node.allocatable)
    }

    fn now(&self) -> u64 {
        self.clock.unwrap_or_else(epoch_secs)
    }

    fn next_seq(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn take_list_fault(&mut self) -> ClusterResult<()> {
        if self.faults.list_failures > 0 {
            self.faults.list_failures -= 1;
            return Err(ClusterError::Unavailable("simulated api outage".into()));
        }
        Ok(())
    }
}

pub struct SimCluster {
    catalog: BTreeMap<String, Resources>,
    state: Mutex<SimState>,
}

impl SimCluster {
    /// A cluster that can create nodes of the given instance types.
    pub fn new(catalog: impl IntoIterator<Item = (String, Resources)>) -> Self {
        Self {
            catalog: catalog.into_iter().collect(),
            state: Mutex::new(SimState::default()),
        }
    }

    pub fn from_policy(policy: &PoolPolicy) -> Self {
        let catalog = policy
            .pools()
            .iter()
            .flat_map(|p| policy.instance_types_for(&p.name))
            .map(|t| (t.name.clone(), t.capacity));
        Self::new(catalog)
    }

    /// Add a node named `{pool}-{n}`.
    pub async fn add_node(&self, pool: &str, instance_type: &str) -> ClusterResult<String> {
        let capacity = self
            .catalog
            .get(instance_type)
            .copied()
            .ok_or_else(|| ClusterError::Rejected(format!("unknown instance type {instance_type}")))?;
        let mut state = self.state.lock().await;
        let index = state.next_index.entry(pool.to_string()).or_insert(0);
        *index += 1;
        let name = format!("{pool}-{index}");
        state.nodes.insert(
            name.clone(),
            ObservedNode {
                name: name.clone(),
                pool: Some(pool.to_string()),
                instance_type: instance_type.to_string(),
                capacity,
                allocatable: capacity,
                schedulable: true,
            },
        );
        debug!(node = %name, %pool, %instance_type, "sim node added");
        Ok(name)
    }

    /// Add a node with an explicit name (unlabeled nodes pass `None`).
    pub async fn add_named_node(&self, name: &str, pool: Option<&str>, instance_type: &str, capacity: Resources) {
        let mut state = self.state.lock().await;
        state.nodes.insert(
            name.to_string(),
            ObservedNode {
                name: name.to_string(),
                pool: pool.map(str::to_string),
                instance_type: instance_type.to_string(),
                capacity,
                allocatable: capacity,
                schedulable: true,
            },
        );
    }

    /// Remove a node object without touching its pods.
    pub async fn forget_node(&self, name: &str) {
        self.state.lock().await.nodes.remove(name);
    }

    pub async fn submit(&self, pod: ObservedPod) {
        self.state.lock().await.pods.insert(pod.id.clone(), pod);
    }

    /// Place a pod directly, bypassing capacity checks (test setup).
    pub async fn place(&self, mut pod: ObservedPod, node: &str, started_at: u64) {
        pod.node = Some(node.to_string());
        pod.phase = PodPhase::Running;
        pod.started_at = Some(started_at);
        self.submit(pod).await;
    }

    pub async fn set_phase(&self, pod: &str, phase: PodPhase) {
        if let Some(p) = self.state.lock().await.pods.get_mut(pod) {
            p.phase = phase;
        }
    }

    /// Pin the simulated clock used for bind and restore times.
    pub async fn set_clock(&self, now: u64) {
        self.state.lock().await.clock = Some(now);
    }

    pub async fn inject(&self, f: impl FnOnce(&mut Faults)) {
        f(&mut self.state.lock().await.faults);
    }

    pub async fn node(&self, name: &str) -> Option<ObservedNode> {
        self.state.lock().await.nodes.get(name).cloned()
    }

    pub async fn node_names(&self) -> Vec<String> {
        self.state.lock().await.nodes.keys().cloned().collect()
    }

    pub async fn pod(&self, id: &str) -> Option<ObservedPod> {
        self.state.lock().await.pods.get(id).cloned()
    }

    /// Pods holding resources on `node`.
    pub async fn pods_on(&self, node: &str) -> Vec<ObservedPod> {
        let state = self.state.lock().await;
        state.pods.values().filter(|p| p.occupies(node)).cloned().collect()
    }

    /// Pods that were still running on a node when it was deleted.
    pub async fn lost_pods(&self) -> Vec<String> {
        self.state.lock().await.lost.clone()
    }
}

#[async_trait]
impl Orchestrator for SimCluster {
    async fn list_nodes(&self) -> ClusterResult<Vec<ObservedNode>> {
        let mut state = self.state.lock().await;
        state.take_list_fault()?;
        Ok(state.nodes.values().cloned().collect())
    }

    async fn list_pods(&self) -> ClusterResult<Vec<ObservedPod>> {
        let mut state = self.state.lock().await;
        state.take_list_fault()?;
        Ok(state.pods.values().cloned().collect())
    }

    async fn bind(&self, pod: &str, node: &str) -> ClusterResult<BindOutcome> {
        let mut state = self.state.lock().await;
        let Some(current) = state.pods.get(pod) else {
            return Err(ClusterError::NotFound(format!("pod {pod}")));
        };
        match current.node.as_deref() {
            Some(bound) if bound == node => return Ok(BindOutcome::AlreadyBound),
            Some(bound) => return Ok(BindOutcome::Conflict(format!("{pod} already bound to {bound}"))),
            None => {}
        }
        let requests = current.requests;
        let Some(target) = state.nodes.get(node) else {
            return Ok(BindOutcome::Conflict(format!("node {node} does not exist")));
        };
        if !state.fits(target, requests) {
            return Ok(BindOutcome::Conflict(format!("{pod} does not fit on {node}")));
        }
        let now = state.now();
        if let Some(p) = state.pods.get_mut(pod) {
            p.node = Some(node.to_string());
            p.phase = PodPhase::Running;
            p.started_at = Some(now);
        }
        Ok(BindOutcome::Bound)
    }

    async fn evict(&self, pod: &str) -> ClusterResult<()> {
        let mut state = self.state.lock().await;
        let Some(mut evicted) = state.pods.remove(pod) else {
            return Err(ClusterError::NotFound(format!("pod {pod}")));
        };
        // The controller recreates it: pinned pods on the same node, the
        // rest as a fresh pending pod.
        let seq = state.next_seq();
        evicted.id = format!("{pod}-e{seq}");
        if evicted.pinned {
            evicted.started_at = Some(state.now());
        } else {
            evicted.node = None;
            evicted.phase = PodPhase::Pending;
            evicted.started_at = None;
        }
        state.pods.insert(evicted.id.clone(), evicted);
        Ok(())
    }

    async fn delete_pod(&self, pod: &str) -> ClusterResult<()> {
        let mut state = self.state.lock().await;
        state
            .pods
            .remove(pod)
            .map(|_| ())
            .ok_or_else(|| ClusterError::NotFound(format!("pod {pod}")))
    }

    async fn cordon(&self, node: &str, cordoned: bool) -> ClusterResult<()> {
        let mut state = self.state.lock().await;
        let n = state
            .nodes
            .get_mut(node)
            .ok_or_else(|| ClusterError::NotFound(format!("node {node}")))?;
        n.schedulable = !cordoned;
        Ok(())
    }
}

#[async_trait]
impl CloudProvider for SimCluster {
    async fn create_node(&self, pool: &str, instance_type: &str) -> ClusterResult<String> {
        {
            let mut state = self.state.lock().await;
            if state.faults.create_failures > 0 {
                state.faults.create_failures -= 1;
                return Err(ClusterError::Unavailable("simulated quota exhaustion".into()));
            }
        }
        self.add_node(pool, instance_type).await
    }

    async fn delete_node(&self, node: &str) -> ClusterResult<()> {
        let mut state = self.state.lock().await;
        if state.faults.delete_failures > 0 {
            state.faults.delete_failures -= 1;
            return Err(ClusterError::Unavailable("simulated delete failure".into()));
        }
        if state.nodes.remove(node).is_none() {
            return Err(ClusterError::NotFound(format!("node {node}")));
        }
        let mut lost = Vec::new();
        for pod in state.pods.values_mut() {
            if pod.occupies(node) {
                pod.phase = PodPhase::Failed;
                if !pod.pinned {
                    lost.push(pod.id.clone());
                }
            }
        }
        state.lost.extend(lost);
        debug!(%node, "sim node deleted");
        Ok(())
    }
}

#[async_trait]
impl Checkpointer for SimCluster {
    async fn checkpoint(&self, pod: &str) -> ClusterResult<SnapshotHandle> {
        let mut state = self.state.lock().await;
        if state.faults.checkpoint_failures.contains(pod) {
            return Err(ClusterError::Command(format!("checkpoint of {pod} failed")));
        }
        let Some(p) = state.pods.get(pod).cloned() else {
            return Err(ClusterError::NotFound(format!("pod {pod}")));
        };
        if p.phase != PodPhase::Running {
            return Err(ClusterError::Rejected(format!("pod {pod} is not running")));
        }
        let handle = format!("snap-{}", state.next_seq());
        state.snapshots.insert(handle.clone(), p);
        Ok(SnapshotHandle(handle))
    }

    async fn restore(&self, snapshot: &SnapshotHandle, node: &str) -> ClusterResult<String> {
        let mut state = self.state.lock().await;
        if state.faults.restore_failures > 0 {
            state.faults.restore_failures -= 1;
            return Err(ClusterError::Command(format!("restore of {snapshot} failed")));
        }
        let Some(mut pod) = state.snapshots.get(&snapshot.0).cloned() else {
            return Err(ClusterError::NotFound(format!("snapshot {snapshot}")));
        };
        let Some(target) = state.nodes.get(node) else {
            return Err(ClusterError::NotFound(format!("node {node}")));
        };
        if !state.fits(target, pod.requests) {
            return Err(ClusterError::Rejected(format!("{} does not fit on {node}", pod.id)));
        }
        let seq = state.next_seq();
        pod.id = format!("{}-m{seq}", pod.id);
        pod.node = Some(node.to_string());
        pod.phase = PodPhase::Running;
        pod.started_at = Some(state.now());
        let id = pod.id.clone();
        state.pods.insert(id.clone(), pod);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use htas_core::WorkloadKind;

    fn sim() -> SimCluster {
        SimCluster::new([("e2-standard-2".to_string(), Resources::cores_gib(2, 4))])
    }

    #[tokio::test]
    async fn names_nodes_per_pool() {
        let sim = sim();
        assert_eq!(sim.add_node("batch-pool", "e2-standard-2").await.unwrap(), "batch-pool-1");
        assert_eq!(sim.create_node("batch-pool", "e2-standard-2").await.unwrap(), "batch-pool-2");
        assert!(sim.add_node("batch-pool", "n2-huge").await.is_err());
    }

    #[tokio::test]
    async fn bind_outcomes() {
        let sim = sim();
        let node = sim.add_node("p", "e2-standard-2").await.unwrap();
        sim.submit(ObservedPod::pending("a", Resources::cores_gib(1, 1), WorkloadKind::Batch, 1)).await;
        sim.submit(ObservedPod::pending("big", Resources::cores_gib(3, 1), WorkloadKind::Batch, 1)).await;

        assert_eq!(sim.bind("a", &node).await.unwrap(), BindOutcome::Bound);
        assert_eq!(sim.bind("a", &node).await.unwrap(), BindOutcome::AlreadyBound);
        assert!(matches!(sim.bind("big", &node).await.unwrap(), BindOutcome::Conflict(_)));
        assert!(matches!(sim.bind("a", "elsewhere").await.unwrap(), BindOutcome::Conflict(_)));
        assert!(sim.bind("ghost", &node).await.is_err());
    }

    #[tokio::test]
    async fn list_faults_are_consumed() {
        let sim = sim();
        sim.inject(|f| f.list_failures = 1).await;
        assert!(sim.list_nodes().await.unwrap_err().is_transient());
        assert!(sim.list_nodes().await.is_ok());
    }

    #[tokio::test]
    async fn checkpoint_and_restore_moves_a_pod() {
        let sim = sim();
        let a = sim.add_node("p", "e2-standard-2").await.unwrap();
        let b = sim.add_node("p", "e2-standard-2").await.unwrap();
        sim.place(ObservedPod::pending("job", Resources::cores_gib(1, 1), WorkloadKind::Batch, 0), &a, 1)
            .await;

        let handle = sim.checkpoint("job").await.unwrap();
        let restored = sim.restore(&handle, &b).await.unwrap();
        assert_eq!(sim.pod(&restored).await.unwrap().node.as_deref(), Some(b.as_str()));
        sim.delete_pod("job").await.unwrap();
        assert!(sim.pods_on(&a).await.is_empty());
    }

    #[tokio::test]
    async fn deleting_an_occupied_node_loses_pods() {
        let sim = sim();
        let a = sim.add_node("p", "e2-standard-2").await.unwrap();
        sim.place(ObservedPod::pending("svc", Resources::new(100, 64), WorkloadKind::LongRunning, 0), &a, 1)
            .await;
        sim.delete_node(&a).await.unwrap();
        assert_eq!(sim.lost_pods().await, vec!["svc".to_string()]);
    }

    #[tokio::test]
    async fn pinned_pods_stay_with_their_node() {
        let sim = sim();
        let a = sim.add_node("p", "e2-standard-2").await.unwrap();
        let daemon = ObservedPod::pending("agent", Resources::new(50, 64), WorkloadKind::LongRunning, 0).pinned();
        sim.place(daemon, &a, 1).await;

        sim.evict("agent").await.unwrap();
        let on_a = sim.pods_on(&a).await;
        assert_eq!(on_a.len(), 1);
        assert!(on_a[0].pinned);

        sim.delete_node(&a).await.unwrap();
        assert!(sim.lost_pods().await.is_empty());
    }

    #[tokio::test]
    async fn eviction_requeues_a_fresh_pod() {
        let sim = sim();
        let a = sim.add_node("p", "e2-standard-2").await.unwrap();
        sim.place(ObservedPod::pending("svc", Resources::new(100, 64), WorkloadKind::LongRunning, 0), &a, 1)
            .await;
        sim.evict("svc").await.unwrap();
        assert!(sim.pod("svc").await.is_none());
        let pods = sim.list_pods().await.unwrap();
        assert_eq!(pods.len(), 1);
        assert!(pods[0].is_unbound());
    }
}
