//! The task packer control loop.
//!
//! Each pass:
//! 1. lists pods and takes a [`ClusterSnapshot`]
//! 2. garbage-collects placements of pods that are gone, finished or
//!    bound elsewhere
//! 3. plans every pool from the snapshot (see [`plan_pool`])
//! 4. binds immediate decisions one by one and records their placements
//! 5. publishes per-pool [`PendingDemand`] for the autoscaler

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use htas_cluster::{BindOutcome, ObservedPod, Orchestrator};
use htas_core::config::PackerConfig;
use htas_core::{PoolPolicy, epoch_secs};
use htas_state::{ClusterSnapshot, PendingDemand, Placement, StateStore};
use tracing::{debug, info, warn};

use crate::error::PackerError;
use crate::plan::{Decision, plan_pool};
use crate::task::{PendingTask, pending_tasks};
use crate::timebin::BinLayout;

/// Outcome counters of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub bound: usize,
    pub deferred: usize,
    pub overflow: usize,
    pub conflicts: usize,
    pub collected: usize,
}

pub struct TaskPacker {
    store: StateStore,
    orchestrator: Arc<dyn Orchestrator>,
    policy: Arc<PoolPolicy>,
    config: PackerConfig,
}

impl TaskPacker {
    pub fn new(
        store: StateStore,
        orchestrator: Arc<dyn Orchestrator>,
        policy: Arc<PoolPolicy>,
        config: PackerConfig,
    ) -> Self {
        Self {
            store,
            orchestrator,
            policy,
            config,
        }
    }

    /// Run one scheduling pass at time `now`.
    pub async fn pass(&self, now: u64) -> Result<PassReport, PackerError> {
        let pods = self.orchestrator.list_pods().await?;
        let mut snapshot = self.store.snapshot(now)?;
        let mut report = PassReport {
            collected: self.collect_placements(&mut snapshot, &pods, now)?,
            ..Default::default()
        };

        let tasks = pending_tasks(&pods, &self.config.scheduler_name, self.config.default_batch_runtime);
        let mut by_pool: BTreeMap<String, Vec<PendingTask>> = BTreeMap::new();
        for task in tasks {
            if snapshot.placements.contains_key(&task.pod_id) {
                // Bound last pass; the orchestrator has not caught up yet.
                continue;
            }
            match self.policy.pool_for(task.kind, task.pool.as_deref()) {
                Some(pool) => by_pool.entry(pool.name.clone()).or_default().push(task),
                None => warn!(pod = %task.pod_id, kind = %task.kind, "no pool serves this task"),
            }
        }

        let layout = BinLayout::new(
            now,
            self.config.bin_width.as_secs(),
            self.config.batch_horizon.as_secs(),
        );
        let mut demand: BTreeMap<String, PendingDemand> = self
            .policy
            .pools()
            .iter()
            .map(|p| (p.name.clone(), PendingDemand::empty(&p.name, now)))
            .collect();

        for (pool, tasks) in &by_pool {
            let plan = plan_pool(&snapshot, pool, tasks, &layout);
            for decision in &plan.binds {
                match self.commit(pool, decision, now).await {
                    Ok(true) => report.bound += 1,
                    Ok(false) => report.conflicts += 1,
                    Err(e) => {
                        warn!(pod = %decision.task.pod_id, node = %decision.node, error = %e, "bind failed");
                        report.conflicts += 1;
                    }
                }
            }
            for decision in &plan.deferred {
                debug!(
                    pod = %decision.task.pod_id,
                    node = %decision.node,
                    start_bin = decision.start_bin,
                    "batch job reserved for a later bin"
                );
            }
            report.deferred += plan.deferred.len();
            report.overflow += plan.overflow.len();
            let entry = demand
                .entry(pool.clone())
                .or_insert_with(|| PendingDemand::empty(pool, now));
            for task in &plan.overflow {
                entry.add(task.requests, task.arrival);
            }
        }

        for d in demand.values() {
            self.store.put_pending(d)?;
            if d.tasks > 0 {
                info!(pool = %d.pool, tasks = d.tasks, demand = %d.resources, "unplaceable demand");
            }
        }

        debug!(
            bound = report.bound,
            deferred = report.deferred,
            overflow = report.overflow,
            conflicts = report.conflicts,
            collected = report.collected,
            "packing pass complete"
        );
        Ok(report)
    }

    /// Bind one decision. Returns false when the orchestrator refused and
    /// the pod stays pending.
    async fn commit(&self, pool: &str, decision: &Decision, now: u64) -> Result<bool, PackerError> {
        let task = &decision.task;
        match self.orchestrator.bind(&task.pod_id, &decision.node).await? {
            BindOutcome::Bound | BindOutcome::AlreadyBound => {}
            BindOutcome::Conflict(reason) => {
                warn!(pod = %task.pod_id, node = %decision.node, %reason, "bind conflict, pod stays pending");
                return Ok(false);
            }
        }
        let placement = Placement {
            pod_id: task.pod_id.clone(),
            node: decision.node.clone(),
            pool: pool.to_string(),
            resources: task.requests,
            kind: task.kind,
            bound_at: now,
            expected_end: task.runtime_secs.map(|r| now + r),
        };
        match self.store.create_placement(&placement) {
            Ok(_) => {}
            Err(e) if e.is_conflict() => debug!(pod = %task.pod_id, "placement already recorded"),
            Err(e) => return Err(e.into()),
        }
        info!(pod = %task.pod_id, node = %decision.node, %pool, kind = %task.kind, "pod bound");
        Ok(true)
    }

    /// Drop placements whose pod is gone, finished, bound elsewhere, or
    /// still unbound a full interval after the bind was recorded.
    fn collect_placements(
        &self,
        snapshot: &mut ClusterSnapshot,
        pods: &[ObservedPod],
        now: u64,
    ) -> Result<usize, PackerError> {
        let by_id: HashMap<&str, &ObservedPod> = pods.iter().map(|p| (p.id.as_str(), p)).collect();
        let grace = self.config.interval.max(Duration::from_secs(1)).as_secs();

        let doomed: Vec<String> = snapshot
            .placements
            .values()
            .filter(|placement| match by_id.get(placement.pod_id.as_str()) {
                None => true,
                Some(pod) if pod.phase.is_terminal() => true,
                Some(pod) => match pod.node.as_deref() {
                    Some(node) => node != placement.node,
                    None => placement.bound_at + grace < now,
                },
            })
            .map(|p| p.pod_id.clone())
            .collect();

        for pod in &doomed {
            self.store.delete_placement(pod)?;
            snapshot.placements.remove(pod);
            debug!(%pod, "placement collected");
        }
        Ok(doomed.len())
    }

    /// Run passes until the shutdown signal fires.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_secs = self.config.interval.as_secs(), "task packer started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {
                    if let Err(e) = self.pass(epoch_secs()).await {
                        tracing::error!(error = %e, "packing pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("task packer shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use htas_cluster::{PodPhase, SimCluster};
    use htas_core::{HtasConfig, Resources, WorkloadKind};
    use htas_state::NodeProfile;

    const CONFIG: &str = r#"
[packer]
bin_width = "5m"
batch_horizon = "1h"

[[pool]]
name = "batch-pool"
workload = "batch"
max_nodes = 4
instance_types = ["std"]

[[pool]]
name = "longrunning-pool"
workload = "long-running"
max_nodes = 4
instance_types = ["std"]

[[instance_type]]
name = "std"
cpu = 2
memory = "4Gi"
hourly_cost = 0.07
"#;

    struct Fixture {
        store: StateStore,
        sim: Arc<SimCluster>,
        packer: TaskPacker,
    }

    async fn fixture(nodes: &[&str]) -> Fixture {
        let config = HtasConfig::from_toml_str(CONFIG).unwrap();
        let policy = Arc::new(PoolPolicy::from_config(&config));
        let store = StateStore::open_in_memory().unwrap();
        let sim = Arc::new(SimCluster::from_policy(&policy));
        sim.set_clock(100).await;
        for pool in nodes {
            let name = sim.add_node(pool, "std").await.unwrap();
            let profile = NodeProfile::new(&name, "std", *pool, Resources::cores_gib(2, 4), 12);
            store.put_profile(&profile, None).unwrap();
        }
        let packer = TaskPacker::new(store.clone(), sim.clone(), policy, config.packer.clone());
        Fixture { store, sim, packer }
    }

    fn job(id: &str, at: u64) -> ObservedPod {
        ObservedPod::pending(id, Resources::cores_gib(1, 1), WorkloadKind::Batch, at)
            .with_runtime(600)
            .with_scheduler("htas-scheduler")
    }

    #[tokio::test]
    async fn binds_and_records_placements() {
        let f = fixture(&["batch-pool", "batch-pool"]).await;
        for i in 1..=3 {
            f.sim.submit(job(&format!("job-{i}"), i)).await;
        }
        let report = f.packer.pass(100).await.unwrap();
        assert_eq!(report.bound, 3);

        let nodes: Vec<_> = ["job-1", "job-2", "job-3"]
            .iter()
            .map(|id| f.store.get_placement(id).unwrap().unwrap().node.clone())
            .collect();
        assert_eq!(nodes, vec!["batch-pool-1", "batch-pool-1", "batch-pool-2"]);
        let p = f.store.get_placement("job-1").unwrap().unwrap();
        assert_eq!(p.expected_end, Some(700));
        assert_eq!(f.sim.pods_on("batch-pool-1").await.len(), 2);
    }

    #[tokio::test]
    async fn overflow_becomes_pending_demand() {
        let f = fixture(&["batch-pool"]).await;
        f.sim
            .submit(
                ObservedPod::pending("svc-big", Resources::cores_gib(3, 1), WorkloadKind::LongRunning, 5)
                    .with_scheduler("htas-scheduler"),
            )
            .await;
        let report = f.packer.pass(100).await.unwrap();
        assert_eq!(report.overflow, 1);

        let lr = f.store.get_pending("longrunning-pool").unwrap().unwrap();
        assert_eq!(lr.tasks, 1);
        assert_eq!(lr.largest, Resources::cores_gib(3, 1));
        assert_eq!(lr.oldest_arrival, Some(5));
        // Every pool gets a record, even without demand.
        assert_eq!(f.store.get_pending("batch-pool").unwrap().unwrap().tasks, 0);
    }

    #[tokio::test]
    async fn ignores_pods_for_other_schedulers() {
        let f = fixture(&["batch-pool"]).await;
        f.sim
            .submit(ObservedPod::pending("foreign", Resources::new(100, 64), WorkloadKind::Batch, 1))
            .await;
        let report = f.packer.pass(100).await.unwrap();
        assert_eq!(report, PassReport::default());
    }

    #[tokio::test]
    async fn collects_placements_of_finished_pods() {
        let f = fixture(&["batch-pool"]).await;
        f.sim.submit(job("job-1", 1)).await;
        f.packer.pass(100).await.unwrap();
        f.sim.set_phase("job-1", PodPhase::Succeeded).await;

        let report = f.packer.pass(120).await.unwrap();
        assert_eq!(report.collected, 1);
        assert!(f.store.get_placement("job-1").unwrap().is_none());
    }

    #[tokio::test]
    async fn api_outage_fails_the_pass_without_side_effects() {
        let f = fixture(&["batch-pool"]).await;
        f.sim.submit(job("job-1", 1)).await;
        f.sim.inject(|faults| faults.list_failures = 1).await;
        assert!(f.packer.pass(100).await.is_err());
        assert!(f.store.list_placements().unwrap().is_empty());
        assert_eq!(f.packer.pass(100).await.unwrap().bound, 1);
    }
}
