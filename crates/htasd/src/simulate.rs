//! Simulation mode — every collaborator is an in-process [`SimCluster`].

use std::sync::Arc;

use htas_cluster::{ObservedPod, SimCluster};
use htas_core::{HtasConfig, PoolPolicy, Resources, WorkloadKind, epoch_secs};
use htas_state::StateStore;
use tracing::info;

use crate::control_plane::{Collaborators, ControlPlane};

/// Workload submitted when a simulation starts.
#[derive(Debug, Clone, Copy, Default)]
pub struct Seed {
    pub batch_jobs: u32,
    pub services: u32,
}

/// A simulated cluster with each pool at its minimum size (at least one node).
pub async fn seeded_cluster(policy: &PoolPolicy) -> anyhow::Result<Arc<SimCluster>> {
    let sim = Arc::new(SimCluster::from_policy(policy));
    for pool in policy.pools() {
        let Some(instance_type) = pool.instance_types.first() else {
            continue;
        };
        for _ in 0..pool.min_nodes.max(1) {
            let node = sim.add_node(&pool.name, instance_type).await?;
            info!(%node, pool = %pool.name, "simulated node added");
        }
    }
    Ok(sim)
}

/// Submit the seed workload: 1 cpu / 1 GiB batch jobs with a 10 minute
/// estimate and 500m / 512 MiB services.
pub async fn submit_seed(sim: &SimCluster, scheduler: &str, seed: Seed, now: u64) {
    for i in 0..seed.batch_jobs {
        let pod = ObservedPod::pending(format!("sim/job-{i}"), Resources::cores_gib(1, 1), WorkloadKind::Batch, now)
            .with_runtime(600)
            .with_scheduler(scheduler);
        sim.submit(pod).await;
    }
    for i in 0..seed.services {
        let pod = ObservedPod::pending(format!("sim/svc-{i}"), Resources::new(500, 512), WorkloadKind::LongRunning, now)
            .with_scheduler(scheduler);
        sim.submit(pod).await;
    }
}

/// Build a control plane over an in-memory store and a seeded simulated cluster.
pub async fn build(config: &HtasConfig, seed: Seed) -> anyhow::Result<(ControlPlane, Arc<SimCluster>)> {
    let policy = PoolPolicy::from_config(config);
    let sim = seeded_cluster(&policy).await?;
    submit_seed(&sim, &config.packer.scheduler_name, seed, epoch_secs()).await;

    let store = StateStore::open_in_memory()?;
    let plane = ControlPlane::new(
        store,
        config,
        Collaborators {
            orchestrator: sim.clone(),
            cloud: sim.clone(),
            checkpointer: sim.clone(),
        },
    );
    Ok((plane, sim))
}
