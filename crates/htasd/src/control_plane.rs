//! Control plane — wires the control loops to one store and the
//! collaborators, and serves the REST API.
//!
//! In `serve` mode the daemon:
//! 1. Spawns every loop on its own cadence (the cloud adaptor also wakes on
//!    intent writes)
//! 2. Serves the REST API and metrics over HTTP
//! 3. On Ctrl-C, signals every loop and waits for it to finish its step

use std::net::SocketAddr;
use std::sync::Arc;

use htas_autoscale::{Autoscaler, StepReport};
use htas_cleaner::{CleanerReport, InstanceCleaner};
use htas_cloud::{AdaptorReport, CloudAdaptor};
use htas_cluster::{Checkpointer, CloudProvider, Orchestrator};
use htas_core::{HtasConfig, PoolPolicy};
use htas_packer::{PassReport, TaskPacker};
use htas_profiler::{PollReport, ResourceProfiler};
use htas_state::StateStore;
use tokio::sync::watch;
use tracing::{error, info};

/// The external systems the loops talk to.
pub struct Collaborators {
    pub orchestrator: Arc<dyn Orchestrator>,
    pub cloud: Arc<dyn CloudProvider>,
    pub checkpointer: Arc<dyn Checkpointer>,
}

/// What one [`ControlPlane::tick`] did, loop by loop.
#[derive(Debug, Default)]
pub struct TickReport {
    pub poll: PollReport,
    pub pass: PassReport,
    pub scale: StepReport,
    pub clean: CleanerReport,
    pub cloud: AdaptorReport,
}

pub struct ControlPlane {
    pub store: StateStore,
    pub policy: Arc<PoolPolicy>,
    pub profiler: Arc<ResourceProfiler>,
    pub packer: Arc<TaskPacker>,
    pub autoscaler: Arc<Autoscaler>,
    pub cleaner: Arc<InstanceCleaner>,
    pub cloud: Arc<CloudAdaptor>,
}

impl ControlPlane {
    pub fn new(store: StateStore, config: &HtasConfig, collaborators: Collaborators) -> Self {
        let policy = Arc::new(PoolPolicy::from_config(config));
        let Collaborators {
            orchestrator,
            cloud,
            checkpointer,
        } = collaborators;

        let profiler = ResourceProfiler::new(
            store.clone(),
            orchestrator.clone(),
            config.profiler.clone(),
            policy.conflict_retries,
        );
        let packer = TaskPacker::new(store.clone(), orchestrator.clone(), policy.clone(), config.packer.clone());
        let autoscaler = Autoscaler::new(store.clone(), policy.clone(), config.autoscaler.clone());
        let cleaner = InstanceCleaner::new(
            store.clone(),
            orchestrator,
            checkpointer,
            policy.clone(),
            config.cleaner.clone(),
        );
        let adaptor = CloudAdaptor::new(store.clone(), cloud, config.cloud.clone());

        Self {
            store,
            policy,
            profiler: Arc::new(profiler),
            packer: Arc::new(packer),
            autoscaler: Arc::new(autoscaler),
            cleaner: Arc::new(cleaner),
            cloud: Arc::new(adaptor),
        }
    }

    /// Run every loop once, in pipeline order, at time `now`.
    pub async fn tick(&self, now: u64) -> anyhow::Result<TickReport> {
        Ok(TickReport {
            poll: self.profiler.poll(now).await?,
            pass: self.packer.pass(now).await?,
            scale: self.autoscaler.step(now)?,
            clean: self.cleaner.step(now).await?,
            cloud: self.cloud.step(now).await?,
        })
    }

    /// Spawn the loops and serve the API until Ctrl-C.
    pub async fn serve(self, api_port: u16) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut handles = Vec::new();
        {
            let (profiler, rx) = (self.profiler.clone(), shutdown_rx.clone());
            handles.push(tokio::spawn(async move { profiler.run(rx).await }));
        }
        {
            let (packer, rx) = (self.packer.clone(), shutdown_rx.clone());
            handles.push(tokio::spawn(async move { packer.run(rx).await }));
        }
        {
            let (autoscaler, rx) = (self.autoscaler.clone(), shutdown_rx.clone());
            handles.push(tokio::spawn(async move { autoscaler.run(rx).await }));
        }
        {
            let (cleaner, rx) = (self.cleaner.clone(), shutdown_rx.clone());
            handles.push(tokio::spawn(async move { cleaner.run(rx).await }));
        }
        {
            let (cloud, rx) = (self.cloud.clone(), shutdown_rx.clone());
            handles.push(tokio::spawn(async move { cloud.run(rx).await }));
        }
        info!(loops = handles.len(), pools = self.policy.pools().len(), "control loops started");

        // ── REST API server ──────────────────────────────────────────
        let router = htas_api::build_router(self.store.clone());
        let api_addr = SocketAddr::from(([0, 0, 0, 0], api_port));

        info!(%api_addr, "API server starting");
        let listener = tokio::net::TcpListener::bind(api_addr).await?;

        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        });

        server.await?;

        for handle in handles {
            let _ = handle.await;
        }
        info!("control plane stopped");
        Ok(())
    }
}
