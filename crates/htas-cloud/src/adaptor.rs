//! Executes pending scaling intents against a [`CloudProvider`].

use std::sync::Arc;

use htas_cluster::{CloudProvider, ClusterError};
use htas_core::config::CloudConfig;
use htas_core::epoch_secs;
use htas_state::{Alert, IntentStatus, ProvisioningNode, ScalingIntent, Severity, StateStore, TableKind, Versioned};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use crate::error::CloudResult;

const POOL_STATE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdaptorReport {
    pub created: usize,
    pub deleted: usize,
    pub failed: usize,
    /// Intents withdrawn or rewritten while the call was running.
    pub superseded: usize,
}

/// Watches the intent table and carries out each pending intent once.
///
/// An intent is marked in progress before the provider is called, so the
/// issuer can no longer withdraw it with the version it saw.
///
/// The adaptor only reports back through the intent's status; whoever
/// issued the intent decides what a failure means.
pub struct CloudAdaptor {
    store: StateStore,
    provider: Arc<dyn CloudProvider>,
    config: CloudConfig,
}

impl CloudAdaptor {
    pub fn new(store: StateStore, provider: Arc<dyn CloudProvider>, config: CloudConfig) -> Self {
        Self { store, provider, config }
    }

    /// Execute every pending intent.
    pub async fn step(&self, now: u64) -> CloudResult<AdaptorReport> {
        let mut report = AdaptorReport::default();
        for intent in self.store.list_intents()? {
            if !intent.is_pending() {
                continue;
            }
            self.execute(intent, now, &mut report).await?;
        }
        Ok(report)
    }

    async fn execute(&self, intent: Versioned<ScalingIntent>, now: u64, report: &mut AdaptorReport) -> CloudResult<()> {
        let pool = intent.pool.clone();
        let seen = intent.version;

        // Claim first: once in progress, a withdrawal by the issuer conflicts.
        let mut claimed = intent.into_inner();
        claimed.status = IntentStatus::InProgress;
        let version = match self.store.update_intent(&claimed, seen) {
            Ok(version) => version,
            Err(e) if e.is_conflict() => {
                debug!(%pool, "intent withdrawn before execution");
                report.superseded += 1;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let status = match (claimed.delta, claimed.node.as_deref()) {
            (delta, _) if delta > 0 => self.create(&claimed, delta.unsigned_abs(), report).await,
            (delta, Some(node)) if delta < 0 => self.delete(node, report).await,
            (delta, node) => IntentStatus::Failed {
                error: format!("unsupported intent: delta {delta}, node {node:?}"),
            },
        };

        if let IntentStatus::Failed { error } = &status {
            error!(%pool, delta = claimed.delta, %error, "scaling intent failed");
            report.failed += 1;
        }

        let mut resolved = claimed;
        resolved.status = status;
        match self.store.update_intent(&resolved, version) {
            Ok(_) => Ok(()),
            Err(e) if e.is_conflict() => {
                report.superseded += 1;
                match &resolved.status {
                    IntentStatus::Acknowledged { nodes } if resolved.is_scale_up() && !nodes.is_empty() => {
                        self.adopt(&resolved, nodes, now)
                    }
                    _ => {
                        warn!(%pool, "intent changed while executing, result dropped");
                        Ok(())
                    }
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Nodes created for an intent that was rewritten mid-call still exist.
    /// Track them as provisioning so the pool bounds count them, and alert.
    fn adopt(&self, intent: &ScalingIntent, nodes: &[String], now: u64) -> CloudResult<()> {
        warn!(pool = %intent.pool, created = nodes.len(), "intent changed while executing, tracking created nodes");
        self.store.modify_pool_state(&intent.pool, POOL_STATE_ATTEMPTS, |state| {
            let before = state.provisioning.len();
            for node in nodes {
                if !state.provisioning.iter().any(|p| &p.name == node) {
                    state.provisioning.push(ProvisioningNode {
                        name: node.clone(),
                        instance_type: intent.instance_type.clone(),
                        requested_at: now,
                    });
                }
            }
            state.provisioning.len() != before
        })?;
        self.store.raise_alert(&Alert {
            source: "cloud".into(),
            subject: intent.pool.clone(),
            severity: Severity::Warning,
            message: format!(
                "intent rewritten while creating {} node(s): {}",
                nodes.len(),
                nodes.join(", ")
            ),
            raised_at: now,
        })?;
        Ok(())
    }

    async fn create(&self, intent: &ScalingIntent, count: u32, report: &mut AdaptorReport) -> IntentStatus {
        let mut nodes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            match self.provider.create_node(&intent.pool, &intent.instance_type).await {
                Ok(node) => {
                    info!(pool = %intent.pool, %node, instance_type = %intent.instance_type, "node requested");
                    report.created += 1;
                    nodes.push(node);
                }
                Err(e) if nodes.is_empty() => return IntentStatus::Failed { error: e.to_string() },
                Err(e) => {
                    // The created nodes exist; report them rather than leak them.
                    warn!(pool = %intent.pool, created = nodes.len(), wanted = count, error = %e, "scale-up partially applied");
                    break;
                }
            }
        }
        IntentStatus::Acknowledged { nodes }
    }

    async fn delete(&self, node: &str, report: &mut AdaptorReport) -> IntentStatus {
        match self.provider.delete_node(node).await {
            Ok(()) => {}
            Err(ClusterError::NotFound(_)) => debug!(%node, "node already gone"),
            Err(e) => return IntentStatus::Failed { error: e.to_string() },
        }
        info!(%node, "node terminated");
        report.deleted += 1;
        IntentStatus::Acknowledged {
            nodes: vec![node.to_string()],
        }
    }

    /// Execute intents as they are written, with a fallback interval.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_secs = self.config.interval.as_secs(), "cloud adaptor started");
        let mut events = self.store.subscribe();

        loop {
            let wake = tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => true,
                event = events.recv() => match event {
                    Ok(event) => event.table == TableKind::Intents && !event.deleted,
                    Err(RecvError::Lagged(missed)) => {
                        debug!(missed, "store events lagged");
                        true
                    }
                    Err(RecvError::Closed) => {
                        warn!("store event channel closed, cloud adaptor stopping");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    info!("cloud adaptor shutting down");
                    break;
                }
            };
            if !wake {
                continue;
            }
            if let Err(e) = self.step(epoch_secs()).await {
                error!(error = %e, "cloud adaptor step failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use htas_cluster::{ClusterResult, SimCluster};
    use htas_core::Resources;
    use htas_state::NodeProfile;
    use std::sync::Mutex;

    fn setup() -> (StateStore, Arc<SimCluster>, CloudAdaptor) {
        let store = StateStore::open_in_memory().unwrap();
        let sim = Arc::new(SimCluster::new([("std".to_string(), Resources::cores_gib(2, 4))]));
        let adaptor = CloudAdaptor::new(store.clone(), sim.clone(), CloudConfig::default());
        (store, sim, adaptor)
    }

    #[tokio::test]
    async fn scale_up_creates_and_acknowledges() {
        let (store, sim, adaptor) = setup();
        store
            .create_intent(&ScalingIntent::scale_up("batch", 2, "std", "pending work".into(), 0))
            .unwrap();

        let report = adaptor.step(0).await.unwrap();
        assert_eq!(report.created, 2);
        let intent = store.get_intent("batch").unwrap().unwrap();
        assert_eq!(
            intent.status,
            IntentStatus::Acknowledged {
                nodes: vec!["batch-1".into(), "batch-2".into()]
            }
        );
        assert_eq!(sim.node_names().await, vec!["batch-1", "batch-2"]);

        // Already acknowledged: nothing more happens.
        assert_eq!(adaptor.step(0).await.unwrap(), AdaptorReport::default());
    }

    #[tokio::test]
    async fn provider_errors_mark_the_intent_failed() {
        let (store, sim, adaptor) = setup();
        sim.inject(|f| f.create_failures = 1).await;
        store
            .create_intent(&ScalingIntent::scale_up("batch", 1, "std", "pending work".into(), 0))
            .unwrap();

        assert_eq!(adaptor.step(0).await.unwrap().failed, 1);
        let intent = store.get_intent("batch").unwrap().unwrap();
        assert!(matches!(intent.status, IntentStatus::Failed { .. }));
    }

    #[tokio::test]
    async fn unknown_instance_type_creates_nothing() {
        let (store, sim, adaptor) = setup();
        store
            .create_intent(&ScalingIntent::scale_up("batch", 3, "unknown", "x".into(), 0))
            .unwrap();
        adaptor.step(0).await.unwrap();
        assert!(matches!(
            store.get_intent("batch").unwrap().unwrap().status,
            IntentStatus::Failed { .. }
        ));
        assert!(sim.node_names().await.is_empty());
    }

    #[tokio::test]
    async fn termination_deletes_the_named_node() {
        let (store, sim, adaptor) = setup();
        let node = sim.add_node("batch", "std").await.unwrap();
        let profile = NodeProfile::new(&node, "std", "batch", Resources::cores_gib(2, 4), 4);
        store
            .create_intent(&ScalingIntent::terminate(&profile, "drained".into(), 0))
            .unwrap();

        assert_eq!(adaptor.step(0).await.unwrap().deleted, 1);
        assert!(sim.node(&node).await.is_none());
        assert_eq!(
            store.get_intent("batch").unwrap().unwrap().status,
            IntentStatus::Acknowledged { nodes: vec![node] }
        );
    }

    /// Tries to withdraw the termination, with the version the issuer
    /// saw, while the delete call is running.
    struct WithdrawDuringDelete {
        sim: Arc<SimCluster>,
        store: StateStore,
        seen: u64,
        outcome: Mutex<Option<bool>>,
    }

    #[async_trait]
    impl CloudProvider for WithdrawDuringDelete {
        async fn create_node(&self, pool: &str, instance_type: &str) -> ClusterResult<String> {
            self.sim.create_node(pool, instance_type).await
        }

        async fn delete_node(&self, node: &str) -> ClusterResult<()> {
            let conflicted = self.store.delete_intent("batch", self.seen).unwrap_err().is_conflict();
            *self.outcome.lock().unwrap() = Some(conflicted);
            self.sim.delete_node(node).await
        }
    }

    #[tokio::test]
    async fn in_flight_termination_cannot_be_withdrawn() {
        let store = StateStore::open_in_memory().unwrap();
        let sim = Arc::new(SimCluster::new([("std".to_string(), Resources::cores_gib(2, 4))]));
        let node = sim.add_node("batch", "std").await.unwrap();
        let profile = NodeProfile::new(&node, "std", "batch", Resources::cores_gib(2, 4), 4);
        let seen = store
            .create_intent(&ScalingIntent::terminate(&profile, "drained".into(), 0))
            .unwrap();

        let provider = Arc::new(WithdrawDuringDelete {
            sim: sim.clone(),
            store: store.clone(),
            seen,
            outcome: Mutex::new(None),
        });
        let adaptor = CloudAdaptor::new(store.clone(), provider.clone(), CloudConfig::default());

        let report = adaptor.step(0).await.unwrap();
        assert_eq!(*provider.outcome.lock().unwrap(), Some(true));
        assert_eq!(report.deleted, 1);
        assert_eq!(report.superseded, 0);
        assert!(sim.node(&node).await.is_none());
        assert_eq!(
            store.get_intent("batch").unwrap().unwrap().status,
            IntentStatus::Acknowledged { nodes: vec![node] }
        );
    }

    #[tokio::test]
    async fn withdrawn_intent_is_not_executed() {
        let (store, sim, adaptor) = setup();
        let node = sim.add_node("batch", "std").await.unwrap();
        let profile = NodeProfile::new(&node, "std", "batch", Resources::cores_gib(2, 4), 4);
        let version = store
            .create_intent(&ScalingIntent::terminate(&profile, "drained".into(), 0))
            .unwrap();
        assert!(store.delete_intent("batch", version).unwrap());

        assert_eq!(adaptor.step(0).await.unwrap(), AdaptorReport::default());
        assert!(sim.node(&node).await.is_some());
    }

    /// Rewrites the intent the way an autoscaler retry does, then creates.
    struct RetryDuringCreate {
        sim: Arc<SimCluster>,
        store: StateStore,
    }

    #[async_trait]
    impl CloudProvider for RetryDuringCreate {
        async fn create_node(&self, pool: &str, instance_type: &str) -> ClusterResult<String> {
            let current = self.store.get_intent(pool).unwrap().unwrap();
            let mut retry = current.value.clone();
            retry.status = IntentStatus::Pending;
            retry.retried = true;
            self.store.update_intent(&retry, current.version).unwrap();
            self.sim.create_node(pool, instance_type).await
        }

        async fn delete_node(&self, node: &str) -> ClusterResult<()> {
            self.sim.delete_node(node).await
        }
    }

    #[tokio::test]
    async fn nodes_created_for_a_rewritten_intent_are_tracked() {
        let store = StateStore::open_in_memory().unwrap();
        let sim = Arc::new(SimCluster::new([("std".to_string(), Resources::cores_gib(2, 4))]));
        let provider = Arc::new(RetryDuringCreate {
            sim: sim.clone(),
            store: store.clone(),
        });
        let adaptor = CloudAdaptor::new(store.clone(), provider, CloudConfig::default());
        store
            .create_intent(&ScalingIntent::scale_up("batch", 1, "std", "pending work".into(), 0))
            .unwrap();

        let report = adaptor.step(500).await.unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.superseded, 1);

        let intent = store.get_intent("batch").unwrap().unwrap();
        assert!(intent.retried);
        assert!(intent.is_pending());

        let state = store.get_pool_state("batch").unwrap().unwrap();
        assert_eq!(
            state.provisioning,
            vec![ProvisioningNode {
                name: "batch-1".into(),
                instance_type: "std".into(),
                requested_at: 500,
            }]
        );
        let alerts = store.list_alerts().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].source, "cloud");
        assert_eq!(alerts[0].subject, "batch");
    }
}
