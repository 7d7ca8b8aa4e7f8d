//! Autoscaler — turns pending demand into scaling intents.
//!
//! Each step reads one [`ClusterSnapshot`], follows up on the pool's
//! outstanding intent if there is one, and otherwise applies the decision
//! of [`evaluate`]. Scale-ups become a [`ScalingIntent`] for the cloud
//! adaptor; scale-downs are handed to the instance cleaner as a drain.

use std::sync::Arc;

use htas_core::config::AutoscalerConfig;
use htas_core::{PoolPolicy, epoch_secs};
use htas_state::{
    Alert, ClusterSnapshot, DrainOrigin, DrainRecord, IntentOrigin, IntentStatus, Lifecycle, ProvisioningNode,
    ScalingIntent, Severity, StateStore, Versioned,
};
use tracing::{debug, error, info, warn};

use crate::sizing::{ScaleDecision, evaluate};

/// What one step did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepReport {
    pub scale_ups: usize,
    pub drains: usize,
    pub acknowledged: usize,
    pub retried: usize,
    pub dropped: usize,
    pub pruned: usize,
}

/// The autoscaler evaluates pending demand and pool utilization and
/// decides whether pools grow or shrink.
pub struct Autoscaler {
    store: StateStore,
    policy: Arc<PoolPolicy>,
    config: AutoscalerConfig,
}

impl Autoscaler {
    pub fn new(store: StateStore, policy: Arc<PoolPolicy>, config: AutoscalerConfig) -> Self {
        Self { store, policy, config }
    }

    /// Run one evaluation cycle over every configured pool.
    pub fn step(&self, now: u64) -> anyhow::Result<StepReport> {
        let mut report = StepReport::default();

        let mut snapshot = self.store.snapshot(now)?;
        report.pruned = self.prune_provisioning(&snapshot, now)?;
        if report.pruned > 0 {
            snapshot = self.store.snapshot(now)?;
        }

        for pool in self.policy.pools() {
            if let Some(intent) = snapshot.intent(&pool.name) {
                if intent.origin == IntentOrigin::Autoscaler {
                    self.follow_intent(intent, now, &mut report)?;
                }
                continue;
            }

            match evaluate(&snapshot, &self.policy, pool, now) {
                ScaleDecision::ScaleUp {
                    instance_type,
                    count,
                    reason,
                } => {
                    if !self.claim(&snapshot, &pool.name, now)? {
                        continue;
                    }
                    let intent = ScalingIntent::scale_up(&pool.name, count, &instance_type, reason, now);
                    match self.store.create_intent(&intent) {
                        Ok(_) => {
                            info!(
                                pool = %pool.name,
                                %instance_type,
                                count,
                                reason = %intent.reason,
                                "scale-up requested"
                            );
                            report.scale_ups += 1;
                        }
                        Err(e) if e.is_conflict() => {
                            debug!(pool = %pool.name, "another intent appeared, scale-up skipped");
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                ScaleDecision::Drain { node, reason } => {
                    if !self.claim(&snapshot, &pool.name, now)? {
                        continue;
                    }
                    let handed = self.store.modify_profile(&node, self.policy.conflict_retries, |p| {
                        if p.lifecycle != Lifecycle::Active || p.stale {
                            return false;
                        }
                        p.lifecycle = Lifecycle::Draining;
                        p.drain = Some(DrainRecord::new(DrainOrigin::ScaleDown, now));
                        true
                    })?;
                    if handed.is_some() {
                        info!(pool = %pool.name, %node, %reason, "scale-down: node handed to the cleaner");
                        report.drains += 1;
                    } else {
                        debug!(pool = %pool.name, %node, "node changed under us, scale-down skipped");
                    }
                }
                ScaleDecision::NoChange => {}
            }
        }

        Ok(report)
    }

    fn claim(&self, snapshot: &ClusterSnapshot, pool: &str, now: u64) -> anyhow::Result<bool> {
        let seen = snapshot.pool_state(pool).map(|s| s.version);
        let claimed = self.store.claim_pool_change(pool, seen, now)?;
        if !claimed {
            debug!(%pool, "pool changed concurrently, decision deferred");
        }
        Ok(claimed)
    }

    /// Consume an acknowledgement, or retry / drop a failed or stale intent.
    fn follow_intent(
        &self,
        intent: &Versioned<ScalingIntent>,
        now: u64,
        report: &mut StepReport,
    ) -> anyhow::Result<()> {
        let pool = intent.pool.as_str();
        match &intent.status {
            IntentStatus::Acknowledged { nodes } => {
                self.store.modify_pool_state(pool, self.policy.conflict_retries, |state| {
                    for node in nodes {
                        if !state.provisioning.iter().any(|p| &p.name == node) {
                            state.provisioning.push(ProvisioningNode {
                                name: node.clone(),
                                instance_type: intent.instance_type.clone(),
                                requested_at: now,
                            });
                        }
                    }
                    true
                })?;
                self.discard(intent)?;
                info!(%pool, nodes = ?nodes, "scale-up acknowledged, nodes provisioning");
                report.acknowledged += 1;
            }
            IntentStatus::Failed { error } => {
                let why = format!("cloud adaptor failed: {error}");
                self.retry_or_drop(intent, &why, now, report)?;
            }
            IntentStatus::Pending | IntentStatus::InProgress => {
                let age = now.saturating_sub(intent.created_at);
                if age >= self.config.intent_timeout.as_secs() {
                    let why = format!("no acknowledgement after {age}s");
                    self.retry_or_drop(intent, &why, now, report)?;
                }
            }
        }
        Ok(())
    }

    fn retry_or_drop(
        &self,
        intent: &Versioned<ScalingIntent>,
        why: &str,
        now: u64,
        report: &mut StepReport,
    ) -> anyhow::Result<()> {
        let pool = intent.pool.as_str();
        if !intent.retried {
            let mut retry = intent.value.clone();
            retry.status = IntentStatus::Pending;
            retry.retried = true;
            retry.created_at = now;
            match self.store.update_intent(&retry, intent.version) {
                Ok(_) => {
                    warn!(%pool, delta = retry.delta, reason = %why, "scale-up intent retried");
                    report.retried += 1;
                }
                Err(e) if e.is_conflict() => debug!(%pool, "intent changed, retry skipped"),
                Err(e) => return Err(e.into()),
            }
            return Ok(());
        }

        self.discard(intent)?;
        let alert = Alert {
            source: "autoscaler".into(),
            subject: pool.to_string(),
            severity: Severity::Critical,
            message: format!(
                "scale-up of {} x {} dropped after retry: {why}",
                intent.delta, intent.instance_type
            ),
            raised_at: now,
        };
        error!(%pool, message = %alert.message, "alert raised");
        self.store.raise_alert(&alert)?;
        report.dropped += 1;
        Ok(())
    }

    fn discard(&self, intent: &Versioned<ScalingIntent>) -> anyhow::Result<()> {
        match self.store.delete_intent(&intent.pool, intent.version) {
            Ok(true) => {}
            Ok(false) => debug!(pool = %intent.pool, "intent already gone"),
            Err(e) if e.is_conflict() => debug!(pool = %intent.pool, "intent changed, left for the next step"),
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Forget provisioning nodes the profiler has reported (or that never
    /// showed up within the intent timeout).
    fn prune_provisioning(&self, snapshot: &ClusterSnapshot, now: u64) -> anyhow::Result<usize> {
        let timeout = self.config.intent_timeout.as_secs();
        let mut pruned = 0;
        for (pool, state) in &snapshot.pools {
            let arrived = |n: &ProvisioningNode| {
                snapshot.profile(&n.name).is_some()
                    || snapshot.tombstones.contains(&n.name)
                    || n.requested_at + timeout <= now
            };
            let count = state.provisioning.iter().filter(|&n| arrived(n)).count();
            if count == 0 {
                continue;
            }
            for n in state.provisioning.iter().filter(|&n| snapshot.profile(&n.name).is_none() && arrived(n)) {
                warn!(%pool, node = %n.name, "provisioned node never appeared");
            }
            self.store.modify_pool_state(pool, self.policy.conflict_retries, |s| {
                let before = s.provisioning.len();
                s.provisioning.retain(|n| !arrived(n));
                s.provisioning.len() != before
            })?;
            pruned += count;
        }
        Ok(pruned)
    }

    /// Run steps until the shutdown signal fires.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_secs = self.config.interval.as_secs(), "autoscaler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {
                    if let Err(e) = self.step(epoch_secs()) {
                        error!(error = %e, "autoscaler step failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use htas_core::{HtasConfig, Resources};
    use htas_state::{NodeProfile, PendingDemand};

    const CONFIG: &str = r#"
[autoscaler]
intent_timeout = "10m"

[policy]
sustained_samples = 3
utilization_window = 5
structural_cooldown = "1s"

[[pool]]
name = "batch-pool"
workload = "batch"
min_nodes = 1
max_nodes = 4
instance_types = ["std"]

[[instance_type]]
name = "std"
cpu = 2
memory = "4Gi"
hourly_cost = 0.07
"#;

    fn scaler() -> (StateStore, Autoscaler) {
        let config = HtasConfig::from_toml_str(CONFIG).unwrap();
        let policy = Arc::new(PoolPolicy::from_config(&config));
        let store = StateStore::open_in_memory().unwrap();
        let autoscaler = Autoscaler::new(store.clone(), policy, config.autoscaler.clone());
        (store, autoscaler)
    }

    fn busy_node(store: &StateStore, name: &str) {
        let cap = Resources::cores_gib(2, 4);
        let mut p = NodeProfile::new(name, "std", "batch-pool", cap, 12);
        p.set_resources(cap, Resources::ZERO);
        store.put_profile(&p, None).unwrap();
    }

    fn pending(store: &StateStore, tasks: u32) {
        let mut d = PendingDemand::empty("batch-pool", 0);
        for _ in 0..tasks {
            d.add(Resources::cores_gib(1, 1), 0);
        }
        store.put_pending(&d).unwrap();
    }

    fn acknowledge(store: &StateStore, nodes: &[&str]) {
        let intent = store.get_intent("batch-pool").unwrap().unwrap();
        let mut acked = intent.value.clone();
        acked.status = IntentStatus::Acknowledged {
            nodes: nodes.iter().map(|n| n.to_string()).collect(),
        };
        store.update_intent(&acked, intent.version).unwrap();
    }

    #[test]
    fn pending_demand_creates_one_intent() {
        let (store, scaler) = scaler();
        busy_node(&store, "n1");
        pending(&store, 3);

        let report = scaler.step(100).unwrap();
        assert_eq!(report.scale_ups, 1);
        let intent = store.get_intent("batch-pool").unwrap().unwrap();
        assert_eq!(intent.delta, 2);
        assert_eq!(intent.instance_type, "std");

        // The outstanding intent suppresses further decisions.
        let report = scaler.step(200).unwrap();
        assert_eq!(report.scale_ups, 0);
        assert_eq!(store.list_intents().unwrap().len(), 1);
    }

    #[test]
    fn acknowledgement_records_provisioning_nodes() {
        let (store, scaler) = scaler();
        busy_node(&store, "n1");
        pending(&store, 3);
        scaler.step(100).unwrap();
        acknowledge(&store, &["batch-pool-2", "batch-pool-3"]);

        let report = scaler.step(110).unwrap();
        assert_eq!(report.acknowledged, 1);
        assert!(store.get_intent("batch-pool").unwrap().is_none());
        let state = store.get_pool_state("batch-pool").unwrap().unwrap();
        let names: Vec<_> = state.provisioning.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["batch-pool-2", "batch-pool-3"]);

        // Incoming capacity covers the same demand: no second scale-up.
        let report = scaler.step(120).unwrap();
        assert_eq!(report.scale_ups, 0);
        assert!(store.get_intent("batch-pool").unwrap().is_none());
    }

    #[test]
    fn provisioning_entries_are_pruned_once_profiled() {
        let (store, scaler) = scaler();
        busy_node(&store, "n1");
        pending(&store, 1);
        scaler.step(100).unwrap();
        acknowledge(&store, &["batch-pool-2"]);
        scaler.step(110).unwrap();

        busy_node(&store, "batch-pool-2");
        let report = scaler.step(120).unwrap();
        assert_eq!(report.pruned, 1);
        assert!(store.get_pool_state("batch-pool").unwrap().unwrap().provisioning.is_empty());
    }

    #[test]
    fn timed_out_intent_is_retried_once_then_dropped() {
        let (store, scaler) = scaler();
        busy_node(&store, "n1");
        pending(&store, 1);
        scaler.step(100).unwrap();

        let report = scaler.step(100 + 600).unwrap();
        assert_eq!(report.retried, 1);
        let intent = store.get_intent("batch-pool").unwrap().unwrap();
        assert!(intent.retried);
        assert_eq!(intent.created_at, 700);

        let report = scaler.step(700 + 300).unwrap();
        assert_eq!(report.retried + report.dropped, 0);

        let report = scaler.step(700 + 600).unwrap();
        assert_eq!(report.dropped, 1);
        assert!(store.get_intent("batch-pool").unwrap().is_none());
        let alerts = store.list_alerts().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].subject, "batch-pool");
        assert_eq!(alerts[0].severity, Severity::Critical);
    }

    #[test]
    fn stuck_in_progress_intent_times_out() {
        let (store, scaler) = scaler();
        busy_node(&store, "n1");
        pending(&store, 1);
        scaler.step(100).unwrap();

        let intent = store.get_intent("batch-pool").unwrap().unwrap();
        let mut claimed = intent.value.clone();
        claimed.status = IntentStatus::InProgress;
        store.update_intent(&claimed, intent.version).unwrap();

        // Claimed by the adaptor: left alone until the timeout.
        let report = scaler.step(400).unwrap();
        assert_eq!(report.retried + report.scale_ups, 0);
        assert!(store.get_intent("batch-pool").unwrap().unwrap().is_in_progress());

        assert_eq!(scaler.step(700).unwrap().retried, 1);
        assert!(store.get_intent("batch-pool").unwrap().unwrap().is_pending());
    }

    #[test]
    fn failed_intent_is_retried_then_alerted() {
        let (store, scaler) = scaler();
        busy_node(&store, "n1");
        pending(&store, 1);
        scaler.step(100).unwrap();

        let fail = |store: &StateStore| {
            let intent = store.get_intent("batch-pool").unwrap().unwrap();
            let mut failed = intent.value.clone();
            failed.status = IntentStatus::Failed { error: "quota exceeded".into() };
            store.update_intent(&failed, intent.version).unwrap();
        };

        fail(&store);
        assert_eq!(scaler.step(110).unwrap().retried, 1);
        assert!(store.get_intent("batch-pool").unwrap().unwrap().is_pending());

        fail(&store);
        assert_eq!(scaler.step(120).unwrap().dropped, 1);
        assert!(store.list_alerts().unwrap()[0].message.contains("quota exceeded"));
    }

    #[test]
    fn sustained_low_pool_hands_a_node_to_the_cleaner() {
        let (store, scaler) = scaler();
        let cap = Resources::cores_gib(2, 4);
        for (name, used) in [("a", 1), ("b", 0)] {
            let mut p = NodeProfile::new(name, "std", "batch-pool", cap, 12);
            p.set_resources(cap, cap.saturating_sub(Resources::cores_gib(used, 0)));
            for _ in 0..3 {
                p.utilization_history.push(0.1);
            }
            store.put_profile(&p, None).unwrap();
        }

        let report = scaler.step(100).unwrap();
        assert_eq!(report.drains, 1);
        let b = store.get_profile("b").unwrap().unwrap();
        assert_eq!(b.lifecycle, Lifecycle::Draining);
        assert_eq!(b.drain.as_ref().unwrap().origin, DrainOrigin::ScaleDown);
        assert_eq!(store.get_profile("a").unwrap().unwrap().lifecycle, Lifecycle::Active);

        // One drain at a time per pool.
        assert_eq!(scaler.step(200).unwrap().drains, 0);
    }

    #[test]
    fn cleaner_intents_are_left_alone() {
        let (store, scaler) = scaler();
        let cap = Resources::cores_gib(2, 4);
        let profile = NodeProfile::new("n1", "std", "batch-pool", cap, 12);
        store.put_profile(&profile, None).unwrap();
        store
            .create_intent(&ScalingIntent::terminate(&profile, "drained".into(), 0))
            .unwrap();

        let report = scaler.step(10_000).unwrap();
        assert_eq!(report, StepReport::default());
        assert!(store.get_intent("batch-pool").unwrap().is_some());
    }
}
