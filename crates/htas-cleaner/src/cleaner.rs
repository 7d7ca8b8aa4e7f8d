//! Instance cleaner — drives nodes through the drain state machine.
//!
//! Each step:
//! 1. lists pods and takes a [`ClusterSnapshot`]
//! 2. advances every DRAINING node (cordon, cancel, migrate, hand over to
//!    TERMINATING once the orchestrator reports no pods)
//! 3. advances every TERMINATING node (issue the termination intent, wait
//!    for the cloud adaptor, remove or revert)
//! 4. starts at most one new drain per pool
//!
//! A node is only handed to the cloud while the orchestrator shows no pod
//! bound to it, checked again right before the termination intent is
//! written; pods that reappear send it back to DRAINING. Pinned pods
//! (daemon and mirror pods) are left in place and go with the node.

use std::collections::BTreeMap;
use std::sync::Arc;

use htas_cluster::{Checkpointer, ObservedPod, Orchestrator};
use htas_core::config::CleanerConfig;
use htas_core::{PoolPolicy, Resources, WorkloadKind, delay_for_attempt, epoch_secs};
use htas_state::{
    Alert, ClusterSnapshot, DrainOrigin, DrainRecord, IntentOrigin, IntentStatus, Lifecycle, Migration,
    MigrationFailure, NodeProfile, Placement, ScalingIntent, Severity, StateStore, Versioned,
};
use tracing::{debug, error, info, warn};

use crate::error::CleanerError;
use crate::machine::{activation_candidate, migration_target, should_cancel};

/// Outcome counters of one step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanerReport {
    pub activated: usize,
    pub cancelled: usize,
    pub migrated: usize,
    pub evicted: usize,
    pub terminating: usize,
    pub removed: usize,
    pub reverted: usize,
}

/// Per-step working state.
struct Pass<'a> {
    snapshot: &'a ClusterSnapshot,
    pods: &'a [ObservedPod],
    now: u64,
    budget: usize,
    /// Capacity promised to restored pods this step, by target node.
    reserved: BTreeMap<String, Resources>,
    report: CleanerReport,
}

impl<'a> Pass<'a> {
    fn bound_to(&self, node: &str) -> Vec<&'a ObservedPod> {
        let mut pods: Vec<&'a ObservedPod> = self.pods.iter().filter(|p| p.must_leave(node)).collect();
        pods.sort_by(|a, b| a.id.cmp(&b.id));
        pods
    }
}

pub struct InstanceCleaner {
    store: StateStore,
    orchestrator: Arc<dyn Orchestrator>,
    checkpointer: Arc<dyn Checkpointer>,
    policy: Arc<PoolPolicy>,
    config: CleanerConfig,
}

impl InstanceCleaner {
    pub fn new(
        store: StateStore,
        orchestrator: Arc<dyn Orchestrator>,
        checkpointer: Arc<dyn Checkpointer>,
        policy: Arc<PoolPolicy>,
        config: CleanerConfig,
    ) -> Self {
        Self {
            store,
            orchestrator,
            checkpointer,
            policy,
            config,
        }
    }

    /// Run one cleaner step at time `now`.
    pub async fn step(&self, now: u64) -> Result<CleanerReport, CleanerError> {
        let pods = self.orchestrator.list_pods().await?;
        let snapshot = self.store.snapshot(now)?;
        let mut pass = Pass {
            snapshot: &snapshot,
            pods: &pods,
            now,
            budget: self.config.max_migrations_per_step,
            reserved: BTreeMap::new(),
            report: CleanerReport::default(),
        };

        for profile in snapshot.profiles.values().filter(|p| p.is_leaving()) {
            let result = match profile.lifecycle {
                Lifecycle::Draining => self.advance_drain(&mut pass, profile).await,
                Lifecycle::Terminating => self.advance_termination(&mut pass, profile).await,
                Lifecycle::Active => Ok(()),
            };
            if let Err(e) = result {
                warn!(node = %profile.instance_name, error = %e, "drain step failed, retrying next cycle");
            }
        }

        for pool in self.policy.pools() {
            let Some(candidate) = activation_candidate(&snapshot, &self.policy, pool, now) else {
                continue;
            };
            if let Err(e) = self.activate(&mut pass, candidate).await {
                warn!(node = %candidate.instance_name, error = %e, "drain activation failed");
            }
        }

        let report = pass.report;
        debug!(
            activated = report.activated,
            migrated = report.migrated,
            evicted = report.evicted,
            removed = report.removed,
            "cleaner step complete"
        );
        Ok(report)
    }

    // ── ACTIVE → DRAINING ──────────────────────────────────────────

    async fn activate(&self, pass: &mut Pass<'_>, candidate: &Versioned<NodeProfile>) -> Result<(), CleanerError> {
        let node = candidate.instance_name.as_str();
        let pool = candidate.pool.as_str();
        let seen = pass.snapshot.pool_state(pool).map(|s| s.version);
        if !self.store.claim_pool_change(pool, seen, pass.now)? {
            debug!(%pool, %node, "pool changed concurrently, drain deferred");
            return Ok(());
        }
        let now = pass.now;
        let started = self.store.modify_profile(node, self.policy.conflict_retries, |p| {
            if p.lifecycle != Lifecycle::Active || p.stale {
                return false;
            }
            p.lifecycle = Lifecycle::Draining;
            p.drain = Some(DrainRecord::new(DrainOrigin::Cleaner, now));
            true
        })?;
        if started.is_none() {
            return Ok(());
        }
        info!(
            %node,
            %pool,
            utilization = candidate.utilization(),
            "node underused, draining"
        );
        pass.report.activated += 1;
        self.cordon(node).await
    }

    async fn cordon(&self, node: &str) -> Result<(), CleanerError> {
        self.orchestrator.cordon(node, true).await?;
        self.store.modify_profile(node, self.policy.conflict_retries, |p| match p.drain.as_mut() {
            Some(d) if !d.cordoned => {
                d.cordoned = true;
                true
            }
            _ => false,
        })?;
        debug!(%node, "node cordoned");
        Ok(())
    }

    // ── DRAINING ───────────────────────────────────────────────────

    async fn advance_drain(&self, pass: &mut Pass<'_>, profile: &Versioned<NodeProfile>) -> Result<(), CleanerError> {
        let node = profile.instance_name.as_str();
        let now = pass.now;
        let Some(record) = profile.drain.clone() else {
            // Draining without progress record: adopt the drain.
            self.store.modify_profile(node, self.policy.conflict_retries, |p| {
                if p.lifecycle != Lifecycle::Draining || p.drain.is_some() {
                    return false;
                }
                p.drain = Some(DrainRecord::new(DrainOrigin::Cleaner, now));
                true
            })?;
            return Ok(());
        };

        if !record.cordoned {
            self.cordon(node).await?;
        }

        if should_cancel(pass.snapshot, &self.policy, profile) {
            return self.cancel(pass, node).await;
        }

        let bound = pass.bound_to(node);
        if bound.is_empty() {
            let moved = self.store.modify_profile(node, self.policy.conflict_retries, |p| {
                if p.lifecycle != Lifecycle::Draining {
                    return false;
                }
                p.lifecycle = Lifecycle::Terminating;
                if let Some(d) = p.drain.as_mut() {
                    d.termination_attempts = 0;
                    d.next_attempt_at = None;
                }
                true
            })?;
            if let Some(updated) = moved {
                info!(%node, migrated = record.migrated.len(), evicted = record.evicted.len(), "node empty, terminating");
                pass.report.terminating += 1;
                self.advance_termination(pass, &updated).await?;
            }
            return Ok(());
        }

        // Restored pods whose original could not be deleted last time.
        for pod in bound.iter().filter(|p| record.migrated.iter().any(|m| m.pod == p.id)) {
            if let Err(e) = self.orchestrator.delete_pod(&pod.id).await {
                warn!(%node, pod = %pod.id, error = %e, "migrated pod still present");
            }
        }

        if pass.budget == 0 {
            debug!(%node, pods = bound.len(), "migration budget spent for this cycle");
            return Ok(());
        }

        if !record.migration_started {
            self.record(node, |d| d.migration_started = true)?;
        }

        for pod in bound.into_iter().filter(|p| !record.handled(&p.id)) {
            if pass.budget == 0 {
                break;
            }
            pass.budget -= 1;
            self.migrate(pass, profile, pod).await?;
        }
        Ok(())
    }

    async fn cancel(&self, pass: &mut Pass<'_>, node: &str) -> Result<(), CleanerError> {
        self.orchestrator.cordon(node, false).await?;
        let reverted = self.store.modify_profile(node, self.policy.conflict_retries, |p| {
            let untouched = p.drain.as_ref().is_none_or(|d| !d.migration_started);
            if p.lifecycle != Lifecycle::Draining || !untouched {
                return false;
            }
            p.lifecycle = Lifecycle::Active;
            p.drain = None;
            true
        })?;
        if reverted.is_some() {
            info!(%node, "drain cancelled, node busy again");
            pass.report.cancelled += 1;
        }
        Ok(())
    }

    /// Move one pod off `profile`'s node: checkpoint and restore onto the
    /// best-fit sibling, or evict when that is not possible.
    async fn migrate(
        &self,
        pass: &mut Pass<'_>,
        profile: &Versioned<NodeProfile>,
        pod: &ObservedPod,
    ) -> Result<(), CleanerError> {
        let node = profile.instance_name.as_str();
        let now = pass.now;
        let snapshot = pass.snapshot;

        let attempt = match migration_target(snapshot, &profile.pool, node, pod.requests, &pass.reserved) {
            None => Err("no sibling node has room".to_string()),
            Some(target) => match self.checkpoint_restore(&pod.id, &target).await {
                Ok(restored) => Ok((target, restored)),
                Err(e) => Err(e.to_string()),
            },
        };

        match attempt {
            Ok((target, restored)) => {
                *pass.reserved.entry(target.clone()).or_default() += pod.requests;
                if let Err(e) = self.orchestrator.delete_pod(&pod.id).await {
                    warn!(pod = %pod.id, error = %e, "original pod not deleted, retrying next cycle");
                }
                let previous = snapshot.placements.get(&pod.id);
                let expected_end = previous.and_then(|p| p.expected_end).or_else(|| match pod.kind {
                    WorkloadKind::Batch => pod.estimated_runtime.map(|r| pod.started_at.unwrap_or(now) + r),
                    WorkloadKind::LongRunning => None,
                });
                let placement = Placement {
                    pod_id: restored.clone(),
                    node: target.clone(),
                    pool: profile.pool.clone(),
                    resources: pod.requests,
                    kind: pod.kind,
                    bound_at: now,
                    expected_end,
                };
                self.store.reassign_placement(&pod.id, &placement)?;
                self.record(node, |d| {
                    d.migrated.push(Migration {
                        pod: pod.id.clone(),
                        restored_as: restored.clone(),
                        target: target.clone(),
                        at: now,
                    })
                })?;
                info!(pod = %pod.id, from = %node, to = %target, %restored, "pod migrated");
                pass.report.migrated += 1;
            }
            Err(reason) => {
                warn!(pod = %pod.id, %node, %reason, "migration failed, falling back to eviction");
                let evicted = self.orchestrator.evict(&pod.id).await;
                let failure = MigrationFailure {
                    pod: pod.id.clone(),
                    error: match &evicted {
                        Ok(()) => reason,
                        Err(e) => format!("{reason}; eviction failed: {e}"),
                    },
                    at: now,
                };
                let was_evicted = evicted.is_ok();
                self.record(node, |d| {
                    d.record_failure(failure.clone());
                    if was_evicted {
                        d.evicted.push(pod.id.clone());
                    }
                })?;
                if was_evicted {
                    self.store.delete_placement(&pod.id)?;
                    pass.report.evicted += 1;
                }
            }
        }
        Ok(())
    }

    async fn checkpoint_restore(&self, pod: &str, target: &str) -> Result<String, CleanerError> {
        let handle = self.checkpointer.checkpoint(pod).await?;
        debug!(%pod, snapshot = %handle, "pod checkpointed");
        Ok(self.checkpointer.restore(&handle, target).await?)
    }

    /// Update the drain record of `node` in place.
    fn record(&self, node: &str, mut f: impl FnMut(&mut DrainRecord)) -> Result<(), CleanerError> {
        self.store
            .modify_profile(node, self.policy.conflict_retries, |p| match p.drain.as_mut() {
                Some(d) => {
                    f(d);
                    true
                }
                None => false,
            })?;
        Ok(())
    }

    // ── TERMINATING ────────────────────────────────────────────────

    async fn advance_termination(
        &self,
        pass: &mut Pass<'_>,
        profile: &Versioned<NodeProfile>,
    ) -> Result<(), CleanerError> {
        let node = profile.instance_name.as_str();
        let pool = profile.pool.as_str();
        let now = pass.now;
        let record = profile
            .drain
            .clone()
            .unwrap_or_else(|| DrainRecord::new(DrainOrigin::Cleaner, now));
        let snapshot = pass.snapshot;
        let bound = pass.bound_to(node).len();
        let intent = snapshot
            .intent(pool)
            .filter(|i| i.origin == IntentOrigin::Cleaner && i.node.as_deref() == Some(node));

        let Some(intent) = intent else {
            if bound > 0 {
                return self.back_to_draining(node, bound);
            }
            if record.next_attempt_at.is_some_and(|at| now < at) {
                return Ok(());
            }
            let late = self
                .orchestrator
                .list_pods()
                .await?
                .iter()
                .filter(|p| p.must_leave(node))
                .count();
            if late > 0 {
                return self.back_to_draining(node, late);
            }
            let reason = match record.origin {
                DrainOrigin::Cleaner => "drained underused node",
                DrainOrigin::ScaleDown => "pool scale-down",
            };
            match self.store.create_intent(&ScalingIntent::terminate(profile, reason.to_string(), now)) {
                Ok(_) => info!(%node, %pool, "termination requested"),
                Err(e) if e.is_conflict() => debug!(%pool, "pool has another intent in flight, termination waits"),
                Err(e) => return Err(e.into()),
            }
            return Ok(());
        };

        match &intent.status {
            IntentStatus::Acknowledged { .. } => {
                let current = self.store.get_profile(node)?;
                if let Some(current) = current {
                    self.store.remove_node(node, current.version, now)?;
                }
                self.withdraw(pool, intent.version)?;
                info!(%node, %pool, "node removed");
                pass.report.removed += 1;
            }
            IntentStatus::Failed { error } => {
                if self.withdraw(pool, intent.version)? {
                    self.termination_failed(pass, node, &record, error).await?;
                }
            }
            IntentStatus::Pending if bound > 0 => {
                // Not picked up yet: withdraw it rather than terminate under a pod.
                if self.withdraw(pool, intent.version)? {
                    self.back_to_draining(node, bound)?;
                }
            }
            IntentStatus::Pending | IntentStatus::InProgress => {
                if bound > 0 {
                    warn!(%node, pods = bound, "pods bound to a node the cloud is already removing");
                }
                let age = now.saturating_sub(intent.created_at);
                if age >= self.config.termination_timeout.as_secs() && self.withdraw(pool, intent.version)? {
                    let why = format!("no acknowledgement after {age}s");
                    self.termination_failed(pass, node, &record, &why).await?;
                }
            }
        }
        Ok(())
    }

    /// Delete our intent if it is still at `version`. False when the cloud
    /// adaptor claimed or resolved it first.
    fn withdraw(&self, pool: &str, version: u64) -> Result<bool, CleanerError> {
        match self.store.delete_intent(pool, version) {
            Ok(deleted) => Ok(deleted),
            Err(e) if e.is_conflict() => {
                debug!(%pool, "intent changed, left for the next step");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn back_to_draining(&self, node: &str, pods: usize) -> Result<(), CleanerError> {
        let moved = self.store.modify_profile(node, self.policy.conflict_retries, |p| {
            if p.lifecycle != Lifecycle::Terminating {
                return false;
            }
            p.lifecycle = Lifecycle::Draining;
            if let Some(d) = p.drain.as_mut() {
                d.next_attempt_at = None;
            }
            true
        })?;
        if moved.is_some() {
            warn!(%node, pods, "pods reappeared on a terminating node, draining again");
        }
        Ok(())
    }

    async fn termination_failed(
        &self,
        pass: &mut Pass<'_>,
        node: &str,
        record: &DrainRecord,
        error: &str,
    ) -> Result<(), CleanerError> {
        let now = pass.now;
        let attempts = record.termination_attempts + 1;
        if attempts < self.config.termination_retries {
            let delay = delay_for_attempt(
                self.config.termination_backoff,
                self.config.termination_backoff_max,
                attempts,
            );
            self.record(node, |d| {
                d.termination_attempts = attempts;
                d.next_attempt_at = Some(now + delay.as_secs());
            })?;
            warn!(%node, attempts, retry_in_secs = delay.as_secs(), %error, "termination failed");
            return Ok(());
        }

        self.orchestrator.cordon(node, false).await?;
        let reverted = self.store.modify_profile(node, self.policy.conflict_retries, |p| {
            if p.lifecycle != Lifecycle::Terminating {
                return false;
            }
            p.lifecycle = Lifecycle::Active;
            p.drain = None;
            true
        })?;
        if reverted.is_none() {
            return Ok(());
        }
        let alert = Alert {
            source: "cleaner".into(),
            subject: node.to_string(),
            severity: Severity::Critical,
            message: format!("termination failed {attempts} times, node returned to service: {error}"),
            raised_at: now,
        };
        error!(%node, message = %alert.message, "alert raised");
        self.store.raise_alert(&alert)?;
        pass.report.reverted += 1;
        Ok(())
    }

    /// Run steps until the shutdown signal fires.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_secs = self.config.interval.as_secs(), "instance cleaner started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {
                    if let Err(e) = self.step(epoch_secs()).await {
                        error!(error = %e, "cleaner step failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("instance cleaner shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use htas_cluster::{BindOutcome, ClusterResult, SimCluster};
    use htas_core::HtasConfig;
    use htas_state::MAX_DRAIN_FAILURES;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const CONFIG: &str = r#"
[policy]
sustained_samples = 5

[cleaner]
termination_retries = 2
termination_backoff = "30s"

[[pool]]
name = "batch-pool"
workload = "batch"
min_nodes = 1
max_nodes = 5
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
        cleaner: InstanceCleaner,
    }

    /// Three nodes; `batch-pool-3` is idle apart from one small pod and
    /// has been under the low-water mark for five samples.
    async fn fixture() -> Fixture {
        fixture_with(|sim| sim as Arc<dyn Orchestrator>).await
    }

    async fn fixture_with(orchestrator: impl FnOnce(Arc<SimCluster>) -> Arc<dyn Orchestrator>) -> Fixture {
        let config = HtasConfig::from_toml_str(CONFIG).unwrap();
        let policy = Arc::new(PoolPolicy::from_config(&config));
        let store = StateStore::open_in_memory().unwrap();
        let sim = Arc::new(SimCluster::from_policy(&policy));
        sim.set_clock(1000).await;
        let cap = Resources::cores_gib(2, 4);
        for (used, history) in [(1200, 0.6), (1200, 0.6), (400, 0.2)] {
            let name = sim.add_node("batch-pool", "std").await.unwrap();
            let pod = ObservedPod::pending(format!("{name}-pod"), Resources::new(used, 512), WorkloadKind::Batch, 0)
                .with_runtime(3600);
            sim.place(pod, &name, 900).await;
            let mut profile = NodeProfile::new(&name, "std", "batch-pool", cap, 12);
            profile.set_resources(cap, cap.saturating_sub(Resources::new(used, 512)));
            for _ in 0..5 {
                profile.utilization_history.push(history);
            }
            store.put_profile(&profile, None).unwrap();
        }
        let cleaner = InstanceCleaner::new(
            store.clone(),
            orchestrator(sim.clone()),
            sim.clone(),
            policy,
            config.cleaner.clone(),
        );
        Fixture { store, sim, cleaner }
    }

    /// Places a pod on `node` just before answering list call `at`.
    struct LateArrival {
        sim: Arc<SimCluster>,
        node: &'static str,
        at: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Orchestrator for LateArrival {
        async fn list_nodes(&self) -> ClusterResult<Vec<htas_cluster::ObservedNode>> {
            self.sim.list_nodes().await
        }

        async fn list_pods(&self) -> ClusterResult<Vec<ObservedPod>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) + 1 == self.at {
                let late = ObservedPod::pending("late", Resources::new(100, 64), WorkloadKind::Batch, 0);
                self.sim.place(late, self.node, 1019).await;
            }
            self.sim.list_pods().await
        }

        async fn bind(&self, pod: &str, node: &str) -> ClusterResult<BindOutcome> {
            self.sim.bind(pod, node).await
        }

        async fn evict(&self, pod: &str) -> ClusterResult<()> {
            self.sim.evict(pod).await
        }

        async fn delete_pod(&self, pod: &str) -> ClusterResult<()> {
            self.sim.delete_pod(pod).await
        }

        async fn cordon(&self, node: &str, cordoned: bool) -> ClusterResult<()> {
            self.sim.cordon(node, cordoned).await
        }
    }

    fn lifecycle(store: &StateStore, node: &str) -> Lifecycle {
        store.get_profile(node).unwrap().unwrap().lifecycle
    }

    fn resolve_intent(store: &StateStore, status: IntentStatus) {
        let intent = store.get_intent("batch-pool").unwrap().unwrap();
        let mut resolved = intent.value.clone();
        resolved.status = status;
        store.update_intent(&resolved, intent.version).unwrap();
    }

    #[tokio::test]
    async fn drains_migrates_and_removes_an_underused_node() {
        let f = fixture().await;

        let report = f.cleaner.step(1000).await.unwrap();
        assert_eq!(report.activated, 1);
        assert_eq!(lifecycle(&f.store, "batch-pool-3"), Lifecycle::Draining);
        assert!(!f.sim.node("batch-pool-3").await.unwrap().schedulable);

        let report = f.cleaner.step(1010).await.unwrap();
        assert_eq!(report.migrated, 1);
        assert!(f.sim.pods_on("batch-pool-3").await.is_empty());
        let drain = f.store.get_profile("batch-pool-3").unwrap().unwrap().drain.clone().unwrap();
        assert!(drain.migration_started);
        assert_eq!(drain.migrated.len(), 1);
        let restored = &drain.migrated[0].restored_as;
        let placement = f.store.get_placement(restored).unwrap().unwrap();
        assert_eq!(placement.node, drain.migrated[0].target);
        assert_eq!(placement.expected_end, Some(900 + 3600));

        let report = f.cleaner.step(1020).await.unwrap();
        assert_eq!(report.terminating, 1);
        assert_eq!(lifecycle(&f.store, "batch-pool-3"), Lifecycle::Terminating);
        let intent = f.store.get_intent("batch-pool").unwrap().unwrap();
        assert_eq!(intent.node.as_deref(), Some("batch-pool-3"));
        assert_eq!(intent.delta, -1);

        resolve_intent(&f.store, IntentStatus::Acknowledged { nodes: vec!["batch-pool-3".into()] });
        let report = f.cleaner.step(1030).await.unwrap();
        assert_eq!(report.removed, 1);
        assert!(f.store.get_profile("batch-pool-3").unwrap().is_none());
        assert!(f.store.is_tombstoned("batch-pool-3").unwrap());
        assert!(f.store.get_intent("batch-pool").unwrap().is_none());
        assert!(f.sim.lost_pods().await.is_empty());
    }

    #[tokio::test]
    async fn checkpoint_failure_falls_back_to_eviction() {
        let f = fixture().await;
        f.sim
            .inject(|faults| {
                faults.checkpoint_failures.insert("batch-pool-3-pod".into());
            })
            .await;
        f.cleaner.step(1000).await.unwrap();

        let report = f.cleaner.step(1010).await.unwrap();
        assert_eq!(report.evicted, 1);
        let drain = f.store.get_profile("batch-pool-3").unwrap().unwrap().drain.clone().unwrap();
        assert_eq!(drain.evicted, vec!["batch-pool-3-pod".to_string()]);
        assert_eq!(drain.failures.len(), 1);
        assert!(f.sim.pods_on("batch-pool-3").await.is_empty());
        // The controller recreated it as a fresh pending pod.
        assert!(f.sim.lost_pods().await.is_empty());
    }

    #[tokio::test]
    async fn busy_node_is_pulled_back_before_migration() {
        let f = fixture().await;
        f.cleaner.step(1000).await.unwrap();
        f.store
            .modify_profile("batch-pool-3", 3, |p| {
                p.utilization_history.push(0.95);
                true
            })
            .unwrap();

        let report = f.cleaner.step(1010).await.unwrap();
        assert_eq!(report.cancelled, 1);
        assert_eq!(lifecycle(&f.store, "batch-pool-3"), Lifecycle::Active);
        assert!(f.sim.node("batch-pool-3").await.unwrap().schedulable);
        assert_eq!(f.sim.pods_on("batch-pool-3").await.len(), 1);
    }

    #[tokio::test]
    async fn reappearing_pods_send_the_node_back_to_draining() {
        let f = fixture().await;
        f.cleaner.step(1000).await.unwrap();
        f.cleaner.step(1010).await.unwrap();
        f.cleaner.step(1020).await.unwrap();
        assert_eq!(lifecycle(&f.store, "batch-pool-3"), Lifecycle::Terminating);

        let late = ObservedPod::pending("late", Resources::new(100, 64), WorkloadKind::Batch, 0);
        f.sim.place(late, "batch-pool-3", 1015).await;
        f.cleaner.step(1025).await.unwrap();
        assert_eq!(lifecycle(&f.store, "batch-pool-3"), Lifecycle::Draining);
        assert!(f.store.get_intent("batch-pool").unwrap().is_none());
    }

    #[tokio::test]
    async fn repeated_termination_failures_revert_and_alert() {
        let f = fixture().await;
        f.cleaner.step(1000).await.unwrap();
        f.cleaner.step(1010).await.unwrap();
        f.cleaner.step(1020).await.unwrap();

        resolve_intent(&f.store, IntentStatus::Failed { error: "api quota".into() });
        f.cleaner.step(1030).await.unwrap();
        let drain = f.store.get_profile("batch-pool-3").unwrap().unwrap().drain.clone().unwrap();
        assert_eq!(drain.termination_attempts, 1);
        assert_eq!(drain.next_attempt_at, Some(1060));

        // Backoff holds the retry.
        f.cleaner.step(1040).await.unwrap();
        assert!(f.store.get_intent("batch-pool").unwrap().is_none());
        f.cleaner.step(1060).await.unwrap();
        assert!(f.store.get_intent("batch-pool").unwrap().is_some());

        resolve_intent(&f.store, IntentStatus::Failed { error: "api quota".into() });
        let report = f.cleaner.step(1070).await.unwrap();
        assert_eq!(report.reverted, 1);
        assert_eq!(lifecycle(&f.store, "batch-pool-3"), Lifecycle::Active);
        assert!(f.sim.node("batch-pool-3").await.unwrap().schedulable);
        let alerts = f.store.list_alerts().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].subject, "batch-pool-3");
    }

    #[tokio::test]
    async fn never_terminating_while_pods_are_bound() {
        let f = fixture().await;
        f.sim
            .inject(|faults| {
                faults.checkpoint_failures.insert("batch-pool-3-pod".into());
            })
            .await;
        for t in (1000..1100).step_by(10) {
            f.cleaner.step(t).await.unwrap();
            if lifecycle(&f.store, "batch-pool-3") == Lifecycle::Terminating {
                assert!(f.sim.pods_on("batch-pool-3").await.is_empty());
            }
        }
        assert!(f.sim.lost_pods().await.is_empty());
    }

    #[tokio::test]
    async fn pod_bound_just_before_handover_blocks_termination() {
        // Steps at 1000, 1010 and 1020 list once each; the fourth list is
        // the check right before the termination intent.
        let f = fixture_with(|sim| {
            Arc::new(LateArrival {
                sim,
                node: "batch-pool-3",
                at: 4,
                calls: AtomicUsize::new(0),
            }) as Arc<dyn Orchestrator>
        })
        .await;
        f.cleaner.step(1000).await.unwrap();
        f.cleaner.step(1010).await.unwrap();

        let report = f.cleaner.step(1020).await.unwrap();
        assert_eq!(report.terminating, 1);
        assert_eq!(lifecycle(&f.store, "batch-pool-3"), Lifecycle::Draining);
        assert!(f.store.get_intent("batch-pool").unwrap().is_none());

        // The late pod is moved like any other before termination.
        let report = f.cleaner.step(1030).await.unwrap();
        assert_eq!(report.migrated, 1);
        f.cleaner.step(1040).await.unwrap();
        assert_eq!(lifecycle(&f.store, "batch-pool-3"), Lifecycle::Terminating);
        assert!(f.store.get_intent("batch-pool").unwrap().is_some());
    }

    #[tokio::test]
    async fn claimed_termination_is_not_withdrawn() {
        let f = fixture().await;
        f.cleaner.step(1000).await.unwrap();
        f.cleaner.step(1010).await.unwrap();
        f.cleaner.step(1020).await.unwrap();
        resolve_intent(&f.store, IntentStatus::InProgress);

        let late = ObservedPod::pending("late", Resources::new(100, 64), WorkloadKind::Batch, 0);
        f.sim.place(late, "batch-pool-3", 1021).await;
        f.cleaner.step(1025).await.unwrap();
        assert_eq!(lifecycle(&f.store, "batch-pool-3"), Lifecycle::Terminating);
        assert!(f.store.get_intent("batch-pool").unwrap().unwrap().is_in_progress());

        resolve_intent(&f.store, IntentStatus::Acknowledged { nodes: vec!["batch-pool-3".into()] });
        assert_eq!(f.cleaner.step(1030).await.unwrap().removed, 1);
    }

    #[tokio::test]
    async fn pinned_pods_do_not_hold_a_drain() {
        let f = fixture().await;
        let daemon = ObservedPod::pending("node-agent", Resources::new(50, 64), WorkloadKind::LongRunning, 0).pinned();
        f.sim.place(daemon, "batch-pool-3", 900).await;

        f.cleaner.step(1000).await.unwrap();
        let report = f.cleaner.step(1010).await.unwrap();
        assert_eq!(report.migrated, 1);
        assert_eq!(report.evicted, 0);

        let report = f.cleaner.step(1020).await.unwrap();
        assert_eq!(report.terminating, 1);
        assert_eq!(lifecycle(&f.store, "batch-pool-3"), Lifecycle::Terminating);
        assert!(f.store.get_intent("batch-pool").unwrap().is_some());

        let left: Vec<_> = f.sim.pods_on("batch-pool-3").await.into_iter().map(|p| p.id).collect();
        assert_eq!(left, vec!["node-agent".to_string()]);
    }

    #[tokio::test]
    async fn drain_failures_are_bounded() {
        let f = fixture().await;
        f.cleaner.step(1000).await.unwrap();
        f.store
            .modify_profile("batch-pool-3", 3, |p| {
                let drain = p.drain.as_mut().unwrap();
                for i in 0..MAX_DRAIN_FAILURES as u64 {
                    drain.record_failure(MigrationFailure {
                        pod: format!("old-{i}"),
                        error: "gone".into(),
                        at: i,
                    });
                }
                true
            })
            .unwrap();
        f.sim
            .inject(|faults| {
                faults.checkpoint_failures.insert("batch-pool-3-pod".into());
            })
            .await;

        f.cleaner.step(1010).await.unwrap();
        let drain = f.store.get_profile("batch-pool-3").unwrap().unwrap().drain.clone().unwrap();
        assert_eq!(drain.failures.len(), MAX_DRAIN_FAILURES);
        assert_eq!(drain.failures.last().unwrap().pod, "batch-pool-3-pod");
        assert_eq!(drain.failures[0].pod, "old-1");
    }
}
