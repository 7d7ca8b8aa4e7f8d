//! Resource profiler — publishes node profiles on a fixed cadence.
//!
//! A poll lists nodes and pods (retrying transient failures with
//! exponential backoff), computes allocatable and used resources for every
//! node carrying the pool label and upserts its profile with a versioned
//! write. When the orchestrator stays unreachable the last-known profiles
//! are kept and flagged stale once older than the TTL.

use std::sync::Arc;

use htas_cluster::{ClusterError, ObservedNode, ObservedPod, Orchestrator};
use htas_core::config::ProfilerConfig;
use htas_core::{Backoff, epoch_secs};
use htas_state::{NodeProfile, StateError, StateStore};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::usage::{NodeUsage, usage_by_node};

#[derive(Debug, Error)]
pub enum ProfilerError {
    #[error("state store: {0}")]
    State(#[from] StateError),

    #[error("orchestrator unreachable after {attempts} attempts: {source}")]
    Unreachable {
        attempts: u32,
        #[source]
        source: ClusterError,
    },
}

/// Outcome of one poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Another poll was in flight; this one did nothing.
    pub skipped: bool,
    pub profiled: usize,
    /// Profiles newly flagged stale (vanished node or unreachable API).
    pub marked_stale: usize,
    /// Nodes whose write kept conflicting; retried next cycle.
    pub deferred: usize,
    pub tombstones_cleared: usize,
}

pub struct ResourceProfiler {
    store: StateStore,
    orchestrator: Arc<dyn Orchestrator>,
    config: ProfilerConfig,
    conflict_retries: u32,
    in_flight: Mutex<()>,
}

impl ResourceProfiler {
    pub fn new(
        store: StateStore,
        orchestrator: Arc<dyn Orchestrator>,
        config: ProfilerConfig,
        conflict_retries: u32,
    ) -> Self {
        Self {
            store,
            orchestrator,
            config,
            conflict_retries: conflict_retries.max(1),
            in_flight: Mutex::new(()),
        }
    }

    /// Run one poll at time `now`. A poll attempted while another is in
    /// flight is skipped.
    pub async fn poll(&self, now: u64) -> Result<PollReport, ProfilerError> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!("poll already in flight, skipped");
            return Ok(PollReport {
                skipped: true,
                ..Default::default()
            });
        };

        let (nodes, pods) = match self.fetch().await {
            Ok(listed) => listed,
            Err(e) => {
                let marked = self.mark_stale(now, |p| now.saturating_sub(p.last_updated) >= self.config.stale_ttl.as_secs())?;
                if marked > 0 {
                    warn!(marked, "orchestrator unreachable, profiles flagged stale");
                }
                return Err(e);
            }
        };

        let mut report = PollReport::default();
        let usage = usage_by_node(&pods, now);
        let snapshot = self.store.snapshot(now)?;

        for node in &nodes {
            let Some(pool) = node.pool.as_deref() else {
                continue;
            };
            if snapshot.tombstones.contains(&node.name) {
                debug!(node = %node.name, "node was removed, not profiling");
                continue;
            }
            let node_usage = usage.get(&node.name).copied().unwrap_or_default();
            match self.upsert(node, pool, node_usage, now) {
                Ok(true) => report.profiled += 1,
                Ok(false) => report.deferred += 1,
                Err(e) => return Err(e),
            }
        }

        let present: std::collections::HashSet<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
        report.marked_stale = self.mark_stale(now, |p| !present.contains(p.instance_name.as_str()))?;

        for node in &snapshot.tombstones {
            if !present.contains(node.as_str()) && self.store.clear_tombstone(node)? {
                debug!(%node, "node object gone, tombstone cleared");
                report.tombstones_cleared += 1;
            }
        }

        debug!(
            profiled = report.profiled,
            stale = report.marked_stale,
            deferred = report.deferred,
            "poll complete"
        );
        Ok(report)
    }

    async fn fetch(&self) -> Result<(Vec<ObservedNode>, Vec<ObservedPod>), ProfilerError> {
        let attempts = self.config.retry_attempts.max(1);
        let mut backoff = Backoff::new(self.config.retry_base, self.config.retry_max);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let listed = async {
                let nodes = self.orchestrator.list_nodes().await?;
                let pods = self.orchestrator.list_pods().await?;
                Ok::<_, ClusterError>((nodes, pods))
            }
            .await;
            match listed {
                Ok(listed) => return Ok(listed),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = backoff.next_delay();
                    warn!(attempt, error = %e, retry_in_ms = delay.as_millis() as u64, "listing failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(ProfilerError::Unreachable {
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }

    /// Write the observed state of `node`, keeping lifecycle and drain
    /// fields. Returns false when the write kept conflicting.
    fn upsert(&self, node: &ObservedNode, pool: &str, usage: NodeUsage, now: u64) -> Result<bool, ProfilerError> {
        let history_len = self.config.history_len;
        let apply = |p: &mut NodeProfile| {
            p.instance_type = node.instance_type.clone();
            p.pool = pool.to_string();
            p.set_resources(node.allocatable, node.allocatable.saturating_sub(usage.used));
            p.runtime_seconds = usage.runtime_seconds;
            p.last_updated = now;
            p.stale = false;
            p.utilization_history.resize(history_len);
            let sample = p.utilization();
            p.utilization_history.push(sample);
        };

        for _ in 0..self.conflict_retries {
            let updated = self.store.modify_profile(&node.name, self.conflict_retries, |p| {
                apply(p);
                true
            });
            match updated {
                Ok(Some(_)) => return Ok(true),
                Ok(None) => {}
                Err(e) if e.is_conflict() => {
                    warn!(node = %node.name, "profile write kept conflicting, deferred");
                    return Ok(false);
                }
                Err(e) => return Err(e.into()),
            }

            // First sighting. The cleaner may have removed it meanwhile.
            if self.store.is_tombstoned(&node.name)? {
                return Ok(true);
            }
            let mut fresh = NodeProfile::new(&node.name, &node.instance_type, pool, node.allocatable, history_len);
            apply(&mut fresh);
            match self.store.put_profile(&fresh, None) {
                Ok(_) => {
                    info!(node = %node.name, %pool, capacity = %node.allocatable, "node profiled");
                    return Ok(true);
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(false)
    }

    /// Flag every fresh profile matching `doomed` as stale.
    fn mark_stale(&self, now: u64, doomed: impl Fn(&NodeProfile) -> bool) -> Result<usize, ProfilerError> {
        let mut marked = 0;
        for profile in self.store.list_profiles()? {
            if profile.stale || !doomed(&profile) {
                continue;
            }
            let written = self.store.modify_profile(&profile.instance_name, self.conflict_retries, |p| {
                if p.stale {
                    return false;
                }
                p.stale = true;
                true
            });
            match written {
                Ok(Some(_)) => {
                    debug!(node = %profile.instance_name, age = now.saturating_sub(profile.last_updated), "profile stale");
                    marked += 1;
                }
                Ok(None) => {}
                Err(e) if e.is_conflict() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(marked)
    }

    /// Poll until the shutdown signal fires.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_secs = self.config.poll_interval.as_secs(), "resource profiler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.poll(epoch_secs()).await {
                        tracing::error!(error = %e, "profiler poll failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("resource profiler shutting down");
                    break;
                }
            }
        }
    }
}
