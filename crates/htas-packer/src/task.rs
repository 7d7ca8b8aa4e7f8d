//! Pending tasks derived from the orchestrator's pod listing.

use std::time::Duration;

use htas_cluster::ObservedPod;
use htas_core::{Resources, WorkloadKind};

/// An unbound pod awaiting placement.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTask {
    pub pod_id: String,
    pub requests: Resources,
    pub kind: WorkloadKind,
    /// Estimated runtime in seconds; set for batch tasks only.
    pub runtime_secs: Option<u64>,
    pub arrival: u64,
    /// Submission order, the final tie-break of every sort.
    pub seq: u64,
    pub pool: Option<String>,
}

impl PendingTask {
    /// BFD order: cpu descending, memory descending, submission order.
    pub fn decreasing_key(&self) -> (std::cmp::Reverse<u64>, std::cmp::Reverse<u64>, u64) {
        (
            std::cmp::Reverse(self.requests.cpu_millis),
            std::cmp::Reverse(self.requests.memory_mib),
            self.seq,
        )
    }
}

/// Unbound pods addressed to `scheduler_name`, numbered in submission
/// order (creation time, then id).
pub fn pending_tasks(pods: &[ObservedPod], scheduler_name: &str, default_runtime: Duration) -> Vec<PendingTask> {
    let mut pending: Vec<&ObservedPod> = pods
        .iter()
        .filter(|p| p.is_unbound() && p.scheduler_name.as_deref() == Some(scheduler_name))
        .collect();
    pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

    pending
        .into_iter()
        .enumerate()
        .map(|(seq, pod)| PendingTask {
            pod_id: pod.id.clone(),
            requests: pod.requests,
            kind: pod.kind,
            runtime_secs: match pod.kind {
                WorkloadKind::Batch => Some(pod.estimated_runtime.unwrap_or(default_runtime.as_secs())),
                WorkloadKind::LongRunning => None,
            },
            arrival: pod.created_at,
            seq: seq as u64,
            pool: pod.pool.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use htas_cluster::PodPhase;

    #[test]
    fn selects_unbound_pods_for_our_scheduler() {
        let ours = |id: &str, at: u64| {
            ObservedPod::pending(id, Resources::new(100, 64), WorkloadKind::Batch, at).with_scheduler("htas-scheduler")
        };
        let mut running = ours("running", 1);
        running.node = Some("n1".into());
        running.phase = PodPhase::Running;
        let foreign = ObservedPod::pending("foreign", Resources::new(100, 64), WorkloadKind::Batch, 1);
        let pods = vec![ours("b", 5), ours("a", 5), ours("early", 2).with_runtime(900), running, foreign];

        let tasks = pending_tasks(&pods, "htas-scheduler", Duration::from_secs(300));
        let ids: Vec<_> = tasks.iter().map(|t| t.pod_id.as_str()).collect();
        assert_eq!(ids, vec!["early", "a", "b"]);
        assert_eq!(tasks[0].seq, 0);
        assert_eq!(tasks[0].runtime_secs, Some(900));
        assert_eq!(tasks[1].runtime_secs, Some(300));
    }
}
