//! Per-node usage derived from the pod list.

use std::collections::HashMap;

use htas_cluster::ObservedPod;
use htas_core::{Resources, WorkloadKind};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeUsage {
    /// Sum of the requests of non-terminal pods bound to the node.
    pub used: Resources,
    pub pods: usize,
    /// Longest remaining estimated runtime of batch pods on the node.
    pub runtime_seconds: u64,
}

/// Aggregate `pods` by the node they occupy.
///
/// A batch pod without a start time counts its whole estimated runtime.
pub fn usage_by_node(pods: &[ObservedPod], now: u64) -> HashMap<String, NodeUsage> {
    let mut usage: HashMap<String, NodeUsage> = HashMap::new();
    for pod in pods {
        let Some(node) = pod.node.as_deref() else {
            continue;
        };
        if !pod.occupies(node) {
            continue;
        }
        let entry = usage.entry(node.to_string()).or_default();
        entry.used += pod.requests;
        entry.pods += 1;
        if pod.kind == WorkloadKind::Batch {
            if let Some(runtime) = pod.estimated_runtime {
                let end = pod.started_at.unwrap_or(now) + runtime;
                entry.runtime_seconds = entry.runtime_seconds.max(end.saturating_sub(now));
            }
        }
    }
    usage
}
