//! Mapping Kubernetes objects onto the observed cluster types.

use std::collections::BTreeMap;

use htas_cluster::{ObservedNode, ObservedPod, PodPhase};
use htas_core::config::KubeConfig;
use htas_core::resources::{parse_cpu_millis, parse_memory_mib_ceil, parse_memory_mib_floor};
use htas_core::{Resources, WorkloadKind};
use k8s_openapi::api::core::v1::{Node, Pod, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tracing::debug;

const INSTANCE_TYPE_LABELS: [&str; 2] = ["node.kubernetes.io/instance-type", "beta.kubernetes.io/instance-type"];
const MIRROR_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// Pods are addressed as `namespace/name`.
pub fn pod_id(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Split a pod id back into namespace and name. A bare name lives in
/// `default`.
pub fn split_pod_id(id: &str) -> (&str, &str) {
    id.split_once('/').unwrap_or(("default", id))
}

pub fn observe_node(node: &Node, config: &KubeConfig) -> Option<ObservedNode> {
    let name = node.metadata.name.clone()?;
    let labels = node.metadata.labels.as_ref();
    let label = |key: &str| labels.and_then(|l| l.get(key)).cloned();

    let status = node.status.as_ref();
    let capacity = status
        .and_then(|s| s.capacity.as_ref())
        .map(node_resources)
        .unwrap_or_default();
    let allocatable = status
        .and_then(|s| s.allocatable.as_ref())
        .map(node_resources)
        .unwrap_or(capacity);

    Some(ObservedNode {
        pool: label(&config.pool_label),
        instance_type: INSTANCE_TYPE_LABELS
            .iter()
            .find_map(|key| label(key))
            .unwrap_or_else(|| "unknown".to_string()),
        capacity,
        allocatable,
        schedulable: !node.spec.as_ref().and_then(|s| s.unschedulable).unwrap_or(false),
        name,
    })
}

fn node_resources(quantities: &BTreeMap<String, Quantity>) -> Resources {
    let cpu = quantities
        .get("cpu")
        .and_then(|q| parse_cpu_millis(&q.0).ok())
        .unwrap_or(0);
    let memory = quantities
        .get("memory")
        .and_then(|q| parse_memory_mib_floor(&q.0).ok())
        .unwrap_or(0);
    Resources::new(cpu, memory)
}

fn requested(resources: Option<&ResourceRequirements>) -> Resources {
    let Some(requests) = resources.and_then(|r| r.requests.as_ref()) else {
        return Resources::ZERO;
    };
    let cpu = requests.get("cpu").and_then(|q| parse_cpu_millis(&q.0).ok()).unwrap_or(0);
    let memory = requests
        .get("memory")
        .and_then(|q| parse_memory_mib_ceil(&q.0).ok())
        .unwrap_or(0);
    Resources::new(cpu, memory)
}

fn phase(raw: Option<&str>) -> PodPhase {
    match raw {
        Some("Pending") | None => PodPhase::Pending,
        Some("Running") => PodPhase::Running,
        Some("Succeeded") => PodPhase::Succeeded,
        Some("Failed") => PodPhase::Failed,
        Some(_) => PodPhase::Unknown,
    }
}

pub fn observe_pod(pod: &Pod, config: &KubeConfig) -> Option<ObservedPod> {
    let meta = &pod.metadata;
    let id = pod_id(meta.namespace.as_deref().unwrap_or("default"), meta.name.as_deref()?);
    let spec = pod.spec.as_ref()?;
    let status = pod.status.as_ref();

    // Effective request: the containers run together, init containers one at a time.
    let containers: Resources = spec.containers.iter().map(|c| requested(c.resources.as_ref())).sum();
    let requests = spec
        .init_containers
        .iter()
        .flatten()
        .map(|c| requested(c.resources.as_ref()))
        .fold(containers, Resources::max);

    let kind = match meta.labels.as_ref().and_then(|l| l.get(&config.workload_label)) {
        Some(value) => value.parse().unwrap_or_else(|e| {
            debug!(pod = %id, error = %e, "unrecognised workload label, assuming batch");
            WorkloadKind::Batch
        }),
        None => WorkloadKind::Batch,
    };
    let estimated_runtime = meta
        .annotations
        .as_ref()
        .and_then(|a| a.get(&config.runtime_annotation))
        .and_then(|v| v.trim().parse::<u64>().ok());

    // Daemon and static pods live and die with their node.
    let pinned = meta
        .owner_references
        .iter()
        .flatten()
        .any(|owner| owner.kind == "DaemonSet")
        || meta.annotations.as_ref().is_some_and(|a| a.contains_key(MIRROR_ANNOTATION));

    Some(ObservedPod {
        node: spec.node_name.clone(),
        phase: phase(status.and_then(|s| s.phase.as_deref())),
        requests,
        kind,
        estimated_runtime,
        created_at: meta
            .creation_timestamp
            .as_ref()
            .map_or(0, |t| t.0.timestamp().max(0) as u64),
        started_at: status
            .and_then(|s| s.start_time.as_ref())
            .map(|t| t.0.timestamp().max(0) as u64),
        pool: spec
            .node_selector
            .as_ref()
            .and_then(|s| s.get(&config.pool_label))
            .cloned(),
        scheduler_name: spec.scheduler_name.clone(),
        pinned,
        id,
    })
}
