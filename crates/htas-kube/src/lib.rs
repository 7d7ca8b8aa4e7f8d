//! htas-kube — Kubernetes implementation of the orchestrator interface.
//!
//! Nodes join a pool through a node label. Pods declare their workload kind
//! with a label and their estimated runtime (seconds) with an annotation;
//! pods without an estimate get the packer's default runtime. Binding goes
//! through the `pods/binding` subresource, eviction through the eviction
//! API (so disruption budgets apply) and cordoning through
//! `spec.unschedulable`.

pub mod convert;
pub mod orchestrator;

pub use convert::{observe_node, observe_pod, pod_id, split_pod_id};
pub use orchestrator::KubeOrchestrator;
