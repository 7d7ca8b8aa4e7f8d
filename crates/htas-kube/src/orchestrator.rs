//! [`Orchestrator`] over the Kubernetes API.

use async_trait::async_trait;
use htas_cluster::{BindOutcome, ClusterError, ClusterResult, ObservedNode, ObservedPod, Orchestrator};
use htas_core::config::KubeConfig;
use k8s_openapi::api::core::v1::{Binding, Node, ObjectReference, Pod};
use kube::api::{Api, DeleteParams, EvictParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Client, Config};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::convert::{observe_node, observe_pod, split_pod_id};

pub struct KubeOrchestrator {
    client: Client,
    config: KubeConfig,
}

impl std::fmt::Debug for KubeOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeOrchestrator")
            .field("namespace", &self.config.namespace)
            .finish()
    }
}

impl KubeOrchestrator {
    /// Connect using the local kubeconfig, or the in-cluster service account.
    pub async fn connect(config: KubeConfig) -> ClusterResult<Self> {
        let kubeconfig = Config::infer()
            .await
            .map_err(|e| ClusterError::Unavailable(format!("no kubernetes config: {e}")))?;
        let client = Client::try_from(kubeconfig)
            .map_err(|e| ClusterError::Unavailable(format!("kubernetes client: {e}")))?;
        info!(namespace = ?config.namespace, "connected to kubernetes");
        Ok(Self { client, config })
    }

    pub fn with_client(client: Client, config: KubeConfig) -> Self {
        Self { client, config }
    }

    fn pods_in(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Map a client error onto the collaborator error kinds.
fn classify(e: kube::Error, what: &str) -> ClusterError {
    match e {
        kube::Error::Api(resp) if resp.code == 404 => ClusterError::NotFound(what.to_string()),
        kube::Error::Api(resp) if resp.code == 409 || resp.code == 422 || resp.code == 429 => {
            ClusterError::Rejected(format!("{what}: {}", resp.message))
        }
        kube::Error::Api(resp) if resp.code >= 500 => ClusterError::Unavailable(format!("{what}: {}", resp.message)),
        kube::Error::Api(resp) => ClusterError::Rejected(format!("{what}: {}", resp.message)),
        other => ClusterError::Unavailable(format!("{what}: {other}")),
    }
}

#[async_trait]
impl Orchestrator for KubeOrchestrator {
    async fn list_nodes(&self) -> ClusterResult<Vec<ObservedNode>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes
            .list(&ListParams::default())
            .await
            .map_err(|e| classify(e, "list nodes"))?;
        Ok(list.items.iter().filter_map(|n| observe_node(n, &self.config)).collect())
    }

    async fn list_pods(&self) -> ClusterResult<Vec<ObservedPod>> {
        let pods: Api<Pod> = match &self.config.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let list = pods
            .list(&ListParams::default())
            .await
            .map_err(|e| classify(e, "list pods"))?;
        Ok(list.items.iter().filter_map(|p| observe_pod(p, &self.config)).collect())
    }

    async fn bind(&self, pod: &str, node: &str) -> ClusterResult<BindOutcome> {
        let (namespace, name) = split_pod_id(pod);
        let binding = Binding {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            target: ObjectReference {
                api_version: Some("v1".to_string()),
                kind: Some("Node".to_string()),
                name: Some(node.to_string()),
                ..Default::default()
            },
        };
        let body = serde_json::to_vec(&binding).map_err(|e| ClusterError::Rejected(e.to_string()))?;

        let result: Result<serde_json::Value, kube::Error> = self
            .pods_in(namespace)
            .create_subresource("binding", name, &PostParams::default(), body)
            .await;
        match result {
            Ok(_) => {
                debug!(%pod, %node, "bound");
                Ok(BindOutcome::Bound)
            }
            Err(kube::Error::Api(resp)) if resp.code == 409 => {
                // Already bound: find out where.
                let current = self
                    .pods_in(namespace)
                    .get(name)
                    .await
                    .map_err(|e| classify(e, pod))?;
                match current.spec.and_then(|s| s.node_name) {
                    Some(bound) if bound == node => Ok(BindOutcome::AlreadyBound),
                    Some(bound) => Ok(BindOutcome::Conflict(format!("already bound to {bound}"))),
                    None => Ok(BindOutcome::Conflict(resp.message)),
                }
            }
            Err(kube::Error::Api(resp)) if resp.code == 404 => Err(ClusterError::NotFound(pod.to_string())),
            Err(kube::Error::Api(resp)) if resp.code < 500 => Ok(BindOutcome::Conflict(resp.message)),
            Err(e) => Err(classify(e, pod)),
        }
    }

    async fn evict(&self, pod: &str) -> ClusterResult<()> {
        let (namespace, name) = split_pod_id(pod);
        self.pods_in(namespace)
            .evict(name, &EvictParams::default())
            .await
            .map_err(|e| classify(e, pod))?;
        info!(%pod, "evicted");
        Ok(())
    }

    async fn delete_pod(&self, pod: &str) -> ClusterResult<()> {
        let (namespace, name) = split_pod_id(pod);
        match self.pods_in(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => {
                warn!(%pod, "pod already deleted");
                Ok(())
            }
            Err(e) => Err(classify(e, pod)),
        }
    }

    async fn cordon(&self, node: &str, cordoned: bool) -> ClusterResult<()> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let patch = json!({ "spec": { "unschedulable": cordoned } });
        nodes
            .patch(node, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| classify(e, node))?;
        info!(%node, cordoned, "node schedulability changed");
        Ok(())
    }
}
