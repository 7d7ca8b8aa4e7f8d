use htas_cluster::ClusterError;
use htas_state::StateError;

#[derive(Debug, thiserror::Error)]
pub enum CleanerError {
    #[error("state store: {0}")]
    State(#[from] StateError),

    #[error("cluster: {0}")]
    Cluster(#[from] ClusterError),
}
