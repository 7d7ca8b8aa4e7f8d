//! Error types for the task packer.

use htas_cluster::ClusterError;
use htas_state::StateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PackerError {
    #[error("state store: {0}")]
    State(#[from] StateError),

    #[error("orchestrator: {0}")]
    Cluster(#[from] ClusterError),
}
