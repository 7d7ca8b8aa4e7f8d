use std::time::Duration;

use htas_cluster::ClusterError;
use htas_state::StateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("no {0} command configured")]
    NotConfigured(&'static str),

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with code {code}: {stderr}")]
    Failed {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("`{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("`{command}` printed nothing")]
    EmptyOutput { command: String },

    #[error("state store: {0}")]
    State(#[from] StateError),
}

pub type CloudResult<T> = Result<T, CloudError>;

impl From<CloudError> for ClusterError {
    fn from(e: CloudError) -> Self {
        match e {
            CloudError::Timeout { .. } => ClusterError::Timeout(e.to_string()),
            CloudError::NotConfigured(_) => ClusterError::Rejected(e.to_string()),
            _ => ClusterError::Command(e.to_string()),
        }
    }
}
