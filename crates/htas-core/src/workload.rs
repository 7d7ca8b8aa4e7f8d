//! Workload classes.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The two workload classes HTAS packs differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkloadKind {
    /// Services packed with plain best-fit-decreasing.
    LongRunning,
    /// Jobs with an estimated runtime, packed along the time axis.
    Batch,
}

impl WorkloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::LongRunning => "long-running",
            WorkloadKind::Batch => "batch",
        }
    }
}

impl std::fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkloadKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "long-running" | "longrunning" | "long_running" | "service" => {
                Ok(WorkloadKind::LongRunning)
            }
            "batch" | "job" => Ok(WorkloadKind::Batch),
            other => Err(format!("unknown workload kind {other:?}")),
        }
    }
}
