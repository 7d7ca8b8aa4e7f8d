//! htas-profiler — the cluster's eventually-consistent capacity view.
//!
//! Polls the orchestrator for nodes and pods, derives per-node usage and
//! publishes one [`NodeProfile`](htas_state::NodeProfile) per pool-labelled
//! node through versioned writes. Lifecycle and drain fields belong to the
//! autoscaler and the cleaner and are never touched here.

pub mod profiler;
pub mod usage;

pub use profiler::{PollReport, ProfilerError, ResourceProfiler};
pub use usage::{NodeUsage, usage_by_node};
