//! htas-packer — assigns pending pods to nodes.
//!
//! This crate decides placements from an immutable [`ClusterSnapshot`]
//! and commits them through the orchestrator's bind extension point.
//!
//! # Components
//!
//! - **`task`** — pending tasks derived from the orchestrator's pod listing
//! - **`bfd`** — best-fit-decreasing for long-running services
//! - **`timebin`** — best-fit-decreasing extended along a time axis for batch jobs
//! - **`plan`** — per-pool placement plan combining both
//! - **`packer`** — the control loop: snapshot, plan, bind, record
//!
//! [`ClusterSnapshot`]: htas_state::ClusterSnapshot

pub mod bfd;
pub mod error;
pub mod packer;
pub mod plan;
pub mod task;
pub mod timebin;

pub use bfd::{best_fit, pack_long_running};
pub use error::PackerError;
pub use packer::{PassReport, TaskPacker};
pub use plan::{Decision, PoolPlan, plan_pool};
pub use task::{PendingTask, pending_tasks};
pub use timebin::{BatchChoice, BinLayout, Timeline, pack_batch};
