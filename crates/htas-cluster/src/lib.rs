//! htas-cluster — the seams between the HTAS loops and the outside world.
//!
//! - [`Orchestrator`] — node/pod listing plus bind, evict, delete and cordon
//! - [`CloudProvider`] — node create/delete
//! - [`Checkpointer`] — pod checkpoint/restore
//!
//! [`SimCluster`] implements all three in memory with fault injection; it
//! backs the unit and integration tests and `htasd simulate`.

pub mod api;
pub mod sim;

pub use api::*;
pub use sim::{Faults, SimCluster};
