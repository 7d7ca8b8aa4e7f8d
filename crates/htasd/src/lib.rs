//! htasd — the HTAS daemon.
//!
//! Single binary that assembles every HTAS subsystem against one
//! coordination store:
//! - Resource profiler
//! - Task packer
//! - Autoscaler
//! - Instance cleaner
//! - Cloud adaptor
//! - REST API + Prometheus metrics
//!
//! # Usage
//!
//! ```text
//! htasd --config htas.toml run --data-dir /var/lib/htas
//! htasd --config htas.toml simulate --batch-jobs 12
//! htasd --config htas.toml check-config
//! ```

pub mod control_plane;
pub mod simulate;

pub use control_plane::{Collaborators, ControlPlane, TickReport};
