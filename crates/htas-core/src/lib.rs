//! htas-core — shared vocabulary for the HTAS control loops.
//!
//! - **`resources`** — cpu/memory vectors and Kubernetes quantity parsing
//! - **`workload`** — workload classes (long-running vs. batch)
//! - **`config`** — `htas.toml` parsing and validation
//! - **`policy`** — the pool-sizing policy consulted by both the autoscaler
//!   and the instance cleaner, so their thresholds cannot drift apart
//! - **`backoff`** — exponential backoff used by every retrying loop
//! - **`clock`** — wall-clock helpers and duration strings

pub mod backoff;
pub mod clock;
pub mod config;
pub mod policy;
pub mod resources;
pub mod workload;

pub use backoff::{Backoff, delay_for_attempt};
pub use clock::epoch_secs;
pub use config::{ConfigError, HtasConfig};
pub use policy::{InstanceType, PoolPolicy, PoolSpec};
pub use resources::{QuantityError, Resources, utilization};
pub use workload::WorkloadKind;
