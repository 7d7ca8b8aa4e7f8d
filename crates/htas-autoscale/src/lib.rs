//! htas-autoscale — pending-demand driven pool sizing.
//!
//! Reads the packer's [`PendingDemand`](htas_state::PendingDemand) and the
//! node profiles from a [`ClusterSnapshot`](htas_state::ClusterSnapshot),
//! decides per pool whether to grow or shrink, and talks to the cloud
//! adaptor only through the pool's single [`ScalingIntent`](htas_state::ScalingIntent).
//!
//! # Scaling Algorithm
//!
//! ```text
//! deficit = pending - spare(active nodes) - capacity(provisioning nodes)
//!           (per dimension, floored at zero)
//!
//! if pending tasks > 0 and deficit == 0 and nothing is provisioning:
//!     deficit = largest single pending request      // fragmentation
//!
//! if deficit > 0:
//!     type  = argmin cost_per_unit over types that fit the largest request
//!     count = max(ceil(deficit.cpu / type.cpu), ceil(deficit.mem / type.mem))
//!     ScaleUp(type, min(count, max_nodes - live))
//!
//! if no pending tasks and pool mean utilization < low water for N samples
//!    and live > min_nodes and nothing is draining
//!    and removing the least-utilized node keeps the rest <= high water:
//!     Drain(least-utilized node)                    // cleaner terminates it
//! ```
//!
//! Every structural change claims the pool's cooldown slot first, so the
//! autoscaler and the instance cleaner never act on the same pool in the
//! same window.

pub mod scaler;
pub mod sizing;

pub use scaler::{Autoscaler, StepReport};
pub use sizing::{ScaleDecision, choose_instance_type, evaluate, pool_deficit};
