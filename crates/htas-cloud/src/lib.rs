//! htas-cloud — the cloud side of scaling.
//!
//! # Components
//!
//! - **CloudAdaptor**: claims and executes pending [`ScalingIntent`]s
//!   written by the autoscaler and the instance cleaner, then records the
//!   outcome on the intent (acknowledged with node names, or failed with the
//!   error text).
//! - **CommandProvider**: a [`CloudProvider`] and [`Checkpointer`] that
//!   shells out to operator-configured command templates.
//!
//! [`ScalingIntent`]: htas_state::ScalingIntent
//! [`CloudProvider`]: htas_cluster::CloudProvider
//! [`Checkpointer`]: htas_cluster::Checkpointer

pub mod adaptor;
pub mod command;
pub mod error;

pub use adaptor::{AdaptorReport, CloudAdaptor};
pub use command::CommandProvider;
pub use error::{CloudError, CloudResult};
