//! htas-state — the shared coordination store for the HTAS control loops.
//!
//! Backed by [redb](https://docs.rs/redb). Every record is wrapped in a
//! [`Versioned`] envelope and JSON-serialized into a `&[u8]` value column.
//!
//! # Concurrency
//!
//! ```text
//!   profiler ──┐                               ┌──► packer
//!   packer   ──┤  conditional writes         ├──► autoscaler
//!   scaler   ──┼────────────►  StateStore  ────┼──► cleaner     snapshot()
//!   cleaner  ──┤                               ├──► cloud       subscribe()
//!   cloud    ──┘                               └──► api
//! ```
//!
//! Writers never hold a lock across a decision. They read a
//! [`ClusterSnapshot`], decide, and write conditionally on the version they
//! saw; a mismatch surfaces as [`StateError::Conflict`] and the caller
//! retries against a fresh read. Every committed write is announced on a
//! broadcast channel ([`StateStore::subscribe`]).

pub mod error;
pub mod snapshot;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use snapshot::ClusterSnapshot;
pub use store::{MAX_ALERTS, StateStore, StoreEvent, TableKind};
pub use types::*;
