//! htas-cleaner — reclaims underused nodes.
//!
//! Every node moves through one state machine, persisted on its profile:
//!
//! ```text
//!   ACTIVE ──(sustained low, slot claimed)──> DRAINING ──(no pods left)──> TERMINATING ──(ack)──> REMOVED
//!     ^                                          │  ^                           │
//!     └──────(busy again, nothing migrated)──────┘  └──────(pods reappeared)────┤
//!     ^                                                                         │
//!     └───────────────────────(termination retries exhausted)───────────────────┘
//! ```
//!
//! # Components
//!
//! - **`machine`** — pure transition rules (who may drain, where a pod goes)
//! - **`cleaner`** — the loop that applies them through the orchestrator,
//!   the checkpointer and the state store

pub mod cleaner;
pub mod error;
pub mod machine;

pub use cleaner::{CleanerReport, InstanceCleaner};
pub use error::CleanerError;
pub use machine::{activation_candidate, migration_target, should_cancel};
