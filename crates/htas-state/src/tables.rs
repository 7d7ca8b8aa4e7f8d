//! redb table definitions for the HTAS state store.
//!
//! Each table uses `&str` keys and `&[u8]` values holding a JSON-encoded
//! `Versioned<T>`.

use redb::TableDefinition;

/// Node profiles keyed by `{instance_name}`.
pub const PROFILES: TableDefinition<&str, &[u8]> = TableDefinition::new("profiles");

/// Placements keyed by `{pod_id}`.
pub const PLACEMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("placements");

/// Scaling intents keyed by `{pool}`; the key admits one intent per pool.
pub const INTENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("intents");

/// Unplaceable demand keyed by `{pool}`.
pub const PENDING: TableDefinition<&str, &[u8]> = TableDefinition::new("pending");

/// Structural-change bookkeeping keyed by `{pool}`.
pub const POOLS: TableDefinition<&str, &[u8]> = TableDefinition::new("pools");

/// Operator alerts keyed by `{raised_at:020}/{source}/{subject}`.
pub const ALERTS: TableDefinition<&str, &[u8]> = TableDefinition::new("alerts");

/// Removed nodes keyed by `{instance_name}`.
pub const TOMBSTONES: TableDefinition<&str, &[u8]> = TableDefinition::new("tombstones");
