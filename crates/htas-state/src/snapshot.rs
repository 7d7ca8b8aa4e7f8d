//! Immutable view of the coordination store taken at the start of a pass.
//!
//! Decision functions (packing, sizing, drain selection) take a
//! `&ClusterSnapshot` and never touch the store, so they are pure
//! functions of the snapshot and the pending work.

use std::collections::{BTreeMap, BTreeSet};

use htas_core::Resources;

use crate::types::*;

#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    pub taken_at: u64,
    pub profiles: BTreeMap<NodeName, Versioned<NodeProfile>>,
    pub placements: BTreeMap<PodId, Versioned<Placement>>,
    pub intents: BTreeMap<PoolName, Versioned<ScalingIntent>>,
    pub pending: BTreeMap<PoolName, Versioned<PendingDemand>>,
    pub pools: BTreeMap<PoolName, Versioned<PoolState>>,
    pub tombstones: BTreeSet<NodeName>,
}

impl ClusterSnapshot {
    pub fn new(taken_at: u64) -> Self {
        Self {
            taken_at,
            ..Default::default()
        }
    }

    // ── Builders (tests and simulation) ────────────────────────────

    pub fn with_profile(mut self, profile: NodeProfile) -> Self {
        self.profiles.insert(
            profile.instance_name.clone(),
            Versioned {
                version: 1,
                value: profile,
            },
        );
        self
    }

    pub fn with_placement(mut self, placement: Placement) -> Self {
        self.placements.insert(
            placement.pod_id.clone(),
            Versioned {
                version: 1,
                value: placement,
            },
        );
        self
    }

    pub fn with_intent(mut self, intent: ScalingIntent) -> Self {
        self.intents.insert(
            intent.pool.clone(),
            Versioned {
                version: 1,
                value: intent,
            },
        );
        self
    }

    pub fn with_pending(mut self, demand: PendingDemand) -> Self {
        self.pending.insert(
            demand.pool.clone(),
            Versioned {
                version: 1,
                value: demand,
            },
        );
        self
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn profile(&self, node: &str) -> Option<&Versioned<NodeProfile>> {
        self.profiles.get(node)
    }

    /// Every profile of a pool, in node-name order.
    pub fn pool_profiles<'a, 'p>(&'a self, pool: &'p str) -> impl Iterator<Item = &'a Versioned<NodeProfile>> + use<'a, 'p> {
        self.profiles.values().filter(move |p| p.pool == pool)
    }

    /// Nodes that may receive new work: active and fresh.
    pub fn schedulable_in<'a>(&'a self, pool: &'a str) -> impl Iterator<Item = &'a NodeProfile> + 'a {
        self.pool_profiles(pool)
            .map(|p| &p.value)
            .filter(|p| p.is_schedulable())
    }

    pub fn placements_on<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a Placement> + 'a {
        self.placements
            .values()
            .map(|p| &p.value)
            .filter(move |p| p.node == node)
    }

    /// Requests of binds the profiler had not yet observed when it last
    /// profiled `node` (bound at or after its last update).
    pub fn unobserved_on(&self, node: &str) -> Resources {
        let Some(profile) = self.profiles.get(node) else {
            return Resources::ZERO;
        };
        self.placements_on(node)
            .filter(|p| p.bound_at >= profile.last_updated)
            .map(|p| p.resources)
            .sum()
    }

    /// Profiled availability minus unobserved binds.
    pub fn effective_available(&self, node: &str) -> Option<Resources> {
        let profile = self.profiles.get(node)?;
        Some(profile.available().saturating_sub(self.unobserved_on(node)))
    }

    /// Nodes of the pool that still exist (any lifecycle).
    pub fn live_nodes(&self, pool: &str) -> u32 {
        self.pool_profiles(pool).count() as u32
    }

    /// Whether any node of the pool is draining or terminating.
    pub fn has_leaving(&self, pool: &str) -> bool {
        self.pool_profiles(pool).any(|p| p.is_leaving())
    }

    pub fn intent(&self, pool: &str) -> Option<&Versioned<ScalingIntent>> {
        self.intents.get(pool)
    }

    pub fn scale_up_in_flight(&self, pool: &str) -> bool {
        self.intent(pool).is_some_and(|i| i.is_scale_up())
    }

    pub fn pool_state(&self, pool: &str) -> Option<&Versioned<PoolState>> {
        self.pools.get(pool)
    }

    pub fn pending_for(&self, pool: &str) -> Option<&PendingDemand> {
        self.pending.get(pool).map(|d| &d.value)
    }
}
