//! Pool-sizing policy shared by the autoscaler and the instance cleaner.
//!
//! Both loops consult the same thresholds through [`PoolPolicy`], so a
//! node the cleaner considers underused is exactly the kind of node the
//! autoscaler would shrink away, and neither grows what the other drains.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use crate::config::HtasConfig;
use crate::resources::{Resources, utilization};
use crate::workload::WorkloadKind;

/// A purchasable node shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceType {
    pub name: String,
    pub capacity: Resources,
    pub hourly_cost: f64,
}

impl InstanceType {
    /// Nodes of this type needed to cover `deficit`, ceiling on each
    /// dimension and the larger of the two. Zero for a zero deficit.
    pub fn nodes_for(&self, deficit: Resources) -> u32 {
        let ceil_div = |need: u64, per: u64| {
            if need == 0 {
                0
            } else if per == 0 {
                u64::MAX
            } else {
                need.div_ceil(per)
            }
        };
        let n = ceil_div(deficit.cpu_millis, self.capacity.cpu_millis)
            .max(ceil_div(deficit.memory_mib, self.capacity.memory_mib));
        u32::try_from(n).unwrap_or(u32::MAX)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolSpec {
    pub name: String,
    pub workload: WorkloadKind,
    pub min_nodes: u32,
    pub max_nodes: u32,
    pub instance_types: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolPolicy {
    pools: Vec<PoolSpec>,
    instance_types: BTreeMap<String, InstanceType>,
    pub drain_low_water: f64,
    pub autoscale_high_water: f64,
    pub sustained_samples: usize,
    pub utilization_window: usize,
    pub structural_cooldown: Duration,
    pub cpu_cost_weight: f64,
    pub memory_cost_weight: f64,
    pub conflict_retries: u32,
}

impl PoolPolicy {
    pub fn from_config(config: &HtasConfig) -> Self {
        let instance_types = config
            .instance_types
            .iter()
            .map(|t| {
                (
                    t.name.clone(),
                    InstanceType {
                        name: t.name.clone(),
                        capacity: Resources::new(t.cpu_millis, t.memory_mib),
                        hourly_cost: t.hourly_cost,
                    },
                )
            })
            .collect();
        let pools = config
            .pools
            .iter()
            .map(|p| PoolSpec {
                name: p.name.clone(),
                workload: p.workload,
                min_nodes: p.min_nodes,
                max_nodes: p.max_nodes,
                instance_types: p.instance_types.clone(),
            })
            .collect();
        let p = &config.policy;
        Self {
            pools,
            instance_types,
            drain_low_water: p.drain_low_water,
            autoscale_high_water: p.autoscale_high_water,
            sustained_samples: p.sustained_samples,
            utilization_window: p.utilization_window,
            structural_cooldown: p.structural_cooldown,
            cpu_cost_weight: p.cpu_cost_weight,
            memory_cost_weight: p.memory_cost_weight,
            conflict_retries: p.conflict_retries.max(1),
        }
    }

    // ── Pools and instance types ───────────────────────────────────

    pub fn pools(&self) -> &[PoolSpec] {
        &self.pools
    }

    pub fn pool(&self, name: &str) -> Option<&PoolSpec> {
        self.pools.iter().find(|p| p.name == name)
    }

    /// Resolve the pool a task belongs to: its explicit pool if given,
    /// otherwise the first pool configured for its workload class.
    pub fn pool_for(&self, kind: WorkloadKind, explicit: Option<&str>) -> Option<&PoolSpec> {
        match explicit {
            Some(name) => self.pool(name),
            None => self.pools.iter().find(|p| p.workload == kind),
        }
    }

    pub fn instance_type(&self, name: &str) -> Option<&InstanceType> {
        self.instance_types.get(name)
    }

    /// Instance types a pool may grow with, in configured order.
    pub fn instance_types_for(&self, pool: &str) -> Vec<&InstanceType> {
        self.pool(pool)
            .map(|p| {
                p.instance_types
                    .iter()
                    .filter_map(|t| self.instance_types.get(t))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `hourly_cost / (cpu_weight * cores + memory_weight * GiB)`.
    pub fn cost_per_unit(&self, t: &InstanceType) -> f64 {
        let cores = t.capacity.cpu_millis as f64 / 1000.0;
        let gib = t.capacity.memory_mib as f64 / 1024.0;
        let units = self.cpu_cost_weight * cores + self.memory_cost_weight * gib;
        if units <= 0.0 {
            f64::INFINITY
        } else {
            t.hourly_cost / units
        }
    }

    // ── Thresholds ─────────────────────────────────────────────────

    pub fn is_low(&self, utilization: f64) -> bool {
        utilization < self.drain_low_water
    }

    pub fn exceeds_high(&self, utilization: f64) -> bool {
        utilization > self.autoscale_high_water
    }

    /// True when the last `sustained_samples` entries of `history` are all
    /// below the low-water mark. Short histories never qualify.
    pub fn sustained_low(&self, history: &[f64]) -> bool {
        let n = self.sustained_samples;
        history.len() >= n && history[history.len() - n..].iter().all(|u| self.is_low(*u))
    }

    /// Mean utilization across nodes for each of the last
    /// `utilization_window` sample positions, aligned from the newest sample.
    /// A position contributes only the nodes that have a sample there.
    pub fn pool_mean_series(&self, histories: &[&[f64]]) -> Vec<f64> {
        let depth = histories
            .iter()
            .map(|h| h.len())
            .max()
            .unwrap_or(0)
            .min(self.utilization_window);
        let mut series = Vec::with_capacity(depth);
        for back in (0..depth).rev() {
            let mut sum = 0.0;
            let mut count = 0usize;
            for h in histories {
                if back < h.len() {
                    sum += h[h.len() - 1 - back];
                    count += 1;
                }
            }
            if count > 0 {
                series.push(sum / count as f64);
            }
        }
        series
    }

    /// Whether the pool's remaining nodes would stay at or under the
    /// high-water mark after `removed` capacity leaves.
    pub fn removal_keeps_headroom(&self, used: Resources, capacity: Resources, removed: Resources) -> bool {
        let remaining = capacity.saturating_sub(removed);
        if remaining.is_zero() {
            return used.is_zero();
        }
        !self.exceeds_high(utilization(used, remaining))
    }

    // ── Pool size ──────────────────────────────────────────────────

    /// A pool of `current` nodes may lose one.
    pub fn can_shrink(&self, pool: &PoolSpec, current: u32) -> bool {
        current > pool.min_nodes
    }

    /// Nodes a pool of `current` nodes may still add.
    pub fn growth_headroom(&self, pool: &PoolSpec, current: u32) -> u32 {
        pool.max_nodes.saturating_sub(current)
    }

    /// Whether the structural cooldown has passed since `last_change_at`.
    pub fn cooldown_elapsed(&self, last_change_at: Option<u64>, now: u64) -> bool {
        match last_change_at {
            None => true,
            Some(at) => now.saturating_sub(at) >= self.structural_cooldown.as_secs(),
        }
    }
}
