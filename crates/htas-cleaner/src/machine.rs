//! Transition rules of the drain state machine.
//!
//! Pure functions of a [`ClusterSnapshot`] and the shared [`PoolPolicy`];
//! the cleaner loop owns every side effect.

use std::collections::BTreeMap;

use htas_core::{PoolPolicy, PoolSpec, Resources};
use htas_packer::best_fit;
use htas_state::{ClusterSnapshot, DrainOrigin, Lifecycle, NodeProfile, Versioned};

/// The node of `pool` the cleaner should start draining, if any.
///
/// A node qualifies when its own utilization stayed below the low-water
/// mark for the sustained number of samples. The pool must have more than
/// one node and stay at or above its minimum, nothing in it may be draining
/// or terminating, no scale-up may be in flight, the structural cooldown
/// must have passed, and the remaining nodes must absorb the node's load
/// without crossing the high-water mark. The least-utilized qualifying node
/// wins; ties go to the node name.
pub fn activation_candidate<'a>(
    snapshot: &'a ClusterSnapshot,
    policy: &PoolPolicy,
    pool: &PoolSpec,
    now: u64,
) -> Option<&'a Versioned<NodeProfile>> {
    let name = pool.name.as_str();
    let live = snapshot.live_nodes(name);
    if live <= 1
        || !policy.can_shrink(pool, live)
        || snapshot.has_leaving(name)
        || snapshot.scale_up_in_flight(name)
        || !policy.cooldown_elapsed(snapshot.pool_state(name).and_then(|s| s.last_change_at), now)
    {
        return None;
    }

    let active: Vec<&Versioned<NodeProfile>> = snapshot
        .pool_profiles(name)
        .filter(|p| p.lifecycle == Lifecycle::Active && !p.stale)
        .collect();
    let used: Resources = active.iter().map(|p| p.used()).sum();
    let capacity: Resources = active.iter().map(|p| p.capacity()).sum();

    active
        .iter()
        .copied()
        .filter(|p| policy.sustained_low(p.utilization_history.as_slice()))
        .filter(|p| policy.removal_keeps_headroom(used, capacity, p.capacity()))
        .min_by(|a, b| {
            a.utilization()
                .total_cmp(&b.utilization())
                .then_with(|| a.instance_name.cmp(&b.instance_name))
        })
}

/// Whether a drain that has not migrated anything yet should be pulled
/// back: the node got busy again, or its pool has work waiting for room.
///
/// A node the cleaner picked for being underused is busy again once its
/// latest sample is back at the low-water mark. A scale-down victim was
/// picked for its pool's mean, so only high water pulls it back.
pub fn should_cancel(snapshot: &ClusterSnapshot, policy: &PoolPolicy, profile: &NodeProfile) -> bool {
    if profile.lifecycle != Lifecycle::Draining {
        return false;
    }
    let Some(drain) = profile.drain.as_ref() else {
        return false;
    };
    if drain.migration_started {
        return false;
    }
    let busy = profile.utilization_history.latest().is_some_and(|u| match drain.origin {
        DrainOrigin::Cleaner => !policy.is_low(u),
        DrainOrigin::ScaleDown => policy.exceeds_high(u),
    });
    let starved = snapshot.pending_for(&profile.pool).is_some_and(|d| d.tasks > 0);
    busy || starved
}

/// Where a pod of `request` leaving `source` should be restored.
///
/// Best fit over the schedulable nodes of the same pool, minus what this
/// step already reserved on them.
pub fn migration_target(
    snapshot: &ClusterSnapshot,
    pool: &str,
    source: &str,
    request: Resources,
    reserved: &BTreeMap<String, Resources>,
) -> Option<String> {
    let candidates: Vec<(&str, Resources)> = snapshot
        .schedulable_in(pool)
        .filter(|p| p.instance_name != source)
        .filter_map(|p| {
            let free = snapshot.effective_available(&p.instance_name)?;
            let taken = reserved.get(&p.instance_name).copied().unwrap_or_default();
            Some((p.instance_name.as_str(), free.saturating_sub(taken)))
        })
        .collect();
    best_fit(candidates, request).map(str::to_string)
}
