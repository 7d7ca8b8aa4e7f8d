//! Pure sizing decisions.
//!
//! Everything here is a function of a [`ClusterSnapshot`] and the shared
//! [`PoolPolicy`], so the same snapshot always yields the same decision.

use std::cmp::{Ordering, Reverse};

use htas_core::{InstanceType, PoolPolicy, PoolSpec, Resources};
use htas_state::{ClusterSnapshot, Lifecycle, NodeProfile};
use tracing::{debug, warn};

/// A scaling decision for a single pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Ask the cloud for `count` nodes of `instance_type`.
    ScaleUp {
        instance_type: String,
        count: u32,
        reason: String,
    },
    /// Hand `node` to the instance cleaner for a scale-down drain.
    Drain { node: String, reason: String },
    /// No change needed.
    NoChange,
}

/// Nodes the cloud acknowledged that the profiler has not reported yet.
fn provisioning<'a>(snapshot: &'a ClusterSnapshot, pool: &str) -> Vec<&'a str> {
    snapshot
        .pool_state(pool)
        .map(|s| {
            s.provisioning
                .iter()
                .filter(|n| snapshot.profile(&n.name).is_none())
                .map(|n| n.instance_type.as_str())
                .collect()
        })
        .unwrap_or_default()
}

/// Resources the pool still lacks for its pending tasks.
///
/// `pending - spare - provisioning`, per dimension and floored at zero.
/// When tasks are pending but the spare capacity is only fragmented
/// (nothing is missing in aggregate) and no node is on its way, the largest
/// single pending request is the deficit.
pub fn pool_deficit(snapshot: &ClusterSnapshot, policy: &PoolPolicy, pool: &str) -> Resources {
    let Some(pending) = snapshot.pending_for(pool).filter(|d| d.tasks > 0) else {
        return Resources::ZERO;
    };

    let spare: Resources = snapshot
        .schedulable_in(pool)
        .filter_map(|p| snapshot.effective_available(&p.instance_name))
        .sum();
    let incoming = provisioning(snapshot, pool);
    let incoming_capacity: Resources = incoming
        .iter()
        .filter_map(|t| policy.instance_type(t))
        .map(|t| t.capacity)
        .sum();

    let deficit = pending
        .resources
        .saturating_sub(spare)
        .saturating_sub(incoming_capacity);
    if deficit.is_zero() && incoming.is_empty() {
        pending.largest
    } else {
        deficit
    }
}

/// Pick the instance type and node count for `deficit`.
///
/// Only types that can host `largest` on a single node qualify. Among the
/// types whose node count fits in `headroom`, the cheapest per unit of
/// resource wins, then the one leaving more spare capacity, then the name.
/// If no type covers the deficit within the headroom, the cheapest
/// qualifying type grows the pool by whatever headroom is left.
pub fn choose_instance_type<'a>(
    policy: &'a PoolPolicy,
    pool: &str,
    deficit: Resources,
    largest: Resources,
    headroom: u32,
) -> Option<(&'a InstanceType, u32)> {
    if headroom == 0 {
        return None;
    }
    let fitting: Vec<&InstanceType> = policy
        .instance_types_for(pool)
        .into_iter()
        .filter(|t| largest.fits_within(&t.capacity))
        .collect();

    let by_cost = |a: &&InstanceType, b: &&InstanceType| {
        policy
            .cost_per_unit(a)
            .total_cmp(&policy.cost_per_unit(b))
    };

    let covering = fitting
        .iter()
        .map(|t| (*t, t.nodes_for(deficit).max(1)))
        .filter(|(_, n)| *n <= headroom)
        .min_by(|(a, na), (b, nb)| {
            by_cost(a, b)
                .then_with(|| Reverse(spare_left(a, *na, deficit)).cmp(&Reverse(spare_left(b, *nb, deficit))))
                .then_with(|| a.name.cmp(&b.name))
        });
    if covering.is_some() {
        return covering;
    }

    fitting
        .into_iter()
        .min_by(|a, b| by_cost(a, b).then_with(|| a.name.cmp(&b.name)))
        .map(|t| (t, headroom))
}

fn spare_left(t: &InstanceType, count: u32, deficit: Resources) -> (u64, u64) {
    let n = u64::from(count);
    Resources::new(t.capacity.cpu_millis * n, t.capacity.memory_mib * n)
        .saturating_sub(deficit)
        .fit_key()
}

/// Evaluate one pool.
///
/// A pool with an intent in flight or inside its structural cooldown is
/// left alone.
pub fn evaluate(snapshot: &ClusterSnapshot, policy: &PoolPolicy, pool: &PoolSpec, now: u64) -> ScaleDecision {
    let name = pool.name.as_str();
    if snapshot.intent(name).is_some() {
        debug!(pool = %name, "intent in flight, no decision");
        return ScaleDecision::NoChange;
    }
    if !policy.cooldown_elapsed(snapshot.pool_state(name).and_then(|s| s.last_change_at), now) {
        debug!(pool = %name, "structural cooldown active");
        return ScaleDecision::NoChange;
    }

    let incoming = provisioning(snapshot, name).len() as u32;
    let live = snapshot.live_nodes(name) + incoming;

    if live < pool.min_nodes {
        let cheapest = policy
            .instance_types_for(name)
            .into_iter()
            .min_by(|a, b| {
                policy
                    .cost_per_unit(a)
                    .total_cmp(&policy.cost_per_unit(b))
                    .then_with(|| a.name.cmp(&b.name))
            });
        return match cheapest {
            Some(t) => ScaleDecision::ScaleUp {
                instance_type: t.name.clone(),
                count: pool.min_nodes - live,
                reason: format!("pool below minimum size ({live} < {})", pool.min_nodes),
            },
            None => ScaleDecision::NoChange,
        };
    }

    let pending = snapshot.pending_for(name).map(|d| (d.tasks, d.largest));
    if let Some((tasks, largest)) = pending.filter(|(tasks, _)| *tasks > 0) {
        let deficit = pool_deficit(snapshot, policy, name);
        if deficit.is_zero() {
            debug!(pool = %name, tasks, "pending demand covered by provisioning nodes");
            return ScaleDecision::NoChange;
        }
        let headroom = policy.growth_headroom(pool, live);
        return match choose_instance_type(policy, name, deficit, largest, headroom) {
            Some((t, count)) => ScaleDecision::ScaleUp {
                instance_type: t.name.clone(),
                count,
                reason: format!("{tasks} pending tasks, deficit {deficit}"),
            },
            None if headroom == 0 => {
                warn!(pool = %name, tasks, max = pool.max_nodes, "pool at maximum size with pending tasks");
                ScaleDecision::NoChange
            }
            None => {
                warn!(pool = %name, largest = %largest, "no instance type fits the largest pending request");
                ScaleDecision::NoChange
            }
        };
    }

    scale_down_candidate(snapshot, policy, pool, live, incoming)
}

fn scale_down_candidate(
    snapshot: &ClusterSnapshot,
    policy: &PoolPolicy,
    pool: &PoolSpec,
    live: u32,
    incoming: u32,
) -> ScaleDecision {
    let name = pool.name.as_str();
    if incoming > 0 || !policy.can_shrink(pool, live) || snapshot.has_leaving(name) {
        return ScaleDecision::NoChange;
    }

    let active: Vec<&NodeProfile> = snapshot
        .pool_profiles(name)
        .map(|p| &p.value)
        .filter(|p| p.lifecycle == Lifecycle::Active && !p.stale)
        .collect();
    let histories: Vec<&[f64]> = active.iter().map(|p| p.utilization_history.as_slice()).collect();
    let series = policy.pool_mean_series(&histories);
    if !policy.sustained_low(&series) {
        return ScaleDecision::NoChange;
    }

    let Some(victim) = active.iter().min_by(|a, b| {
        a.utilization()
            .partial_cmp(&b.utilization())
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.instance_name.cmp(&b.instance_name))
    }) else {
        return ScaleDecision::NoChange;
    };

    let used: Resources = active.iter().map(|p| p.used()).sum();
    let capacity: Resources = active.iter().map(|p| p.capacity()).sum();
    if !policy.removal_keeps_headroom(used, capacity, victim.capacity()) {
        debug!(pool = %name, node = %victim.instance_name, "removal would push the pool over high water");
        return ScaleDecision::NoChange;
    }

    let mean = series.last().copied().unwrap_or(0.0);
    ScaleDecision::Drain {
        node: victim.instance_name.clone(),
        reason: format!("pool mean utilization {mean:.2} below {:.2}", policy.drain_low_water),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use htas_core::HtasConfig;
    use htas_state::{PendingDemand, PoolState, ProvisioningNode, ScalingIntent};

    const CONFIG: &str = r#"
[policy]
sustained_samples = 3
utilization_window = 5
structural_cooldown = "5m"

[[pool]]
name = "batch-pool"
workload = "batch"
min_nodes = 1
max_nodes = 5
instance_types = ["small", "large", "pricey"]

[[instance_type]]
name = "small"
cpu = 2
memory = "4Gi"
hourly_cost = 0.08

[[instance_type]]
name = "large"
cpu = 8
memory = "16Gi"
hourly_cost = 0.32

[[instance_type]]
name = "pricey"
cpu = 2
memory = "4Gi"
hourly_cost = 0.5
"#;

    fn policy() -> PoolPolicy {
        PoolPolicy::from_config(&HtasConfig::from_toml_str(CONFIG).unwrap())
    }

    fn node(name: &str, used_cores: u64, history: &[f64]) -> NodeProfile {
        let cap = Resources::cores_gib(2, 4);
        let mut p = NodeProfile::new(name, "small", "batch-pool", cap, 10);
        p.set_resources(cap, cap.saturating_sub(Resources::cores_gib(used_cores, 0)));
        for s in history {
            p.utilization_history.push(*s);
        }
        p
    }

    fn demand(tasks: &[(u64, u64)]) -> PendingDemand {
        let mut d = PendingDemand::empty("batch-pool", 0);
        for (cpu, mem) in tasks {
            d.add(Resources::new(*cpu, *mem), 0);
        }
        d
    }

    fn pool(policy: &PoolPolicy) -> PoolSpec {
        policy.pool("batch-pool").unwrap().clone()
    }

    #[test]
    fn deficit_subtracts_spare_capacity() {
        let p = policy();
        let snap = ClusterSnapshot::new(0)
            .with_profile(node("a", 1, &[]))
            .with_pending(demand(&[(1500, 1024), (1500, 1024)]));
        // 3 cores pending, 1 core spare.
        assert_eq!(pool_deficit(&snap, &p, "batch-pool"), Resources::new(2000, 0));
    }

    #[test]
    fn fragmented_spare_uses_largest_request() {
        let p = policy();
        let snap = ClusterSnapshot::new(0)
            .with_profile(node("a", 1, &[]))
            .with_profile(node("b", 1, &[]))
            .with_pending(demand(&[(1500, 512)]));
        assert_eq!(pool_deficit(&snap, &p, "batch-pool"), Resources::new(1500, 512));
    }

    #[test]
    fn provisioning_nodes_cover_the_deficit() {
        let p = policy();
        let mut state = PoolState::new("batch-pool");
        state.provisioning.push(ProvisioningNode {
            name: "batch-pool-9".into(),
            instance_type: "small".into(),
            requested_at: 0,
        });
        let mut snap = ClusterSnapshot::new(0)
            .with_profile(node("a", 2, &[]))
            .with_pending(demand(&[(1500, 512)]));
        snap.pools.insert(
            "batch-pool".into(),
            htas_state::Versioned { version: 1, value: state },
        );
        assert_eq!(pool_deficit(&snap, &p, "batch-pool"), Resources::ZERO);
        assert_eq!(evaluate(&snap, &p, &pool(&p), 0), ScaleDecision::NoChange);
    }

    #[test]
    fn cheapest_type_per_unit_wins() {
        let p = policy();
        // small and large cost the same per unit; large leaves more spare.
        let (t, n) = choose_instance_type(&p, "batch-pool", Resources::cores_gib(3, 2), Resources::cores_gib(1, 1), 5).unwrap();
        assert_eq!((t.name.as_str(), n), ("large", 1));
        assert!(p.cost_per_unit(p.instance_type("pricey").unwrap()) > p.cost_per_unit(t));
    }

    #[test]
    fn types_too_small_for_the_largest_request_are_skipped() {
        let p = policy();
        let (t, n) = choose_instance_type(&p, "batch-pool", Resources::cores_gib(3, 1), Resources::cores_gib(3, 1), 5).unwrap();
        assert_eq!((t.name.as_str(), n), ("large", 1));
        assert!(choose_instance_type(&p, "batch-pool", Resources::cores_gib(9, 1), Resources::cores_gib(9, 1), 5).is_none());
    }

    #[test]
    fn count_is_capped_at_headroom() {
        let p = policy();
        let (_, n) = choose_instance_type(&p, "batch-pool", Resources::cores_gib(40, 1), Resources::cores_gib(1, 1), 2).unwrap();
        assert_eq!(n, 2);
        assert!(choose_instance_type(&p, "batch-pool", Resources::cores_gib(1, 1), Resources::cores_gib(1, 1), 0).is_none());
    }

    #[test]
    fn pending_work_scales_up() {
        let p = policy();
        let snap = ClusterSnapshot::new(0)
            .with_profile(node("a", 2, &[]))
            .with_pending(demand(&[(1000, 1024), (1000, 1024), (1000, 1024)]));
        match evaluate(&snap, &p, &pool(&p), 0) {
            ScaleDecision::ScaleUp { instance_type, count, .. } => {
                assert_eq!(instance_type, "large");
                assert_eq!(count, 1);
            }
            other => panic!("expected scale-up, got {other:?}"),
        }
    }

    #[test]
    fn intent_in_flight_suppresses_decisions() {
        let p = policy();
        let snap = ClusterSnapshot::new(0)
            .with_pending(demand(&[(1000, 1024)]))
            .with_intent(ScalingIntent::scale_up("batch-pool", 1, "small", "x".into(), 0));
        assert_eq!(evaluate(&snap, &p, &pool(&p), 0), ScaleDecision::NoChange);
    }

    #[test]
    fn below_minimum_grows_to_minimum() {
        let p = policy();
        let snap = ClusterSnapshot::new(0);
        match evaluate(&snap, &p, &pool(&p), 0) {
            ScaleDecision::ScaleUp { count, .. } => assert_eq!(count, 1),
            other => panic!("expected scale-up, got {other:?}"),
        }
    }

    #[test]
    fn sustained_low_pool_drains_least_utilized_node() {
        let p = policy();
        let low = [0.2, 0.2, 0.2];
        let snap = ClusterSnapshot::new(0)
            .with_profile(node("a", 1, &low))
            .with_profile(node("b", 0, &low))
            .with_profile(node("c", 1, &low));
        match evaluate(&snap, &p, &pool(&p), 0) {
            ScaleDecision::Drain { node, .. } => assert_eq!(node, "b"),
            other => panic!("expected drain, got {other:?}"),
        }
    }

    #[test]
    fn no_drain_when_removal_overloads_the_rest() {
        let p = policy();
        let low = [0.3, 0.3, 0.3];
        // 3 of 4 cores used; one node left would be at 150%.
        let snap = ClusterSnapshot::new(0)
            .with_profile(node("a", 2, &low))
            .with_profile(node("b", 1, &low));
        assert_eq!(evaluate(&snap, &p, &pool(&p), 0), ScaleDecision::NoChange);
    }

    #[test]
    fn no_drain_at_minimum_size_or_while_draining() {
        let p = policy();
        let low = [0.1, 0.1, 0.1];
        let single = ClusterSnapshot::new(0).with_profile(node("a", 0, &low));
        assert_eq!(evaluate(&single, &p, &pool(&p), 0), ScaleDecision::NoChange);

        let mut leaving = node("b", 0, &low);
        leaving.lifecycle = Lifecycle::Draining;
        let snap = ClusterSnapshot::new(0)
            .with_profile(node("a", 0, &low))
            .with_profile(leaving)
            .with_profile(node("c", 0, &low));
        assert_eq!(evaluate(&snap, &p, &pool(&p), 0), ScaleDecision::NoChange);
    }

    #[test]
    fn short_low_streak_does_not_drain() {
        let p = policy();
        let snap = ClusterSnapshot::new(0)
            .with_profile(node("a", 0, &[0.9, 0.1, 0.1]))
            .with_profile(node("b", 0, &[0.9, 0.1, 0.1]));
        assert_eq!(evaluate(&snap, &p, &pool(&p), 0), ScaleDecision::NoChange);
    }

    #[test]
    fn cooldown_blocks_structural_changes() {
        let p = policy();
        let mut state = PoolState::new("batch-pool");
        state.last_change_at = Some(100);
        let mut snap = ClusterSnapshot::new(0).with_pending(demand(&[(1000, 1024)]));
        snap.pools.insert(
            "batch-pool".into(),
            htas_state::Versioned { version: 1, value: state },
        );
        assert_eq!(evaluate(&snap, &p, &pool(&p), 200), ScaleDecision::NoChange);
        assert_ne!(evaluate(&snap, &p, &pool(&p), 400), ScaleDecision::NoChange);
    }
}
