//! Prometheus text exposition format.
//!
//! Renders a [`ClusterSnapshot`] into gauges labelled by node and pool.

use std::collections::BTreeMap;
use std::fmt::Write;

use htas_state::{Alert, ClusterSnapshot, Lifecycle, Severity};

fn header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
}

/// Render the snapshot and alert list into Prometheus text format.
pub fn render_prometheus(snapshot: &ClusterSnapshot, alerts: &[Alert]) -> String {
    let mut out = String::new();
    let profiles: Vec<_> = snapshot.profiles.values().collect();

    header(&mut out, "htas_node_utilization", "Dominant-resource utilization of the node (0.0-1.0).", "gauge");
    for p in &profiles {
        let _ = writeln!(
            out,
            "htas_node_utilization{{node=\"{}\",pool=\"{}\"}} {:.4}",
            p.instance_name,
            p.pool,
            p.utilization()
        );
    }

    header(&mut out, "htas_node_available_cpu_millis", "Unrequested cpu on the node in millicores.", "gauge");
    for p in &profiles {
        let _ = writeln!(
            out,
            "htas_node_available_cpu_millis{{node=\"{}\",pool=\"{}\"}} {}",
            p.instance_name, p.pool, p.cpu_available
        );
    }

    header(&mut out, "htas_node_available_memory_mib", "Unrequested memory on the node in MiB.", "gauge");
    for p in &profiles {
        let _ = writeln!(
            out,
            "htas_node_available_memory_mib{{node=\"{}\",pool=\"{}\"}} {}",
            p.instance_name, p.pool, p.memory_available
        );
    }

    header(&mut out, "htas_node_stale", "1 when the node profile is older than the staleness TTL.", "gauge");
    for p in &profiles {
        let _ = writeln!(
            out,
            "htas_node_stale{{node=\"{}\",pool=\"{}\"}} {}",
            p.instance_name,
            p.pool,
            u8::from(p.stale)
        );
    }

    header(&mut out, "htas_pool_nodes", "Nodes per pool and lifecycle state.", "gauge");
    let mut by_state: BTreeMap<(&str, String), u32> = BTreeMap::new();
    for p in &profiles {
        *by_state.entry((p.pool.as_str(), p.lifecycle.to_string())).or_default() += 1;
    }
    for pool in snapshot.pools.keys() {
        for state in [Lifecycle::Active, Lifecycle::Draining, Lifecycle::Terminating] {
            by_state.entry((pool.as_str(), state.to_string())).or_default();
        }
    }
    for ((pool, state), count) in &by_state {
        let _ = writeln!(out, "htas_pool_nodes{{pool=\"{pool}\",state=\"{state}\"}} {count}");
    }

    header(&mut out, "htas_pending_tasks", "Tasks the packer could not place.", "gauge");
    for (pool, demand) in &snapshot.pending {
        let _ = writeln!(out, "htas_pending_tasks{{pool=\"{pool}\"}} {}", demand.tasks);
    }

    header(&mut out, "htas_scaling_intent_delta", "Node delta of the pool's outstanding scaling intent.", "gauge");
    for (pool, intent) in &snapshot.intents {
        let _ = writeln!(out, "htas_scaling_intent_delta{{pool=\"{pool}\"}} {}", intent.delta);
    }

    header(&mut out, "htas_placements", "Placement records held in the store.", "gauge");
    let _ = writeln!(out, "htas_placements {}", snapshot.placements.len());

    header(&mut out, "htas_alerts", "Operator alerts raised, by severity.", "gauge");
    let critical = alerts.iter().filter(|a| a.severity == Severity::Critical).count();
    let _ = writeln!(out, "htas_alerts{{severity=\"warning\"}} {}", alerts.len() - critical);
    let _ = writeln!(out, "htas_alerts{{severity=\"critical\"}} {critical}");

    out
}
