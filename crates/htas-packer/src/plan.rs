//! Per-pool placement plan.
//!
//! Long-running tasks are packed first; they hold their node for the whole
//! horizon, so batch timelines start from what they leave behind.

use std::collections::BTreeMap;

use htas_core::{Resources, WorkloadKind};
use htas_state::ClusterSnapshot;

use crate::bfd::pack_long_running;
use crate::task::PendingTask;
use crate::timebin::{BinLayout, Timeline, pack_batch};

/// One task's placement decision.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub task: PendingTask,
    pub node: String,
    /// 0 for immediate binds.
    pub start_bin: usize,
    /// Batch only: when the job is expected to finish if started as planned.
    pub expected_end: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolPlan {
    pub pool: String,
    /// Bind now.
    pub binds: Vec<Decision>,
    /// Batch jobs reserved in a later bin; they stay pending this pass.
    pub deferred: Vec<Decision>,
    /// Tasks that fit nowhere within the horizon.
    pub overflow: Vec<PendingTask>,
}

/// Plan placements for `tasks` on the schedulable nodes of `pool`.
///
/// Pure function of the snapshot, the tasks and the bin layout.
pub fn plan_pool(snapshot: &ClusterSnapshot, pool: &str, tasks: &[PendingTask], layout: &BinLayout) -> PoolPlan {
    let mut available: BTreeMap<String, Resources> = snapshot
        .schedulable_in(pool)
        .filter_map(|p| {
            snapshot
                .effective_available(&p.instance_name)
                .map(|free| (p.instance_name.clone(), free))
        })
        .collect();

    let (long_running, batch): (Vec<PendingTask>, Vec<PendingTask>) =
        tasks.iter().cloned().partition(|t| t.kind == WorkloadKind::LongRunning);

    let mut plan = PoolPlan {
        pool: pool.to_string(),
        ..Default::default()
    };

    let (placed, unplaced) = pack_long_running(&long_running, &mut available);
    plan.binds.extend(placed.into_iter().map(|(task, node)| Decision {
        task,
        node,
        start_bin: 0,
        expected_end: None,
    }));
    plan.overflow.extend(unplaced);

    let mut timelines: Vec<Timeline> = available
        .iter()
        .filter_map(|(node, free)| {
            let profile = snapshot.profile(node)?;
            let ending = snapshot
                .placements_on(node)
                .filter_map(|p| p.expected_end.map(|end| (p.resources, end)));
            Some(Timeline::new(node.clone(), profile.capacity(), *free, layout, ending))
        })
        .collect();

    let (chosen, unplaced) = pack_batch(&batch, &mut timelines, layout);
    for choice in chosen {
        let runtime = choice.task.runtime_secs.unwrap_or(0);
        let decision = Decision {
            expected_end: Some(layout.bin_start(choice.start_bin) + runtime),
            task: choice.task,
            node: choice.node,
            start_bin: choice.start_bin,
        };
        if decision.start_bin == 0 {
            plan.binds.push(decision);
        } else {
            plan.deferred.push(decision);
        }
    }
    plan.overflow.extend(unplaced);
    plan
}
