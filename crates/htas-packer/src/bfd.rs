//! Best-fit-decreasing for long-running services.
//!
//! Tasks are taken largest first (cpu, then memory, then submission
//! order) and each goes to the candidate node that leaves the least
//! capacity behind: cpu leftover first, memory leftover second, node name
//! last. Identical inputs therefore always produce identical placements.

use std::collections::BTreeMap;

use htas_core::Resources;

use crate::task::PendingTask;

/// Pick the node that fits `request` most tightly.
///
/// Ties on leftover capacity go to the lexicographically smallest name.
pub fn best_fit<'a, I>(candidates: I, request: Resources) -> Option<&'a str>
where
    I: IntoIterator<Item = (&'a str, Resources)>,
{
    candidates
        .into_iter()
        .filter_map(|(name, available)| {
            available
                .checked_sub(request)
                .map(|leftover| (leftover.fit_key(), name))
        })
        .min()
        .map(|(_, name)| name)
}

/// Place `tasks` onto `available`, debiting each chosen node.
///
/// Returns `(task, node)` pairs in placement order and the tasks that fit
/// nowhere.
pub fn pack_long_running(
    tasks: &[PendingTask],
    available: &mut BTreeMap<String, Resources>,
) -> (Vec<(PendingTask, String)>, Vec<PendingTask>) {
    let mut ordered: Vec<&PendingTask> = tasks.iter().collect();
    ordered.sort_by_key(|t| t.decreasing_key());

    let mut placed = Vec::new();
    let mut unplaced = Vec::new();
    for task in ordered {
        let chosen = best_fit(
            available.iter().map(|(name, free)| (name.as_str(), *free)),
            task.requests,
        )
        .map(str::to_string);
        match chosen {
            Some(node) => {
                if let Some(free) = available.get_mut(&node) {
                    *free = free.saturating_sub(task.requests);
                }
                placed.push((task.clone(), node));
            }
            None => unplaced.push(task.clone()),
        }
    }
    (placed, unplaced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use htas_core::WorkloadKind;

    fn task(id: &str, cpu: u64, mem: u64, seq: u64) -> PendingTask {
        PendingTask {
            pod_id: id.to_string(),
            requests: Resources::new(cpu, mem),
            kind: WorkloadKind::LongRunning,
            runtime_secs: None,
            arrival: seq,
            seq,
            pool: None,
        }
    }

    fn nodes(entries: &[(&str, u64, u64)]) -> BTreeMap<String, Resources> {
        entries
            .iter()
            .map(|(n, c, m)| (n.to_string(), Resources::new(*c, *m)))
            .collect()
    }

    #[test]
    fn best_fit_minimizes_leftover_cpu_first() {
        let candidates = vec![
            ("a", Resources::new(4000, 1024)),
            ("b", Resources::new(1500, 8192)),
            ("c", Resources::new(1000, 512)),
        ];
        assert_eq!(best_fit(candidates.clone(), Resources::new(1000, 256)), Some("c"));
        assert_eq!(best_fit(candidates.clone(), Resources::new(1200, 1024)), Some("b"));
        assert_eq!(best_fit(candidates, Resources::new(5000, 1)), None);
    }

    #[test]
    fn best_fit_breaks_ties_by_name() {
        let candidates = vec![("z", Resources::new(1000, 1000)), ("m", Resources::new(1000, 1000))];
        assert_eq!(best_fit(candidates, Resources::new(500, 500)), Some("m"));
    }

    #[test]
    fn packs_largest_first() {
        let mut available = nodes(&[("a", 2000, 4096), ("b", 3000, 4096)]);
        let tasks = vec![task("small", 500, 512, 0), task("big", 2500, 1024, 1), task("mid", 1500, 512, 2)];
        let (placed, unplaced) = pack_long_running(&tasks, &mut available);
        let got: Vec<_> = placed.iter().map(|(t, n)| (t.pod_id.as_str(), n.as_str())).collect();
        assert_eq!(got, vec![("big", "b"), ("mid", "a"), ("small", "b")]);
        assert!(unplaced.is_empty());
        assert_eq!(available["a"], Resources::new(500, 3584));
        assert_eq!(available["b"], Resources::new(0, 2560));
    }

    #[test]
    fn equal_requests_keep_submission_order() {
        let mut available = nodes(&[("a", 1000, 1024)]);
        let tasks = vec![task("second", 1000, 512, 1), task("first", 1000, 512, 0)];
        let (placed, unplaced) = pack_long_running(&tasks, &mut available);
        assert_eq!(placed[0].0.pod_id, "first");
        assert_eq!(unplaced[0].pod_id, "second");
    }

    #[test]
    fn never_overcommits() {
        let mut available = nodes(&[("a", 1000, 1000), ("b", 1200, 900)]);
        let tasks: Vec<_> = (0..10).map(|i| task(&format!("t{i}"), 300 + i * 37, 200 + i * 53, i)).collect();
        let before = available.clone();
        let (placed, _) = pack_long_running(&tasks, &mut available);
        for (node, cap) in &before {
            let used: Resources = placed.iter().filter(|(_, n)| n == node).map(|(t, _)| t.requests).sum();
            assert!(used.fits_within(cap), "{node} overcommitted: {used} > {cap}");
        }
    }

    #[test]
    fn deterministic_across_runs() {
        let tasks: Vec<_> = (0..12).map(|i| task(&format!("t{i}"), 250 * (i % 4 + 1), 128 * (i % 3 + 1), i)).collect();
        let run = || {
            let mut available = nodes(&[("a", 2000, 2048), ("b", 2000, 2048), ("c", 1000, 4096)]);
            pack_long_running(&tasks, &mut available)
        };
        assert_eq!(run(), run());
    }
}
