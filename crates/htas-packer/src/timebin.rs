//! Time-bin extended best-fit-decreasing for batch jobs.
//!
//! The horizon is cut into fixed-width bins starting at the pass time. A
//! job of estimated runtime `r` occupies `ceil(r / width)` consecutive bins
//! (at least one, at most the whole horizon) on one node.
//!
//! ```text
//!   bin:      0      1      2      3      4   ...
//!   node a  [####] [####] [    ] [    ] [    ]
//!   node b  [##  ] [    ] [    ] [    ] [    ]
//!            ^ now
//! ```
//!
//! A bin's free capacity is the node's effective availability plus the
//! requests of batch work expected to finish at or before the bin starts.
//! Bin 0 is never credited with finishing work, so an immediate bind can
//! only consume capacity that is free right now.

use htas_core::Resources;

use crate::task::PendingTask;

/// Bin geometry for one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinLayout {
    pub start: u64,
    pub width: u64,
    pub count: usize,
}

impl BinLayout {
    pub fn new(now: u64, width_secs: u64, horizon_secs: u64) -> Self {
        let width = width_secs.max(1);
        Self {
            start: now,
            width,
            count: horizon_secs.div_ceil(width).max(1) as usize,
        }
    }

    pub fn bin_start(&self, bin: usize) -> u64 {
        self.start + bin as u64 * self.width
    }

    /// Bins a job of `runtime_secs` occupies, clamped to the horizon.
    pub fn bins_for(&self, runtime_secs: u64) -> usize {
        (runtime_secs.div_ceil(self.width).max(1) as usize).min(self.count)
    }
}

/// Free capacity of one node across the horizon.
#[derive(Debug, Clone, PartialEq)]
pub struct Timeline {
    pub node: String,
    capacity: Resources,
    free: Vec<Resources>,
}

impl Timeline {
    /// `base` is the node's effective availability now; `ending` lists
    /// `(request, expected_end)` of batch work currently on the node.
    pub fn new(
        node: impl Into<String>,
        capacity: Resources,
        base: Resources,
        layout: &BinLayout,
        ending: impl IntoIterator<Item = (Resources, u64)>,
    ) -> Self {
        let mut free = vec![base.min(capacity); layout.count];
        for (request, end) in ending {
            // Overdue work is assumed to finish by the next bin.
            let first = if end <= layout.start {
                1
            } else {
                (end - layout.start).div_ceil(layout.width) as usize
            };
            for slot in free.iter_mut().skip(first.max(1)) {
                *slot = (*slot + request).min(capacity);
            }
        }
        Self {
            node: node.into(),
            capacity,
            free,
        }
    }

    pub fn free(&self, bin: usize) -> Resources {
        self.free.get(bin).copied().unwrap_or(Resources::ZERO)
    }

    /// Earliest start bin where `request` fits in each of `bins` bins.
    pub fn earliest_start(&self, request: Resources, bins: usize) -> Option<usize> {
        if bins == 0 || bins > self.free.len() {
            return None;
        }
        (0..=self.free.len() - bins).find(|&s| self.free[s..s + bins].iter().all(|f| request.fits_within(f)))
    }

    /// Bins in `[start, start + bins)` that hold no work yet.
    pub fn newly_touched(&self, start: usize, bins: usize) -> usize {
        self.free[start..start + bins]
            .iter()
            .filter(|f| **f == self.capacity)
            .count()
    }

    /// Leftover of the busiest bin in the range after adding `request`.
    pub fn busiest_leftover(&self, start: usize, bins: usize, request: Resources) -> Resources {
        self.free[start..start + bins]
            .iter()
            .map(|f| f.saturating_sub(request))
            .min_by_key(|r| r.fit_key())
            .unwrap_or(Resources::ZERO)
    }

    pub fn reserve(&mut self, start: usize, bins: usize, request: Resources) {
        for slot in &mut self.free[start..start + bins] {
            *slot = slot.saturating_sub(request);
        }
    }
}

/// A batch job's chosen node and start bin.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchChoice {
    pub task: PendingTask,
    pub node: String,
    pub start_bin: usize,
}

/// Place batch `tasks` onto `timelines` (in node-name order).
///
/// Among feasible `(node, earliest start)` pairs the winner minimizes,
/// in order: bins newly touched, leftover in the busiest occupied bin
/// (cpu then memory), start bin, node name.
pub fn pack_batch(
    tasks: &[PendingTask],
    timelines: &mut [Timeline],
    layout: &BinLayout,
) -> (Vec<BatchChoice>, Vec<PendingTask>) {
    let mut ordered: Vec<&PendingTask> = tasks.iter().collect();
    ordered.sort_by_key(|t| t.decreasing_key());

    let mut chosen = Vec::new();
    let mut unplaced = Vec::new();
    for task in ordered {
        let bins = layout.bins_for(task.runtime_secs.unwrap_or(0));
        let best = timelines
            .iter()
            .enumerate()
            .filter_map(|(i, tl)| {
                let start = tl.earliest_start(task.requests, bins)?;
                let key = (
                    tl.newly_touched(start, bins),
                    tl.busiest_leftover(start, bins, task.requests).fit_key(),
                    start,
                    tl.node.as_str(),
                );
                Some((key, i))
            })
            .min();
        match best {
            Some(((_, _, start, _), i)) => {
                let tl = &mut timelines[i];
                tl.reserve(start, bins, task.requests);
                chosen.push(BatchChoice {
                    task: task.clone(),
                    node: tl.node.clone(),
                    start_bin: start,
                });
            }
            None => unplaced.push(task.clone()),
        }
    }
    (chosen, unplaced)
}
