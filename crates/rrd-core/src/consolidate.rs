//! Update pipeline: raw samples → PDPs → CDPs
//!
//! A gauge sample reported at `t` holds for the interval since the previous
//! update. That interval is cut at every step boundary; each completed step
//! becomes one primary data point (PDP), the time-weighted mean of the known
//! seconds inside it. PDPs are then folded into every RRA:
//!
//! - AVERAGE rings accumulate `pdp_per_row` PDPs per CDP, aligned to absolute
//!   multiples of their resolution
//! - forecast families run the Holt-Winters model once per PDP and write one
//!   CDP to each member ring
//!
//! Steps that one sample covers entirely all get the same PDP, so they are
//! folded as a run: an update costs at most one lap of each ring no matter
//! how long the interval is.
//!
//! Nothing here touches the file: the caller receives the ring writes and
//! the mutated live state, and commits both.

use std::collections::HashSet;

use log::debug;

use crate::definition::{ArchiveDef, ConsolidationFn, Timestamp};
use crate::storage::{CdpPrep, LiveState, PdpPrep, SlotWrite};

/// One completed primary data point
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pdp {
    /// End of the step interval (a multiple of the step)
    pub end: Timestamp,
    /// NaN when unknown
    pub value: f64,
}

/// Ring writes and counters produced by one or more samples
#[derive(Debug, Clone, Default)]
pub struct UpdatePlan {
    pub writes: Vec<SlotWrite>,
    pub pdps: usize,
    pub failures: usize,
}

impl UpdatePlan {
    /// Keep only the last write to every ring slot
    pub fn compact(&mut self) {
        let mut seen = HashSet::new();
        let mut writes: Vec<SlotWrite> = self
            .writes
            .drain(..)
            .rev()
            .filter(|write| seen.insert((write.rra, write.row)))
            .collect();
        writes.reverse();
        self.writes = writes;
    }
}

impl PdpPrep {
    fn add(&mut self, seconds: u64, value: Option<f64>) {
        match value {
            Some(v) => {
                self.known_secs += seconds;
                self.weighted_sum += v * seconds as f64;
            }
            None => self.unknown_secs += seconds,
        }
    }

    fn finish(&mut self, heartbeat: u64) -> f64 {
        let value = if self.known_secs == 0 || self.unknown_secs > heartbeat {
            f64::NAN
        } else {
            self.weighted_sum / self.known_secs as f64
        };
        *self = Self::default();
        value
    }
}

impl CdpPrep {
    fn push(&mut self, value: f64) {
        if value.is_nan() {
            self.unknown += 1;
        } else {
            self.sum += value;
            self.known += 1;
        }
    }

    /// Mean of the known PDPs, NaN when the unknown share exceeds `xff`
    fn finish(&mut self, pdp_per_row: u32, xff: f64) -> f64 {
        let missing = pdp_per_row.saturating_sub(self.known + self.unknown);
        let unknown = self.unknown + missing;
        let value = if self.known == 0 || unknown as f64 / pdp_per_row as f64 > xff {
            f64::NAN
        } else {
            self.sum / self.known as f64
        };
        *self = Self::default();
        value
    }
}

/// Consecutive full-step PDPs that all carry the same value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PdpRun {
    /// End of the first step of the run
    pub first_end: Timestamp,
    pub count: u64,
    /// NaN when unknown
    pub value: f64,
}

/// PDPs completed by one sample
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Split {
    /// The step the previous update left open, now closed
    pub head: Option<Pdp>,
    /// Every step lying entirely inside the interval
    pub run: Option<PdpRun>,
}

/// Cut `(last_update, timestamp]` at step boundaries
///
/// `value` is `None` when the sample is unknown. An interval longer than
/// the heartbeat is unknown as a whole. The trailing partial step stays in
/// `prep` for the next update. Steps fully covered by the sample are
/// returned as one run, however many there are.
pub fn split_interval(
    step: u64,
    heartbeat: u64,
    last_update: Timestamp,
    timestamp: Timestamp,
    value: Option<f64>,
    prep: &mut PdpPrep,
) -> Split {
    let value = value.filter(|_| timestamp - last_update <= heartbeat);

    let first_boundary = (last_update / step + 1) * step;
    if first_boundary > timestamp {
        prep.add(timestamp - last_update, value);
        return Split::default();
    }

    prep.add(first_boundary - last_update, value);
    let head = Pdp {
        end: first_boundary,
        value: prep.finish(heartbeat),
    };

    let last_boundary = timestamp / step * step;
    let count = (last_boundary - first_boundary) / step;
    let run = (count > 0).then(|| {
        let mut full = PdpPrep::default();
        full.add(step, value);
        PdpRun {
            first_end: first_boundary + step,
            count,
            value: full.finish(heartbeat),
        }
    });

    if timestamp > last_boundary {
        prep.add(timestamp - last_boundary, value);
    }
    Split {
        head: Some(head),
        run,
    }
}

/// Push one PDP into an AVERAGE ring, writing the CDP it completes
fn fold_average(
    def: &ArchiveDef,
    state: &mut LiveState,
    idx: usize,
    pdp: Pdp,
    plan: &mut UpdatePlan,
) {
    let rra = &def.rras[idx];
    let rra_state = &mut state.rras[idx];
    rra_state.cdp.push(pdp.value);

    if pdp.end % def.resolution(idx) == 0 {
        let value = rra_state.cdp.finish(rra.pdp_per_row, rra.xff);
        rra_state.cursor = (rra_state.cursor + 1) % rra.rows;
        plan.writes.push(SlotWrite {
            rra: idx,
            row: rra_state.cursor,
            value,
        });
    }
}

/// Advance a ring cursor by `count` rows, writing `value` to the newest
/// `min(count, rows)` of them
fn fill_rows(
    def: &ArchiveDef,
    state: &mut LiveState,
    idx: usize,
    count: u64,
    value: f64,
    plan: &mut UpdatePlan,
) {
    let rows = def.rras[idx].rows as u64;
    let cursor = state.rras[idx].cursor as u64;
    for age in (count - count.min(rows))..count {
        plan.writes.push(SlotWrite {
            rra: idx,
            row: ((cursor + 1 + age) % rows) as u32,
            value,
        });
    }
    state.rras[idx].cursor = ((cursor + count) % rows) as u32;
}

/// Fold one PDP into every RRA
pub fn fold_pdp(def: &ArchiveDef, state: &mut LiveState, pdp: Pdp, plan: &mut UpdatePlan) {
    plan.pdps += 1;

    for (idx, rra) in def.rras.iter().enumerate() {
        if rra.cf == ConsolidationFn::Average {
            fold_average(def, state, idx, pdp, plan);
        }
    }

    for (family_idx, family) in def.forecasts.iter().enumerate() {
        let out = state.forecasts[family_idx].observe(pdp.value, &family.params);
        if out.failure == 1.0 {
            debug!("Failure flagged at {} (prediction {:.3})", pdp.end, out.prediction);
            plan.failures += 1;
        }

        for (offset, value) in out.as_family().into_iter().enumerate() {
            fill_rows(def, state, family.first_rra as usize + offset, 1, value, plan);
        }
    }
}

/// Fold a run of identical PDPs into every RRA
///
/// Work and ring writes are bounded by the ring sizes, not by the length of
/// the run: rows that a later PDP of the same run would overwrite are never
/// written.
pub fn fold_run(def: &ArchiveDef, state: &mut LiveState, run: PdpRun, plan: &mut UpdatePlan) {
    plan.pdps += run.count as usize;
    let step = def.step;

    for (idx, rra) in def.rras.iter().enumerate() {
        if rra.cf != ConsolidationFn::Average {
            continue;
        }
        let resolution = def.resolution(idx);
        let pdp_per_row = rra.pdp_per_row as u64;
        let mut end = run.first_end;
        let mut left = run.count;

        // Close the CDP that is already open
        while left > 0 && (end - step) % resolution != 0 {
            fold_average(def, state, idx, Pdp { end, value: run.value }, plan);
            end += step;
            left -= 1;
        }

        let full = left / pdp_per_row;
        if full > 0 {
            let mut cdp = CdpPrep::default();
            for _ in 0..pdp_per_row {
                cdp.push(run.value);
            }
            let value = cdp.finish(rra.pdp_per_row, rra.xff);
            fill_rows(def, state, idx, full, value, plan);
            end += full * resolution;
            left -= full * pdp_per_row;
        }

        // Start of the next CDP
        for _ in 0..left {
            fold_average(def, state, idx, Pdp { end, value: run.value }, plan);
            end += step;
        }
    }

    for (family_idx, family) in def.forecasts.iter().enumerate() {
        let first = family.first_rra as usize;
        let members = first..first + ConsolidationFn::FORECAST_FAMILY.len();
        let longest = members
            .clone()
            .map(|idx| def.rras[idx].rows as u64)
            .max()
            .unwrap_or(0);
        let replayed = run.count.min(longest);
        let skipped = run.count - replayed;

        let forecast = &mut state.forecasts[family_idx];
        let failures = forecast.advance(skipped, run.value, &family.params);
        if failures > 0 {
            debug!("{} failures flagged before {}", failures, run.first_end + skipped * step);
            plan.failures += failures;
        }
        for idx in members.clone() {
            let rows = def.rras[idx].rows;
            let cursor = state.rras[idx].cursor as u64;
            state.rras[idx].cursor = ((cursor + skipped) % rows as u64) as u32;
        }

        for i in 0..replayed {
            let end = run.first_end + (skipped + i) * step;
            let out = state.forecasts[family_idx].observe(run.value, &family.params);
            if out.failure == 1.0 {
                debug!("Failure flagged at {} (prediction {:.3})", end, out.prediction);
                plan.failures += 1;
            }

            let remaining = replayed - i;
            for (idx, value) in members.clone().zip(out.as_family()) {
                if remaining <= def.rras[idx].rows as u64 {
                    fill_rows(def, state, idx, 1, value, plan);
                } else {
                    let rows = def.rras[idx].rows;
                    state.rras[idx].cursor = (state.rras[idx].cursor + 1) % rows;
                }
            }
        }
    }
}

/// Apply one sample to `state`, appending the resulting ring writes to `plan`
///
/// The caller guarantees `timestamp > state.last_update`.
pub fn apply_sample(
    def: &ArchiveDef,
    state: &mut LiveState,
    timestamp: Timestamp,
    value: Option<f64>,
    plan: &mut UpdatePlan,
) {
    let split = split_interval(
        def.step,
        def.source.heartbeat,
        state.last_update,
        timestamp,
        value,
        &mut state.pdp,
    );
    if let Some(pdp) = split.head {
        fold_pdp(def, state, pdp, plan);
    }
    if let Some(run) = split.run {
        fold_run(def, state, run, plan);
    }
    state.last_update = timestamp;
}
