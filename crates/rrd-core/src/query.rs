//! Reading series back out of the rings
//!
//! Every CDP is identified by the end of the interval it covers. The most
//! recent CDP of a ring ends at the last resolution boundary reached by the
//! latest update; older ones follow at multiples of the resolution, back to
//! `rows - 1` CDPs ago or the first boundary after creation, whichever is
//! later.

use crate::definition::{ArchiveDef, ConsolidationFn, Timestamp};
use crate::error::RrdError;
use crate::storage::{LiveState, Ring};

/// Which ring a fetch reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeriesSelector {
    pub cf: ConsolidationFn,
    /// Explicit RRA index; the finest ring with `cf` when `None`
    pub rra: Option<usize>,
}

impl SeriesSelector {
    /// Finest-resolution ring using `cf`
    pub fn finest(cf: ConsolidationFn) -> Self {
        Self { cf, rra: None }
    }

    /// The ring at `rra`, which must use `cf`
    pub fn at(cf: ConsolidationFn, rra: usize) -> Self {
        Self { cf, rra: Some(rra) }
    }
}

/// CDPs of one ring, oldest first
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    pub rra: usize,
    pub cf: ConsolidationFn,
    /// Seconds covered by each point
    pub resolution: u64,
    /// `(interval end, value)`; NaN when unknown
    pub points: Vec<(Timestamp, f64)>,
}

impl FetchResult {
    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.points.iter().map(|(_, value)| *value)
    }
}

/// Window and confidence band width for [`graph`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GraphRequest {
    pub start: Timestamp,
    pub end: Timestamp,
    /// Band half-width in deviations
    pub ro: f64,
}

/// Series aligned on the archive step grid, ready for a renderer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphSeries {
    pub step: u64,
    pub timestamps: Vec<Timestamp>,
    pub average: Vec<f64>,
    pub prediction: Vec<f64>,
    pub deviation: Vec<f64>,
    /// prediction + ro × deviation
    pub upper: Vec<f64>,
    /// prediction - ro × deviation
    pub lower: Vec<f64>,
    /// 1.0 where a failure was flagged
    pub failures: Vec<f64>,
}

impl GraphSeries {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Grid points where a failure was flagged
    pub fn failure_times(&self) -> impl Iterator<Item = Timestamp> + '_ {
        self.timestamps
            .iter()
            .zip(&self.failures)
            .filter(|(_, flag)| **flag == 1.0)
            .map(|(t, _)| *t)
    }
}

/// First multiple of `resolution` at or after `t`, `None` past `u64::MAX`
fn align_up(t: Timestamp, resolution: u64) -> Option<Timestamp> {
    t.div_ceil(resolution).checked_mul(resolution)
}

/// Time-addressed read access to one ring
struct RingView<'a> {
    ring: &'a Ring,
    cursor: u32,
    resolution: u64,
    oldest: Timestamp,
    latest: Timestamp,
}

impl<'a> RingView<'a> {
    fn new(def: &ArchiveDef, state: &LiveState, rings: &'a [Ring], rra: usize) -> Self {
        let resolution = def.resolution(rra);
        let ring = &rings[rra];
        let latest = state.last_update / resolution * resolution;
        let first = (def.start / resolution + 1) * resolution;
        let retained = latest.saturating_sub((ring.rows() as u64 - 1) * resolution);

        Self {
            ring,
            cursor: state.rras[rra].cursor,
            resolution,
            oldest: retained.max(first),
            latest,
        }
    }

    fn is_empty(&self) -> bool {
        self.oldest > self.latest
    }

    /// Value of the CDP ending at `t`, which must be a retained boundary
    fn at(&self, t: Timestamp) -> f64 {
        let age = (self.latest - t) / self.resolution;
        self.ring.get(self.ring.row_at_age(self.cursor, age as u32))
    }

    /// Value of the CDP whose interval contains `t`, NaN outside retention
    fn covering(&self, t: Timestamp) -> f64 {
        match align_up(t, self.resolution) {
            Some(end) if !self.is_empty() && end >= self.oldest && end <= self.latest => {
                self.at(end)
            }
            _ => f64::NAN,
        }
    }
}

fn resolve(def: &ArchiveDef, selector: SeriesSelector) -> Result<usize, RrdError> {
    match selector.rra {
        Some(idx) => match def.rras.get(idx) {
            Some(rra) if rra.cf == selector.cf => Ok(idx),
            Some(rra) => Err(RrdError::invalid(format!(
                "RRA #{idx} is {}, not {}",
                rra.cf, selector.cf
            ))),
            None => Err(RrdError::invalid(format!("RRA index {idx} out of range"))),
        },
        None => def
            .finest(selector.cf)
            .ok_or_else(|| RrdError::invalid(format!("archive has no {} RRA", selector.cf))),
    }
}

/// Retained CDPs of the selected ring ending within `[start, end]`
pub(crate) fn fetch(
    def: &ArchiveDef,
    state: &LiveState,
    rings: &[Ring],
    start: Timestamp,
    end: Timestamp,
    selector: SeriesSelector,
) -> Result<FetchResult, RrdError> {
    if end < start {
        return Err(RrdError::invalid(format!(
            "window end {end} precedes start {start}"
        )));
    }
    let rra = resolve(def, selector)?;
    let view = RingView::new(def, state, rings, rra);

    let mut points = Vec::new();
    let first = align_up(start.max(view.oldest), view.resolution);
    if let Some(mut t) = first.filter(|_| !view.is_empty()) {
        let last = end.min(view.latest);
        while t <= last {
            points.push((t, view.at(t)));
            match t.checked_add(view.resolution) {
                Some(next) => t = next,
                None => break,
            }
        }
    }

    Ok(FetchResult {
        rra,
        cf: selector.cf,
        resolution: view.resolution,
        points,
    })
}

/// Average, prediction, deviation, band and failures over `[start, end]`
///
/// The prediction side reads the first forecast family; an archive without
/// one yields all-NaN forecast series.
pub(crate) fn graph(
    def: &ArchiveDef,
    state: &LiveState,
    rings: &[Ring],
    request: &GraphRequest,
) -> Result<GraphSeries, RrdError> {
    if request.end < request.start {
        return Err(RrdError::invalid(format!(
            "window end {} precedes start {}",
            request.end, request.start
        )));
    }
    if !(request.ro >= 0.0 && request.ro.is_finite()) {
        return Err(RrdError::invalid(format!(
            "band width must be a non-negative number, got {}",
            request.ro
        )));
    }

    let view = move |cf: ConsolidationFn| {
        let rra = match cf {
            ConsolidationFn::Average => def.finest(cf),
            _ => def.forecasts.first().and_then(|family| family.member(cf)),
        };
        rra.map(|rra| RingView::new(def, state, rings, rra))
    };
    let read = |view: &Option<RingView<'_>>, t: Timestamp| {
        view.as_ref().map_or(f64::NAN, |view| view.covering(t))
    };

    let average = view(ConsolidationFn::Average);
    let prediction = view(ConsolidationFn::HwPredict);
    let deviation = view(ConsolidationFn::DevPredict);
    let failures = view(ConsolidationFn::Failures);

    let mut series = GraphSeries {
        step: def.step,
        ..GraphSeries::default()
    };
    let mut next = align_up(request.start, def.step);
    while let Some(t) = next.filter(|t| *t <= request.end) {
        let p = read(&prediction, t);
        let d = read(&deviation, t);

        series.timestamps.push(t);
        series.average.push(read(&average, t));
        series.prediction.push(p);
        series.deviation.push(d);
        // NaN propagates through both bounds
        series.upper.push(p + request.ro * d);
        series.lower.push(p - request.ro * d);
        series.failures.push(read(&failures, t));
        next = t.checked_add(def.step);
    }

    Ok(series)
}
