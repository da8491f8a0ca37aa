//! Holt-Winters forecasting with failure detection
//!
//! Each forecast family keeps one [`ForecastState`]. The state starts in
//! [`Phase::Seeding`], collecting one full season of PDPs to initialize the
//! baseline and the seasonal coefficients, then switches to
//! [`Phase::Running`] where every PDP produces a one-step-ahead prediction,
//! a smoothed absolute deviation and a failure flag.
//!
//! ## Running update
//!
//! For a value `v` at seasonal slot `s`:
//!
//! ```text
//! p            = baseline + slope + seasonal[s]
//! e            = v - p
//! baseline'    = α·(v - seasonal[s]) + (1-α)·(baseline + slope)
//! slope'       = β·(baseline' - baseline) + (1-β)·slope
//! seasonal'[s] = γ·(v - baseline') + (1-γ)·seasonal[s]
//! deviation'   = γd·|e| + (1-γd)·deviation
//! ```
//!
//! A violation is `e > δ+·deviation'` or `-e > δ-·deviation'`. Violations go
//! into a sliding window and a failure is raised when the window holds at
//! least `failure_threshold` of them.

use heapless::Deque;
use log::debug;

use crate::definition::{HwParams, MAX_FAILURE_WINDOW};

/// Relative size of a residue treated as floating point noise
const NOISE_FLOOR: f64 = 1e-9;

/// Lifecycle of a forecast family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Collecting the first season, no predictions yet
    Seeding,
    /// Predicting and updating every PDP
    Running,
}

/// Sliding window of recent violation flags
#[derive(Debug, Clone)]
pub struct FailureWindow {
    flags: Deque<bool, MAX_FAILURE_WINDOW>,
}

impl Default for FailureWindow {
    fn default() -> Self {
        Self {
            flags: Deque::new(),
        }
    }
}

impl FailureWindow {
    /// Push a flag, dropping the oldest ones beyond `window_length`
    pub fn push(&mut self, violation: bool, window_length: u8) {
        let len = (window_length as usize).clamp(1, MAX_FAILURE_WINDOW);
        while self.flags.len() >= len {
            self.flags.pop_front();
        }
        let pushed = self.flags.push_back(violation);
        debug_assert!(pushed.is_ok(), "room was made above");
    }

    /// Keep only the newest `window_length` flags
    pub fn truncate(&mut self, window_length: u8) {
        while self.flags.len() > window_length as usize {
            self.flags.pop_front();
        }
    }

    pub fn violations(&self) -> usize {
        self.flags.iter().filter(|flag| **flag).count()
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    pub fn clear(&mut self) {
        self.flags.clear();
    }

    /// Flags oldest first
    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        self.flags.iter().copied()
    }

    pub(crate) fn from_flags(flags: impl IntoIterator<Item = bool>) -> Self {
        let mut window = Self::default();
        for flag in flags {
            window.push(flag, MAX_FAILURE_WINDOW as u8);
        }
        window
    }
}

/// Values written to the family rings for one PDP (NaN = unknown)
#[derive(Debug, Clone, Copy)]
pub struct ForecastOutput {
    pub prediction: f64,
    pub seasonal: f64,
    pub seasonal_deviation: f64,
    pub deviation: f64,
    pub failure: f64,
}

impl ForecastOutput {
    const fn unknown() -> Self {
        Self {
            prediction: f64::NAN,
            seasonal: f64::NAN,
            seasonal_deviation: f64::NAN,
            deviation: f64::NAN,
            failure: f64::NAN,
        }
    }

    /// In ring order: HWPREDICT, SEASONAL, DEVSEASONAL, DEVPREDICT, FAILURES
    pub fn as_family(&self) -> [f64; 5] {
        [
            self.prediction,
            self.seasonal,
            self.seasonal_deviation,
            self.deviation,
            self.failure,
        ]
    }
}

/// Hidden Holt-Winters state of one forecast family
#[derive(Debug, Clone)]
pub struct ForecastState {
    pub phase: Phase,
    /// Seasonal slot of the next PDP
    pub slot: u32,
    /// PDPs seen in the current seed window
    pub seeded: u32,
    pub baseline: f64,
    pub slope: f64,
    /// Smoothed absolute prediction error
    pub deviation: f64,
    pub seasonal: Vec<f64>,
    pub seasonal_deviation: Vec<f64>,
    /// First-season values by slot, NaN where unknown
    pub seed: Vec<f64>,
    pub window: FailureWindow,
}

impl ForecastState {
    pub fn new(season_period: u32) -> Self {
        let season = season_period as usize;
        Self {
            phase: Phase::Seeding,
            slot: 0,
            seeded: 0,
            baseline: 0.0,
            slope: 0.0,
            deviation: 0.0,
            seasonal: vec![0.0; season],
            seasonal_deviation: vec![0.0; season],
            seed: vec![f64::NAN; season],
            window: FailureWindow::default(),
        }
    }

    pub fn season_period(&self) -> usize {
        self.seasonal.len()
    }

    /// Go back to seeding; the seasonal slot keeps advancing with time
    pub fn reset(&mut self) {
        let slot = self.slot;
        *self = Self::new(self.season_period() as u32);
        self.slot = slot;
    }

    /// Feed one PDP value (NaN when unknown)
    pub fn observe(&mut self, value: f64, params: &HwParams) -> ForecastOutput {
        let season = self.season_period();
        let slot = self.slot as usize % season;
        self.slot = ((slot + 1) % season) as u32;

        match self.phase {
            Phase::Seeding => self.seed_slot(slot, value),
            Phase::Running => self.run_slot(slot, value, params),
        }
    }

    /// Feed `count` PDPs of the same value, discarding the ring outputs
    ///
    /// Returns how many of them raised a failure. Known values are replayed
    /// one by one. A run of unknown values only moves the slot once the
    /// model has settled: after one season every seed window has been
    /// closed, and after [`MAX_FAILURE_WINDOW`] more PDPs the window holds
    /// nothing but non-violations.
    pub fn advance(&mut self, count: u64, value: f64, params: &HwParams) -> usize {
        let settle = if value.is_nan() {
            (self.season_period() + MAX_FAILURE_WINDOW) as u64
        } else {
            count
        };
        let replayed = count.min(settle);

        let mut failures = 0;
        for _ in 0..replayed {
            if self.observe(value, params).failure == 1.0 {
                failures += 1;
            }
        }

        let left = count - replayed;
        if left > 0 {
            let season = self.season_period() as u64;
            self.slot = ((self.slot as u64 + left) % season) as u32;
            if self.phase == Phase::Seeding {
                self.seeded = ((self.seeded as u64 + left) % season) as u32;
            }
        }
        failures
    }

    fn seed_slot(&mut self, slot: usize, value: f64) -> ForecastOutput {
        self.seed[slot] = value;
        self.seeded += 1;
        if self.seeded as usize >= self.season_period() {
            self.finish_seed();
        }
        ForecastOutput::unknown()
    }

    fn finish_seed(&mut self) {
        self.seeded = 0;

        let known: Vec<f64> = self.seed.iter().copied().filter(|v| !v.is_nan()).collect();
        if known.is_empty() {
            debug!("Seed season held no known values, seeding again");
            self.seed.fill(f64::NAN);
            return;
        }

        let mean = known.iter().sum::<f64>() / known.len() as f64;
        self.baseline = mean;
        self.slope = 0.0;
        self.deviation = 0.0;
        for (coefficient, value) in self.seasonal.iter_mut().zip(&self.seed) {
            *coefficient = if value.is_nan() { 0.0 } else { value - mean };
        }
        self.seasonal_deviation.fill(0.0);
        self.seed.fill(f64::NAN);
        self.window.clear();
        self.phase = Phase::Running;

        debug!(
            "Seeding finished: baseline {:.3} from {} known values",
            mean,
            known.len()
        );
    }

    fn run_slot(&mut self, slot: usize, value: f64, params: &HwParams) -> ForecastOutput {
        let prediction = self.baseline + self.slope + self.seasonal[slot];

        if value.is_nan() {
            // State holds across gaps
            self.window.push(false, params.window_length);
            return ForecastOutput {
                prediction,
                seasonal: self.seasonal[slot],
                seasonal_deviation: self.seasonal_deviation[slot],
                deviation: self.deviation,
                failure: self.failure_flag(params),
            };
        }

        let error = value - prediction;
        let magnitude = error.abs();

        let baseline = params.alpha * (value - self.seasonal[slot])
            + (1.0 - params.alpha) * (self.baseline + self.slope);
        self.slope = params.beta * (baseline - self.baseline) + (1.0 - params.beta) * self.slope;
        self.baseline = baseline;
        self.seasonal[slot] =
            params.gamma * (value - baseline) + (1.0 - params.gamma) * self.seasonal[slot];

        let gd = params.gamma_deviation;
        self.deviation = gd * magnitude + (1.0 - gd) * self.deviation;
        self.seasonal_deviation[slot] = gd * magnitude + (1.0 - gd) * self.seasonal_deviation[slot];

        let noise = NOISE_FLOOR * prediction.abs().max(1.0);
        let violation = magnitude > noise
            && (error > params.delta_pos * self.deviation
                || -error > params.delta_neg * self.deviation);
        self.window.push(violation, params.window_length);

        ForecastOutput {
            prediction,
            seasonal: self.seasonal[slot],
            seasonal_deviation: self.seasonal_deviation[slot],
            deviation: self.deviation,
            failure: self.failure_flag(params),
        }
    }

    fn failure_flag(&self, params: &HwParams) -> f64 {
        if self.window.violations() >= params.failure_threshold as usize {
            1.0
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEASON: [f64; 4] = [20.0, 22.0, 24.0, 22.0];

    fn params() -> HwParams {
        HwParams {
            alpha: 0.5,
            beta: 0.1,
            gamma: 0.3,
            gamma_deviation: 0.3,
            delta_pos: 2.0,
            delta_neg: 2.0,
            failure_threshold: 1,
            window_length: 1,
        }
    }

    #[test]
    fn test_seeding_initializes_baseline_and_seasonal() {
        let mut state = ForecastState::new(4);
        for value in SEASON {
            let out = state.observe(value, &params());
            assert!(out.prediction.is_nan());
            assert!(out.failure.is_nan());
        }

        assert_eq!(state.phase, Phase::Running);
        assert_eq!(state.baseline, 22.0);
        assert_eq!(state.slope, 0.0);
        assert_eq!(state.seasonal, vec![-2.0, 0.0, 2.0, 0.0]);
    }

    #[test]
    fn test_periodic_signal_converges() {
        let mut state = ForecastState::new(4);
        let mut last_error = f64::MAX;
        for cycle in 0..8 {
            for value in SEASON {
                let out = state.observe(value, &params());
                if cycle > 0 {
                    last_error = (out.prediction - value).abs();
                    assert_eq!(out.failure, 0.0);
                }
            }
        }
        assert!(last_error < 1e-6, "error {last_error}");
    }

    #[test]
    fn test_outlier_raises_failure() {
        let mut state = ForecastState::new(4);
        for _ in 0..5 {
            for value in SEASON {
                state.observe(value, &params());
            }
        }

        let out = state.observe(40.0, &params());
        let error = 40.0 - out.prediction;
        assert!(error > 2.0 * out.deviation);
        assert_eq!(out.failure, 1.0);
    }

    #[test]
    fn test_unknown_values_hold_state() {
        let mut state = ForecastState::new(4);
        for value in SEASON {
            state.observe(value, &params());
        }
        let baseline = state.baseline;
        let seasonal = state.seasonal.clone();

        let out = state.observe(f64::NAN, &params());
        assert_eq!(out.prediction, 20.0);
        assert_eq!(out.failure, 0.0);
        assert_eq!(state.baseline, baseline);
        assert_eq!(state.seasonal, seasonal);
        assert_eq!(state.slot, 1);
    }

    #[test]
    fn test_seed_without_known_values_restarts() {
        let mut state = ForecastState::new(3);
        for _ in 0..3 {
            state.observe(f64::NAN, &params());
        }
        assert_eq!(state.phase, Phase::Seeding);
        assert_eq!(state.seeded, 0);
    }

    #[test]
    fn test_reset_keeps_slot() {
        let mut state = ForecastState::new(4);
        for value in SEASON {
            state.observe(value, &params());
        }
        state.observe(20.0, &params());
        state.reset();

        assert_eq!(state.phase, Phase::Seeding);
        assert_eq!(state.slot, 1);
        assert_eq!(state.baseline, 0.0);
    }

    fn assert_same_state(a: &ForecastState, b: &ForecastState) {
        assert_eq!(a.phase, b.phase);
        assert_eq!(a.slot, b.slot);
        assert_eq!(a.seeded, b.seeded);
        assert_eq!(a.baseline, b.baseline);
        assert_eq!(a.slope, b.slope);
        assert_eq!(a.deviation, b.deviation);
        assert_eq!(a.seasonal, b.seasonal);
        assert_eq!(a.window.iter().collect::<Vec<_>>(), b.window.iter().collect::<Vec<_>>());
    }

    #[test]
    fn test_advance_over_unknown_run_matches_replay() {
        for warmup in [0usize, 2, 4, 9] {
            let mut stepped = ForecastState::new(4);
            for value in SEASON.iter().cycle().take(warmup) {
                stepped.observe(*value, &params());
            }
            // Violation right before the gap
            stepped.observe(60.0, &params());
            let mut advanced = stepped.clone();

            let mut failures = 0;
            for _ in 0..1_003 {
                if stepped.observe(f64::NAN, &params()).failure == 1.0 {
                    failures += 1;
                }
            }
            assert_eq!(advanced.advance(1_003, f64::NAN, &params()), failures);
            assert_same_state(&stepped, &advanced);
        }
    }

    #[test]
    fn test_advance_over_known_run_matches_replay() {
        let mut stepped = ForecastState::new(4);
        let mut advanced = ForecastState::new(4);
        for _ in 0..10 {
            stepped.observe(21.0, &params());
        }
        advanced.advance(10, 21.0, &params());
        assert_same_state(&stepped, &advanced);
    }

    #[test]
    fn test_failure_window_threshold() {
        let mut window = FailureWindow::default();
        for flag in [true, false, true, true] {
            window.push(flag, 3);
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.violations(), 2);

        window.truncate(1);
        assert_eq!(window.iter().collect::<Vec<_>>(), vec![true]);
    }

    #[test]
    fn test_failure_window_stays_within_capacity() {
        let mut window = FailureWindow::default();
        for i in 0..40 {
            window.push(i >= 30, MAX_FAILURE_WINDOW as u8);
        }
        assert_eq!(window.len(), MAX_FAILURE_WINDOW);
        assert_eq!(window.violations(), 10);

        // Out-of-range lengths are clamped
        window.push(true, 200);
        assert_eq!(window.len(), MAX_FAILURE_WINDOW);
        window.push(true, 0);
        assert_eq!(window.len(), 1);
    }
}
