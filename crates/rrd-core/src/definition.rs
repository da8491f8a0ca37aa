//! Archive definition types
//!
//! An archive is defined once at creation: one gauge data source, a step
//! interval and an ordered list of round-robin archives (RRAs). The
//! definition is stored in the archive header and only the Holt-Winters
//! tuning parameters may change afterwards.

use core::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::error::RrdError;

/// Seconds since the Unix epoch
pub type Timestamp = u64;

/// Upper bound for the failure sliding window length
pub const MAX_FAILURE_WINDOW: usize = 28;

/// Number of RRAs created by a single HWPREDICT declaration
pub const FORECAST_FAMILY_LEN: usize = 5;

// ============================================================================
// Data source
// ============================================================================

/// How raw values are interpreted between updates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataSourceKind {
    /// The reported value holds for the whole interval since the last update
    Gauge,
}

/// The single numeric channel an archive records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    pub name: String,
    pub kind: DataSourceKind,
    /// Longest tolerated gap between updates, in seconds
    pub heartbeat: u64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl DataSource {
    /// Create an unbounded gauge
    pub fn gauge(name: impl Into<String>, heartbeat: u64) -> Self {
        Self {
            name: name.into(),
            kind: DataSourceKind::Gauge,
            heartbeat,
            min: None,
            max: None,
        }
    }

    /// Restrict the accepted value range
    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    /// Whether `value` is a known, in-range reading
    pub fn accepts(&self, value: f64) -> bool {
        !value.is_nan()
            && self.min.is_none_or(|min| value >= min)
            && self.max.is_none_or(|max| value <= max)
    }

    fn validate(&self) -> Result<(), RrdError> {
        if self.name.is_empty() || self.name.len() > 19 {
            return Err(RrdError::invalid(
                "data source name must be 1 to 19 characters",
            ));
        }
        if self.heartbeat == 0 {
            return Err(RrdError::invalid("heartbeat must be positive"));
        }
        if let (Some(min), Some(max)) = (self.min, self.max)
            && min >= max
        {
            return Err(RrdError::invalid(format!(
                "data source range [{min}, {max}] is empty"
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Consolidation functions
// ============================================================================

/// Aggregation rule applied when PDPs are folded into a CDP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsolidationFn {
    Average,
    HwPredict,
    Seasonal,
    DevSeasonal,
    DevPredict,
    Failures,
}

impl ConsolidationFn {
    /// Family members in storage order, starting with HWPREDICT
    pub const FORECAST_FAMILY: [ConsolidationFn; FORECAST_FAMILY_LEN] = [
        Self::HwPredict,
        Self::Seasonal,
        Self::DevSeasonal,
        Self::DevPredict,
        Self::Failures,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Average => "AVERAGE",
            Self::HwPredict => "HWPREDICT",
            Self::Seasonal => "SEASONAL",
            Self::DevSeasonal => "DEVSEASONAL",
            Self::DevPredict => "DEVPREDICT",
            Self::Failures => "FAILURES",
        }
    }

    /// Whether this function is driven by the Holt-Winters model
    pub const fn is_forecast(self) -> bool {
        !matches!(self, Self::Average)
    }

    /// Offset of this function inside a forecast family
    pub(crate) fn family_offset(self) -> Option<usize> {
        Self::FORECAST_FAMILY.iter().position(|cf| *cf == self)
    }
}

impl Display for ConsolidationFn {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Holt-Winters parameters
// ============================================================================

/// Tuning parameters shared by every member of a forecast family
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HwParams {
    /// Baseline smoothing
    pub alpha: f64,
    /// Slope smoothing
    pub beta: f64,
    /// Seasonal coefficient smoothing
    pub gamma: f64,
    /// Deviation smoothing
    pub gamma_deviation: f64,
    /// Multiplier for violations above the prediction
    pub delta_pos: f64,
    /// Multiplier for violations below the prediction
    pub delta_neg: f64,
    /// Violations within the window needed to raise a failure
    pub failure_threshold: u8,
    /// Sliding window length, at most [`MAX_FAILURE_WINDOW`]
    pub window_length: u8,
}

impl Default for HwParams {
    fn default() -> Self {
        Self {
            alpha: 0.1,
            beta: 0.0035,
            gamma: 0.1,
            gamma_deviation: 0.1,
            delta_pos: 2.0,
            delta_neg: 2.0,
            failure_threshold: 7,
            window_length: 9,
        }
    }
}

impl HwParams {
    pub fn validate(&self) -> Result<(), RrdError> {
        for (name, value) in [
            ("alpha", self.alpha),
            ("beta", self.beta),
            ("gamma", self.gamma),
            ("gamma_deviation", self.gamma_deviation),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(RrdError::invalid(format!(
                    "{name} must lie in [0, 1], got {value}"
                )));
            }
        }
        for (name, value) in [("delta_pos", self.delta_pos), ("delta_neg", self.delta_neg)] {
            if !(value >= 0.0 && value.is_finite()) {
                return Err(RrdError::invalid(format!(
                    "{name} must be a non-negative number, got {value}"
                )));
            }
        }
        let window = self.window_length as usize;
        if window == 0 || window > MAX_FAILURE_WINDOW {
            return Err(RrdError::invalid(format!(
                "window length must lie in 1..={MAX_FAILURE_WINDOW}, got {window}"
            )));
        }
        if self.failure_threshold == 0 || self.failure_threshold > self.window_length {
            return Err(RrdError::invalid(format!(
                "failure threshold must lie in 1..={window}, got {}",
                self.failure_threshold
            )));
        }
        Ok(())
    }
}

/// Partial update of [`HwParams`]; `None` keeps the stored value
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TuneRequest {
    pub alpha: Option<f64>,
    pub beta: Option<f64>,
    pub gamma: Option<f64>,
    pub gamma_deviation: Option<f64>,
    pub delta_pos: Option<f64>,
    pub delta_neg: Option<f64>,
    pub failure_threshold: Option<u8>,
    pub window_length: Option<u8>,
}

impl TuneRequest {
    /// Set both violation multipliers at once
    pub fn with_ro(mut self, ro: f64) -> Self {
        self.delta_pos = Some(ro);
        self.delta_neg = Some(ro);
        self
    }

    /// Apply the requested changes on top of `params`
    pub fn apply(&self, params: &HwParams) -> HwParams {
        HwParams {
            alpha: self.alpha.unwrap_or(params.alpha),
            beta: self.beta.unwrap_or(params.beta),
            gamma: self.gamma.unwrap_or(params.gamma),
            gamma_deviation: self.gamma_deviation.unwrap_or(params.gamma_deviation),
            delta_pos: self.delta_pos.unwrap_or(params.delta_pos),
            delta_neg: self.delta_neg.unwrap_or(params.delta_neg),
            failure_threshold: self.failure_threshold.unwrap_or(params.failure_threshold),
            window_length: self.window_length.unwrap_or(params.window_length),
        }
    }
}

// ============================================================================
// RRA specs and stored definitions
// ============================================================================

/// What a caller asks for when creating an archive
#[derive(Debug, Clone, PartialEq)]
pub enum RraSpec {
    /// Mean of `pdp_per_row` PDPs, unknown when the unknown share exceeds `xff`
    Average {
        xff: f64,
        pdp_per_row: u32,
        rows: u32,
    },
    /// HWPREDICT plus its SEASONAL, DEVSEASONAL, DEVPREDICT and FAILURES rings
    HwPredict {
        rows: u32,
        season_period: u32,
        params: HwParams,
    },
}

impl RraSpec {
    pub fn average(xff: f64, pdp_per_row: u32, rows: u32) -> Self {
        Self::Average {
            xff,
            pdp_per_row,
            rows,
        }
    }

    /// HWPREDICT with default deviation and failure settings
    pub fn hw_predict(rows: u32, alpha: f64, beta: f64, season_period: u32) -> Self {
        Self::HwPredict {
            rows,
            season_period,
            params: HwParams {
                alpha,
                beta,
                ..HwParams::default()
            },
        }
    }
}

/// Stored definition of one ring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RraDef {
    pub cf: ConsolidationFn,
    pub rows: u32,
    pub pdp_per_row: u32,
    pub xff: f64,
    /// Index into [`ArchiveDef::forecasts`] for forecast family members
    pub family: Option<u16>,
}

/// Stored definition of one forecast family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastDef {
    pub season_period: u32,
    pub params: HwParams,
    /// Index of the HWPREDICT ring; the other members follow in family order
    pub first_rra: u16,
}

impl ForecastDef {
    /// RRA index of the given family member
    pub fn member(&self, cf: ConsolidationFn) -> Option<usize> {
        cf.family_offset().map(|offset| self.first_rra as usize + offset)
    }
}

/// Everything fixed at creation time (tuning parameters aside)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveDef {
    pub start: Timestamp,
    pub step: u64,
    pub source: DataSource,
    pub rras: Vec<RraDef>,
    pub forecasts: Vec<ForecastDef>,
}

impl ArchiveDef {
    /// Validate the specs and expand forecast declarations into their families
    pub fn build(
        start: Timestamp,
        step: u64,
        source: DataSource,
        specs: &[RraSpec],
    ) -> Result<Self, RrdError> {
        if step == 0 {
            return Err(RrdError::invalid("step must be positive"));
        }
        if specs.is_empty() {
            return Err(RrdError::invalid("at least one RRA is required"));
        }
        source.validate()?;

        let mut rras = Vec::new();
        let mut forecasts = Vec::new();

        for spec in specs {
            match spec {
                RraSpec::Average {
                    xff,
                    pdp_per_row,
                    rows,
                } => {
                    if *rows == 0 || *pdp_per_row == 0 {
                        return Err(RrdError::invalid(format!(
                            "AVERAGE needs positive rows and PDPs per row, got {rows} and {pdp_per_row}"
                        )));
                    }
                    if !(0.0..1.0).contains(xff) {
                        return Err(RrdError::invalid(format!(
                            "xfiles factor must lie in [0, 1), got {xff}"
                        )));
                    }
                    rras.push(RraDef {
                        cf: ConsolidationFn::Average,
                        rows: *rows,
                        pdp_per_row: *pdp_per_row,
                        xff: *xff,
                        family: None,
                    });
                }
                RraSpec::HwPredict {
                    rows,
                    season_period,
                    params,
                } => {
                    if *rows == 0 || *season_period == 0 {
                        return Err(RrdError::invalid(format!(
                            "HWPREDICT needs positive rows and season period, got {rows} and {season_period}"
                        )));
                    }
                    params.validate()?;

                    let family = u16::try_from(forecasts.len())
                        .map_err(|_| RrdError::invalid("too many forecast families"))?;
                    let first_rra = u16::try_from(rras.len())
                        .map_err(|_| RrdError::invalid("too many RRAs"))?;

                    for cf in ConsolidationFn::FORECAST_FAMILY {
                        let member_rows = match cf {
                            ConsolidationFn::Seasonal | ConsolidationFn::DevSeasonal => {
                                *season_period
                            }
                            _ => *rows,
                        };
                        rras.push(RraDef {
                            cf,
                            rows: member_rows,
                            pdp_per_row: 1,
                            xff: 0.0,
                            family: Some(family),
                        });
                    }
                    forecasts.push(ForecastDef {
                        season_period: *season_period,
                        params: *params,
                        first_rra,
                    });
                }
            }
        }

        Ok(Self {
            start,
            step,
            source,
            rras,
            forecasts,
        })
    }

    /// Seconds covered by one CDP of the given RRA
    pub fn resolution(&self, rra: usize) -> u64 {
        self.step * self.rras[rra].pdp_per_row as u64
    }

    /// Forecast family that the RRA at `rra` belongs to
    pub fn family_of(&self, rra: usize) -> Result<usize, RrdError> {
        let def = self
            .rras
            .get(rra)
            .ok_or_else(|| RrdError::invalid(format!("RRA index {rra} out of range")))?;
        def.family
            .map(usize::from)
            .ok_or_else(|| RrdError::invalid(format!("RRA #{rra} ({}) has no forecast", def.cf)))
    }

    /// Finest-resolution RRA using `cf`
    pub fn finest(&self, cf: ConsolidationFn) -> Option<usize> {
        self.rras
            .iter()
            .enumerate()
            .filter(|(_, rra)| rra.cf == cf)
            .min_by_key(|(_, rra)| rra.pdp_per_row)
            .map(|(idx, _)| idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> DataSource {
        DataSource::gauge("data", 172_800).with_range(-273.0, 5000.0)
    }

    #[test]
    fn test_hw_predict_expands_to_family() {
        let specs = [
            RraSpec::average(0.5, 1, 30),
            RraSpec::hw_predict(16, 0.5, 0.1, 7),
        ];
        let def = ArchiveDef::build(0, 86_400, source(), &specs).unwrap();

        assert_eq!(def.rras.len(), 6);
        let cfs: Vec<_> = def.rras.iter().map(|r| r.cf).collect();
        assert_eq!(
            cfs,
            [
                ConsolidationFn::Average,
                ConsolidationFn::HwPredict,
                ConsolidationFn::Seasonal,
                ConsolidationFn::DevSeasonal,
                ConsolidationFn::DevPredict,
                ConsolidationFn::Failures,
            ]
        );
        assert_eq!(def.rras[1].rows, 16);
        assert_eq!(def.rras[2].rows, 7);
        assert_eq!(def.rras[3].rows, 7);
        assert_eq!(def.rras[5].rows, 16);
        assert_eq!(def.forecasts[0].member(ConsolidationFn::Failures), Some(5));
        assert_eq!(def.family_of(4).unwrap(), 0);
        assert!(def.family_of(0).is_err());
    }

    #[test]
    fn test_rejects_bad_specs() {
        assert!(ArchiveDef::build(0, 86_400, source(), &[]).is_err());
        assert!(ArchiveDef::build(0, 0, source(), &[RraSpec::average(0.5, 1, 10)]).is_err());
        assert!(ArchiveDef::build(0, 60, source(), &[RraSpec::average(0.5, 1, 0)]).is_err());
        assert!(ArchiveDef::build(0, 60, source(), &[RraSpec::average(1.5, 1, 10)]).is_err());
        assert!(
            ArchiveDef::build(0, 60, source(), &[RraSpec::hw_predict(10, 1.5, 0.1, 4)]).is_err()
        );
        assert!(
            ArchiveDef::build(0, 60, source(), &[RraSpec::hw_predict(10, 0.5, 0.1, 0)]).is_err()
        );
    }

    #[test]
    fn test_range_check() {
        let ds = source();
        assert!(ds.accepts(21.5));
        assert!(ds.accepts(-273.0));
        assert!(!ds.accepts(-300.0));
        assert!(!ds.accepts(5000.5));
        assert!(!ds.accepts(f64::NAN));
    }

    #[test]
    fn test_tune_request_with_ro() {
        let params = HwParams::default();
        let tuned = TuneRequest::default().with_ro(3.0).apply(&params);
        assert_eq!(tuned.delta_pos, 3.0);
        assert_eq!(tuned.delta_neg, 3.0);
        assert_eq!(tuned.alpha, params.alpha);
    }

    #[test]
    fn test_params_validation() {
        let mut params = HwParams::default();
        assert!(params.validate().is_ok());

        params.window_length = 29;
        assert!(params.validate().is_err());

        params.window_length = 3;
        params.failure_threshold = 4;
        assert!(params.validate().is_err());

        params.failure_threshold = 1;
        params.delta_neg = -1.0;
        assert!(params.validate().is_err());
    }
}
