//! Live update state persisted next to the definition
//!
//! The live state is rewritten after every update. Its encoded size depends
//! only on the archive definition (RRA count and season lengths), so it is
//! overwritten in place.
//!
//! Binary format (little-endian):
//! - last_update: 8 bytes
//! - PDP prep: known_secs 8, unknown_secs 8, weighted_sum 8
//! - per RRA: cursor 4, CDP sum 8, known 4, unknown 4
//! - per forecast family: phase 1, slot 4, seeded 4, baseline 8, slope 8,
//!   deviation 8, 3 × season × 8 (seasonal, seasonal deviation, seed),
//!   window length 1, 28 flag bytes

use crate::definition::{ArchiveDef, MAX_FAILURE_WINDOW, Timestamp};
use crate::error::RrdError;
use crate::forecast::{FailureWindow, ForecastState, Phase};

use super::codec::{ByteReader, ByteWriter};

const PDP_PREP_LEN: usize = 24;
const RRA_STATE_LEN: usize = 20;
const FORECAST_FIXED_LEN: usize = 1 + 4 + 4 + 24 + 1 + MAX_FAILURE_WINDOW;

/// Partially accumulated primary data point
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PdpPrep {
    pub known_secs: u64,
    pub unknown_secs: u64,
    /// Σ value × seconds over the known part
    pub weighted_sum: f64,
}

/// Partially accumulated consolidated data point
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CdpPrep {
    pub sum: f64,
    pub known: u32,
    pub unknown: u32,
}

/// Write cursor and accumulator of one ring
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RraState {
    /// Row holding the most recent CDP
    pub cursor: u32,
    pub cdp: CdpPrep,
}

/// Everything an update mutates apart from ring slots
#[derive(Debug, Clone)]
pub struct LiveState {
    pub last_update: Timestamp,
    pub pdp: PdpPrep,
    pub rras: Vec<RraState>,
    pub forecasts: Vec<ForecastState>,
}

impl LiveState {
    /// State of a freshly created archive
    pub fn initial(def: &ArchiveDef) -> Self {
        let rras = def
            .rras
            .iter()
            .map(|rra| RraState {
                cursor: rra.rows - 1,
                cdp: CdpPrep {
                    // PDPs of the first CDP that elapsed before the archive existed
                    unknown: ((def.start / def.step) % rra.pdp_per_row as u64) as u32,
                    ..CdpPrep::default()
                },
            })
            .collect();
        let forecasts = def
            .forecasts
            .iter()
            .map(|family| ForecastState::new(family.season_period))
            .collect();

        Self {
            last_update: def.start,
            pdp: PdpPrep::default(),
            rras,
            forecasts,
        }
    }

    /// Encoded size for archives described by `def`
    pub fn encoded_len(def: &ArchiveDef) -> usize {
        8 + PDP_PREP_LEN
            + def.rras.len() * RRA_STATE_LEN
            + def
                .forecasts
                .iter()
                .map(|family| FORECAST_FIXED_LEN + 3 * 8 * family.season_period as usize)
                .sum::<usize>()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(64);

        w.put_u64(self.last_update);
        w.put_u64(self.pdp.known_secs);
        w.put_u64(self.pdp.unknown_secs);
        w.put_f64(self.pdp.weighted_sum);

        for rra in &self.rras {
            w.put_u32(rra.cursor);
            w.put_f64(rra.cdp.sum);
            w.put_u32(rra.cdp.known);
            w.put_u32(rra.cdp.unknown);
        }

        for family in &self.forecasts {
            w.put_u8(match family.phase {
                Phase::Seeding => 0,
                Phase::Running => 1,
            });
            w.put_u32(family.slot);
            w.put_u32(family.seeded);
            w.put_f64(family.baseline);
            w.put_f64(family.slope);
            w.put_f64(family.deviation);
            for values in [&family.seasonal, &family.seasonal_deviation, &family.seed] {
                for value in values.iter() {
                    w.put_f64(*value);
                }
            }

            w.put_u8(family.window.len() as u8);
            let mut flags = [0u8; MAX_FAILURE_WINDOW];
            for (slot, flag) in flags.iter_mut().zip(family.window.iter()) {
                *slot = flag as u8;
            }
            w.put_bytes(&flags);
        }

        w.into_bytes()
    }

    pub fn from_bytes(def: &ArchiveDef, bytes: &[u8]) -> Result<Self, RrdError> {
        let mut r = ByteReader::new(bytes);

        let last_update = r.get_u64()?;
        let pdp = PdpPrep {
            known_secs: r.get_u64()?,
            unknown_secs: r.get_u64()?,
            weighted_sum: r.get_f64()?,
        };

        let mut rras = Vec::with_capacity(def.rras.len());
        for rra in &def.rras {
            let state = RraState {
                cursor: r.get_u32()?,
                cdp: CdpPrep {
                    sum: r.get_f64()?,
                    known: r.get_u32()?,
                    unknown: r.get_u32()?,
                },
            };
            if state.cursor >= rra.rows {
                return Err(RrdError::Corrupt(format!(
                    "{} cursor {} outside {} rows",
                    rra.cf, state.cursor, rra.rows
                )));
            }
            rras.push(state);
        }

        let mut forecasts = Vec::with_capacity(def.forecasts.len());
        for family in &def.forecasts {
            let season = family.season_period as usize;
            let phase = match r.get_u8()? {
                0 => Phase::Seeding,
                1 => Phase::Running,
                other => return Err(RrdError::Corrupt(format!("unknown forecast phase {other}"))),
            };
            let slot = r.get_u32()?;
            let seeded = r.get_u32()?;
            let baseline = r.get_f64()?;
            let slope = r.get_f64()?;
            let deviation = r.get_f64()?;

            let mut read_vec = || -> Result<Vec<f64>, RrdError> {
                (0..season).map(|_| r.get_f64()).collect()
            };
            let seasonal = read_vec()?;
            let seasonal_deviation = read_vec()?;
            let seed = read_vec()?;

            let window_len = r.get_u8()? as usize;
            let flags = r.get_bytes(MAX_FAILURE_WINDOW)?;
            if window_len > MAX_FAILURE_WINDOW {
                return Err(RrdError::Corrupt(format!(
                    "failure window holds {window_len} flags"
                )));
            }
            let window = FailureWindow::from_flags(flags[..window_len].iter().map(|b| *b != 0));

            forecasts.push(ForecastState {
                phase,
                slot,
                seeded,
                baseline,
                slope,
                deviation,
                seasonal,
                seasonal_deviation,
                seed,
                window,
            });
        }

        Ok(Self {
            last_update,
            pdp,
            rras,
            forecasts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{DataSource, HwParams, RraSpec};

    fn def() -> ArchiveDef {
        ArchiveDef::build(
            1_641_600_000,
            86_400,
            DataSource::gauge("data", 172_800),
            &[
                RraSpec::average(0.5, 1, 30),
                RraSpec::hw_predict(16, 0.5, 0.1, 7),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_encoded_len_matches_definition() {
        let def = def();
        let state = LiveState::initial(&def);
        assert_eq!(state.to_bytes().len(), LiveState::encoded_len(&def));
    }

    #[test]
    fn test_forecast_state_survives_encoding() {
        let def = def();
        let mut state = LiveState::initial(&def);
        let params = HwParams {
            failure_threshold: 1,
            window_length: 3,
            ..HwParams::default()
        };
        for value in [10.0, 12.0, 14.0, 16.0, 14.0, 12.0, 10.0, 30.0, 11.0] {
            state.forecasts[0].observe(value, &params);
        }
        state.last_update += 9 * 86_400;
        state.rras[0].cursor = 8;

        let decoded = LiveState::from_bytes(&def, &state.to_bytes()).unwrap();
        let (a, b) = (&state.forecasts[0], &decoded.forecasts[0]);
        assert_eq!(decoded.last_update, state.last_update);
        assert_eq!(decoded.rras[0].cursor, 8);
        assert_eq!(a.phase, b.phase);
        assert_eq!(a.slot, b.slot);
        assert_eq!(a.baseline, b.baseline);
        assert_eq!(a.seasonal, b.seasonal);
        assert_eq!(a.window.iter().collect::<Vec<_>>(), b.window.iter().collect::<Vec<_>>());
    }

    #[test]
    fn test_cursor_outside_rows_is_corrupt() {
        let def = def();
        let mut state = LiveState::initial(&def);
        state.rras[1].cursor = 99;
        assert!(matches!(
            LiveState::from_bytes(&def, &state.to_bytes()),
            Err(RrdError::Corrupt(_))
        ));
    }
}
