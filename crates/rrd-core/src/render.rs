//! Output seam for graph series
//!
//! The core stops at numbers. A [`Renderer`] turns a [`GraphSeries`] into
//! whatever the caller displays; [`CsvRenderer`] is the plain-text one.

use std::io::Write;

use crate::error::RrdError;
use crate::query::GraphSeries;

/// Consumer of aligned graph series
pub trait Renderer {
    fn render(&mut self, series: &GraphSeries) -> Result<(), RrdError>;
}

/// Writes one CSV line per grid point, unknown values as `nan`
#[derive(Debug)]
pub struct CsvRenderer<W: Write> {
    out: W,
}

impl<W: Write> CsvRenderer<W> {
    pub const HEADER: &'static str = "timestamp,average,prediction,deviation,upper,lower,failures";

    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

fn cell(value: f64) -> String {
    if value.is_nan() {
        "nan".into()
    } else {
        format!("{value}")
    }
}

impl<W: Write> Renderer for CsvRenderer<W> {
    fn render(&mut self, series: &GraphSeries) -> Result<(), RrdError> {
        writeln!(self.out, "{}", Self::HEADER)?;
        for (i, t) in series.timestamps.iter().enumerate() {
            writeln!(
                self.out,
                "{},{},{},{},{},{},{}",
                t,
                cell(series.average[i]),
                cell(series.prediction[i]),
                cell(series.deviation[i]),
                cell(series.upper[i]),
                cell(series.lower[i]),
                cell(series.failures[i]),
            )?;
        }
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_output() {
        let series = GraphSeries {
            step: 60,
            timestamps: vec![60, 120],
            average: vec![21.5, f64::NAN],
            prediction: vec![21.0, 22.0],
            deviation: vec![0.25, f64::NAN],
            upper: vec![21.5, f64::NAN],
            lower: vec![20.5, f64::NAN],
            failures: vec![0.0, 1.0],
        };

        let mut renderer = CsvRenderer::new(Vec::new());
        renderer.render(&series).unwrap();
        let text = String::from_utf8(renderer.into_inner()).unwrap();

        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], CsvRenderer::<Vec<u8>>::HEADER);
        assert_eq!(lines[1], "60,21.5,21,0.25,21.5,20.5,0");
        assert_eq!(lines[2], "120,nan,22,nan,nan,nan,1");
    }
}
