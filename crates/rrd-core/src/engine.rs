//! Path-based access to archives
//!
//! [`RrdEngine`] keeps one shared [`Archive`] handle per file so that callers
//! on different threads that name the same file go through the same lock.
//! Handles are keyed by canonical path: `a/../b.rrd`, `./b.rrd` and a
//! symlink to `b.rrd` all reach the same handle.
//! It also knows how to build the forecasting archive used for daily
//! temperature monitoring: an AVERAGE ring over the whole retention plus a
//! Holt-Winters family tuned for single-sample failure detection.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;
use parking_lot::Mutex;

use crate::archive::{Archive, ArchiveInfo, UpdateReport};
use crate::config::ArchiveConfig;
use crate::definition::{DataSource, HwParams, RraSpec, Timestamp, TuneRequest};
use crate::error::RrdError;
use crate::query::{FetchResult, GraphRequest, GraphSeries, SeriesSelector};
use crate::render::Renderer;

/// HWPREDICT ring of a forecasting archive (right after the AVERAGE ring)
const HWPREDICT_RRA: usize = 1;
/// FAILURES ring of a forecasting archive
const FAILURES_RRA: usize = 5;

/// Parameters of a forecasting archive
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForecastRequest {
    pub alpha: f64,
    pub beta: f64,
    /// Smoothing for both seasonal coefficients and deviations
    pub gamma: f64,
    /// Confidence band half-width, in deviations
    pub ro: f64,
    /// Steps per season
    pub season_period: u32,
    /// Steps of history kept in the AVERAGE ring
    pub retention: u32,
}

impl ForecastRequest {
    /// Rows of the prediction rings: the retention minus two seasons
    pub fn prediction_rows(&self) -> Result<u32, RrdError> {
        if self.season_period == 0 {
            return Err(RrdError::invalid("season period must be positive"));
        }
        let seasons = self.season_period.saturating_mul(2);
        if self.retention <= seasons {
            return Err(RrdError::invalid(format!(
                "retention {} must exceed two seasons ({})",
                self.retention, seasons
            )));
        }
        Ok(self.retention - seasons)
    }

    fn tuning(&self) -> TuneRequest {
        TuneRequest {
            gamma: Some(self.gamma),
            gamma_deviation: Some(self.gamma),
            failure_threshold: Some(1),
            window_length: Some(1),
            ..TuneRequest::default()
        }
        .with_ro(self.ro)
    }
}

/// Canonical form of `path`
///
/// A file that does not exist yet is keyed by its canonical parent
/// directory joined with its file name.
fn registry_key(path: &Path) -> Result<PathBuf, RrdError> {
    match fs::canonicalize(path) {
        Ok(key) => return Ok(key),
        Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
        Err(_) => {}
    }

    let name = path
        .file_name()
        .ok_or_else(|| RrdError::invalid(format!("{} does not name a file", path.display())))?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    match fs::canonicalize(parent) {
        Ok(dir) => Ok(dir.join(name)),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(RrdError::NotFound(path.to_path_buf())),
        Err(e) => Err(e.into()),
    }
}

/// Registry of open archives keyed by canonical path
#[derive(Debug, Default)]
pub struct RrdEngine {
    config: ArchiveConfig,
    archives: Mutex<HashMap<PathBuf, Arc<Archive>>>,
}

impl RrdEngine {
    pub fn new(config: ArchiveConfig) -> Self {
        Self {
            config,
            archives: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    /// Shared handle for `path`, opening the file on first use
    pub fn archive(&self, path: impl AsRef<Path>) -> Result<Arc<Archive>, RrdError> {
        let key = registry_key(path.as_ref())?;
        let mut archives = self.archives.lock();
        if let Some(archive) = archives.get(&key) {
            return Ok(Arc::clone(archive));
        }

        let archive = Arc::new(Archive::open(&key)?);
        archives.insert(key, Arc::clone(&archive));
        Ok(archive)
    }

    /// Drop the registry's handle for `path` after flushing it
    pub fn close(&self, path: impl AsRef<Path>) -> Result<(), RrdError> {
        let key = match registry_key(path.as_ref()) {
            Ok(key) => key,
            // Nothing can be open under a missing directory
            Err(RrdError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        if let Some(archive) = self.archives.lock().remove(&key) {
            archive.sync()?;
        }
        Ok(())
    }

    fn register(&self, key: PathBuf, archive: Archive) -> Arc<Archive> {
        let archive = Arc::new(archive);
        self.archives.lock().insert(key, Arc::clone(&archive));
        archive
    }

    /// Create an archive and register its handle
    pub fn create(
        &self,
        path: impl AsRef<Path>,
        start: Timestamp,
        step: u64,
        source: DataSource,
        specs: &[RraSpec],
        overwrite: bool,
    ) -> Result<Arc<Archive>, RrdError> {
        let key = registry_key(path.as_ref())?;
        let archive = Archive::create(&key, start, step, source, specs, overwrite)?;
        Ok(self.register(key, archive))
    }

    /// Create (or replace) a forecasting archive
    ///
    /// Step and data source come from the engine configuration. Nothing is
    /// written when the request is invalid.
    pub fn create_forecasting(
        &self,
        path: impl AsRef<Path>,
        start: Timestamp,
        request: &ForecastRequest,
    ) -> Result<Arc<Archive>, RrdError> {
        let rows = request.prediction_rows()?;

        let params = HwParams {
            alpha: request.alpha,
            beta: request.beta,
            ..HwParams::default()
        };
        request.tuning().apply(&params).validate()?;
        let specs = [
            RraSpec::average(self.config.xff, 1, request.retention),
            RraSpec::HwPredict {
                rows,
                season_period: request.season_period,
                params,
            },
        ];

        let key = registry_key(path.as_ref())?;
        let archive = Archive::create(
            &key,
            start,
            self.config.step,
            self.config.data_source(),
            &specs,
            true,
        )?;
        archive.tune(HWPREDICT_RRA, &request.tuning())?;
        archive.resize_rows(FAILURES_RRA, rows)?;

        info!(
            "Forecasting archive {} ready: season {}, {} prediction rows",
            key.display(),
            request.season_period,
            rows
        );
        Ok(self.register(key, archive))
    }

    pub fn update(
        &self,
        path: impl AsRef<Path>,
        timestamp: Timestamp,
        value: f64,
    ) -> Result<UpdateReport, RrdError> {
        self.archive(path)?.update(timestamp, value)
    }

    pub fn update_batch(
        &self,
        path: impl AsRef<Path>,
        samples: &[(Timestamp, f64)],
    ) -> Result<UpdateReport, RrdError> {
        self.archive(path)?.update_batch(samples)
    }

    pub fn tune(
        &self,
        path: impl AsRef<Path>,
        rra: usize,
        request: &TuneRequest,
    ) -> Result<(), RrdError> {
        self.archive(path)?.tune(rra, request)
    }

    pub fn resize_rows(&self, path: impl AsRef<Path>, rra: usize, rows: u32) -> Result<(), RrdError> {
        self.archive(path)?.resize_rows(rra, rows)
    }

    pub fn reset_forecast(&self, path: impl AsRef<Path>, rra: usize) -> Result<(), RrdError> {
        self.archive(path)?.reset_forecast(rra)
    }

    pub fn info(&self, path: impl AsRef<Path>) -> Result<ArchiveInfo, RrdError> {
        Ok(self.archive(path)?.info())
    }

    pub fn fetch(
        &self,
        path: impl AsRef<Path>,
        start: Timestamp,
        end: Timestamp,
        selector: SeriesSelector,
    ) -> Result<FetchResult, RrdError> {
        self.archive(path)?.fetch(start, end, selector)
    }

    pub fn graph(
        &self,
        path: impl AsRef<Path>,
        request: &GraphRequest,
    ) -> Result<GraphSeries, RrdError> {
        self.archive(path)?.graph(request)
    }

    /// Compute the graph series and hand them to `renderer`
    pub fn render(
        &self,
        path: impl AsRef<Path>,
        request: &GraphRequest,
        renderer: &mut dyn Renderer,
    ) -> Result<GraphSeries, RrdError> {
        let series = self.graph(path, request)?;
        renderer.render(&series)?;
        Ok(series)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::ConsolidationFn;

    fn request(retention: u32) -> ForecastRequest {
        ForecastRequest {
            alpha: 0.5,
            beta: 0.1,
            gamma: 0.3,
            ro: 2.0,
            season_period: 7,
            retention,
        }
    }

    #[test]
    fn test_prediction_rows() {
        assert_eq!(request(30).prediction_rows().unwrap(), 16);
        assert!(request(14).prediction_rows().is_err());
        assert!(request(10).prediction_rows().is_err());
    }

    #[test]
    fn test_forecasting_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("temp.rrd");
        let engine = RrdEngine::default();

        engine.create_forecasting(&path, 1_641_600_000, &request(30)).unwrap();
        let info = engine.info(&path).unwrap();

        let rows: Vec<_> = info.def.rras.iter().map(|rra| (rra.cf, rra.rows)).collect();
        assert_eq!(
            rows,
            vec![
                (ConsolidationFn::Average, 30),
                (ConsolidationFn::HwPredict, 16),
                (ConsolidationFn::Seasonal, 7),
                (ConsolidationFn::DevSeasonal, 7),
                (ConsolidationFn::DevPredict, 16),
                (ConsolidationFn::Failures, 16),
            ]
        );
        let params = info.def.forecasts[0].params;
        assert_eq!(params.gamma_deviation, 0.3);
        assert_eq!(params.delta_pos, 2.0);
        assert_eq!(params.failure_threshold, 1);
        assert_eq!(params.window_length, 1);
        assert_eq!(info.def.step, 86_400);
        assert_eq!(info.def.source.min, Some(-273.0));
    }

    #[test]
    fn test_invalid_request_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("temp.rrd");
        let engine = RrdEngine::default();

        assert!(matches!(
            engine.create_forecasting(&path, 0, &request(10)),
            Err(RrdError::InvalidArgument(_))
        ));
        let bad_ro = ForecastRequest {
            ro: -1.0,
            ..request(30)
        };
        assert!(engine.create_forecasting(&path, 0, &bad_ro).is_err());
        assert!(!path.exists());
        assert!(matches!(engine.info(&path), Err(RrdError::NotFound(_))));
    }

    #[test]
    fn test_handles_are_shared() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("temp.rrd");
        let engine = RrdEngine::new(ArchiveConfig::default());

        let created = engine.create_forecasting(&path, 0, &request(30)).unwrap();
        let looked_up = engine.archive(&path).unwrap();
        assert!(Arc::ptr_eq(&created, &looked_up));

        engine.update(&path, 86_400, 20.0).unwrap();
        assert_eq!(created.last_update(), 86_400);

        engine.close(&path).unwrap();
        let reopened = engine.archive(&path).unwrap();
        assert!(!Arc::ptr_eq(&created, &reopened));
        assert_eq!(reopened.last_update(), 86_400);
    }

    #[test]
    fn test_aliases_share_one_handle() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let path = dir.path().join("temp.rrd");
        let alias = dir.path().join("sub").join("..").join("temp.rrd");
        let engine = RrdEngine::default();

        let created = engine.create_forecasting(&alias, 0, &request(30)).unwrap();
        assert!(Arc::ptr_eq(&created, &engine.archive(&path).unwrap()));
        assert!(Arc::ptr_eq(&created, &engine.archive(&alias).unwrap()));

        engine.update(&path, 2 * 86_400, 20.0).unwrap();
        assert!(matches!(
            engine.update(&alias, 86_400, 21.0),
            Err(RrdError::OutOfOrder { .. })
        ));

        engine.close(&alias).unwrap();
        let reopened = engine.archive(&path).unwrap();
        assert!(!Arc::ptr_eq(&created, &reopened));
        assert_eq!(reopened.last_update(), 2 * 86_400);
    }

    #[test]
    fn test_missing_directory_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("temp.rrd");
        let engine = RrdEngine::default();

        assert!(matches!(engine.info(&path), Err(RrdError::NotFound(_))));
        assert!(engine.close(&path).is_ok());
    }
}
