//! The [`Archive`] handle
//!
//! An `Archive` owns the open file plus an in-memory copy of the definition,
//! live state and rings. Mutations compute their result on a copy, commit
//! it to the file (ring slots first, live state last) and only then swap it
//! into memory, so a failed write leaves the handle as it was. When an
//! update fails halfway, the slots it touched are written back from memory.
//! Reads are served from memory under the read lock.

use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};
use parking_lot::RwLock;

use crate::consolidate::{self, UpdatePlan};
use crate::definition::{
    ArchiveDef, ConsolidationFn, DataSource, RraSpec, Timestamp, TuneRequest,
};
use crate::error::RrdError;
use crate::forecast::Phase;
use crate::query::{self, FetchResult, GraphRequest, GraphSeries, SeriesSelector};
use crate::storage::{ArchiveFile, LiveState, Ring, SlotWrite};

/// What one update call did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateReport {
    /// Primary data points completed
    pub pdps: usize,
    /// Ring slots written, across all RRAs
    pub cdps_written: usize,
    /// Samples stored as unknown (NaN or outside the data source range)
    pub stored_unknown: usize,
    /// PDPs for which a forecast family raised a failure
    pub failures: usize,
}

/// Snapshot of an archive's definition and progress
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveInfo {
    pub path: PathBuf,
    pub def: ArchiveDef,
    pub last_update: Timestamp,
    /// Phase of every forecast family, in definition order
    pub phases: Vec<Phase>,
}

struct Inner {
    file: ArchiveFile,
    def: ArchiveDef,
    state: LiveState,
    rings: Vec<Ring>,
}

impl Inner {
    /// Put the stored slots named by `writes` and the live state back to
    /// their in-memory values
    fn roll_back(&mut self, writes: &[SlotWrite]) -> Result<(), RrdError> {
        let previous: Vec<SlotWrite> = writes
            .iter()
            .map(|write| SlotWrite {
                value: self.rings[write.rra].get(write.row),
                ..*write
            })
            .collect();
        self.file.write_slots(&previous)?;
        self.file.write_state(&self.state)
    }
}

/// Open archive shared between threads
pub struct Archive {
    inner: RwLock<Inner>,
}

impl core::fmt::Debug for Archive {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Archive")
            .field("path", &inner.file.path())
            .field("last_update", &inner.state.last_update)
            .finish()
    }
}

impl Archive {
    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Create a new archive file
    ///
    /// Fails with [`RrdError::InvalidArgument`] when the definition is
    /// malformed or the file exists and `overwrite` is false.
    pub fn create(
        path: impl AsRef<Path>,
        start: Timestamp,
        step: u64,
        source: DataSource,
        specs: &[RraSpec],
        overwrite: bool,
    ) -> Result<Self, RrdError> {
        let path = path.as_ref();
        let def = ArchiveDef::build(start, step, source, specs)?;
        let state = LiveState::initial(&def);
        let file = ArchiveFile::create(path, &def, &state, overwrite)?;
        let rings = def.rras.iter().map(|rra| Ring::new(rra.rows)).collect();

        info!(
            "Created archive {} (step {} s, {} RRAs, {} forecast families)",
            path.display(),
            def.step,
            def.rras.len(),
            def.forecasts.len()
        );

        Ok(Self {
            inner: RwLock::new(Inner {
                file,
                def,
                state,
                rings,
            }),
        })
    }

    /// Open an existing archive file
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RrdError> {
        let loaded = ArchiveFile::open(path.as_ref())?;
        debug!(
            "Opened archive {} (last update {})",
            loaded.file.path().display(),
            loaded.state.last_update
        );

        Ok(Self {
            inner: RwLock::new(Inner {
                file: loaded.file,
                def: loaded.def,
                state: loaded.state,
                rings: loaded.rings,
            }),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.inner.read().file.path().to_path_buf()
    }

    pub fn last_update(&self) -> Timestamp {
        self.inner.read().state.last_update
    }

    pub fn info(&self) -> ArchiveInfo {
        let inner = self.inner.read();
        ArchiveInfo {
            path: inner.file.path().to_path_buf(),
            def: inner.def.clone(),
            last_update: inner.state.last_update,
            phases: inner.state.forecasts.iter().map(|f| f.phase).collect(),
        }
    }

    /// Flush pending writes to the device
    pub fn sync(&self) -> Result<(), RrdError> {
        self.inner.write().file.sync()
    }

    // ========================================================================
    // Updates
    // ========================================================================

    /// Record `value` as holding from the last update until `timestamp`
    pub fn update(&self, timestamp: Timestamp, value: f64) -> Result<UpdateReport, RrdError> {
        self.update_batch(&[(timestamp, value)])
    }

    /// Apply several samples atomically
    ///
    /// Timestamps must be strictly increasing and after the last update;
    /// otherwise nothing is applied.
    pub fn update_batch(&self, samples: &[(Timestamp, f64)]) -> Result<UpdateReport, RrdError> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        let mut last_update = inner.state.last_update;
        for &(timestamp, _) in samples {
            if timestamp <= last_update {
                return Err(RrdError::OutOfOrder {
                    timestamp,
                    last_update,
                });
            }
            last_update = timestamp;
        }

        let mut report = UpdateReport::default();
        if samples.is_empty() {
            return Ok(report);
        }

        let mut state = inner.state.clone();
        let mut plan = UpdatePlan::default();
        for &(timestamp, value) in samples {
            let value = if inner.def.source.accepts(value) {
                Some(value)
            } else {
                if value.is_nan() {
                    debug!("Unknown value at {}", timestamp);
                } else {
                    warn!(
                        "Value {} at {} outside the range of {}, stored as unknown",
                        value, timestamp, inner.def.source.name
                    );
                }
                report.stored_unknown += 1;
                None
            };
            consolidate::apply_sample(&inner.def, &mut state, timestamp, value, &mut plan);
        }

        plan.compact();
        let committed = inner
            .file
            .write_slots(&plan.writes)
            .and_then(|()| inner.file.write_state(&state));
        if let Err(e) = committed {
            if let Err(restore) = inner.roll_back(&plan.writes) {
                error!(
                    "Could not restore {} after a failed update: {}",
                    inner.file.path().display(),
                    restore
                );
            }
            return Err(e);
        }

        for write in &plan.writes {
            inner.rings[write.rra].set(write.row, write.value);
        }
        inner.state = state;

        report.pdps = plan.pdps;
        report.cdps_written = plan.writes.len();
        report.failures = plan.failures;
        debug!(
            "Updated {} to {}: {} PDPs, {} CDPs",
            inner.file.path().display(),
            last_update,
            report.pdps,
            report.cdps_written
        );
        Ok(report)
    }

    // ========================================================================
    // Forecast maintenance
    // ========================================================================

    /// Change the tuning of the forecast family that `rra` belongs to
    ///
    /// Samples and model state are kept; a shorter failure window drops its
    /// oldest flags.
    pub fn tune(&self, rra: usize, request: &TuneRequest) -> Result<(), RrdError> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        let family = inner.def.family_of(rra)?;
        let params = request.apply(&inner.def.forecasts[family].params);
        params.validate()?;

        let mut def = inner.def.clone();
        def.forecasts[family].params = params;
        let mut state = inner.state.clone();
        state.forecasts[family].window.truncate(params.window_length);

        inner.file.write_definition(&def)?;
        inner.file.write_state(&state)?;
        inner.def = def;
        inner.state = state;

        info!(
            "Tuned forecast family {} of {}: {:?}",
            family,
            inner.file.path().display(),
            params
        );
        Ok(())
    }

    /// Change the row count of a DEVPREDICT or FAILURES ring
    ///
    /// Only allowed while the archive has never been updated. The file is
    /// rewritten with the new layout.
    pub fn resize_rows(&self, rra: usize, rows: u32) -> Result<(), RrdError> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        let cf = inner
            .def
            .rras
            .get(rra)
            .map(|def| def.cf)
            .ok_or_else(|| RrdError::invalid(format!("RRA index {rra} out of range")))?;
        if !matches!(cf, ConsolidationFn::DevPredict | ConsolidationFn::Failures) {
            return Err(RrdError::invalid(format!(
                "RRA #{rra} ({cf}) cannot be resized"
            )));
        }
        if rows == 0 {
            return Err(RrdError::invalid("row count must be positive"));
        }
        if inner.state.last_update != inner.def.start {
            return Err(RrdError::invalid(
                "rings can only be resized before the first update",
            ));
        }
        if inner.def.rras[rra].rows == rows {
            return Ok(());
        }

        let mut def = inner.def.clone();
        def.rras[rra].rows = rows;
        let state = LiveState::initial(&def);
        let path = inner.file.path().to_path_buf();
        let file = ArchiveFile::create(&path, &def, &state, true)?;

        inner.rings = def.rras.iter().map(|rra| Ring::new(rra.rows)).collect();
        inner.file = file;
        inner.def = def;
        inner.state = state;

        info!("Resized RRA #{} ({}) of {} to {} rows", rra, cf, path.display(), rows);
        Ok(())
    }

    /// Send the forecast family that `rra` belongs to back to seeding
    pub fn reset_forecast(&self, rra: usize) -> Result<(), RrdError> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        let family = inner.def.family_of(rra)?;
        let mut state = inner.state.clone();
        state.forecasts[family].reset();

        inner.file.write_state(&state)?;
        inner.state = state;

        info!(
            "Reset forecast family {} of {}",
            family,
            inner.file.path().display()
        );
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// CDPs of one ring ending within `[start, end]`, limited to what the
    /// ring still retains
    pub fn fetch(
        &self,
        start: Timestamp,
        end: Timestamp,
        selector: SeriesSelector,
    ) -> Result<FetchResult, RrdError> {
        let inner = self.inner.read();
        query::fetch(&inner.def, &inner.state, &inner.rings, start, end, selector)
    }

    /// Aligned average, prediction and confidence band series
    pub fn graph(&self, request: &GraphRequest) -> Result<GraphSeries, RrdError> {
        let inner = self.inner.read();
        query::graph(&inner.def, &inner.state, &inner.rings, request)
    }
}
