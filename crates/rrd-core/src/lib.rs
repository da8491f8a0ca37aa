//! Round-robin archive engine for periodic gauge readings
//!
//! This crate contains the platform-agnostic logic behind a forecasting
//! temperature archive: the single-file round-robin storage format, the
//! update/consolidation pipeline, the Holt-Winters forecasting model with
//! failure detection, and the query layer that hands aligned series to a
//! renderer.
//!
//! ## Layout
//!
//! - [`definition`]: data source, RRA and tuning parameter types
//! - [`config`]: deployment defaults for new archives
//! - [`storage`]: on-disk container, live state codec and in-memory rings
//! - [`consolidate`]: PDP splitting and CDP accumulation
//! - [`forecast`]: Holt-Winters state machine and the failure window
//! - [`archive`]: the [`Archive`] handle (create, update, tune, fetch)
//! - [`query`]: fetch results and graph series with confidence bounds
//! - [`render`]: the renderer seam and a CSV implementation
//! - [`engine`]: path-keyed registry and the forecasting archive recipe

pub mod archive;
pub mod config;
pub mod consolidate;
pub mod definition;
pub mod engine;
pub mod error;
pub mod forecast;
pub mod query;
pub mod render;
pub mod storage;

pub use archive::{Archive, ArchiveInfo, UpdateReport};
pub use config::ArchiveConfig;
pub use definition::{
    ArchiveDef, ConsolidationFn, DataSource, DataSourceKind, HwParams, RraDef, RraSpec,
    Timestamp, TuneRequest,
};
pub use engine::{ForecastRequest, RrdEngine};
pub use error::RrdError;
pub use forecast::{ForecastState, Phase};
pub use query::{FetchResult, GraphRequest, GraphSeries, SeriesSelector};
pub use render::{CsvRenderer, Renderer};
