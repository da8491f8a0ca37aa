//! Desktop simulator for the rrd-core forecasting archive.
//!
//! Creates a daily temperature archive, feeds it synthetic readings with a
//! weekly rhythm and a few injected anomalies, then exports the graph series
//! (average, prediction, confidence band, failures) as CSV.
//!
//! # Settings
//!
//! Read from the environment, optionally through a `.env` file:
//!
//! | Variable         | Default              | Meaning                          |
//! |------------------|----------------------|----------------------------------|
//! | RRD_PATH         | `temperature.rrd`    | Archive file                     |
//! | RRD_OUTPUT       | stdout               | CSV destination                  |
//! | RRD_DAYS         | 90                   | Simulated days                   |
//! | RRD_SEASON       | 7                    | Season length in days            |
//! | RRD_RETENTION    | 120                  | Days kept in the AVERAGE ring    |
//! | RRD_ALPHA        | 0.5                  | Baseline smoothing               |
//! | RRD_BETA         | 0.1                  | Slope smoothing                  |
//! | RRD_GAMMA        | 0.3                  | Seasonal and deviation smoothing |
//! | RRD_RO           | 2.0                  | Band half-width in deviations    |
//! | RRD_ANOMALY_DAYS | 40,61,75             | Days that get a temperature spike |
//! | RRD_SOURCE       | `data`               | Data source name                 |
//! | RRD_XFF          | 0.5                  | Unknown share tolerated per CDP  |

use std::env;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{error, info, warn};

use rrd_core::config::SECONDS_IN_A_DAY;
use rrd_core::{
    ArchiveConfig, CsvRenderer, ForecastRequest, GraphRequest, RrdEngine, RrdError, Timestamp,
};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Size of the temperature spike added on anomaly days, in °C
const ANOMALY_OFFSET: f64 = 15.0;

struct Settings {
    path: String,
    output: Option<String>,
    days: u64,
    anomaly_days: Vec<u64>,
    config: ArchiveConfig,
    request: ForecastRequest,
}

/// Parse `key` from the environment, falling back to `default`
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring unparsable {}={:?}", key, raw);
            default
        }),
        Err(_) => default,
    }
}

impl Settings {
    fn from_env() -> Self {
        let anomaly_days = env::var("RRD_ANOMALY_DAYS")
            .unwrap_or_else(|_| "40,61,75".into())
            .split(',')
            .filter_map(|day| day.trim().parse().ok())
            .collect();
        let defaults = ArchiveConfig::default();

        Self {
            path: env_or("RRD_PATH", "temperature.rrd".to_string()),
            output: env::var("RRD_OUTPUT").ok(),
            days: env_or("RRD_DAYS", 90),
            anomaly_days,
            config: ArchiveConfig {
                source_name: env_or("RRD_SOURCE", defaults.source_name.clone()),
                xff: env_or("RRD_XFF", defaults.xff),
                ..defaults
            },
            request: ForecastRequest {
                alpha: env_or("RRD_ALPHA", 0.5),
                beta: env_or("RRD_BETA", 0.1),
                gamma: env_or("RRD_GAMMA", 0.3),
                ro: env_or("RRD_RO", 2.0),
                season_period: env_or("RRD_SEASON", 7),
                retention: env_or("RRD_RETENTION", 120),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Mock data generation
// ---------------------------------------------------------------------------

/// Generates one synthetic daily mean temperature per call.
struct MockTemperatureGenerator {
    season_period: u32,
    anomaly_days: Vec<u64>,
}

impl MockTemperatureGenerator {
    fn new(season_period: u32, anomaly_days: Vec<u64>) -> Self {
        Self {
            season_period,
            anomaly_days,
        }
    }

    /// Temperature for simulated day `day` (1-based)
    fn sample(&self, day: u64) -> f64 {
        let d = day as f64;
        let season = self.season_period.max(1) as f64;

        // Slow yearly drift around 12 °C
        let yearly = 12.0 + 4.0 * (d * std::f64::consts::TAU / 365.0).sin();
        // Weekly rhythm the forecast should learn
        let weekly = 2.5 * (d * std::f64::consts::TAU / season).sin();
        // Small deterministic jitter
        let jitter = 0.3 * (d * 12.9898).sin();

        let anomaly = if self.anomaly_days.contains(&day) {
            ANOMALY_OFFSET
        } else {
            0.0
        };

        yearly + weekly + jitter + anomaly
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn today() -> Timestamp {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    now / SECONDS_IN_A_DAY * SECONDS_IN_A_DAY
}

fn run(settings: &Settings) -> Result<(), RrdError> {
    let engine = RrdEngine::new(settings.config.clone());
    let step = engine.config().step;
    let start = today().saturating_sub(settings.days * step);

    engine.create_forecasting(&settings.path, start, &settings.request)?;
    info!(
        "Simulating {} days into {} (season {}, retention {})",
        settings.days, settings.path, settings.request.season_period, settings.request.retention
    );

    let generator =
        MockTemperatureGenerator::new(settings.request.season_period, settings.anomaly_days.clone());
    let samples: Vec<_> = (1..=settings.days)
        .map(|day| (start + day * step, generator.sample(day)))
        .collect();
    let report = engine.update_batch(&settings.path, &samples)?;
    info!(
        "Fed {} samples: {} PDPs, {} CDPs written, {} failures",
        samples.len(),
        report.pdps,
        report.cdps_written,
        report.failures
    );

    let request = GraphRequest {
        // Skip the creation day, it never holds a CDP
        start: start + step,
        end: start + settings.days * step,
        ro: settings.request.ro,
    };
    let series = match &settings.output {
        Some(path) => {
            let mut renderer = CsvRenderer::new(BufWriter::new(File::create(path)?));
            let series = engine.render(&settings.path, &request, &mut renderer)?;
            info!("Wrote {} rows to {}", series.len(), path);
            series
        }
        None => {
            let mut renderer = CsvRenderer::new(io::stdout().lock());
            engine.render(&settings.path, &request, &mut renderer)?
        }
    };

    for t in series.failure_times() {
        let day = (t - start) / step;
        warn!("Failure flagged on day {} ({})", day, t);
    }

    engine.close(&settings.path)?;
    io::stdout().flush()?;
    Ok(())
}

fn main() {
    dotenvy::dotenv().ok();
    env_logger::init();

    let settings = Settings::from_env();
    if let Err(e) = run(&settings) {
        error!("Simulation failed: {}", e);
        std::process::exit(1);
    }
}
