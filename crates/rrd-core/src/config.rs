use crate::definition::DataSource;

/// Seconds in one day, the default step of a temperature archive
pub const SECONDS_IN_A_DAY: u64 = 86_400;

/// Deployment defaults applied to archives built by [`crate::RrdEngine`]
///
/// Built in code; the simulator fills it from its environment settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveConfig {
    /// Seconds between primary data points
    pub step: u64,
    pub source_name: String,
    /// Longest tolerated gap between updates, in seconds
    pub heartbeat: u64,
    /// Lowest physically meaningful reading (absolute zero, in °C)
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Unknown share tolerated inside one AVERAGE CDP
    pub xff: f64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            step: SECONDS_IN_A_DAY,
            source_name: "data".into(),
            heartbeat: 2 * SECONDS_IN_A_DAY,
            min: Some(-273.0),
            max: Some(5000.0),
            xff: 0.5,
        }
    }
}

impl ArchiveConfig {
    /// Data source definition described by this configuration
    pub fn data_source(&self) -> DataSource {
        let mut source = DataSource::gauge(self.source_name.clone(), self.heartbeat);
        source.min = self.min;
        source.max = self.max;
        source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_source_follows_config() {
        let config = ArchiveConfig {
            source_name: "outdoor".into(),
            min: None,
            ..ArchiveConfig::default()
        };
        let source = config.data_source();

        assert_eq!(source.name, "outdoor");
        assert_eq!(source.heartbeat, 2 * SECONDS_IN_A_DAY);
        assert!(source.accepts(-500.0));
        assert!(!source.accepts(6000.0));
    }
}
