//! Error type shared by every archive operation

use std::path::PathBuf;

use thiserror_no_std::Error;

use crate::definition::Timestamp;

/// Errors returned by archive operations.
///
/// Values outside the data source range are not errors: they are stored as
/// unknown and reported through [`crate::UpdateReport::stored_unknown`].
#[derive(Error, Debug)]
pub enum RrdError {
    /// Malformed definition, bad index, `end < start` and friends
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No archive file at the given path
    #[error("Archive not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Update timestamp is not strictly after the last update
    #[error("Timestamp {timestamp} is not after last update {last_update}")]
    OutOfOrder {
        /// Rejected timestamp
        timestamp: Timestamp,
        /// Timestamp of the last applied update
        last_update: Timestamp,
    },

    /// Underlying file read or write failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// File does not look like an archive or its layout is inconsistent
    #[error("Corrupt archive: {0}")]
    Corrupt(String),

    /// Definition block could not be (de)serialized
    #[error("Encoding error: {0}")]
    Encoding(#[from] postcard::Error),
}

impl RrdError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}
