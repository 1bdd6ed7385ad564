//! Custom error types for the measurement layer.
//!
//! This module defines the primary error type, `MesoError`, used across the
//! crate. `thiserror` gives a centralized way to handle the different failure
//! classes that show up during a measurement session: configuration problems,
//! instrument communication failures, invalid sweep arrays, and persistence
//! errors.
//!
//! `#[from]` conversions let lower layers bubble errors up with `?` without
//! manual wrapping. Application binaries convert into `anyhow::Error` at the
//! top level.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type MesoResult<T> = std::result::Result<T, MesoError>;

/// Unified error type for station setup, sweeps, and persistence.
#[derive(Error, Debug)]
pub enum MesoError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Transport for '{0}' is not open")]
    TransportNotOpen(String),

    #[error("Unparseable instrument response '{response}' for {channel}")]
    BadResponse {
        /// Parameter the response was read for.
        channel: String,
        /// Raw response as received from the instrument.
        response: String,
    },

    #[error("Station component '{0}' not found")]
    UnknownComponent(String),

    #[error("Station component '{0}' already registered")]
    DuplicateComponent(String),

    #[error("Invalid sweep array: {0}")]
    Array(String),

    #[error("Run {0} not found in database")]
    RunNotFound(u64),

    #[error("Malformed run document: {0}")]
    Document(#[from] serde_json::Error),

    #[cfg(feature = "storage_csv")]
    #[error("CSV export failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<MesoError>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MesoError::Instrument("lock-in timed out".to_string());
        assert_eq!(err.to_string(), "Instrument error: lock-in timed out");
    }

    #[test]
    fn test_bad_response_display() {
        let err = MesoError::BadResponse {
            channel: "lockin1.x".to_string(),
            response: "OVLD".to_string(),
        };
        assert!(err.to_string().contains("OVLD"));
        assert!(err.to_string().contains("lockin1.x"));
    }

    #[test]
    fn test_shutdown_failed_error() {
        let err = MesoError::ShutdownFailed(vec![
            MesoError::Instrument("cryostat socket closed".into()),
            MesoError::TransportNotOpen("rf1".into()),
        ]);
        assert!(err.to_string().contains("Shutdown failed"));
    }
}
