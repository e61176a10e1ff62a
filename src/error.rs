//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, shared by the hardware
//! capabilities, the calibration stages and the acquisition sweep. Using the
//! `thiserror` crate, it provides one consistent taxonomy for everything that can
//! go wrong during a hyperspectral run.
//!
//! ## Error Hierarchy
//!
//! - **`ActuatorComm`**: a drive command (wavelength, amplitude, RF enable, emission)
//!   was not acknowledged. Fatal: the run aborts and every device is released.
//! - **`SensorTimeout`**: a single spectrometer read or camera capture did not
//!   complete in time. Non-fatal: the spectrometer is retried once, a missed frame
//!   is skipped.
//! - **`ZeroReferenceSpan`**: the white/dark references are degenerate
//!   (`max(white) == min(dark)`). Fatal before the controller ever runs.
//! - **`DeviceDisconnected`**: hardware physically went away mid-run. Fatal.
//! - **`Calibration`**: an empty or malformed calibration table, or a grid mismatch.
//! - **`Config`** / **`Configuration`**: parse errors from figment and semantic
//!   validation errors respectively.
//! - **`Io`**, **`Csv`**, **`Serialization`**: artifact persistence failures.
//! - **`ShutdownFailed`**: one or more devices failed to release cleanly.
//!
//! Convergence exhaustion is deliberately absent: it is a terminal state of the
//! power-normalization controller, recorded in the run report, never an error.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Actuator command '{operation}' failed: {detail}")]
    ActuatorComm { operation: String, detail: String },

    #[error("{device} did not respond within {timeout:?}")]
    SensorTimeout { device: String, timeout: Duration },

    #[error("Degenerate reference span: max(white) = {white_max} equals min(dark) = {dark_min}")]
    ZeroReferenceSpan { white_max: f64, dark_min: f64 },

    #[error("Device disconnected: {0}")]
    DeviceDisconnected(String),

    #[error("Calibration error: {0}")]
    Calibration(String),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<DaqError>),
}

impl DaqError {
    /// Build an `ActuatorComm` error for the named drive operation.
    pub fn actuator(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        DaqError::ActuatorComm {
            operation: operation.into(),
            detail: detail.into(),
        }
    }

    /// Build a `SensorTimeout` error for the named device.
    pub fn timeout(device: impl Into<String>, timeout: Duration) -> Self {
        DaqError::SensorTimeout {
            device: device.into(),
            timeout,
        }
    }

    /// Whether this error must abort the run (after releasing all devices).
    ///
    /// Only sensor timeouts are absorbed locally; everything else unwinds.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DaqError::SensorTimeout { .. })
    }

    /// Whether this error is a local, bounded sensor timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, DaqError::SensorTimeout { .. })
    }
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeouts_are_non_fatal() {
        assert!(!DaqError::timeout("spectrometer", Duration::from_millis(10)).is_fatal());
        assert!(DaqError::actuator("set_amplitude", "no ack").is_fatal());
        assert!(DaqError::DeviceDisconnected("camera".into()).is_fatal());
        assert!(DaqError::ZeroReferenceSpan {
            white_max: 1.0,
            dark_min: 1.0
        }
        .is_fatal());
    }

    #[test]
    fn actuator_error_names_operation() {
        let err = DaqError::actuator("set_wavelength", "register write returned 4");
        let msg = err.to_string();
        assert!(msg.contains("set_wavelength"));
        assert!(msg.contains("register write returned 4"));
    }

    #[test]
    fn shutdown_failure_keeps_inner_errors() {
        let err = DaqError::ShutdownFailed(vec![
            DaqError::DeviceDisconnected("camera".into()),
            DaqError::actuator("rf_off", "timeout"),
        ]);
        match err {
            DaqError::ShutdownFailed(inner) => assert_eq!(inner.len(), 2),
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
