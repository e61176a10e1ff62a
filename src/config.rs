//! Run Configuration using Figment
//!
//! This module provides strongly-typed configuration loading for a hyperspectral run.
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, `config/hypercube.toml` by default)
//! 2. Environment variables (prefixed with `HYPERCUBE_DAQ_`, nested keys split on `__`)
//!
//! # Example
//! ```no_run
//! use hypercube_daq::config::RunConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RunConfig::load()?;
//! config.validate()?;
//! println!("Sweep: {} pm to {} pm", config.sweep.min_wavelength_pm, config.sweep.max_wavelength_pm);
//! # Ok(())
//! # }
//! ```

use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::DEFAULT_READ_TIMEOUT;
use crate::hardware::{AMPLITUDE_MAX, AMPLITUDE_MIN};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/hypercube.toml";

/// Top-level run configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Wavelength sweep range
    pub sweep: SweepConfig,
    /// Power-normalization controller settings
    pub normalization: NormalizationConfig,
    /// Camera and spectrometer settings for the acquisition sweep
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Artifact output settings
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Wavelength sweep definition, in picometres
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SweepConfig {
    pub min_wavelength_pm: u32,
    pub max_wavelength_pm: u32,
    pub steps: usize,
}

/// Closed-loop power normalization parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizationConfig {
    /// Calibrated detector count to aim for at every wavelength
    pub target_count: f64,
    /// Accepted absolute deviation from the target
    pub tolerance: f64,
    /// Iteration budget per wavelength
    pub max_iterations: u32,
    /// Amplitude every wavelength starts from
    #[serde(default = "default_seed_amplitude")]
    pub seed_amplitude: u16,
    /// Wait between RF enable and measurement
    #[serde(default = "default_dwell", with = "humantime_serde")]
    pub dwell: Duration,
}

/// Acquisition sweep settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AcquisitionConfig {
    /// Camera exposure time in microseconds
    #[serde(default = "default_exposure_us")]
    pub exposure_us: f64,
    /// Spectrometer integration time in microseconds
    #[serde(default = "default_integration_time_us")]
    pub integration_time_us: u32,
    /// Wait between RF enable and reading during the sweep
    #[serde(default = "default_settle", with = "humantime_serde")]
    pub settle: Duration,
    /// Bound on a single camera capture
    #[serde(default = "default_capture_timeout", with = "humantime_serde")]
    pub capture_timeout: Duration,
    /// Bound on a single spectrometer read, in every phase of the run
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,
}

/// Artifact output configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Directory every artifact is written into
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Calibration table file name (inside `output_dir`)
    #[serde(default = "default_calibration_file")]
    pub calibration_file: String,
    /// Whether to write `run_report.json` and `cumulative_spectrum.csv`
    #[serde(default = "default_write_report")]
    pub write_report: bool,
}

// Default value functions
fn default_name() -> String {
    "Hypercube DAQ".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_seed_amplitude() -> u16 {
    500
}

fn default_dwell() -> Duration {
    Duration::from_millis(100)
}

fn default_exposure_us() -> f64 {
    74_920.0
}

fn default_integration_time_us() -> u32 {
    10_000
}

fn default_settle() -> Duration {
    Duration::from_millis(50)
}

fn default_capture_timeout() -> Duration {
    Duration::from_millis(2000)
}

fn default_read_timeout() -> Duration {
    DEFAULT_READ_TIMEOUT
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_calibration_file() -> String {
    "calibration_results.csv".to_string()
}

fn default_write_report() -> bool {
    true
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            exposure_us: default_exposure_us(),
            integration_time_us: default_integration_time_us(),
            settle: default_settle(),
            capture_timeout: default_capture_timeout(),
            read_timeout: default_read_timeout(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            calibration_file: default_calibration_file(),
            write_report: default_write_report(),
        }
    }
}

impl NormalizationConfig {
    /// Normalization settings with the default seed amplitude and dwell.
    pub fn new(target_count: f64, tolerance: f64, max_iterations: u32) -> Self {
        Self {
            target_count,
            tolerance,
            max_iterations,
            seed_amplitude: default_seed_amplitude(),
            dwell: default_dwell(),
        }
    }
}

impl RunConfig {
    /// Load configuration from the default path and environment variables
    ///
    /// Environment variables can override configuration with prefix `HYPERCUBE_DAQ_`.
    /// Example: `HYPERCUBE_DAQ_NORMALIZATION__TARGET_COUNT=2000`
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("HYPERCUBE_DAQ_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Load from an in-memory TOML document (no environment overrides)
    pub fn from_toml_str(source: &str) -> AppResult<Self> {
        let config = Figment::new().merge(Toml::string(source)).extract()?;
        Ok(config)
    }

    /// Layer a serialized configuration under the environment, for callers that
    /// build the base configuration programmatically.
    pub fn with_env_overrides(self) -> AppResult<Self> {
        let config = Figment::from(Serialized::defaults(self))
            .merge(Env::prefixed("HYPERCUBE_DAQ_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.sweep.min_wavelength_pm > self.sweep.max_wavelength_pm {
            return Err(DaqError::Configuration(format!(
                "Sweep minimum {} pm exceeds maximum {} pm",
                self.sweep.min_wavelength_pm, self.sweep.max_wavelength_pm
            )));
        }

        if self.sweep.steps == 0 {
            return Err(DaqError::Configuration(
                "Sweep must have at least one step".to_string(),
            ));
        }

        let norm = &self.normalization;
        if !norm.target_count.is_finite() || !norm.tolerance.is_finite() || norm.tolerance < 0.0 {
            return Err(DaqError::Configuration(format!(
                "Invalid normalization target {} / tolerance {}",
                norm.target_count, norm.tolerance
            )));
        }

        if norm.max_iterations == 0 {
            return Err(DaqError::Configuration(
                "max_iterations must be at least 1".to_string(),
            ));
        }

        if !(AMPLITUDE_MIN..=AMPLITUDE_MAX).contains(&norm.seed_amplitude) {
            return Err(DaqError::Configuration(format!(
                "Invalid seed_amplitude {}. Must be {}-{}",
                norm.seed_amplitude, AMPLITUDE_MIN, AMPLITUDE_MAX
            )));
        }

        if self.acquisition.exposure_us <= 0.0 || self.acquisition.integration_time_us == 0 {
            return Err(DaqError::Configuration(
                "Exposure and integration times must be positive".to_string(),
            ));
        }

        if self.acquisition.capture_timeout.is_zero() || self.acquisition.read_timeout.is_zero() {
            return Err(DaqError::Configuration(
                "capture_timeout and read_timeout must be positive".to_string(),
            ));
        }

        if self.acquisition.settle > norm.dwell {
            tracing::warn!(
                settle = ?self.acquisition.settle,
                dwell = ?norm.dwell,
                "Acquisition settle is longer than the calibration dwell"
            );
        }

        Ok(())
    }

    /// Full path of the calibration table artifact
    pub fn calibration_path(&self) -> PathBuf {
        self.storage.output_dir.join(&self.storage.calibration_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RunConfig {
        RunConfig {
            application: ApplicationConfig::default(),
            sweep: SweepConfig {
                min_wavelength_pm: 500_000,
                max_wavelength_pm: 650_000,
                steps: 20,
            },
            normalization: NormalizationConfig::new(1000.0, 50.0, 10),
            acquisition: AcquisitionConfig::default(),
            storage: StorageConfig::default(),
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = sample();
        config.application.log_level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inverted_sweep_rejected() {
        let mut config = sample();
        config.sweep.min_wavelength_pm = 700_000;
        assert!(matches!(
            config.validate(),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn test_seed_amplitude_out_of_range() {
        let mut config = sample();
        config.normalization.seed_amplitude = 0;
        assert!(config.validate().is_err());
        config.normalization.seed_amplitude = 1001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_read_timeout_rejected() {
        let mut config = sample();
        config.acquisition.read_timeout = Duration::ZERO;
        assert!(matches!(config.validate(), Err(DaqError::Configuration(_))));
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let mut config = sample();
        config.normalization.max_iterations = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_defaults_fill_in() {
        let config = RunConfig::from_toml_str(
            r#"
            [sweep]
            min_wavelength_pm = 500000
            max_wavelength_pm = 650000
            steps = 4

            [normalization]
            target_count = 1000.0
            tolerance = 50.0
            max_iterations = 12
            dwell = "150ms"
            "#,
        )
        .unwrap();

        assert_eq!(config.normalization.seed_amplitude, 500);
        assert_eq!(config.normalization.dwell, Duration::from_millis(150));
        assert_eq!(config.acquisition.settle, Duration::from_millis(50));
        assert_eq!(config.acquisition.capture_timeout, Duration::from_secs(2));
        assert_eq!(config.acquisition.read_timeout, Duration::from_secs(5));
        assert_eq!(
            config.calibration_path(),
            PathBuf::from("data").join("calibration_results.csv")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_section_is_config_error() {
        let result = RunConfig::from_toml_str("[sweep]\nmin_wavelength_pm = 1\n");
        assert!(matches!(result, Err(DaqError::Config(_))));
    }
}
