//! Run report.
//!
//! The report is the run's record of everything non-fatal: which wavelengths
//! converged and which were kept best-effort, which steps lost a frame or a
//! spectrometer read, and every warning raised along the way.

use crate::acquisition::pipeline::StepDiagnostics;
use crate::calibration::controller::{LoopState, NormalizationOutcome};
use crate::config::RunConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Where the calibration table of a run came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CalibrationSource {
    /// Measured by the power-normalization controller in this run
    Measured,
    /// Loaded from an existing file
    Reused {
        /// File the table was loaded from
        path: PathBuf,
    },
}

/// JSON summary written next to the run's other artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Unique run id
    pub run_id: Uuid,
    /// Session opened
    pub started_at: DateTime<Utc>,
    /// Session released
    pub finished_at: DateTime<Utc>,
    /// Configuration the run used
    pub config: RunConfig,
    /// Origin of the calibration table
    pub calibration: CalibrationSource,
    /// Per-wavelength controller outcomes (empty when reused)
    pub normalization: Vec<NormalizationOutcome>,
    /// Per-step acquisition diagnostics
    pub acquisition: Vec<StepDiagnostics>,
    /// `(height, width, steps)` of the hypercube
    pub hypercube_dimensions: (usize, usize, usize),
    /// Planes actually captured
    pub populated_planes: usize,
    /// Every non-fatal condition, in order
    pub warnings: Vec<String>,
}

impl RunReport {
    /// Wavelengths whose record is best-effort
    pub fn exhausted_wavelengths(&self) -> Vec<u32> {
        self.normalization
            .iter()
            .filter(|o| o.state == LoopState::Exhausted)
            .map(|o| o.record.wavelength_pm)
            .collect()
    }

    /// Steps whose plane is missing
    pub fn missing_planes(&self) -> Vec<usize> {
        self.acquisition
            .iter()
            .filter(|s| !s.captured)
            .map(|s| s.index)
            .collect()
    }

    /// Wall-clock duration
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}
