//! End-to-end hyperspectral run.
//!
//! ```text
//! open session -> references -> power normalization -> save table
//!              -> acquisition sweep -> release session -> spectrum + report
//! ```
//!
//! Every phase runs inside `HardwareSession::run`, so devices are released on
//! every exit path. Configuration and a reused calibration table are checked
//! before any device is touched. A fatal error leaves no calibration table
//! behind unless the controller phase already finished.

pub mod report;

pub use report::{CalibrationSource, RunReport};

use crate::acquisition::pipeline::{AcquisitionOutput, AcquisitionPipeline};
use crate::acquisition::spectrum::CumulativeSpectrum;
use crate::acquisition::sweep::SweepPlan;
use crate::acquisition::Hypercube;
use crate::calibration::controller::{LoopState, NormalizationOutcome, PowerNormalizationController};
use crate::calibration::reference::{ReferenceCalibrator, ReferenceTrigger};
use crate::calibration::table::CalibrationTable;
use crate::config::RunConfig;
use crate::error::AppResult;
use crate::hardware::session::{HardwareSession, SessionDevices};
use crate::storage::{self, ArtifactPaths};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

/// Whether the controller phase runs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Measure a fresh calibration table
    #[default]
    Calibrate,
    /// Skip the controller and use an existing table
    Reuse(PathBuf),
}

/// Products of a completed run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Calibration table used for compensation
    pub table: CalibrationTable,
    /// Completed hypercube
    pub hypercube: Hypercube,
    /// Cumulative diagnostic spectrum
    pub spectrum: CumulativeSpectrum,
    /// Run report
    pub report: RunReport,
    /// Artifact locations
    pub artifacts: ArtifactPaths,
}

struct Phases {
    table: CalibrationTable,
    outcomes: Vec<NormalizationOutcome>,
    acquisition: AcquisitionOutput,
}

/// One run over one configuration.
#[derive(Debug, Clone)]
pub struct HyperspectralRun {
    config: RunConfig,
    mode: RunMode,
}

impl HyperspectralRun {
    /// Run that measures its own calibration
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            mode: RunMode::Calibrate,
        }
    }

    /// Select calibrate or reuse
    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    /// Configuration
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Mode
    pub fn mode(&self) -> &RunMode {
        &self.mode
    }

    /// Acquire `devices`, run every phase, release, and write the artifacts.
    pub async fn execute(
        &self,
        devices: SessionDevices,
        trigger: Arc<dyn ReferenceTrigger>,
    ) -> AppResult<RunOutcome> {
        self.config.validate()?;
        let plan = SweepPlan::from_config(&self.config.sweep)?;
        let artifacts = ArtifactPaths::from_config(&self.config.storage);

        let (reused, calibration) = match &self.mode {
            RunMode::Calibrate => (None, CalibrationSource::Measured),
            RunMode::Reuse(path) => (
                Some(storage::load_calibration(path)?),
                CalibrationSource::Reused { path: path.clone() },
            ),
        };

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = tracing::info_span!("run", %run_id);
        tracing::info!(
            parent: &span,
            steps = plan.len(),
            min_pm = self.config.sweep.min_wavelength_pm,
            max_pm = self.config.sweep.max_wavelength_pm,
            "Starting hyperspectral run"
        );

        let session = HardwareSession::open(devices).instrument(span.clone()).await?;

        let config = self.config.clone();
        let calibration_path = artifacts.calibration.clone();
        let phases = session
            .run(move |hw| {
                Box::pin(async move {
                    run_phases(hw, &config, &plan, trigger.as_ref(), reused, &calibration_path)
                        .await
                })
            })
            .instrument(span.clone())
            .await?;

        let finished_at = Utc::now();
        let Phases {
            table,
            outcomes,
            acquisition,
        } = phases;

        let mut warnings: Vec<String> = outcomes
            .iter()
            .filter(|o| o.state == LoopState::Exhausted)
            .map(|o| {
                format!(
                    "{} pm did not converge in {} iterations; best-effort amplitude {} (count {})",
                    o.record.wavelength_pm, o.iterations, o.record.amplitude, o.record.achieved_count
                )
            })
            .collect();
        warnings.extend(acquisition.warnings);

        let report = RunReport {
            run_id,
            started_at,
            finished_at,
            config: self.config.clone(),
            calibration,
            normalization: outcomes,
            acquisition: acquisition.steps,
            hypercube_dimensions: acquisition.hypercube.dimensions(),
            populated_planes: acquisition.hypercube.populated_count(),
            warnings,
        };

        if self.config.storage.write_report {
            storage::save_spectrum(&artifacts.spectrum, &acquisition.spectrum)?;
            storage::save_json(&artifacts.report, &report)?;
        }

        tracing::info!(
            parent: &span,
            planes = report.populated_planes,
            warnings = report.warnings.len(),
            "Run complete"
        );

        Ok(RunOutcome {
            table,
            hypercube: acquisition.hypercube,
            spectrum: acquisition.spectrum,
            report,
            artifacts,
        })
    }
}

async fn run_phases(
    hw: &HardwareSession,
    config: &RunConfig,
    plan: &SweepPlan,
    trigger: &dyn ReferenceTrigger,
    reused: Option<CalibrationTable>,
    calibration_path: &Path,
) -> AppResult<Phases> {
    let integration_time_us = config.acquisition.integration_time_us;

    let read_timeout = config.acquisition.read_timeout;

    let refs = ReferenceCalibrator::new(hw.spectrometer(), integration_time_us)
        .with_read_timeout(read_timeout)
        .run(trigger)
        .await?;

    let (table, outcomes) = match reused {
        Some(table) => {
            tracing::info!(records = table.len(), "Reusing calibration table");
            (table, Vec::new())
        }
        None => {
            let controller =
                PowerNormalizationController::new(config.normalization.clone(), integration_time_us)
                    .with_read_timeout(read_timeout);
            let run = controller
                .calibrate(hw.source(), hw.spectrometer(), &refs, plan.wavelengths())
                .await?;
            storage::save_calibration(calibration_path, &run.table)?;
            (run.table, run.outcomes)
        }
    };

    let acquisition = AcquisitionPipeline::new(config.acquisition.clone())
        .run(
            hw.source(),
            hw.spectrometer(),
            hw.camera(),
            &refs,
            &table.compensation(),
            plan,
        )
        .await?;

    Ok(Phases {
        table,
        outcomes,
        acquisition,
    })
}
