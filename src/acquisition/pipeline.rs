//! Acquisition Pipeline
//!
//! Sweeps the configured wavelengths with pre-compensated drive amplitudes. Each
//! step runs strictly in order:
//!
//! 1. factor = compensation factor at the wavelength, amplitude = round(1000 / factor)
//! 2. set wavelength, set amplitude, RF on, settle
//! 3. read the spectrometer, subtract the dark reference, accumulate
//! 4. capture one frame into the hypercube plane for this step
//! 5. RF off
//!
//! Spectrometer and camera timeouts are local: the step is recorded as partial and
//! the sweep continues. A capture that overruns twice its timeout counts as a
//! camera timeout. Actuator faults and disconnects abort the sweep.
//!
//! Run-wide mutable state (accumulator, hypercube, diagnostics) lives in an
//! `AcquisitionContext` owned by one `run` call.

use crate::acquisition::hypercube::Hypercube;
use crate::acquisition::spectrum::{peak_index, CumulativeSpectrum, SpectrumAccumulator};
use crate::acquisition::sweep::SweepPlan;
use crate::calibration::reference::ReferenceData;
use crate::calibration::table::CompensationFunction;
use crate::config::AcquisitionConfig;
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{
    read_with_retry, ImageSensor, IntensitySensor, WavelengthActuator,
};
use crate::hardware::{Amplitude, ImagePlane, Picometres};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

/// What happened at one sweep step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDiagnostics {
    /// Position in the sweep
    pub index: usize,
    /// Commanded wavelength
    pub wavelength_pm: Picometres,
    /// Compensation factor from the table
    pub compensation_factor: f64,
    /// Drive amplitude written
    pub amplitude: Amplitude,
    /// Spectrometer read succeeded and was accumulated
    pub spectrum_ok: bool,
    /// Frame captured and written into the hypercube
    pub captured: bool,
    /// Wavelength (nm) of this step's background-subtracted maximum
    pub peak_nm: Option<f64>,
}

/// Everything a finished sweep hands back.
#[derive(Debug, Clone)]
pub struct AcquisitionOutput {
    /// Completed hypercube
    pub hypercube: Hypercube,
    /// Cumulative and compensated spectrum
    pub spectrum: CumulativeSpectrum,
    /// One entry per step
    pub steps: Vec<StepDiagnostics>,
    /// Non-fatal conditions, human readable
    pub warnings: Vec<String>,
}

/// Mutable state of one sweep.
struct AcquisitionContext {
    steps_total: usize,
    cube: Option<Hypercube>,
    accumulator: SpectrumAccumulator,
    steps: Vec<StepDiagnostics>,
    warnings: Vec<String>,
}

impl AcquisitionContext {
    fn new(steps_total: usize, grid: Vec<f64>) -> Self {
        Self {
            steps_total,
            cube: None,
            accumulator: SpectrumAccumulator::new(grid),
            steps: Vec::with_capacity(steps_total),
            warnings: Vec::new(),
        }
    }

    /// Dimensions come from the first frame that arrives.
    fn fix_dimensions(&mut self, plane: &ImagePlane) {
        if self.cube.is_none() {
            let (height, width) = plane.dimensions();
            tracing::info!(height, width, "Hypercube dimensions fixed");
            self.cube = Some(Hypercube::new(height, width, self.steps_total));
        }
    }

    fn warn(&mut self, message: String) {
        tracing::warn!("{}", message);
        self.warnings.push(message);
    }
}

/// Compensated wavelength sweep with synchronized spectrometer and camera.
pub struct AcquisitionPipeline {
    config: AcquisitionConfig,
}

impl AcquisitionPipeline {
    /// Pipeline with the given timing and sensor settings
    pub fn new(config: AcquisitionConfig) -> Self {
        Self { config }
    }

    /// Run the sweep over `plan`.
    pub async fn run<A, S, C>(
        &self,
        source: &A,
        spectrometer: &S,
        camera: &C,
        refs: &ReferenceData,
        compensation: &CompensationFunction,
        plan: &SweepPlan,
    ) -> AppResult<AcquisitionOutput>
    where
        A: WavelengthActuator + ?Sized,
        S: IntensitySensor + ?Sized,
        C: ImageSensor + ?Sized,
    {
        let mut ctx = AcquisitionContext::new(plan.len(), refs.grid().to_vec());

        spectrometer
            .set_integration_time(self.config.integration_time_us)
            .await?;
        camera.set_exposure(self.config.exposure_us).await?;

        self.probe(camera, &mut ctx).await?;

        for (index, &wavelength_pm) in plan.wavelengths().iter().enumerate() {
            let span = tracing::info_span!("acquire", index, wavelength_pm);
            let step = self
                .step(
                    source,
                    spectrometer,
                    camera,
                    refs,
                    compensation,
                    &mut ctx,
                    index,
                    wavelength_pm,
                )
                .instrument(span)
                .await?;
            ctx.steps.push(step);
        }

        let AcquisitionContext {
            steps_total,
            cube,
            accumulator,
            steps,
            warnings,
        } = ctx;

        let hypercube = cube.unwrap_or_else(|| Hypercube::empty(steps_total));
        let spectrum = accumulator.finish(compensation);
        tracing::info!(
            steps = steps.len(),
            planes = hypercube.populated_count(),
            warnings = warnings.len(),
            "Acquisition sweep complete"
        );

        Ok(AcquisitionOutput {
            hypercube,
            spectrum,
            steps,
            warnings,
        })
    }

    /// Preliminary capture that fixes the hypercube dimensions.
    async fn probe<C>(&self, camera: &C, ctx: &mut AcquisitionContext) -> AppResult<()>
    where
        C: ImageSensor + ?Sized,
    {
        match self.bounded_capture(camera).await {
            Ok(Some(plane)) => ctx.fix_dimensions(&plane),
            Ok(None) => ctx.warn(
                "Probe capture timed out; hypercube dimensions deferred to first successful capture"
                    .to_string(),
            ),
            Err(err) if err.is_timeout() => ctx.warn(format!(
                "Probe capture failed ({}); hypercube dimensions deferred",
                err
            )),
            Err(err) => return Err(err),
        }
        Ok(())
    }

    /// Capture with an outer bound of twice the camera's own timeout, so a camera
    /// that ignores its timeout still only costs one missed frame.
    async fn bounded_capture<C>(&self, camera: &C) -> AppResult<Option<ImagePlane>>
    where
        C: ImageSensor + ?Sized,
    {
        let limit = self.config.capture_timeout.saturating_mul(2);
        match tokio::time::timeout(limit, camera.capture(self.config.capture_timeout)).await {
            Ok(result) => result,
            Err(_) => Err(DaqError::timeout("camera", limit)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn step<A, S, C>(
        &self,
        source: &A,
        spectrometer: &S,
        camera: &C,
        refs: &ReferenceData,
        compensation: &CompensationFunction,
        ctx: &mut AcquisitionContext,
        index: usize,
        wavelength_pm: Picometres,
    ) -> AppResult<StepDiagnostics>
    where
        A: WavelengthActuator + ?Sized,
        S: IntensitySensor + ?Sized,
        C: ImageSensor + ?Sized,
    {
        let compensation_factor = compensation.compensation_factor(f64::from(wavelength_pm));
        let amplitude = compensation.drive_amplitude(f64::from(wavelength_pm));

        source.set_wavelength(wavelength_pm).await?;
        source.set_amplitude(amplitude).await?;
        source.set_rf_enabled(true).await?;
        tokio::time::sleep(self.config.settle).await;

        let read = read_with_retry(spectrometer, self.config.read_timeout).await;
        let (spectrum_ok, peak_nm) = match read {
            Ok(raw) => {
                let background_subtracted = refs.subtract_dark(&raw)?;
                ctx.accumulator.accumulate(&background_subtracted)?;
                let peak = peak_index(&background_subtracted).map(|idx| refs.grid()[idx]);
                (true, peak)
            }
            Err(err) if err.is_timeout() => {
                ctx.warn(format!(
                    "Spectrometer read at {} pm (step {}) failed twice ({}); not accumulated",
                    wavelength_pm, index, err
                ));
                (false, None)
            }
            Err(err) => return Err(err),
        };

        let captured = match self.bounded_capture(camera).await {
            Ok(Some(plane)) => {
                ctx.fix_dimensions(&plane);
                let written = ctx
                    .cube
                    .as_mut()
                    .map_or(false, |cube| cube.write_plane(index, &plane));
                if !written {
                    ctx.warn(format!(
                        "Frame at {} pm (step {}) has dimensions {:?}, expected fixed hypercube dimensions; plane left empty",
                        wavelength_pm,
                        index,
                        plane.dimensions()
                    ));
                }
                written
            }
            Ok(None) => {
                ctx.warn(format!(
                    "Capture at {} pm (step {}) timed out; plane left empty",
                    wavelength_pm, index
                ));
                false
            }
            Err(err) if err.is_timeout() => {
                ctx.warn(format!(
                    "Capture at {} pm (step {}) failed ({}); plane left empty",
                    wavelength_pm, index, err
                ));
                false
            }
            Err(err) => return Err(err),
        };

        source.set_rf_enabled(false).await?;

        tracing::debug!(
            factor = compensation_factor,
            amplitude = amplitude.get(),
            spectrum_ok,
            captured,
            "Step complete"
        );

        Ok(StepDiagnostics {
            index,
            wavelength_pm,
            compensation_factor,
            amplitude,
            spectrum_ok,
            captured,
            peak_nm,
        })
    }
}
