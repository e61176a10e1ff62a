//! Power-Normalization Controller
//!
//! For each wavelength, a bounded feedback loop adjusts the RF drive amplitude
//! until the calibrated detector count at that wavelength is within tolerance of a
//! target, or the iteration budget runs out.
//!
//! # Loop
//!
//! ```text
//! SEEKING --|count - target| <= tolerance--> CONVERGED
//!    |
//!    +-----iteration budget spent-----------> EXHAUSTED
//! ```
//!
//! One iteration: set wavelength, set amplitude, RF on, dwell, read, RF off,
//! evaluate. A miss steps the amplitude by `clamp(trunc(|error| / 3), 1, 100)`
//! towards the target, clamped to `[1, 1000]`.
//!
//! The pure stepping logic lives in `NormalizationLoop` so the termination
//! contract can be exercised without hardware. EXHAUSTED is not an error: the
//! best-effort record is kept, a warning is logged, and the sweep continues.

use crate::calibration::reference::ReferenceData;
use crate::calibration::table::{CalibrationRecord, CalibrationTable};
use crate::config::NormalizationConfig;
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{
    read_with_retry, IntensitySensor, WavelengthActuator, DEFAULT_READ_TIMEOUT,
};
use crate::hardware::{Amplitude, Picometres};
use serde::{Deserialize, Serialize};
use tracing::Instrument;
use std::time::Duration;

/// Largest single amplitude correction.
pub const MAX_STEP: i64 = 100;
/// Smallest single amplitude correction.
pub const MIN_STEP: i64 = 1;
/// Error divisor limiting correction aggressiveness.
const STEP_DIVISOR: f64 = 3.0;

/// Per-wavelength loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    /// Still adjusting
    Seeking,
    /// Count within tolerance
    Converged,
    /// Iteration budget spent without convergence; best-effort record
    Exhausted,
}

impl LoopState {
    /// True for `Converged` and `Exhausted`
    pub fn is_terminal(self) -> bool {
        !matches!(self, LoopState::Seeking)
    }
}

/// Bounded proportional step for a count error.
pub fn next_step(error: f64) -> i64 {
    let magnitude = (error.abs() / STEP_DIVISOR).trunc();
    if magnitude.is_nan() {
        return MIN_STEP;
    }
    // `as` saturates for out-of-range floats
    (magnitude as i64).clamp(MIN_STEP, MAX_STEP)
}

/// Pure state machine for one wavelength.
#[derive(Debug, Clone)]
pub struct NormalizationLoop {
    target: f64,
    tolerance: f64,
    max_iterations: u32,
    amplitude: Amplitude,
    iterations: u32,
    state: LoopState,
    last: Option<(Amplitude, f64)>,
}

impl NormalizationLoop {
    /// Fresh loop at the configured seed amplitude
    pub fn new(params: &NormalizationConfig) -> Self {
        Self {
            target: params.target_count,
            tolerance: params.tolerance,
            max_iterations: params.max_iterations,
            amplitude: Amplitude::clamped(i64::from(params.seed_amplitude)),
            iterations: 0,
            state: LoopState::Seeking,
            last: None,
        }
    }

    /// Amplitude to drive on the next iteration
    pub fn amplitude(&self) -> Amplitude {
        self.amplitude
    }

    /// Current state
    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Iterations evaluated so far
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Feed the count measured at `self.amplitude()` and advance.
    ///
    /// Has no effect once terminal. A zero budget behaves like a budget of one.
    pub fn observe(&mut self, count: f64) -> LoopState {
        if self.state.is_terminal() {
            return self.state;
        }

        self.iterations += 1;
        self.last = Some((self.amplitude, count));

        let error = self.target - count;
        if error.abs() <= self.tolerance {
            self.state = LoopState::Converged;
            return self.state;
        }

        let step = next_step(error);
        let delta = if count < self.target { step } else { -step };
        self.amplitude = self.amplitude.offset(delta);

        if self.iterations >= self.max_iterations {
            self.state = LoopState::Exhausted;
        }
        self.state
    }

    /// Record for `wavelength_pm`: the last measured count with the amplitude that
    /// produced it. `None` before any observation.
    pub fn record(&self, wavelength_pm: Picometres) -> Option<CalibrationRecord> {
        // Exhausted loops keep the measured pair, not the unmeasured adjusted amplitude
        self.last
            .map(|(amplitude, count)| CalibrationRecord::new(wavelength_pm, amplitude, count))
    }
}

/// Terminal result at one wavelength.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationOutcome {
    /// Best-effort or converged record
    pub record: CalibrationRecord,
    /// `Converged` or `Exhausted`
    pub state: LoopState,
    /// Iterations spent
    pub iterations: u32,
}

/// Result of a controller pass over a sweep.
#[derive(Debug, Clone)]
pub struct CalibrationRun {
    /// Frozen calibration table
    pub table: CalibrationTable,
    /// One outcome per wavelength, in sweep order
    pub outcomes: Vec<NormalizationOutcome>,
}

impl CalibrationRun {
    /// Outcomes that hit the iteration budget
    pub fn exhausted(&self) -> impl Iterator<Item = &NormalizationOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.state == LoopState::Exhausted)
    }
}

/// Closed-loop amplitude calibration over a sweep.
pub struct PowerNormalizationController {
    params: NormalizationConfig,
    integration_time_us: u32,
    read_timeout: Duration,
}

impl PowerNormalizationController {
    /// Controller reading the spectrometer at `integration_time_us`
    pub fn new(params: NormalizationConfig, integration_time_us: u32) -> Self {
        Self {
            params,
            integration_time_us,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    /// Bound each spectrometer read at `limit`
    pub fn with_read_timeout(mut self, limit: Duration) -> Self {
        self.read_timeout = limit;
        self
    }

    /// Normalization parameters
    pub fn params(&self) -> &NormalizationConfig {
        &self.params
    }

    /// Run the loop at one wavelength.
    ///
    /// Actuator faults and a spectrometer that times out twice in a row are fatal
    /// and propagate; exhaustion is reported in the outcome.
    pub async fn normalize_wavelength<A, S>(
        &self,
        source: &A,
        spectrometer: &S,
        refs: &ReferenceData,
        wavelength_pm: Picometres,
    ) -> AppResult<NormalizationOutcome>
    where
        A: WavelengthActuator + ?Sized,
        S: IntensitySensor + ?Sized,
    {
        let mut state = NormalizationLoop::new(&self.params);

        while !state.state().is_terminal() {
            let amplitude = state.amplitude();

            source.set_wavelength(wavelength_pm).await?;
            source.set_amplitude(amplitude).await?;
            source.set_rf_enabled(true).await?;

            tokio::time::sleep(self.params.dwell).await;

            spectrometer
                .set_integration_time(self.integration_time_us)
                .await?;
            let raw = read_with_retry(spectrometer, self.read_timeout).await?;
            let count = refs.count_at(&raw, wavelength_pm)?;

            source.set_rf_enabled(false).await?;

            let next = state.observe(count);
            tracing::debug!(
                iteration = state.iterations(),
                amplitude = amplitude.get(),
                count,
                state = ?next,
                "Normalization iteration"
            );
        }

        let record = match state.record(wavelength_pm) {
            Some(record) => record,
            None => {
                return Err(DaqError::Calibration(format!(
                    "no measurement taken at {} pm",
                    wavelength_pm
                )))
            }
        };

        match state.state() {
            LoopState::Exhausted => tracing::warn!(
                wavelength_pm,
                iterations = state.iterations(),
                amplitude = record.amplitude.get(),
                count = record.achieved_count,
                saturated = record.amplitude.is_saturated(),
                "Max iterations reached without convergence; keeping best-effort amplitude"
            ),
            _ => tracing::info!(
                wavelength_pm,
                iterations = state.iterations(),
                amplitude = record.amplitude.get(),
                count = record.achieved_count,
                "Target reached"
            ),
        }

        Ok(NormalizationOutcome {
            record,
            state: state.state(),
            iterations: state.iterations(),
        })
    }

    /// Calibrate every wavelength in order and freeze the table.
    pub async fn calibrate<A, S>(
        &self,
        source: &A,
        spectrometer: &S,
        refs: &ReferenceData,
        wavelengths: &[Picometres],
    ) -> AppResult<CalibrationRun>
    where
        A: WavelengthActuator + ?Sized,
        S: IntensitySensor + ?Sized,
    {
        let mut outcomes = Vec::with_capacity(wavelengths.len());

        for (index, &wavelength_pm) in wavelengths.iter().enumerate() {
            let span = tracing::info_span!("normalize", index, wavelength_pm);
            let outcome = self
                .normalize_wavelength(source, spectrometer, refs, wavelength_pm)
                .instrument(span)
                .await?;
            outcomes.push(outcome);
        }

        let table = CalibrationTable::new(outcomes.iter().map(|o| o.record).collect())?;
        let exhausted = outcomes
            .iter()
            .filter(|o| o.state == LoopState::Exhausted)
            .count();
        tracing::info!(
            wavelengths = table.len(),
            exhausted,
            "Power normalization complete"
        );

        Ok(CalibrationRun { table, outcomes })
    }
}
