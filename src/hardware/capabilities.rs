//! Atomic Hardware Capabilities
//!
//! This module defines fine-grained capability traits the devices on the optical
//! path implement. Instead of one monolithic `Instrument` trait, each device
//! implements only what it actually supports:
//!
//! - The acousto-optic RF driver implements `WavelengthActuator + Releasable`
//! - The supercontinuum pump implements `EmissionControl + Releasable`
//! - A spectrometer implements `IntensitySensor + Releasable`
//! - A camera implements `ImageSensor + Releasable`
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Takes `&self`; implementations use interior mutability for state
//! - Returns `AppResult` so callers can tell fatal faults from local timeouts
//!
//! # Example
//!
//! ```rust,ignore
//! async fn probe<A, S>(source: &A, spectrometer: &S) -> AppResult<f64>
//! where
//!     A: WavelengthActuator,
//!     S: IntensitySensor,
//! {
//!     source.set_wavelength(550_000).await?;
//!     source.set_amplitude(Amplitude::clamped(500)).await?;
//!     source.set_rf_enabled(true).await?;
//!     tokio::time::sleep(Duration::from_millis(100)).await;
//!     let reading = spectrometer.read_intensities().await?;
//!     source.set_rf_enabled(false).await?;
//!     Ok(reading.iter().cloned().fold(f64::MIN, f64::max))
//! }
//! ```

use crate::error::{AppResult, DaqError};
use crate::hardware::{Amplitude, ImagePlane, IntensityReading, Picometres};
use async_trait::async_trait;
use std::time::Duration;

/// Capability: Wavelength-selective drive
///
/// The RF driver of an acousto-optic tunable filter: selects the emitted
/// wavelength and the drive strength that sets its optical power.
///
/// # Contract
/// - Every call must be acknowledged by the device; an unacknowledged command is
///   `DaqError::ActuatorComm` and is fatal to the run
/// - A physically absent device is `DaqError::DeviceDisconnected`
/// - Amplitudes arrive already clamped to `[1, 1000]`
#[async_trait]
pub trait WavelengthActuator: Send + Sync {
    /// Select the emitted wavelength, in picometres
    async fn set_wavelength(&self, wavelength: Picometres) -> AppResult<()>;

    /// Set the RF drive amplitude
    async fn set_amplitude(&self, amplitude: Amplitude) -> AppResult<()>;

    /// Enable or disable the RF drive
    async fn set_rf_enabled(&self, enabled: bool) -> AppResult<()>;
}

/// Capability: Source emission
///
/// The broadband pump feeding the filter. Switched on once per session and off at
/// release.
#[async_trait]
pub trait EmissionControl: Send + Sync {
    /// Turn emission on or off
    async fn set_emission(&self, on: bool) -> AppResult<()>;
}

/// Capability: Spectral intensity readout
///
/// Spectrometers reading a full intensity array over a fixed, sensor-defined
/// wavelength grid.
///
/// # Contract
/// - `wavelength_grid()` is immutable for the lifetime of the device and ordered
///   ascending, in nanometres
/// - every `read_intensities()` returns an array of the grid's length
/// - a read that does not complete in time is `DaqError::SensorTimeout`
#[async_trait]
pub trait IntensitySensor: Send + Sync {
    /// Set integration time for subsequent reads
    async fn set_integration_time(&self, micros: u32) -> AppResult<()>;

    /// Read one raw intensity array
    async fn read_intensities(&self) -> AppResult<IntensityReading>;

    /// Wavelength (nm) of every channel, ascending
    fn wavelength_grid(&self) -> &[f64];
}

/// Capability: Single-frame image capture
///
/// # Contract
/// - `capture` returns `Ok(None)` when no frame arrived within `timeout`; this is
///   local and non-fatal
/// - `Err` is reserved for faults that end the run (e.g. the camera disappearing)
/// - frame dimensions are fixed for a given configuration
#[async_trait]
pub trait ImageSensor: Send + Sync {
    /// Set exposure time for subsequent captures
    async fn set_exposure(&self, micros: f64) -> AppResult<()>;

    /// Capture exactly one frame, waiting at most `timeout`
    async fn capture(&self, timeout: Duration) -> AppResult<Option<ImagePlane>>;
}

/// Capability: Exclusive-session release
///
/// Puts the device in its safe idle state (RF off, emission off, acquisition
/// stopped) and closes the underlying handle. Called exactly once by
/// `HardwareSession`.
#[async_trait]
pub trait Releasable: Send + Sync {
    /// Human-readable device name for logs
    fn name(&self) -> &str;

    /// Return to a safe state and close the handle
    async fn release(&self) -> AppResult<()>;
}

/// Combined trait for the tunable source (actuator that can be released)
///
/// This trait exists solely to enable trait objects. Implement the individual
/// traits and get this automatically via blanket impl.
pub trait TunableSource: WavelengthActuator + Releasable {}

impl<T: WavelengthActuator + Releasable> TunableSource for T {}

/// Combined trait for spectrometers held by a session
pub trait Spectrometer: IntensitySensor + Releasable {}

impl<T: IntensitySensor + Releasable> Spectrometer for T {}

/// Combined trait for cameras held by a session
pub trait Camera: ImageSensor + Releasable {}

impl<T: ImageSensor + Releasable> Camera for T {}

/// Combined trait for the emission pump held by a session
pub trait PumpSource: EmissionControl + Releasable {}

impl<T: EmissionControl + Releasable> PumpSource for T {}

/// Index of the channel whose wavelength is nearest `target_nm`.
///
/// Nearest-index lookup, not interpolation: the sensor's native grid is fixed and
/// generally finer than the drive resolution. Ties resolve to the lower index.
/// Returns `None` for an empty grid.
pub fn nearest_channel(grid: &[f64], target_nm: f64) -> Option<usize> {
    grid.iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (idx, &nm)| {
            let distance = (nm - target_nm).abs();
            match best {
                Some((_, best_distance)) if best_distance <= distance => best,
                _ => Some((idx, distance)),
            }
        })
        .map(|(idx, _)| idx)
}

/// Bound on one spectrometer read when the caller configures none.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Read one intensity array, retrying exactly once after a `SensorTimeout`.
///
/// Each attempt is cut off after `limit`; a read that stalls past it counts as a
/// `SensorTimeout` like one the driver reports itself. Any other error, or a
/// second timeout, is returned to the caller, which decides whether it is fatal.
pub async fn read_with_retry<S>(sensor: &S, limit: Duration) -> AppResult<IntensityReading>
where
    S: IntensitySensor + ?Sized,
{
    match bounded_read(sensor, limit).await {
        Err(err) if err.is_timeout() => {
            tracing::warn!(error = %err, "Spectrometer read timed out, retrying once");
            bounded_read(sensor, limit).await
        }
        other => other,
    }
}

async fn bounded_read<S>(sensor: &S, limit: Duration) -> AppResult<IntensityReading>
where
    S: IntensitySensor + ?Sized,
{
    match tokio::time::timeout(limit, sensor.read_intensities()).await {
        Ok(result) => result,
        Err(_) => Err(DaqError::timeout("spectrometer", limit)),
    }
}
