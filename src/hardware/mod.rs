//! Hardware Layer
//!
//! Capability traits for the three devices sharing the optical path (tunable
//! source, spectrometer, camera), the data types they exchange, a scoped session
//! that guarantees release, and concrete implementations:
//!
//! - `capabilities` - async capability traits
//! - `session` - scoped ownership with guaranteed LIFO release
//! - `mock` - simulated optical bench for tests and dry runs
//! - `nktp` - register-level RF driver and supercontinuum source

pub mod capabilities;
pub mod mock;
pub mod nktp;
pub mod session;

pub use capabilities::{
    EmissionControl, ImageSensor, IntensitySensor, Releasable, WavelengthActuator,
};
pub use session::HardwareSession;

use crate::error::DaqError;
use serde::{Deserialize, Serialize};

/// Lowest drive amplitude ever written to the RF driver.
pub const AMPLITUDE_MIN: u16 = 1;
/// Highest drive amplitude ever written to the RF driver.
pub const AMPLITUDE_MAX: u16 = 1000;

/// Wavelength in picometres, the unit the RF driver is commanded in.
pub type Picometres = u32;

/// Real-valued spectrometer read, aligned to the sensor's fixed wavelength grid.
pub type IntensityReading = Vec<f64>;

/// RF drive amplitude, clamped to `[AMPLITUDE_MIN, AMPLITUDE_MAX]` at construction.
///
/// Serialized as the bare register value. Deserializing a value outside the
/// drive range is an error rather than a silent clamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct Amplitude(u16);

impl Amplitude {
    /// Lowest valid amplitude.
    pub const MIN: Amplitude = Amplitude(AMPLITUDE_MIN);
    /// Highest valid amplitude.
    pub const MAX: Amplitude = Amplitude(AMPLITUDE_MAX);

    /// Clamp any signed value into the valid drive range.
    pub fn clamped(value: i64) -> Self {
        Self(value.clamp(i64::from(AMPLITUDE_MIN), i64::from(AMPLITUDE_MAX)) as u16)
    }

    /// Round a real value and clamp it into the valid drive range.
    ///
    /// Non-finite input maps to the upper bound for `+inf` and the lower bound otherwise.
    pub fn from_f64_rounded(value: f64) -> Self {
        if value.is_nan() {
            return Self::MIN;
        }
        let rounded = value.round();
        if rounded >= f64::from(AMPLITUDE_MAX) {
            Self::MAX
        } else if rounded <= f64::from(AMPLITUDE_MIN) {
            Self::MIN
        } else {
            Self(rounded as u16)
        }
    }

    /// Raw register value.
    pub fn get(self) -> u16 {
        self.0
    }

    /// Step by a signed delta, clamping the result.
    pub fn offset(self, delta: i64) -> Self {
        Self::clamped(i64::from(self.0) + delta)
    }

    /// True when sitting on either end of the drive range.
    pub fn is_saturated(self) -> bool {
        self.0 == AMPLITUDE_MIN || self.0 == AMPLITUDE_MAX
    }
}

impl TryFrom<u16> for Amplitude {
    type Error = DaqError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        if (AMPLITUDE_MIN..=AMPLITUDE_MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(DaqError::Calibration(format!(
                "amplitude {} outside {}-{}",
                value, AMPLITUDE_MIN, AMPLITUDE_MAX
            )))
        }
    }
}

impl From<Amplitude> for u16 {
    fn from(amplitude: Amplitude) -> Self {
        amplitude.0
    }
}

impl std::fmt::Display for Amplitude {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One grayscale frame, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePlane {
    height: usize,
    width: usize,
    pixels: Vec<u16>,
}

impl ImagePlane {
    /// Wrap row-major pixels. Returns `None` when the buffer does not match the shape.
    pub fn new(height: usize, width: usize, pixels: Vec<u16>) -> Option<Self> {
        (pixels.len() == height * width).then_some(Self {
            height,
            width,
            pixels,
        })
    }

    /// Frame filled with a single value.
    pub fn filled(height: usize, width: usize, value: u16) -> Self {
        Self {
            height,
            width,
            pixels: vec![value; height * width],
        }
    }

    /// Number of rows.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Number of columns.
    pub fn width(&self) -> usize {
        self.width
    }

    /// `(height, width)`
    pub fn dimensions(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    /// Sample at `(row, col)`, if in bounds.
    pub fn get(&self, row: usize, col: usize) -> Option<u16> {
        (row < self.height && col < self.width).then(|| self.pixels[row * self.width + col])
    }

    /// Row-major samples.
    pub fn pixels(&self) -> &[u16] {
        &self.pixels
    }
}
