//! Calibration table and the compensation function derived from it.
//!
//! The table holds one `CalibrationRecord` per calibrated wavelength, sorted and
//! unique. `CompensationFunction` turns it into a piecewise-linear interpolant that
//! is exact at the nodes and extends the boundary segments' slopes outside the
//! table's range instead of clamping.

use crate::error::{AppResult, DaqError};
use crate::hardware::{Amplitude, Picometres, AMPLITUDE_MAX};
use serde::{Deserialize, Serialize};

/// Outcome of power normalization at one wavelength.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    /// Calibrated wavelength
    #[serde(rename = "Wavelength (pm)")]
    pub wavelength_pm: Picometres,
    /// Final drive amplitude
    #[serde(rename = "Amplitude")]
    pub amplitude: Amplitude,
    /// Calibrated detector count achieved with `amplitude`
    #[serde(rename = "Count")]
    pub achieved_count: f64,
}

impl CalibrationRecord {
    /// Bundle a record
    pub fn new(wavelength_pm: Picometres, amplitude: Amplitude, achieved_count: f64) -> Self {
        Self {
            wavelength_pm,
            amplitude,
            achieved_count,
        }
    }
}

/// Ordered, wavelength-unique collection of calibration records.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationTable {
    records: Vec<CalibrationRecord>,
}

impl CalibrationTable {
    /// Sort `records` by wavelength and freeze them.
    ///
    /// Fails when the table would be empty or two records share a wavelength.
    pub fn new(mut records: Vec<CalibrationRecord>) -> AppResult<Self> {
        if records.is_empty() {
            return Err(DaqError::Calibration(
                "calibration table has no records".to_string(),
            ));
        }

        records.sort_by_key(|r| r.wavelength_pm);
        if let Some(pair) = records
            .windows(2)
            .find(|pair| pair[0].wavelength_pm == pair[1].wavelength_pm)
        {
            return Err(DaqError::Calibration(format!(
                "duplicate calibration wavelength {} pm",
                pair[0].wavelength_pm
            )));
        }

        Ok(Self { records })
    }

    /// Records in ascending wavelength order
    pub fn records(&self) -> &[CalibrationRecord] {
        &self.records
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Always false; an empty table cannot be constructed
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// `(min, max)` wavelength covered by the nodes
    pub fn range(&self) -> (Picometres, Picometres) {
        let first = self.records.first().map_or(0, |r| r.wavelength_pm);
        let last = self.records.last().map_or(0, |r| r.wavelength_pm);
        (first, last)
    }

    /// Interpolant over this table
    pub fn compensation(&self) -> CompensationFunction {
        CompensationFunction::new(self)
    }
}

/// Piecewise-linear amplitude model over a `CalibrationTable`.
#[derive(Debug, Clone, PartialEq)]
pub struct CompensationFunction {
    wavelengths: Vec<f64>,
    amplitudes: Vec<f64>,
}

impl CompensationFunction {
    /// Build the interpolant
    pub fn new(table: &CalibrationTable) -> Self {
        Self {
            wavelengths: table
                .records()
                .iter()
                .map(|r| f64::from(r.wavelength_pm))
                .collect(),
            amplitudes: table
                .records()
                .iter()
                .map(|r| f64::from(r.amplitude.get()))
                .collect(),
        }
    }

    /// Interpolated amplitude at `wavelength_pm`.
    ///
    /// Exact at every node. Outside the node range the first/last segment is
    /// extended linearly. A single-node table is constant.
    pub fn amplitude_at(&self, wavelength_pm: f64) -> f64 {
        let n = self.wavelengths.len();
        if n == 0 {
            return 0.0;
        }
        if n == 1 {
            return self.amplitudes[0];
        }

        let anchor = match self
            .wavelengths
            .binary_search_by(|w| w.total_cmp(&wavelength_pm))
        {
            Ok(exact) => return self.amplitudes[exact],
            Err(0) => 0,
            Err(insert) if insert >= n => n - 1,
            Err(insert) => insert - 1,
        };

        // Segment used for the slope: the one starting at `anchor`, or the last one
        let segment = anchor.min(n - 2);
        let slope = (self.amplitudes[segment + 1] - self.amplitudes[segment])
            / (self.wavelengths[segment + 1] - self.wavelengths[segment]);

        self.amplitudes[anchor] + (wavelength_pm - self.wavelengths[anchor]) * slope
    }

    /// `1 / (amplitude_at / 1000)`, or unity when the interpolant is not positive.
    pub fn compensation_factor(&self, wavelength_pm: f64) -> f64 {
        let normalized = self.amplitude_at(wavelength_pm) / f64::from(AMPLITUDE_MAX);
        if normalized > 0.0 {
            1.0 / normalized
        } else {
            1.0
        }
    }

    /// Drive amplitude for acquisition: `clamp(round(1000 / factor), 1, 1000)`.
    pub fn drive_amplitude(&self, wavelength_pm: f64) -> Amplitude {
        let factor = self.compensation_factor(wavelength_pm);
        Amplitude::from_f64_rounded(f64::from(AMPLITUDE_MAX) / factor)
    }
}
