//! Cumulative spectrum bookkeeping for the acquisition sweep.
//!
//! The accumulator is a running sum of background-subtracted reads over the whole
//! sweep. It is a diagnostic of the total illumination delivered, not the spectrum
//! at any one wavelength, and is exported under that name.

use crate::calibration::table::CompensationFunction;
use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};

/// Index of the largest finite value; ties resolve to the first.
pub fn peak_index(values: &[f64]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .fold(None, |best: Option<(usize, f64)>, (idx, &v)| match best {
            Some((_, top)) if top >= v => best,
            _ => Some((idx, v)),
        })
        .map(|(idx, _)| idx)
}

/// Running element-wise sum over the spectrometer grid.
#[derive(Debug, Clone)]
pub struct SpectrumAccumulator {
    grid: Vec<f64>,
    total: Vec<f64>,
    contributions: usize,
}

impl SpectrumAccumulator {
    /// Zeroed accumulator over `grid` (nm)
    pub fn new(grid: Vec<f64>) -> Self {
        let total = vec![0.0; grid.len()];
        Self {
            grid,
            total,
            contributions: 0,
        }
    }

    /// Add one background-subtracted read.
    pub fn accumulate(&mut self, reading: &[f64]) -> AppResult<()> {
        if reading.len() != self.total.len() {
            return Err(DaqError::Calibration(format!(
                "read has {} channels, accumulator has {}",
                reading.len(),
                self.total.len()
            )));
        }
        for (sum, value) in self.total.iter_mut().zip(reading) {
            *sum += value;
        }
        self.contributions += 1;
        Ok(())
    }

    /// Sum so far
    pub fn total(&self) -> &[f64] {
        &self.total
    }

    /// Reads accumulated so far
    pub fn contributions(&self) -> usize {
        self.contributions
    }

    /// Freeze, dividing each channel by the compensation factor at its own
    /// wavelength (grid nm converted to pm).
    pub fn finish(self, compensation: &CompensationFunction) -> CumulativeSpectrum {
        let compensated = self
            .grid
            .iter()
            .zip(&self.total)
            .map(|(&nm, &sum)| sum / compensation.compensation_factor(nm * 1000.0))
            .collect();

        CumulativeSpectrum {
            wavelengths_nm: self.grid,
            cumulative: self.total,
            compensated,
            contributions: self.contributions,
        }
    }
}

/// Final cumulative spectrum and its power-compensated counterpart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CumulativeSpectrum {
    /// Spectrometer grid, nm
    pub wavelengths_nm: Vec<f64>,
    /// Running sum of background-subtracted reads
    pub cumulative: Vec<f64>,
    /// `cumulative / factor(wavelength)`
    pub compensated: Vec<f64>,
    /// Number of reads that went into the sum
    pub contributions: usize,
}

impl CumulativeSpectrum {
    /// Wavelength (nm) of the cumulative maximum
    pub fn peak_wavelength_nm(&self) -> Option<f64> {
        peak_index(&self.cumulative).map(|idx| self.wavelengths_nm[idx])
    }
}
