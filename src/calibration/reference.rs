//! Dark/white reference calibration of the spectrometer.
//!
//! Both references are captured once per run, with the physical reference placed
//! by an operator. Placement is an external trigger (`ReferenceTrigger`); the
//! calibrator only sequences it against the reads.
//!
//! ```text
//! factors[i]    = (white[i] - dark[i]) / (max(white) - min(dark))
//! calibrated[i] = (raw[i] - dark[i]) / factors[i]
//! ```

use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{
    nearest_channel, read_with_retry, IntensitySensor, DEFAULT_READ_TIMEOUT,
};
use crate::hardware::{IntensityReading, Picometres};
use async_trait::async_trait;
use std::time::Duration;

/// Which reference the operator has to place in front of the spectrometer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    /// No light reaches the spectrometer
    Dark,
    /// Full-spectrum light reaches the spectrometer
    White,
}

impl std::fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReferenceKind::Dark => write!(f, "dark"),
            ReferenceKind::White => write!(f, "white"),
        }
    }
}

/// External trigger that places (and removes) a physical reference.
#[async_trait]
pub trait ReferenceTrigger: Send + Sync {
    /// Returns once `kind` is in place
    async fn place(&self, kind: ReferenceKind) -> AppResult<()>;

    /// Returns once the references are cleared and the object is in view
    async fn clear(&self) -> AppResult<()> {
        Ok(())
    }
}

/// Trigger for setups where the references are already in place.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateTrigger;

#[async_trait]
impl ReferenceTrigger for ImmediateTrigger {
    async fn place(&self, _kind: ReferenceKind) -> AppResult<()> {
        Ok(())
    }
}

/// Immutable reference data for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceData {
    grid: Vec<f64>,
    dark: IntensityReading,
    white: IntensityReading,
    factors: Vec<f64>,
}

impl ReferenceData {
    /// Derive calibration factors from a dark and a white read over `grid`.
    ///
    /// Fails with `ZeroReferenceSpan` when `max(white) == min(dark)`, and with
    /// `Calibration` when the arrays are empty or disagree in length.
    pub fn from_readings(
        grid: Vec<f64>,
        dark: IntensityReading,
        white: IntensityReading,
    ) -> AppResult<Self> {
        if grid.is_empty() {
            return Err(DaqError::Calibration(
                "spectrometer reported an empty wavelength grid".to_string(),
            ));
        }
        if dark.len() != grid.len() || white.len() != grid.len() {
            return Err(DaqError::Calibration(format!(
                "reference length mismatch: grid {}, dark {}, white {}",
                grid.len(),
                dark.len(),
                white.len()
            )));
        }

        let white_max = white.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let dark_min = dark.iter().cloned().fold(f64::INFINITY, f64::min);
        let span = white_max - dark_min;
        if span == 0.0 || !span.is_finite() {
            return Err(DaqError::ZeroReferenceSpan {
                white_max,
                dark_min,
            });
        }

        let factors = white
            .iter()
            .zip(&dark)
            .map(|(w, d)| (w - d) / span)
            .collect();

        Ok(Self {
            grid,
            dark,
            white,
            factors,
        })
    }

    /// Wavelength grid (nm) the references were taken on
    pub fn grid(&self) -> &[f64] {
        &self.grid
    }

    /// Dark reference
    pub fn dark(&self) -> &[f64] {
        &self.dark
    }

    /// White reference
    pub fn white(&self) -> &[f64] {
        &self.white
    }

    /// Per-channel calibration factors
    pub fn factors(&self) -> &[f64] {
        &self.factors
    }

    /// Calibrate a full raw read.
    ///
    /// Channels whose factor is zero (white equals dark there) carry no
    /// information and calibrate to 0 rather than a non-finite value.
    pub fn calibrate(&self, raw: &[f64]) -> AppResult<Vec<f64>> {
        self.check_len(raw)?;
        Ok((0..raw.len()).map(|i| self.calibrate_channel(raw, i)).collect())
    }

    /// Calibrated count at the channel nearest `wavelength` (pm).
    pub fn count_at(&self, raw: &[f64], wavelength: Picometres) -> AppResult<f64> {
        self.check_len(raw)?;
        let target_nm = f64::from(wavelength) / 1000.0;
        let index = nearest_channel(&self.grid, target_nm).ok_or_else(|| {
            DaqError::Calibration("spectrometer reported an empty wavelength grid".to_string())
        })?;
        Ok(self.calibrate_channel(raw, index))
    }

    /// `raw - dark`, element-wise
    pub fn subtract_dark(&self, raw: &[f64]) -> AppResult<Vec<f64>> {
        self.check_len(raw)?;
        Ok(raw.iter().zip(&self.dark).map(|(r, d)| r - d).collect())
    }

    fn calibrate_channel(&self, raw: &[f64], index: usize) -> f64 {
        let factor = self.factors[index];
        if factor == 0.0 {
            0.0
        } else {
            (raw[index] - self.dark[index]) / factor
        }
    }

    fn check_len(&self, raw: &[f64]) -> AppResult<()> {
        if raw.len() == self.grid.len() {
            Ok(())
        } else {
            Err(DaqError::Calibration(format!(
                "read has {} channels, references have {}",
                raw.len(),
                self.grid.len()
            )))
        }
    }
}

/// Captures the dark and white references from one spectrometer.
pub struct ReferenceCalibrator<'a, S: IntensitySensor + ?Sized> {
    spectrometer: &'a S,
    integration_time_us: u32,
    read_timeout: Duration,
}

impl<'a, S: IntensitySensor + ?Sized> ReferenceCalibrator<'a, S> {
    /// Calibrator reading `spectrometer` at the run's integration time
    pub fn new(spectrometer: &'a S, integration_time_us: u32) -> Self {
        Self {
            spectrometer,
            integration_time_us,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    /// Bound each reference read at `limit`
    pub fn with_read_timeout(mut self, limit: Duration) -> Self {
        self.read_timeout = limit;
        self
    }

    /// Read with the dark reference in place
    pub async fn capture_dark_reference(&self) -> AppResult<IntensityReading> {
        self.capture(ReferenceKind::Dark).await
    }

    /// Read with the white reference in place
    pub async fn capture_white_reference(&self) -> AppResult<IntensityReading> {
        self.capture(ReferenceKind::White).await
    }

    /// Full sequence: dark, white, then clear, then derive the factors.
    pub async fn run(&self, trigger: &dyn ReferenceTrigger) -> AppResult<ReferenceData> {
        trigger.place(ReferenceKind::Dark).await?;
        let dark = self.capture_dark_reference().await?;

        trigger.place(ReferenceKind::White).await?;
        let white = self.capture_white_reference().await?;

        trigger.clear().await?;

        let refs = ReferenceData::from_readings(
            self.spectrometer.wavelength_grid().to_vec(),
            dark,
            white,
        )?;
        tracing::info!(channels = refs.grid().len(), "Reference calibration complete");
        Ok(refs)
    }

    async fn capture(&self, kind: ReferenceKind) -> AppResult<IntensityReading> {
        self.spectrometer
            .set_integration_time(self.integration_time_us)
            .await?;
        let reading = read_with_retry(self.spectrometer, self.read_timeout).await?;
        tracing::debug!(reference = %kind, channels = reading.len(), "Captured reference");
        Ok(reading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factors_follow_reference_span() {
        let refs = ReferenceData::from_readings(
            vec![500.0, 501.0, 502.0],
            vec![10.0, 20.0, 10.0],
            vec![110.0, 220.0, 60.0],
        )
        .unwrap();
        // span = 220 - 10
        assert_eq!(refs.factors(), &[100.0 / 210.0, 200.0 / 210.0, 50.0 / 210.0]);

        let calibrated = refs.calibrate(&[110.0, 220.0, 60.0]).unwrap();
        for value in calibrated {
            assert!((value - 210.0).abs() < 1e-9);
        }
    }

    #[test]
    fn zero_span_is_rejected() {
        let err = ReferenceData::from_readings(vec![500.0, 501.0], vec![5.0, 5.0], vec![5.0, 5.0])
            .unwrap_err();
        assert!(matches!(err, DaqError::ZeroReferenceSpan { .. }));
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let err = ReferenceData::from_readings(vec![500.0, 501.0], vec![0.0], vec![1.0, 1.0])
            .unwrap_err();
        assert!(matches!(err, DaqError::Calibration(_)));

        let refs =
            ReferenceData::from_readings(vec![500.0, 501.0], vec![0.0, 0.0], vec![1.0, 1.0]).unwrap();
        assert!(refs.calibrate(&[1.0]).is_err());
    }

    #[test]
    fn count_uses_nearest_channel() {
        let refs = ReferenceData::from_readings(
            vec![500.0, 500.5, 501.0],
            vec![0.0; 3],
            vec![1.0; 3],
        )
        .unwrap();
        let raw = [10.0, 20.0, 30.0];
        assert_eq!(refs.count_at(&raw, 500_400).unwrap(), 20.0);
        assert_eq!(refs.count_at(&raw, 900_000).unwrap(), 30.0);
    }

    #[test]
    fn flat_channel_calibrates_to_zero() {
        let refs = ReferenceData::from_readings(
            vec![500.0, 501.0],
            vec![0.0, 3.0],
            vec![10.0, 3.0],
        )
        .unwrap();
        assert_eq!(refs.calibrate(&[5.0, 9.0]).unwrap(), vec![5.0, 0.0]);
    }
}
