//! Run artifacts on disk.
//!
//! - calibration table: `Wavelength (pm),Amplitude,Count`, one row per wavelength
//! - cumulative spectrum: `wavelength_nm,cumulative,compensated`
//! - run report: pretty JSON
//!
//! Floats are written in shortest round-trip form, so a table read back is
//! identical to the one written. Tables saved with floating-point wavelength and
//! amplitude columns (e.g. `5.000000000000000000e+05`) load as long as the values
//! are integral.

use crate::acquisition::spectrum::CumulativeSpectrum;
use crate::calibration::table::{CalibrationRecord, CalibrationTable};
use crate::config::StorageConfig;
use crate::error::{AppResult, DaqError};
use crate::hardware::{Amplitude, AMPLITUDE_MAX, AMPLITUDE_MIN};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Report file name inside the output directory.
pub const REPORT_FILE: &str = "run_report.json";
/// Cumulative spectrum file name inside the output directory.
pub const SPECTRUM_FILE: &str = "cumulative_spectrum.csv";

/// Where a run writes its artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    /// Calibration table CSV
    pub calibration: PathBuf,
    /// Cumulative spectrum CSV
    pub spectrum: PathBuf,
    /// JSON run report
    pub report: PathBuf,
}

impl ArtifactPaths {
    /// Paths under `config.output_dir`
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            calibration: config.output_dir.join(&config.calibration_file),
            spectrum: config.output_dir.join(SPECTRUM_FILE),
            report: config.output_dir.join(REPORT_FILE),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StoredRecord {
    #[serde(rename = "Wavelength (pm)")]
    wavelength_pm: f64,
    #[serde(rename = "Amplitude")]
    amplitude: f64,
    #[serde(rename = "Count")]
    count: f64,
}

impl StoredRecord {
    fn into_record(self, row: usize) -> AppResult<CalibrationRecord> {
        let wavelength_ok = self.wavelength_pm.fract() == 0.0
            && self.wavelength_pm >= 0.0
            && self.wavelength_pm <= f64::from(u32::MAX);
        if !wavelength_ok {
            return Err(DaqError::Calibration(format!(
                "row {}: wavelength {} is not a whole picometre value",
                row, self.wavelength_pm
            )));
        }

        let amplitude_ok = self.amplitude.fract() == 0.0
            && self.amplitude >= f64::from(AMPLITUDE_MIN)
            && self.amplitude <= f64::from(AMPLITUDE_MAX);
        if !amplitude_ok {
            return Err(DaqError::Calibration(format!(
                "row {}: amplitude {} outside {}-{}",
                row, self.amplitude, AMPLITUDE_MIN, AMPLITUDE_MAX
            )));
        }

        Ok(CalibrationRecord::new(
            self.wavelength_pm as u32,
            Amplitude::clamped(self.amplitude as i64),
            self.count,
        ))
    }
}

/// Write `table` as CSV to any writer.
pub fn write_calibration<W: Write>(writer: W, table: &CalibrationTable) -> AppResult<()> {
    let mut csv = csv::Writer::from_writer(writer);
    for record in table.records() {
        csv.serialize(record)?;
    }
    csv.flush()?;
    Ok(())
}

/// Read a calibration CSV from any reader.
pub fn read_calibration<R: Read>(reader: R) -> AppResult<CalibrationTable> {
    let mut csv = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut records = Vec::new();
    for (row, stored) in csv.deserialize::<StoredRecord>().enumerate() {
        records.push(stored?.into_record(row + 1)?);
    }
    CalibrationTable::new(records)
}

/// Save the calibration table, creating parent directories.
pub fn save_calibration(path: &Path, table: &CalibrationTable) -> AppResult<()> {
    ensure_parent(path)?;
    write_calibration(BufWriter::new(File::create(path)?), table)?;
    tracing::info!(path = %path.display(), records = table.len(), "Calibration table saved");
    Ok(())
}

/// Load a calibration table.
pub fn load_calibration(path: &Path) -> AppResult<CalibrationTable> {
    let table = read_calibration(File::open(path)?)?;
    tracing::info!(path = %path.display(), records = table.len(), "Calibration table loaded");
    Ok(table)
}

#[derive(Serialize)]
struct SpectrumRow {
    wavelength_nm: f64,
    cumulative: f64,
    compensated: f64,
}

/// Save the cumulative and compensated spectrum.
pub fn save_spectrum(path: &Path, spectrum: &CumulativeSpectrum) -> AppResult<()> {
    ensure_parent(path)?;
    let mut csv = csv::Writer::from_writer(BufWriter::new(File::create(path)?));
    for ((&wavelength_nm, &cumulative), &compensated) in spectrum
        .wavelengths_nm
        .iter()
        .zip(&spectrum.cumulative)
        .zip(&spectrum.compensated)
    {
        csv.serialize(SpectrumRow {
            wavelength_nm,
            cumulative,
            compensated,
        })?;
    }
    csv.flush()?;
    tracing::info!(path = %path.display(), "Cumulative spectrum saved");
    Ok(())
}

/// Save any serializable value as pretty JSON.
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> AppResult<()> {
    ensure_parent(path)?;
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush()?;
    tracing::info!(path = %path.display(), "Report saved");
    Ok(())
}

fn ensure_parent(path: &Path) -> AppResult<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() && !dir.exists() => {
            fs::create_dir_all(dir)?;
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> CalibrationTable {
        CalibrationTable::new(vec![
            CalibrationRecord::new(500_000, Amplitude::clamped(812), 1003.25),
            CalibrationRecord::new(550_000, Amplitude::clamped(1000), 0.1 + 0.2),
            CalibrationRecord::new(600_000, Amplitude::clamped(1), 987.654_321_012_345_6),
        ])
        .unwrap()
    }

    #[test]
    fn csv_has_three_named_columns() {
        let mut buffer = Vec::new();
        write_calibration(&mut buffer, &table()).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("Wavelength (pm),Amplitude,Count"));
        assert_eq!(lines.next(), Some("500000,812,1003.25"));
        assert_eq!(text.lines().count(), 4);
    }

    #[test]
    fn csv_round_trip_is_lossless() {
        let mut buffer = Vec::new();
        write_calibration(&mut buffer, &table()).unwrap();
        let reloaded = read_calibration(buffer.as_slice()).unwrap();
        assert_eq!(reloaded, table());
    }

    #[test]
    fn float_formatted_tables_load() {
        let text = "Wavelength (pm),Amplitude,Count\n\
                    5.000000000000000000e+05,6.400000000000000000e+02,1.010000000000000000e+03\n";
        let table = read_calibration(text.as_bytes()).unwrap();
        assert_eq!(table.records()[0].wavelength_pm, 500_000);
        assert_eq!(table.records()[0].amplitude.get(), 640);
        assert_eq!(table.records()[0].achieved_count, 1010.0);
    }

    #[test]
    fn invalid_rows_rejected() {
        let fractional = "Wavelength (pm),Amplitude,Count\n500000.5,640,1000\n";
        assert!(matches!(
            read_calibration(fractional.as_bytes()),
            Err(DaqError::Calibration(_))
        ));

        let out_of_range = "Wavelength (pm),Amplitude,Count\n500000,0,1000\n";
        assert!(read_calibration(out_of_range.as_bytes()).is_err());

        let wrong_header = "wl,amp,count\n500000,640,1000\n";
        assert!(matches!(
            read_calibration(wrong_header.as_bytes()),
            Err(DaqError::Csv(_))
        ));
    }

    #[test]
    fn files_land_under_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            output_dir: dir.path().join("nested"),
            ..StorageConfig::default()
        };
        let paths = ArtifactPaths::from_config(&config);

        save_calibration(&paths.calibration, &table()).unwrap();
        assert_eq!(load_calibration(&paths.calibration).unwrap(), table());

        let spectrum = CumulativeSpectrum {
            wavelengths_nm: vec![500.0, 500.5],
            cumulative: vec![3.0, 4.0],
            compensated: vec![1.5, 2.0],
            contributions: 2,
        };
        save_spectrum(&paths.spectrum, &spectrum).unwrap();
        let text = fs::read_to_string(&paths.spectrum).unwrap();
        assert!(text.starts_with("wavelength_nm,cumulative,compensated\n500.0,3.0,1.5"));

        save_json(&paths.report, &spectrum).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths.report).unwrap()).unwrap();
        assert_eq!(value["contributions"], 2);
    }
}
