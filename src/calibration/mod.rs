//! Calibration stages that run before the acquisition sweep.
//!
//! - `reference` - dark/white spectrometer references and per-channel factors
//! - `controller` - closed-loop power normalization per wavelength
//! - `table` - the resulting calibration table and its compensation interpolant

pub mod controller;
pub mod reference;
pub mod table;

pub use controller::{
    CalibrationRun, LoopState, NormalizationLoop, NormalizationOutcome,
    PowerNormalizationController,
};
pub use reference::{
    ImmediateTrigger, ReferenceCalibrator, ReferenceData, ReferenceKind, ReferenceTrigger,
};
pub use table::{CalibrationRecord, CalibrationTable, CompensationFunction};
