//! # Hypercube DAQ Core Library
//!
//! This crate acquires a wavelength-resolved image stack ("hypercube") of an object
//! lit by an acousto-optically tuned supercontinuum source. Because the source's
//! output power varies with wavelength, a closed-loop calibration first finds, per
//! wavelength, the RF drive amplitude that yields a target detector count; the
//! resulting table pre-compensates the drive during the acquisition sweep.
//!
//! ## Crate Structure
//!
//! - **`error`**: the `DaqError` taxonomy shared by every stage.
//! - **`config`**: figment-backed `RunConfig` (TOML + environment) and validation.
//! - **`logging`**: tracing subscriber initialisation.
//! - **`hardware`**: capability traits for the source, spectrometer and camera, the
//!   scoped `HardwareSession`, register-level NKT drivers and a simulated bench.
//! - **`calibration`**: dark/white references, the power-normalization controller
//!   and the calibration table / compensation function it produces.
//! - **`acquisition`**: sweep plans, the compensated acquisition pipeline, the
//!   cumulative spectrum and the hypercube.
//! - **`storage`**: calibration CSV, spectrum CSV and JSON report files.
//! - **`run`**: end-to-end orchestration of one run.

pub mod acquisition;
pub mod calibration;
pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod run;
pub mod storage;

pub use error::{AppResult, DaqError};
