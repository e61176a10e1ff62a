//! Acquisition sweep and its data products.
//!
//! - `sweep` - wavelength list generation
//! - `spectrum` - cumulative diagnostic spectrum
//! - `hypercube` - the image stack
//! - `pipeline` - the compensated, synchronized sweep

pub mod hypercube;
pub mod pipeline;
pub mod spectrum;
pub mod sweep;

pub use hypercube::{Hypercube, RgbComposite};
pub use pipeline::{AcquisitionOutput, AcquisitionPipeline, StepDiagnostics};
pub use spectrum::{CumulativeSpectrum, SpectrumAccumulator};
pub use sweep::SweepPlan;
