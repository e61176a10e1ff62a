//! Wavelength lists for the calibration and acquisition sweeps.

use crate::config::SweepConfig;
use crate::error::{AppResult, DaqError};
use crate::hardware::Picometres;
use serde::{Deserialize, Serialize};

/// Strictly increasing list of sweep wavelengths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepPlan {
    wavelengths: Vec<Picometres>,
}

impl SweepPlan {
    /// `steps` evenly spaced wavelengths from `min_pm` to `max_pm` inclusive,
    /// each truncated to a whole picometre.
    ///
    /// A single step yields `[min_pm]`. Fails when the range is inverted, `steps`
    /// is zero, or truncation produces duplicates.
    pub fn linspace(min_pm: Picometres, max_pm: Picometres, steps: usize) -> AppResult<Self> {
        if steps == 0 {
            return Err(DaqError::Configuration(
                "Sweep must have at least one step".to_string(),
            ));
        }
        if min_pm > max_pm {
            return Err(DaqError::Configuration(format!(
                "Sweep minimum {} pm exceeds maximum {} pm",
                min_pm, max_pm
            )));
        }

        let wavelengths = if steps == 1 {
            vec![min_pm]
        } else {
            let start = f64::from(min_pm);
            let delta = (f64::from(max_pm) - start) / (steps - 1) as f64;
            (0..steps)
                .map(|i| {
                    if i == steps - 1 {
                        max_pm
                    } else {
                        (start + i as f64 * delta).trunc() as Picometres
                    }
                })
                .collect()
        };

        Self::from_wavelengths(wavelengths)
    }

    /// Plan from the `[sweep]` section
    pub fn from_config(config: &SweepConfig) -> AppResult<Self> {
        Self::linspace(
            config.min_wavelength_pm,
            config.max_wavelength_pm,
            config.steps,
        )
    }

    /// Explicit list; must be non-empty and strictly increasing
    pub fn from_wavelengths(wavelengths: Vec<Picometres>) -> AppResult<Self> {
        if wavelengths.is_empty() {
            return Err(DaqError::Configuration("Sweep is empty".to_string()));
        }
        if let Some(pair) = wavelengths.windows(2).find(|pair| pair[0] >= pair[1]) {
            return Err(DaqError::Configuration(format!(
                "Sweep wavelengths must be strictly increasing ({} pm followed by {} pm); \
                 use fewer steps or a wider range",
                pair[0], pair[1]
            )));
        }
        Ok(Self { wavelengths })
    }

    /// Wavelengths in sweep order
    pub fn wavelengths(&self) -> &[Picometres] {
        &self.wavelengths
    }

    /// Number of steps
    pub fn len(&self) -> usize {
        self.wavelengths.len()
    }

    /// Always false; an empty plan cannot be constructed
    pub fn is_empty(&self) -> bool {
        self.wavelengths.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linspace_includes_endpoints() {
        let plan = SweepPlan::linspace(500_000, 650_000, 4).unwrap();
        assert_eq!(plan.wavelengths(), &[500_000, 550_000, 600_000, 650_000]);
    }

    #[test]
    fn linspace_truncates() {
        let plan = SweepPlan::linspace(500_000, 500_010, 4).unwrap();
        // 500000, 500003.33, 500006.67, 500010
        assert_eq!(plan.wavelengths(), &[500_000, 500_003, 500_006, 500_010]);
    }

    #[test]
    fn single_step_is_minimum() {
        let plan = SweepPlan::linspace(520_000, 700_000, 1).unwrap();
        assert_eq!(plan.wavelengths(), &[520_000]);
    }

    #[test]
    fn degenerate_plans_rejected() {
        assert!(SweepPlan::linspace(500_000, 600_000, 0).is_err());
        assert!(SweepPlan::linspace(600_000, 500_000, 3).is_err());
        // Three steps over two picometres collide after truncation
        assert!(SweepPlan::linspace(500_000, 500_001, 3).is_err());
        assert!(SweepPlan::linspace(500_000, 500_000, 2).is_err());
    }
}
