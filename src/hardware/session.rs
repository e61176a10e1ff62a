//! Scoped Hardware Session
//!
//! The tunable source, spectrometer and camera share one optical path and are
//! exclusively owned for a run's duration. A device left open or actuated after a
//! crash causes start-up conflicts on the next run, so ownership is modelled as a
//! scoped resource:
//!
//! - `HardwareSession::open` acquires every device once (switching pump emission on)
//! - `HardwareSession::release` releases every device exactly once, in reverse
//!   acquisition order (LIFO), collecting failures instead of stopping at the first
//! - `HardwareSession::run` executes a body and releases on every exit path
//! - dropping an unreleased session (panic, early return) spawns the same teardown
//!   on the current tokio runtime as a last resort
//!
//! # Example
//!
//! ```rust,ignore
//! let session = HardwareSession::open(devices).await?;
//! let table = session
//!     .run(|hw| Box::pin(async move { controller.calibrate(hw, &plan).await }))
//!     .await?;
//! ```

use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{Camera, PumpSource, Spectrometer, TunableSource};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Future returned by a session body.
pub type SessionFuture<'a, T> = Pin<Box<dyn Future<Output = AppResult<T>> + Send + 'a>>;

/// Devices handed to `HardwareSession::open`.
pub struct SessionDevices {
    /// Acousto-optic RF driver
    pub source: Arc<dyn TunableSource>,
    /// Spectrometer
    pub spectrometer: Arc<dyn Spectrometer>,
    /// Camera
    pub camera: Arc<dyn Camera>,
    /// Optional broadband pump whose emission is switched with the session
    pub pump: Option<Arc<dyn PumpSource>>,
}

/// Exclusive ownership of every device for one run.
pub struct HardwareSession {
    devices: SessionDevices,
    released: bool,
}

impl HardwareSession {
    /// Acquire the devices, switching pump emission on.
    ///
    /// If emission cannot be enabled the devices are released before the error is
    /// returned.
    pub async fn open(devices: SessionDevices) -> AppResult<Self> {
        let mut session = Self {
            devices,
            released: false,
        };

        if let Some(pump) = session.devices.pump.clone() {
            if let Err(err) = pump.set_emission(true).await {
                tracing::error!(device = pump.name(), error = %err, "Failed to enable emission");
                if let Err(release_err) = session.release_in_place().await {
                    tracing::error!(error = %release_err, "Teardown after failed open also failed");
                }
                return Err(err);
            }
            tracing::info!(device = pump.name(), "Emission: ON");
        }

        tracing::info!(
            source = session.devices.source.name(),
            spectrometer = session.devices.spectrometer.name(),
            camera = session.devices.camera.name(),
            "Hardware session opened"
        );
        Ok(session)
    }

    /// Tunable source (RF driver)
    pub fn source(&self) -> &dyn TunableSource {
        self.devices.source.as_ref()
    }

    /// Spectrometer
    pub fn spectrometer(&self) -> &dyn Spectrometer {
        self.devices.spectrometer.as_ref()
    }

    /// Camera
    pub fn camera(&self) -> &dyn Camera {
        self.devices.camera.as_ref()
    }

    /// Whether `release` has already run
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Run `body` with the session, then release every device regardless of outcome.
    ///
    /// The body's error takes precedence over release failures, which are logged.
    /// A successful body followed by a failed release yields `ShutdownFailed`.
    pub async fn run<T, F>(mut self, body: F) -> AppResult<T>
    where
        F: for<'a> FnOnce(&'a HardwareSession) -> SessionFuture<'a, T>,
    {
        let outcome = body(&self).await;
        let release = self.release_in_place().await;

        match (outcome, release) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(release_err)) => Err(release_err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(release_err)) => {
                tracing::error!(error = %release_err, "Device release failed while unwinding");
                Err(err)
            }
        }
    }

    /// Release every device exactly once, in reverse acquisition order.
    pub async fn release(mut self) -> AppResult<()> {
        self.release_in_place().await
    }

    async fn release_in_place(&mut self) -> AppResult<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let errors = teardown(&self.devices).await;
        if errors.is_empty() {
            tracing::info!("Hardware session released");
            Ok(())
        } else {
            Err(DaqError::ShutdownFailed(errors))
        }
    }
}

/// Release in LIFO order: camera, spectrometer, RF driver, then pump emission.
async fn teardown(devices: &SessionDevices) -> Vec<DaqError> {
    let mut errors = Vec::new();

    let camera = devices.camera.as_ref();
    let spectrometer = devices.spectrometer.as_ref();
    let source = devices.source.as_ref();

    for (name, result) in [
        (camera.name(), camera.release().await),
        (spectrometer.name(), spectrometer.release().await),
        (source.name(), source.release().await),
    ] {
        match result {
            Ok(()) => tracing::info!(device = name, "Released"),
            Err(err) => {
                tracing::error!(device = name, error = %err, "Release failed");
                errors.push(err);
            }
        }
    }

    if let Some(pump) = devices.pump.as_ref() {
        let emission = pump.set_emission(false).await;
        let release = pump.release().await;
        for result in [emission, release] {
            if let Err(err) = result {
                tracing::error!(device = pump.name(), error = %err, "Pump shutdown failed");
                errors.push(err);
            }
        }
        if errors.is_empty() {
            tracing::info!(device = pump.name(), "Emission: OFF");
        }
    }

    errors
}

impl Drop for HardwareSession {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let panicking = std::thread::panicking();
        tracing::error!(
            panicking,
            "Hardware session dropped without release - scheduling teardown"
        );

        let devices = SessionDevices {
            source: self.devices.source.clone(),
            spectrometer: self.devices.spectrometer.clone(),
            camera: self.devices.camera.clone(),
            pump: self.devices.pump.clone(),
        };
        self.released = true;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let errors = teardown(&devices).await;
                    if !errors.is_empty() {
                        tracing::error!(count = errors.len(), "Deferred teardown had failures");
                    }
                });
            }
            Err(_) => {
                tracing::error!("No runtime available; devices may remain open");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{simulated_devices, OpticalBench};

    fn devices(bench: &OpticalBench) -> SessionDevices {
        simulated_devices(bench, 4, 6)
    }

    #[tokio::test]
    async fn test_open_enables_emission_and_release_disables() {
        let bench = OpticalBench::new();
        let session = HardwareSession::open(devices(&bench)).await.unwrap();
        assert!(bench.snapshot().await.emission);

        session.release().await.unwrap();
        let state = bench.snapshot().await;
        assert!(!state.emission);
        assert!(!state.rf_enabled);
        assert_eq!(state.release_count, 4);
    }

    #[tokio::test]
    async fn test_run_releases_after_error() {
        let bench = OpticalBench::new();
        let session = HardwareSession::open(devices(&bench)).await.unwrap();

        let result: AppResult<()> = session
            .run(|hw| {
                Box::pin(async move {
                    hw.source().set_rf_enabled(true).await?;
                    Err(DaqError::DeviceDisconnected("camera".into()))
                })
            })
            .await;

        assert!(matches!(result, Err(DaqError::DeviceDisconnected(_))));
        let state = bench.snapshot().await;
        assert!(!state.rf_enabled);
        assert!(!state.emission);
        assert_eq!(state.release_count, 4);
    }

    #[tokio::test]
    async fn test_release_runs_exactly_once() {
        let bench = OpticalBench::new();
        let mut session = HardwareSession::open(devices(&bench)).await.unwrap();
        session.release_in_place().await.unwrap();
        session.release_in_place().await.unwrap();
        assert!(session.is_released());
        drop(session);
        tokio::task::yield_now().await;
        assert_eq!(bench.snapshot().await.release_count, 4);
    }

    #[tokio::test]
    async fn test_drop_schedules_teardown() {
        let bench = OpticalBench::new();
        {
            let session = HardwareSession::open(devices(&bench)).await.unwrap();
            session.source().set_rf_enabled(true).await.unwrap();
        }
        // Let the spawned teardown run
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let state = bench.snapshot().await;
        assert!(!state.rf_enabled);
        assert_eq!(state.release_count, 4);
    }

    #[tokio::test]
    async fn test_release_failure_is_collected() {
        let bench = OpticalBench::new();
        let session = HardwareSession::open(devices(&bench)).await.unwrap();
        bench.fail_release("camera").await;

        match session.release().await {
            Err(DaqError::ShutdownFailed(errors)) => assert_eq!(errors.len(), 1),
            other => panic!("unexpected: {:?}", other),
        }
        // Remaining devices were still released
        assert_eq!(bench.snapshot().await.release_count, 3);
    }
}
