//! Simulated Hardware Implementations
//!
//! Provides a simulated optical bench for testing without physical hardware.
//! All devices share one `OpticalBench` so the spectrometer and camera observe the
//! state the source was actually left in, the same way the real devices share one
//! optical path. All mocks use async-safe operations (tokio locks, no blocking).
//!
//! # Available Mocks
//!
//! - `SimulatedSource` - RF driver with a wavelength-dependent efficiency curve
//! - `SimulatedPump` - broadband pump emission switch
//! - `SimulatedSpectrometer` - Gaussian line at the selected wavelength over a fixed grid
//! - `ScriptedSpectrometer` - replays a fixed list of reads (controller tests)
//! - `SimulatedCamera` - frames scaled by the optical power reaching the object
//! - `BenchTrigger` - places the dark/white references on the bench
//!
//! # Physics (deliberately crude)
//!
//! - efficiency(nm) = 0.4 + 0.6 * exp(-((nm - 600) / 120)^2)
//! - line peak counts = 3000 * efficiency * amplitude / 1000 * integration / 10 ms
//! - line width sigma = 2 nm, dark level 100 counts, white lamp 4000 counts above dark

use crate::calibration::reference::{ReferenceKind, ReferenceTrigger};
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{
    EmissionControl, ImageSensor, IntensitySensor, Releasable, WavelengthActuator,
};
use crate::hardware::session::SessionDevices;
use crate::hardware::{Amplitude, ImagePlane, IntensityReading, Picometres};
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

const DARK_LEVEL: f64 = 100.0;
const WHITE_SPAN: f64 = 4000.0;
const PEAK_SCALE: f64 = 3000.0;
const LINE_SIGMA_NM: f64 = 2.0;
const REFERENCE_INTEGRATION_US: f64 = 10_000.0;

// =============================================================================
// OpticalBench - shared simulated state
// =============================================================================

/// What sits in front of the spectrometer input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scene {
    /// Dark reference: no light at all
    Dark,
    /// White reference: broadband lamp, flat spectrum
    White,
    /// The object, illuminated only by the filtered source
    Object,
}

/// One observable hardware event, with the instant it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum BenchEvent {
    /// Wavelength command
    Wavelength(Picometres),
    /// Amplitude command
    Amplitude(u16),
    /// RF enable/disable
    Rf(bool),
    /// Pump emission on/off
    Emission(bool),
    /// Spectrometer read completed
    Read,
    /// Camera capture attempted, with success flag
    Capture(bool),
}

/// Snapshot of the simulated bench.
#[derive(Debug, Clone)]
pub struct BenchState {
    /// Selected wavelength
    pub wavelength_pm: Picometres,
    /// Current drive amplitude
    pub amplitude: Amplitude,
    /// RF drive enabled
    pub rf_enabled: bool,
    /// Pump emission on
    pub emission: bool,
    /// What the spectrometer sees
    pub scene: Scene,
    /// Spectrometer integration time
    pub integration_time_us: u32,
    /// Camera exposure time
    pub exposure_us: f64,
    /// Successful device releases so far
    pub release_count: usize,
    /// Every command/read in order
    pub events: Vec<(Instant, BenchEvent)>,
    failing_release: HashSet<String>,
    source_commands_left: Option<usize>,
}

impl Default for BenchState {
    fn default() -> Self {
        Self {
            wavelength_pm: 0,
            amplitude: Amplitude::MIN,
            rf_enabled: false,
            emission: false,
            scene: Scene::Object,
            integration_time_us: 10_000,
            exposure_us: 10_000.0,
            release_count: 0,
            events: Vec::new(),
            failing_release: HashSet::new(),
            source_commands_left: None,
        }
    }
}

/// Shared handle to the simulated optical path.
#[derive(Clone, Default)]
pub struct OpticalBench {
    state: Arc<RwLock<BenchState>>,
}

impl OpticalBench {
    /// Fresh bench: RF off, emission off, object in view.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current state
    pub async fn snapshot(&self) -> BenchState {
        self.state.read().await.clone()
    }

    /// Place a reference (or the object) in front of the spectrometer
    pub async fn set_scene(&self, scene: Scene) {
        self.state.write().await.scene = scene;
    }

    /// Make the named device's `release()` fail
    pub async fn fail_release(&self, device: &str) {
        self.state
            .write()
            .await
            .failing_release
            .insert(device.to_string());
    }

    /// Let the source acknowledge `n` more commands, then stop acknowledging
    pub async fn break_source_after(&self, n: usize) {
        self.state.write().await.source_commands_left = Some(n);
    }

    /// Source efficiency at a wavelength in nm
    pub fn efficiency(nm: f64) -> f64 {
        0.4 + 0.6 * (-((nm - 600.0) / 120.0).powi(2)).exp()
    }

    /// Relative optical power currently leaving the filter, in [0, 1]
    pub async fn optical_power(&self) -> f64 {
        let state = self.state.read().await;
        power_of(&state)
    }

    async fn record(&self, event: BenchEvent) {
        self.state.write().await.events.push((Instant::now(), event));
    }

    async fn release_device(&self, name: &str) -> AppResult<()> {
        let mut state = self.state.write().await;
        if state.failing_release.contains(name) {
            return Err(DaqError::DeviceDisconnected(format!(
                "{} did not respond to close",
                name
            )));
        }
        state.release_count += 1;
        Ok(())
    }
}

fn power_of(state: &BenchState) -> f64 {
    if !(state.rf_enabled && state.emission) {
        return 0.0;
    }
    let nm = f64::from(state.wavelength_pm) / 1000.0;
    OpticalBench::efficiency(nm) * f64::from(state.amplitude.get()) / 1000.0
}

// =============================================================================
// SimulatedSource - RF driver
// =============================================================================

/// Simulated acousto-optic RF driver.
pub struct SimulatedSource {
    bench: OpticalBench,
}

impl SimulatedSource {
    /// Create a source acting on `bench`
    pub fn new(bench: OpticalBench) -> Self {
        Self { bench }
    }

    async fn acknowledge(&self, operation: &str) -> AppResult<()> {
        let mut state = self.bench.state.write().await;
        match state.source_commands_left {
            Some(0) => Err(DaqError::actuator(operation, "no acknowledgement from RF driver")),
            Some(ref mut left) => {
                *left -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl WavelengthActuator for SimulatedSource {
    async fn set_wavelength(&self, wavelength: Picometres) -> AppResult<()> {
        self.acknowledge("set_wavelength").await?;
        self.bench.state.write().await.wavelength_pm = wavelength;
        self.bench.record(BenchEvent::Wavelength(wavelength)).await;
        Ok(())
    }

    async fn set_amplitude(&self, amplitude: Amplitude) -> AppResult<()> {
        self.acknowledge("set_amplitude").await?;
        self.bench.state.write().await.amplitude = amplitude;
        self.bench.record(BenchEvent::Amplitude(amplitude.get())).await;
        Ok(())
    }

    async fn set_rf_enabled(&self, enabled: bool) -> AppResult<()> {
        self.acknowledge("set_rf_enabled").await?;
        self.bench.state.write().await.rf_enabled = enabled;
        self.bench.record(BenchEvent::Rf(enabled)).await;
        Ok(())
    }
}

#[async_trait]
impl Releasable for SimulatedSource {
    fn name(&self) -> &str {
        "source"
    }

    async fn release(&self) -> AppResult<()> {
        // Safe state regardless of the acknowledgement budget
        self.bench.state.write().await.rf_enabled = false;
        self.bench.record(BenchEvent::Rf(false)).await;
        self.bench.release_device("source").await
    }
}

// =============================================================================
// SimulatedPump - broadband emission
// =============================================================================

/// Simulated supercontinuum pump.
pub struct SimulatedPump {
    bench: OpticalBench,
}

impl SimulatedPump {
    /// Create a pump acting on `bench`
    pub fn new(bench: OpticalBench) -> Self {
        Self { bench }
    }
}

#[async_trait]
impl EmissionControl for SimulatedPump {
    async fn set_emission(&self, on: bool) -> AppResult<()> {
        self.bench.state.write().await.emission = on;
        self.bench.record(BenchEvent::Emission(on)).await;
        Ok(())
    }
}

#[async_trait]
impl Releasable for SimulatedPump {
    fn name(&self) -> &str {
        "pump"
    }

    async fn release(&self) -> AppResult<()> {
        self.bench.release_device("pump").await
    }
}

// =============================================================================
// SimulatedSpectrometer
// =============================================================================

/// Simulated spectrometer over a fixed 0.5 nm grid.
pub struct SimulatedSpectrometer {
    bench: OpticalBench,
    grid: Vec<f64>,
    noise: f64,
    pending_timeouts: AtomicUsize,
    pending_stalls: AtomicUsize,
    read_timeout: Duration,
}

impl SimulatedSpectrometer {
    /// 350-1000 nm at 0.5 nm, noise-free
    pub fn new(bench: OpticalBench) -> Self {
        let grid = (0..=1300).map(|i| 350.0 + f64::from(i) * 0.5).collect();
        Self::with_grid(bench, grid)
    }

    /// Custom wavelength grid (nm, ascending)
    pub fn with_grid(bench: OpticalBench, grid: Vec<f64>) -> Self {
        Self {
            bench,
            grid,
            noise: 0.0,
            pending_timeouts: AtomicUsize::new(0),
            pending_stalls: AtomicUsize::new(0),
            read_timeout: Duration::from_millis(500),
        }
    }

    /// Add uniform read noise of +/- `amplitude` counts
    pub fn with_noise(mut self, amplitude: f64) -> Self {
        self.noise = amplitude.abs();
        self
    }

    /// Make the next `n` reads time out
    pub fn inject_timeouts(&self, n: usize) {
        self.pending_timeouts.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` reads hang without ever answering
    pub fn stall_reads(&self, n: usize) {
        self.pending_stalls.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl IntensitySensor for SimulatedSpectrometer {
    async fn set_integration_time(&self, micros: u32) -> AppResult<()> {
        self.bench.state.write().await.integration_time_us = micros;
        Ok(())
    }

    async fn read_intensities(&self) -> AppResult<IntensityReading> {
        if self
            .pending_timeouts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DaqError::timeout("spectrometer", self.read_timeout));
        }

        if self
            .pending_stalls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            std::future::pending::<()>().await;
        }

        let state = self.bench.snapshot().await;
        let exposure = f64::from(state.integration_time_us) / REFERENCE_INTEGRATION_US;
        let line_nm = f64::from(state.wavelength_pm) / 1000.0;
        let peak = PEAK_SCALE * power_of(&state) * exposure;

        // ThreadRng is !Send, keep it out of scope across the await below
        let reading: IntensityReading = {
            let mut rng = rand::thread_rng();
            self.grid
                .iter()
                .map(|&nm| {
                    let signal = match state.scene {
                        Scene::Dark => 0.0,
                        Scene::White => WHITE_SPAN * exposure,
                        Scene::Object => {
                            peak * (-0.5 * ((nm - line_nm) / LINE_SIGMA_NM).powi(2)).exp()
                        }
                    };
                    let noise = if self.noise > 0.0 {
                        rng.gen_range(-self.noise..=self.noise)
                    } else {
                        0.0
                    };
                    DARK_LEVEL + signal + noise
                })
                .collect()
        };

        self.bench.record(BenchEvent::Read).await;
        Ok(reading)
    }

    fn wavelength_grid(&self) -> &[f64] {
        &self.grid
    }
}

#[async_trait]
impl Releasable for SimulatedSpectrometer {
    fn name(&self) -> &str {
        "spectrometer"
    }

    async fn release(&self) -> AppResult<()> {
        self.bench.release_device("spectrometer").await
    }
}

// =============================================================================
// ScriptedSpectrometer - replays fixed reads
// =============================================================================

/// Spectrometer that replays a fixed list of reads, repeating the last one.
///
/// Handy for driving the controller through exact count sequences: with a zero
/// dark reference and unit calibration factors the calibrated count equals the
/// scripted value.
pub struct ScriptedSpectrometer {
    bench: OpticalBench,
    grid: Vec<f64>,
    script: Vec<IntensityReading>,
    cursor: AtomicUsize,
    pending_timeouts: AtomicUsize,
}

impl ScriptedSpectrometer {
    /// Replay `script` over `grid`
    pub fn new(bench: OpticalBench, grid: Vec<f64>, script: Vec<IntensityReading>) -> Self {
        Self {
            bench,
            grid,
            script,
            cursor: AtomicUsize::new(0),
            pending_timeouts: AtomicUsize::new(0),
        }
    }

    /// Each read returns `count` on every channel, in script order
    pub fn from_counts(bench: OpticalBench, grid: Vec<f64>, counts: &[f64]) -> Self {
        let channels = grid.len();
        let script = counts.iter().map(|&c| vec![c; channels]).collect();
        Self::new(bench, grid, script)
    }

    /// Make the next `n` reads time out
    pub fn inject_timeouts(&self, n: usize) {
        self.pending_timeouts.store(n, Ordering::SeqCst);
    }

    /// Reads served so far
    pub fn reads(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IntensitySensor for ScriptedSpectrometer {
    async fn set_integration_time(&self, micros: u32) -> AppResult<()> {
        self.bench.state.write().await.integration_time_us = micros;
        Ok(())
    }

    async fn read_intensities(&self) -> AppResult<IntensityReading> {
        if self
            .pending_timeouts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DaqError::timeout("spectrometer", Duration::from_millis(500)));
        }

        let index = self.cursor.fetch_add(1, Ordering::SeqCst);
        let reading = self
            .script
            .get(index)
            .or_else(|| self.script.last())
            .cloned()
            .unwrap_or_else(|| vec![0.0; self.grid.len()]);
        self.bench.record(BenchEvent::Read).await;
        Ok(reading)
    }

    fn wavelength_grid(&self) -> &[f64] {
        &self.grid
    }
}

#[async_trait]
impl Releasable for ScriptedSpectrometer {
    fn name(&self) -> &str {
        "spectrometer"
    }

    async fn release(&self) -> AppResult<()> {
        self.bench.release_device("spectrometer").await
    }
}

// =============================================================================
// SimulatedCamera
// =============================================================================

/// Simulated camera imaging a fixed object under the filtered source.
pub struct SimulatedCamera {
    bench: OpticalBench,
    height: usize,
    width: usize,
    dropped_wavelengths: HashSet<Picometres>,
    drop_probe: bool,
    captures: AtomicUsize,
}

impl SimulatedCamera {
    /// Camera with the given frame size
    pub fn new(bench: OpticalBench, height: usize, width: usize) -> Self {
        Self {
            bench,
            height,
            width,
            dropped_wavelengths: HashSet::new(),
            drop_probe: false,
            captures: AtomicUsize::new(0),
        }
    }

    /// Captures while the source sits at any of these wavelengths time out
    pub fn with_dropped_wavelengths(mut self, wavelengths: impl IntoIterator<Item = Picometres>) -> Self {
        self.dropped_wavelengths.extend(wavelengths);
        self
    }

    /// The very first capture (the probe) times out
    pub fn with_failed_probe(mut self) -> Self {
        self.drop_probe = true;
        self
    }

    /// Captures attempted so far
    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }

    /// Object reflectance pattern in [0.2, 1.0]: a diagonal gradient
    fn reflectance(&self, row: usize, col: usize) -> f64 {
        let span = (self.height + self.width).max(2) - 2;
        let t = if span == 0 {
            0.0
        } else {
            (row + col) as f64 / span as f64
        };
        0.2 + 0.8 * t
    }
}

#[async_trait]
impl ImageSensor for SimulatedCamera {
    async fn set_exposure(&self, micros: f64) -> AppResult<()> {
        self.bench.state.write().await.exposure_us = micros;
        Ok(())
    }

    async fn capture(&self, _timeout: Duration) -> AppResult<Option<ImagePlane>> {
        let index = self.captures.fetch_add(1, Ordering::SeqCst);
        let state = self.bench.snapshot().await;

        let dropped = (index == 0 && self.drop_probe)
            || (state.rf_enabled && self.dropped_wavelengths.contains(&state.wavelength_pm));
        if dropped {
            self.bench.record(BenchEvent::Capture(false)).await;
            return Ok(None);
        }

        let gain = power_of(&state) * state.exposure_us / 10_000.0;
        let mut pixels = Vec::with_capacity(self.height * self.width);
        for row in 0..self.height {
            for col in 0..self.width {
                let value = 8.0 + 240.0 * gain * self.reflectance(row, col);
                pixels.push(value.clamp(0.0, f64::from(u16::MAX)) as u16);
            }
        }

        self.bench.record(BenchEvent::Capture(true)).await;
        Ok(ImagePlane::new(self.height, self.width, pixels))
    }
}

#[async_trait]
impl Releasable for SimulatedCamera {
    fn name(&self) -> &str {
        "camera"
    }

    async fn release(&self) -> AppResult<()> {
        self.bench.release_device("camera").await
    }
}

// =============================================================================
// BenchTrigger - reference placement
// =============================================================================

/// Places references by switching the bench scene, and restores the object.
#[derive(Clone)]
pub struct BenchTrigger {
    bench: OpticalBench,
}

impl BenchTrigger {
    /// Trigger acting on `bench`
    pub fn new(bench: OpticalBench) -> Self {
        Self { bench }
    }
}

#[async_trait]
impl ReferenceTrigger for BenchTrigger {
    async fn place(&self, kind: ReferenceKind) -> AppResult<()> {
        let scene = match kind {
            ReferenceKind::Dark => Scene::Dark,
            ReferenceKind::White => Scene::White,
        };
        self.bench.set_scene(scene).await;
        Ok(())
    }

    async fn clear(&self) -> AppResult<()> {
        self.bench.set_scene(Scene::Object).await;
        Ok(())
    }
}

/// Full simulated device set (pump included) on one bench.
pub fn simulated_devices(bench: &OpticalBench, height: usize, width: usize) -> SessionDevices {
    SessionDevices {
        source: Arc::new(SimulatedSource::new(bench.clone())),
        spectrometer: Arc::new(SimulatedSpectrometer::new(bench.clone())),
        camera: Arc::new(SimulatedCamera::new(bench.clone(), height, width)),
        pump: Some(Arc::new(SimulatedPump::new(bench.clone()))),
    }
}
