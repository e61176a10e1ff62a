//! Integration tests for the power-normalization controller
//!
//! The controller is driven through scripted count sequences (unit calibration
//! factors, zero dark) so every iteration's count is known exactly, and against
//! the simulated bench for timing and actuation order.

use hypercube_daq::calibration::{LoopState, PowerNormalizationController, ReferenceData};
use hypercube_daq::config::NormalizationConfig;
use hypercube_daq::hardware::mock::{
    BenchEvent, OpticalBench, ScriptedSpectrometer, SimulatedPump, SimulatedSource,
    SimulatedSpectrometer,
};
use hypercube_daq::hardware::{Amplitude, EmissionControl, IntensitySensor};
use hypercube_daq::DaqError;
use std::time::Duration;
use tracing_test::traced_test;

const GRID: [f64; 3] = [500.0, 550.0, 600.0];

fn unit_refs() -> ReferenceData {
    ReferenceData::from_readings(GRID.to_vec(), vec![0.0; 3], vec![1.0; 3]).unwrap()
}

fn controller(tolerance: f64, max_iterations: u32, dwell: Duration) -> PowerNormalizationController {
    let mut params = NormalizationConfig::new(1000.0, tolerance, max_iterations);
    params.dwell = dwell;
    PowerNormalizationController::new(params, 10_000)
}

async fn amplitudes_written(bench: &OpticalBench) -> Vec<u16> {
    bench
        .snapshot()
        .await
        .events
        .iter()
        .filter_map(|(_, event)| match event {
            BenchEvent::Amplitude(a) => Some(*a),
            _ => None,
        })
        .collect()
}

// =============================================================================
// Scripted scenarios
// =============================================================================

#[tokio::test]
async fn test_converges_at_first_count_within_tolerance() {
    let bench = OpticalBench::new();
    let source = SimulatedSource::new(bench.clone());
    let spec =
        ScriptedSpectrometer::from_counts(bench.clone(), GRID.to_vec(), &[200.0, 600.0, 950.0, 1010.0]);

    let outcome = controller(50.0, 10, Duration::from_millis(1))
        .normalize_wavelength(&source, &spec, &unit_refs(), 550_000)
        .await
        .unwrap();

    // 950 is already within 50 of the target
    assert_eq!(outcome.state, LoopState::Converged);
    assert_eq!(outcome.iterations, 3);
    assert_eq!(outcome.record.amplitude.get(), 700);
    assert_eq!(outcome.record.achieved_count, 950.0);
    assert_eq!(amplitudes_written(&bench).await, vec![500, 600, 700]);
    assert_eq!(spec.reads(), 3);
}

#[tokio::test]
async fn test_converges_on_fourth_iteration_with_tighter_tolerance() {
    let bench = OpticalBench::new();
    let source = SimulatedSource::new(bench.clone());
    let spec =
        ScriptedSpectrometer::from_counts(bench.clone(), GRID.to_vec(), &[200.0, 600.0, 950.0, 1010.0]);

    let outcome = controller(49.0, 10, Duration::from_millis(1))
        .normalize_wavelength(&source, &spec, &unit_refs(), 550_000)
        .await
        .unwrap();

    assert_eq!(outcome.state, LoopState::Converged);
    assert_eq!(outcome.iterations, 4);
    // No adjustment after convergence: the amplitude iteration 4 used
    assert_eq!(outcome.record.amplitude.get(), 716);
    assert_eq!(outcome.record.achieved_count, 1010.0);
    assert_eq!(amplitudes_written(&bench).await, vec![500, 600, 700, 716]);
}

#[tokio::test]
#[traced_test]
async fn test_pinned_amplitude_exhausts_and_still_records() {
    let bench = OpticalBench::new();
    let source = SimulatedSource::new(bench.clone());
    let spec = ScriptedSpectrometer::from_counts(bench.clone(), GRID.to_vec(), &[700.0]);

    let outcome = controller(50.0, 10, Duration::from_millis(1))
        .normalize_wavelength(&source, &spec, &unit_refs(), 600_000)
        .await
        .unwrap();

    assert_eq!(outcome.state, LoopState::Exhausted);
    assert_eq!(outcome.iterations, 10);
    assert_eq!(outcome.record.amplitude, Amplitude::MAX);
    assert_eq!(outcome.record.achieved_count, 700.0);
    assert!(logs_contain("Max iterations reached without convergence"));
}

#[tokio::test]
async fn test_amplitude_stays_in_range() {
    let bench = OpticalBench::new();
    let source = SimulatedSource::new(bench.clone());
    // Starved then flooded: the amplitude pins at both bounds
    let counts: Vec<f64> = (0..40)
        .map(|i| if i < 10 { 0.0 } else { 1.0e6 })
        .collect();
    let spec = ScriptedSpectrometer::from_counts(bench.clone(), GRID.to_vec(), &counts);

    let outcome = controller(1.0, 40, Duration::ZERO)
        .normalize_wavelength(&source, &spec, &unit_refs(), 500_000)
        .await
        .unwrap();

    assert_eq!(outcome.state, LoopState::Exhausted);
    let written = amplitudes_written(&bench).await;
    assert_eq!(written.len(), 40);
    assert!(written.iter().all(|a| (1..=1000).contains(a)));
    assert!(written.contains(&1000));
    assert!(written.contains(&1));
}

#[tokio::test]
async fn test_every_record_converged_or_flagged() {
    let bench = OpticalBench::new();
    let source = SimulatedSource::new(bench.clone());
    // First wavelength converges immediately, second never does
    let mut counts = vec![990.0];
    counts.extend(std::iter::repeat(10.0).take(5));
    let spec = ScriptedSpectrometer::from_counts(bench.clone(), GRID.to_vec(), &counts);

    let run = controller(20.0, 5, Duration::ZERO)
        .calibrate(&source, &spec, &unit_refs(), &[500_000, 600_000])
        .await
        .unwrap();

    assert_eq!(run.table.len(), 2);
    for outcome in &run.outcomes {
        let within = (outcome.record.achieved_count - 1000.0).abs() <= 20.0;
        assert!(within || outcome.state == LoopState::Exhausted);
    }
    assert_eq!(run.exhausted().count(), 1);
}

// =============================================================================
// Sequencing against the simulated bench
// =============================================================================

#[tokio::test]
async fn test_dwell_respected_every_iteration() {
    let bench = OpticalBench::new();
    let source = SimulatedSource::new(bench.clone());
    let spec = ScriptedSpectrometer::from_counts(bench.clone(), GRID.to_vec(), &[0.0]);
    let dwell = Duration::from_millis(20);

    controller(1.0, 3, dwell)
        .normalize_wavelength(&source, &spec, &unit_refs(), 550_000)
        .await
        .unwrap();

    let events = bench.snapshot().await.events;
    let mut rf_on_at = None;
    let mut checked = 0;
    for (at, event) in &events {
        match event {
            BenchEvent::Rf(true) => rf_on_at = Some(*at),
            BenchEvent::Read => {
                let enabled = rf_on_at.take().expect("read without RF enabled");
                assert!(at.duration_since(enabled) >= dwell);
                checked += 1;
            }
            _ => {}
        }
    }
    assert_eq!(checked, 3);
}

#[tokio::test]
async fn test_iteration_order_and_rf_hygiene() {
    let bench = OpticalBench::new();
    let source = SimulatedSource::new(bench.clone());
    let spec = ScriptedSpectrometer::from_counts(bench.clone(), GRID.to_vec(), &[100.0, 1000.0]);

    controller(10.0, 5, Duration::ZERO)
        .normalize_wavelength(&source, &spec, &unit_refs(), 550_000)
        .await
        .unwrap();

    let events: Vec<BenchEvent> = bench
        .snapshot()
        .await
        .events
        .into_iter()
        .map(|(_, e)| e)
        .collect();
    let one_iteration = |amplitude| {
        vec![
            BenchEvent::Wavelength(550_000),
            BenchEvent::Amplitude(amplitude),
            BenchEvent::Rf(true),
            BenchEvent::Read,
            BenchEvent::Rf(false),
        ]
    };
    let mut expected = one_iteration(500);
    expected.extend(one_iteration(600));
    assert_eq!(events, expected);
}

#[tokio::test]
async fn test_simulated_bench_converges() {
    let bench = OpticalBench::new();
    let source = SimulatedSource::new(bench.clone());
    let spec = SimulatedSpectrometer::new(bench.clone());
    SimulatedPump::new(bench.clone()).set_emission(true).await.unwrap();

    let grid = spec.wavelength_grid().to_vec();
    let n = grid.len();
    let refs = ReferenceData::from_readings(grid, vec![100.0; n], vec![4100.0; n]).unwrap();

    let run = controller(20.0, 30, Duration::ZERO)
        .calibrate(&source, &spec, &refs, &[450_000, 600_000, 750_000])
        .await
        .unwrap();

    assert!(run.outcomes.iter().all(|o| o.state == LoopState::Converged));
    // Efficiency peaks at 600 nm, so it needs the least drive there
    let amps: Vec<u16> = run.table.records().iter().map(|r| r.amplitude.get()).collect();
    assert!(amps[1] < amps[0] && amps[1] < amps[2]);
}

// =============================================================================
// Faults
// =============================================================================

#[tokio::test]
async fn test_single_spectrometer_timeout_is_retried() {
    let bench = OpticalBench::new();
    let source = SimulatedSource::new(bench.clone());
    let spec = ScriptedSpectrometer::from_counts(bench.clone(), GRID.to_vec(), &[1000.0]);
    spec.inject_timeouts(1);

    let outcome = controller(10.0, 5, Duration::ZERO)
        .normalize_wavelength(&source, &spec, &unit_refs(), 550_000)
        .await
        .unwrap();
    assert_eq!(outcome.state, LoopState::Converged);
}

#[tokio::test]
async fn test_repeated_spectrometer_timeout_is_fatal() {
    let bench = OpticalBench::new();
    let source = SimulatedSource::new(bench.clone());
    let spec = ScriptedSpectrometer::from_counts(bench.clone(), GRID.to_vec(), &[1000.0]);
    spec.inject_timeouts(2);

    let err = controller(10.0, 5, Duration::ZERO)
        .normalize_wavelength(&source, &spec, &unit_refs(), 550_000)
        .await
        .unwrap_err();
    assert!(err.is_timeout());
}

#[tokio::test]
async fn test_actuator_fault_propagates() {
    let bench = OpticalBench::new();
    let source = SimulatedSource::new(bench.clone());
    let spec = ScriptedSpectrometer::from_counts(bench.clone(), GRID.to_vec(), &[0.0]);
    bench.break_source_after(4).await;

    let err = controller(10.0, 5, Duration::ZERO)
        .normalize_wavelength(&source, &spec, &unit_refs(), 550_000)
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::ActuatorComm { .. }));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_stalled_read_is_retried_after_bound() {
    let bench = OpticalBench::new();
    let source = SimulatedSource::new(bench.clone());
    let spec = SimulatedSpectrometer::new(bench.clone());
    SimulatedPump::new(bench.clone()).set_emission(true).await.unwrap();

    let grid = spec.wavelength_grid().to_vec();
    let n = grid.len();
    let refs = ReferenceData::from_readings(grid, vec![100.0; n], vec![4100.0; n]).unwrap();

    spec.stall_reads(1);
    let outcome = controller(20.0, 30, Duration::ZERO)
        .with_read_timeout(Duration::from_millis(20))
        .normalize_wavelength(&source, &spec, &refs, 600_000)
        .await
        .unwrap();
    assert_eq!(outcome.state, LoopState::Converged);
}

#[tokio::test]
async fn test_stalled_spectrometer_is_fatal() {
    let bench = OpticalBench::new();
    let source = SimulatedSource::new(bench.clone());
    let spec = SimulatedSpectrometer::new(bench.clone());
    spec.stall_reads(2);

    let limit = Duration::from_millis(20);
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        controller(10.0, 5, Duration::ZERO)
            .with_read_timeout(limit)
            .normalize_wavelength(&source, &spec, &unit_refs(), 550_000),
    )
    .await
    .expect("controller must give up on a stalled spectrometer");

    match result.unwrap_err() {
        DaqError::SensorTimeout { device, timeout } => {
            assert_eq!(device, "spectrometer");
            assert_eq!(timeout, limit);
        }
        other => panic!("expected SensorTimeout, got {other:?}"),
    }
    // RF is switched off by the session teardown, not the controller
    assert!(bench.snapshot().await.rf_enabled);
}
