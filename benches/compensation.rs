//! Criterion benchmarks for the compensation and accumulation hot paths.
//!
//! The acquisition sweep evaluates the compensation function once per step and
//! once per spectrometer channel when the cumulative spectrum is finished, so
//! both scale with table size and grid size.
//!
//! Key metrics:
//! - Interpolation latency against table size
//! - Full-grid spectrum compensation
//! - Per-read dark subtraction and accumulation
//!
//! Run with: cargo bench --bench compensation

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use hypercube_daq::acquisition::SpectrumAccumulator;
use hypercube_daq::calibration::{CalibrationRecord, CalibrationTable, ReferenceData};
use hypercube_daq::hardware::Amplitude;

const GRID_CHANNELS: usize = 2048;

fn table(nodes: u32) -> CalibrationTable {
    let records = (0..nodes)
        .map(|i| {
            let amplitude = 300 + i64::from((i * 37) % 700);
            CalibrationRecord::new(400_000 + i * 500, Amplitude::clamped(amplitude), 1000.0)
        })
        .collect();
    CalibrationTable::new(records).unwrap()
}

fn grid() -> Vec<f64> {
    (0..GRID_CHANNELS).map(|i| 350.0 + i as f64 * 0.3).collect()
}

/// Interpolation cost as the table grows.
///
/// Queries fall between nodes, on nodes and outside the range so every branch
/// of the lookup is represented.
fn compensation_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("compensation_lookup");

    for nodes in [16u32, 256, 1024] {
        let f = table(nodes).compensation();
        let queries: Vec<f64> = (0..64)
            .map(|i| 350_000.0 + f64::from(i) * f64::from(nodes) * 9.0)
            .collect();

        group.throughput(Throughput::Elements(queries.len() as u64));
        group.bench_with_input(BenchmarkId::new("drive_amplitude", nodes), &nodes, |b, _| {
            b.iter(|| {
                for &wl in &queries {
                    black_box(f.drive_amplitude(black_box(wl)));
                }
            });
        });
    }

    group.finish();
}

/// Finishing the cumulative spectrum divides every channel by its factor.
fn spectrum_compensation(c: &mut Criterion) {
    let mut group = c.benchmark_group("spectrum_compensation");
    group.throughput(Throughput::Elements(GRID_CHANNELS as u64));

    let f = table(256).compensation();
    let reading: Vec<f64> = (0..GRID_CHANNELS).map(|i| (i % 97) as f64).collect();

    group.bench_function("finish", |b| {
        b.iter(|| {
            let mut acc = SpectrumAccumulator::new(grid());
            acc.accumulate(&reading).unwrap();
            black_box(acc.finish(&f));
        });
    });

    group.finish();
}

/// Dark subtraction plus accumulation for one spectrometer read.
fn accumulate_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("accumulate_read");
    group.throughput(Throughput::Elements(GRID_CHANNELS as u64));

    let refs = ReferenceData::from_readings(
        grid(),
        vec![100.0; GRID_CHANNELS],
        vec![4100.0; GRID_CHANNELS],
    )
    .unwrap();
    let raw: Vec<f64> = (0..GRID_CHANNELS).map(|i| 100.0 + (i % 211) as f64).collect();
    let mut acc = SpectrumAccumulator::new(grid());

    group.bench_function("subtract_and_accumulate", |b| {
        b.iter(|| {
            let subtracted = refs.subtract_dark(black_box(&raw)).unwrap();
            acc.accumulate(&subtracted).unwrap();
        });
    });
    black_box(acc.contributions());

    group.finish();
}

criterion_group!(
    benches,
    compensation_lookup,
    spectrum_compensation,
    accumulate_read
);
criterion_main!(benches);
