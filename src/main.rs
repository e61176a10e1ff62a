//! CLI Entry Point for hypercube-daq
//!
//! Provides command-line interface for:
//! - Running a full calibration + acquisition sweep against the simulated bench
//! - Validating a configuration file
//! - Inspecting a saved calibration table
//!
//! # Usage
//!
//! ```bash
//! hypercube-daq run --config config/hypercube.toml
//! hypercube-daq run --reuse-calibration data/calibration_results.csv --auto-references
//! hypercube-daq validate-config --config config/hypercube.toml
//! hypercube-daq inspect-calibration data/calibration_results.csv
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use hypercube_daq::calibration::{ReferenceKind, ReferenceTrigger};
use hypercube_daq::config::{RunConfig, DEFAULT_CONFIG_PATH};
use hypercube_daq::hardware::mock::{simulated_devices, BenchTrigger, OpticalBench};
use hypercube_daq::run::{HyperspectralRun, RunMode};
use hypercube_daq::{logging, storage, AppResult};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "hypercube-daq")]
#[command(about = "Power-normalized hyperspectral image acquisition", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run references, power normalization and the acquisition sweep
    Run {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Skip power normalization and use this calibration table
        #[arg(long)]
        reuse_calibration: Option<PathBuf>,

        /// Place references without waiting for the operator
        #[arg(long)]
        auto_references: bool,

        /// Simulated camera height in pixels
        #[arg(long, default_value_t = 48)]
        height: usize,

        /// Simulated camera width in pixels
        #[arg(long, default_value_t = 64)]
        width: usize,
    },

    /// Load and validate a configuration file
    ValidateConfig {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Print a calibration table with its compensation factors
    InspectCalibration {
        /// Calibration CSV
        file: PathBuf,
    },
}

/// Asks the operator to place each reference, then switches the bench scene.
struct OperatorTrigger {
    bench: BenchTrigger,
}

#[async_trait]
impl ReferenceTrigger for OperatorTrigger {
    async fn place(&self, kind: ReferenceKind) -> AppResult<()> {
        println!("📋 Place {} reference and press Enter", kind);
        let mut line = String::new();
        BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
        self.bench.place(kind).await
    }

    async fn clear(&self) -> AppResult<()> {
        println!("📋 Remove the references and press Enter to begin power normalization");
        let mut line = String::new();
        BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
        self.bench.clear().await
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            reuse_calibration,
            auto_references,
            height,
            width,
        } => run(config, reuse_calibration, auto_references, height, width).await,
        Commands::ValidateConfig { config } => validate_config(config),
        Commands::InspectCalibration { file } => inspect_calibration(file),
    }
}

async fn run(
    config_path: PathBuf,
    reuse: Option<PathBuf>,
    auto_references: bool,
    height: usize,
    width: usize,
) -> Result<()> {
    let config = RunConfig::load_from(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    logging::init_from_config(&config)?;

    println!("🚀 {}", config.application.name);
    println!(
        "   Wavelength range: {} pm to {} pm ({} steps)",
        config.sweep.min_wavelength_pm, config.sweep.max_wavelength_pm, config.sweep.steps
    );
    println!("   Camera exposure: {} µs", config.acquisition.exposure_us);
    println!(
        "   Spectrometer integration: {} µs",
        config.acquisition.integration_time_us
    );
    println!();

    let mode = match reuse {
        Some(path) => RunMode::Reuse(path),
        None => RunMode::Calibrate,
    };

    println!("🔧 Initializing simulated bench...");
    let bench = OpticalBench::new();
    let devices = simulated_devices(&bench, height, width);
    let trigger: Arc<dyn ReferenceTrigger> = if auto_references {
        Arc::new(BenchTrigger::new(bench.clone()))
    } else {
        Arc::new(OperatorTrigger {
            bench: BenchTrigger::new(bench.clone()),
        })
    };

    let run = HyperspectralRun::new(config).with_mode(mode);
    let outcome = match run.execute(devices, trigger).await {
        Ok(outcome) => outcome,
        Err(e) => {
            eprintln!("❌ Run failed: {}", e);
            return Err(e.into());
        }
    };

    let (h, w, steps) = outcome.hypercube.dimensions();
    println!();
    println!("✅ Run {} complete", outcome.report.run_id);
    println!("   Hypercube: {} x {} x {}", h, w, steps);
    println!(
        "   Planes captured: {}/{}",
        outcome.report.populated_planes, steps
    );
    let exhausted = outcome.report.exhausted_wavelengths();
    if !exhausted.is_empty() {
        println!("   ⚠️  Best-effort wavelengths (pm): {:?}", exhausted);
    }
    for warning in &outcome.report.warnings {
        println!("   ⚠️  {}", warning);
    }
    println!("   Calibration: {}", outcome.artifacts.calibration.display());
    if outcome.report.config.storage.write_report {
        println!("   Spectrum:    {}", outcome.artifacts.spectrum.display());
        println!("   Report:      {}", outcome.artifacts.report.display());
    }
    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    let config = RunConfig::load_from(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    config.validate()?;
    println!("✅ {} is valid", config_path.display());
    println!(
        "   {} steps, {} pm to {} pm",
        config.sweep.steps, config.sweep.min_wavelength_pm, config.sweep.max_wavelength_pm
    );
    println!(
        "   target {} ± {}, {} iterations max, dwell {:?}",
        config.normalization.target_count,
        config.normalization.tolerance,
        config.normalization.max_iterations,
        config.normalization.dwell
    );
    println!();
    println!("# Effective configuration (file + environment)");
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

fn inspect_calibration(file: PathBuf) -> Result<()> {
    let table = storage::load_calibration(&file)
        .with_context(|| format!("reading {}", file.display()))?;
    let compensation = table.compensation();

    println!("📊 {} ({} records)", file.display(), table.len());
    println!(
        "{:>16} {:>10} {:>14} {:>10}",
        "Wavelength (pm)", "Amplitude", "Count", "Factor"
    );
    for record in table.records() {
        println!(
            "{:>16} {:>10} {:>14.3} {:>10.4}",
            record.wavelength_pm,
            record.amplitude.get(),
            record.achieved_count,
            compensation.compensation_factor(f64::from(record.wavelength_pm))
        );
    }
    Ok(())
}
