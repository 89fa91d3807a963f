//! CLI Entry Point for waveguide-daq
//!
//! Provides command-line interface for:
//! - Running the full characterization loop on the simulated bench
//! - One-off TE/TM insertion-loss measurements
//! - Validating a configuration file
//!
//! # Usage
//!
//! Run a scan (operator commands `pause`, `resume`, `stop` on stdin):
//! ```bash
//! waveguide-daq run --config config/default.toml --output-dir data
//! ```
//!
//! Measure once at the current position:
//! ```bash
//! waveguide-daq measure --config config/default.toml
//! ```

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use waveguide_daq::config::Settings;
use waveguide_daq::error::DaqError;
use waveguide_daq::experiment::{
    ExecutionControl, Notifier, PolarizationScanner, RunSupervisor, ScanEvent, Spectrum,
};
use waveguide_daq::hardware::mock::SimulatedBench;
use waveguide_daq::logging;

#[derive(Parser)]
#[command(name = "waveguide-daq")]
#[command(about = "Photonic waveguide chip characterization", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the current/temperature/grid scan
    Run {
        /// Settings file
        #[arg(long, default_value = "config/default.toml")]
        config: PathBuf,

        /// Override `[storage] output_dir`
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Start without asking for confirmation
        #[arg(long, short)]
        yes: bool,
    },

    /// Capture one TE/TM sweep at the current position
    Measure {
        /// Settings file
        #[arg(long, default_value = "config/default.toml")]
        config: PathBuf,
    },

    /// Load and validate a settings file
    CheckConfig {
        /// Settings file
        #[arg(long, default_value = "config/default.toml")]
        config: PathBuf,

        /// Print the resolved settings as TOML
        #[arg(long)]
        print: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            output_dir,
            yes,
        } => run_scan(config, output_dir, yes).await,
        Commands::Measure { config } => measure_once(config).await,
        Commands::CheckConfig { config, print } => check_config(config, print),
    }
}

fn load_settings(path: &Path) -> Result<Settings> {
    let settings = Settings::load_validated(path)?;
    logging::init_from_settings(&settings).map_err(|e| anyhow!(e))?;
    Ok(settings)
}

async fn run_scan(config: PathBuf, output_dir: Option<PathBuf>, yes: bool) -> Result<()> {
    let mut settings = load_settings(&config)?;
    if let Some(dir) = output_dir {
        settings.storage.output_dir = dir;
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    println!(
        "{} current setpoints, {} chip(s) x {} output(s), records in {}",
        settings.scan.currents().len(),
        settings.grid.number_of_chips,
        settings.grid.outputs_per_chip,
        settings.storage.output_dir.display()
    );
    if !yes {
        println!("Start the scan? [y/N]");
        let answer = stdin.next_line().await?.unwrap_or_default();
        if !matches!(answer.trim(), "y" | "Y" | "yes") {
            println!("Aborted.");
            return Ok(());
        }
    }

    let sim = SimulatedBench::new(&settings);
    let mut supervisor = RunSupervisor::new(settings, sim.bench());
    let mut events = supervisor.subscribe();
    let run_id = supervisor.start(true).await?;
    info!(%run_id, "scan started");
    println!("Commands: pause | resume | stop");

    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = stdin.next_line(), if stdin_open => match line? {
                Some(command) => {
                    if let Err(e) = dispatch(&supervisor, command.trim()) {
                        warn!(error = %e, "command rejected");
                    }
                }
                None => stdin_open = false,
            },
            event = events.recv() => match event {
                Ok(ScanEvent::Status { text }) => println!("{text}"),
                Ok(ScanEvent::RecordSaved { path, .. }) => println!("saved {}", path.display()),
                Ok(ScanEvent::Finished) => break,
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "display fell behind"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("Ctrl-C: stopping...");
                let _ = supervisor.stop();
            }
        }
    }

    let summary = supervisor.join().await?;
    println!();
    println!("Run {}", summary.run_id);
    println!("  currents applied:   {}", summary.currents_applied.len());
    println!("  sites captured:     {}", summary.sites_captured);
    println!("  records written:    {}", summary.records.len());
    println!("  failed iterations:  {}", summary.iteration_failures);
    println!("  stopped by operator: {}", summary.stopped);
    Ok(())
}

fn dispatch(supervisor: &RunSupervisor, command: &str) -> Result<(), DaqError> {
    match command {
        "pause" => supervisor.pause(),
        "resume" => supervisor.resume(),
        "stop" => supervisor.stop(),
        "" => Ok(()),
        other => {
            println!("Unknown command '{other}'. Use pause, resume or stop.");
            Ok(())
        }
    }
}

async fn measure_once(config: PathBuf) -> Result<()> {
    let settings = load_settings(&config)?;
    let routing = *settings
        .active_routing()
        .ok_or_else(|| anyhow!("no routing for band {}", settings.sweep.band))?;

    let sim = SimulatedBench::new(&settings);
    let (notifier, _rx) = Notifier::channel();
    let scanner = PolarizationScanner::new(&sim.bench(), routing, &settings.sweep, notifier);
    let pair = scanner.capture_both(&ExecutionControl::new()).await?;

    for spectrum in [&pair.te, &pair.tm] {
        print_spectrum(spectrum);
    }
    Ok(())
}

fn print_spectrum(spectrum: &Spectrum) {
    let points = spectrum.loss_db.len();
    let mean = spectrum.loss_db.iter().sum::<f64>() / points.max(1) as f64;
    let worst = spectrum
        .loss_db
        .iter()
        .copied()
        .fold(f64::INFINITY, f64::min);
    println!(
        "{}: {} points, {:.1}-{:.1} nm, mean {:.3} dB, worst {:.3} dB",
        spectrum.polarization,
        points,
        spectrum.wavelengths_nm.first().copied().unwrap_or_default(),
        spectrum.wavelengths_nm.last().copied().unwrap_or_default(),
        mean,
        worst
    );
}

fn check_config(config: PathBuf, print: bool) -> Result<()> {
    let settings = Settings::load_validated(&config)?;
    if print {
        println!("{}", settings.to_toml_string()?);
        return Ok(());
    }
    println!("{}: OK", config.display());
    println!("  band {}", settings.sweep.band);
    println!("  currents (A): {:?}", settings.scan.currents());
    println!("  coupling scan: {}", settings.scan.coupling_scan);
    println!(
        "  grid: {} chip(s) x {} output(s)",
        settings.grid.number_of_chips, settings.grid.outputs_per_chip
    );
    Ok(())
}
