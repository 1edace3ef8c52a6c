//! # Axon CLI
//!
//! Command-line interface for Hodgkin-Huxley membrane simulations.

use anyhow::{bail, Context};
use axon_hh::{
    amplitude_sweep, detect_spikes, Method, SimulationConfig, StimulusProtocol, Trajectory,
    SPIKE_THRESHOLD,
};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "axon")]
#[command(author = "Yatrogenesis")]
#[command(version = "0.1.0")]
#[command(about = "Hodgkin-Huxley single-compartment membrane simulator", long_about = None)]
struct Cli {
    /// Log filter (error, warn, info, debug, trace); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one simulation and write the trajectory
    Run {
        #[command(flatten)]
        setup: Setup,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Csv)]
        format: Format,

        /// Output file (stdout when absent)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the default configuration as JSON
    Defaults,

    /// Sweep the stimulus amplitude and count spikes at each value
    Sweep {
        #[command(flatten)]
        setup: Setup,

        /// First amplitude (uA/cm^2)
        #[arg(long, default_value_t = 0.0)]
        from: f64,

        /// Last amplitude (uA/cm^2)
        #[arg(long, default_value_t = 40.0)]
        to: f64,

        /// Number of amplitudes, endpoints included
        #[arg(long, default_value_t = 9)]
        steps: usize,
    },
}

/// Configuration file plus command-line overrides
#[derive(clap::Args)]
struct Setup {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Step amplitude (uA/cm^2)
    #[arg(long)]
    amplitude: Option<f64>,

    /// Step onset (ms)
    #[arg(long)]
    onset: Option<f64>,

    /// Step offset (ms)
    #[arg(long)]
    offset: Option<f64>,

    /// Simulated time (ms)
    #[arg(long)]
    t_end: Option<f64>,

    /// Output spacing (ms)
    #[arg(long)]
    dt: Option<f64>,

    /// Integration method
    #[arg(long, value_enum)]
    method: Option<MethodArg>,

    /// Relative tolerance
    #[arg(long)]
    rtol: Option<f64>,

    /// Absolute tolerance
    #[arg(long)]
    atol: Option<f64>,
}

#[derive(Clone, Copy, ValueEnum)]
enum MethodArg {
    /// Dormand-Prince 5(4)
    Dopri5,
    /// Bogacki-Shampine 3(2)
    Bs32,
}

impl From<MethodArg> for Method {
    fn from(arg: MethodArg) -> Self {
        match arg {
            MethodArg::Dopri5 => Method::DormandPrince54,
            MethodArg::Bs32 => Method::BogackiShampine32,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Csv,
    Json,
}

impl Setup {
    fn resolve(&self) -> anyhow::Result<SimulationConfig> {
        let mut config = match &self.config {
            Some(path) => SimulationConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => SimulationConfig::default(),
        };

        if self.amplitude.is_some() || self.onset.is_some() || self.offset.is_some() {
            let (mut amplitude, mut onset, mut offset) = match config.stimulus {
                StimulusProtocol::Step {
                    amplitude,
                    onset,
                    offset,
                } => (amplitude, onset, offset),
                StimulusProtocol::None => (0.0, 10.0, 40.0),
                _ => bail!("--amplitude, --onset and --offset only apply to a step stimulus"),
            };
            amplitude = self.amplitude.unwrap_or(amplitude);
            onset = self.onset.unwrap_or(onset);
            offset = self.offset.unwrap_or(offset);
            config.stimulus = StimulusProtocol::Step {
                amplitude,
                onset,
                offset,
            };
        }
        if let Some(t_end) = self.t_end {
            config.time.t_end = t_end;
        }
        if let Some(dt) = self.dt {
            config.time.dt = dt;
        }
        if let Some(method) = self.method {
            config.solver.method = method.into();
        }
        if let Some(rtol) = self.rtol {
            config.solver.rtol = rtol;
        }
        if let Some(atol) = self.atol {
            config.solver.atol = atol;
        }

        config.validate()?;
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("invalid log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            setup,
            format,
            output,
        } => {
            let config = setup.resolve()?;
            let trajectory = axon_hh::simulate(&config)?;
            write_trajectory(&trajectory, format, output.as_deref())?;
            print_summary(&trajectory);
        }

        Commands::Defaults => {
            println!("{}", SimulationConfig::default().to_json()?);
        }

        Commands::Sweep {
            setup,
            from,
            to,
            steps,
        } => {
            if steps == 0 {
                bail!("--steps must be at least 1");
            }
            let config = setup.resolve()?;
            let amplitudes: Vec<f64> = if steps == 1 {
                vec![from]
            } else {
                (0..steps)
                    .map(|i| from + (to - from) * i as f64 / (steps - 1) as f64)
                    .collect()
            };
            info!(count = amplitudes.len(), "amplitude sweep");

            let points = amplitude_sweep(&config, &amplitudes)?;
            println!("{}", "Amplitude sweep:".green().bold());
            println!(
                "  {:>12}  {:>6}  {:>10}  {:>10}",
                "I (uA/cm2)", "spikes", "peak (mV)", "rate (Hz)"
            );
            for p in points {
                let spikes = if p.spikes > 0 {
                    p.spikes.to_string().cyan()
                } else {
                    p.spikes.to_string().normal()
                };
                println!(
                    "  {:>12.3}  {:>6}  {:>10.2}  {:>10.1}",
                    p.amplitude, spikes, p.peak, p.rate
                );
            }
        }
    }

    Ok(())
}

fn write_trajectory(
    trajectory: &Trajectory,
    format: Format,
    path: Option<&Path>,
) -> anyhow::Result<()> {
    let sink: Box<dyn Write> = match path {
        Some(p) => {
            let file = fs::File::create(p).with_context(|| format!("creating {}", p.display()))?;
            Box::new(file)
        }
        None => Box::new(io::stdout().lock()),
    };
    let mut out = BufWriter::new(sink);

    match format {
        Format::Csv => {
            writeln!(out, "t,V,m,h,n")?;
            for s in trajectory.samples() {
                writeln!(out, "{},{},{},{},{}", s.t, s.v, s.m, s.h, s.n)?;
            }
        }
        Format::Json => {
            let samples: Vec<_> = trajectory.samples().collect();
            serde_json::to_writer(&mut out, &samples)?;
            writeln!(out)?;
        }
    }
    out.flush()?;
    Ok(())
}

fn print_summary(trajectory: &Trajectory) {
    let voltage = trajectory.voltage();
    let spikes = detect_spikes(&voltage, SPIKE_THRESHOLD);
    let stats = &trajectory.stats;

    eprintln!("{}", "Simulation complete".green().bold());
    eprintln!("  Samples:  {}", trajectory.len());
    eprintln!(
        "  Steps:    {} accepted, {} rejected, {} evaluations",
        stats.accepted, stats.rejected, stats.evaluations
    );
    if let (Some((_, lo)), Some((_, hi))) = (voltage.min(), voltage.max()) {
        eprintln!("  V range:  [{lo:.2}, {hi:.2}] mV");
    }
    if spikes.is_empty() {
        eprintln!("  Spikes:   {}", "none".yellow());
    } else {
        let times: Vec<String> = spikes.iter().map(|s| format!("{:.2}", s.time)).collect();
        eprintln!("  Spikes:   {} at {} ms", spikes.len().to_string().cyan(), times.join(", "));
    }
}
