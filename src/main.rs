//! ivbench - Main Entry Point
//!
//! Command line frontend for the bench curve tracer: port discovery, live
//! telemetry monitoring, and automated sweeps with aggregated output.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ivbench::config::{self, BenchProfile, DEFAULT_SWEEP_INTERVAL_MS};
use ivbench::engine::{BenchEngine, EngineEvent, EngineHandle};
use ivbench::link::list_ports;
use ivbench::sweep::{SweepConfig, SweepOutcome, SweepTermination};
use ivbench::types::LinkStatus;

/// ivbench -- telemetry and sweep automation for a bench curve tracer.
#[derive(Parser)]
#[command(name = "ivbench", version, about)]
struct Cli {
    /// Profile file to load instead of the platform default.
    #[arg(long)]
    profile: Option<PathBuf>,

    /// Serial port path (e.g. /dev/ttyUSB0, COM3). Overrides the profile.
    #[arg(long)]
    port: Option<String>,

    /// Baud rate override.
    #[arg(long)]
    baud: Option<u32>,

    /// Drive a simulated instrument instead of a serial port.
    #[cfg(feature = "mock-instrument")]
    #[arg(long)]
    mock: bool,

    /// Directory for daily rolling log files. Without it, logs go to
    /// stderr only.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List serial ports that could host the instrument.
    ListPorts,

    /// Stream live telemetry to the terminal.
    Monitor {
        /// Duration in seconds (0 = run until Ctrl-C).
        #[arg(long, default_value_t = 0)]
        seconds: u64,
    },

    /// Run a sweep and print the aggregated curve.
    Sweep {
        /// First setpoint in raw counts.
        #[arg(long)]
        start: i32,

        /// Final setpoint in raw counts.
        #[arg(long)]
        end: i32,

        /// Raw increment per tick.
        #[arg(long)]
        step: i32,

        /// Tick interval in milliseconds.
        #[arg(long, default_value_t = DEFAULT_SWEEP_INTERVAL_MS)]
        interval_ms: u64,

        /// Print the curve as JSON instead of a table.
        #[arg(long)]
        json: bool,

        /// Also write the aggregated curve to a CSV file.
        #[arg(long)]
        csv: Option<PathBuf>,
    },

    /// Write the current profile to the platform config location.
    InitProfile,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let _log_guard = init_logging(cli.log_dir.as_deref())?;

    tracing::info!("Starting ivbench");

    // Profile first, command line overrides on top.
    let mut profile = match &cli.profile {
        Some(path) => BenchProfile::load_from(path)
            .with_context(|| format!("Failed to load profile {}", path.display()))?,
        None => BenchProfile::load_or_default(),
    };
    if let Some(port) = &cli.port {
        profile.link.port = Some(port.clone());
    }
    if let Some(baud) = cli.baud {
        profile.link.baud_rate = baud;
    }

    #[cfg(feature = "mock-instrument")]
    let use_mock = cli.mock;
    #[cfg(not(feature = "mock-instrument"))]
    let use_mock = false;

    match &cli.command {
        Command::ListPorts => cmd_list_ports(),
        Command::InitProfile => cmd_init_profile(&profile),
        Command::Monitor { seconds } => {
            let engine = start_engine(profile, use_mock)?;
            cmd_monitor(engine, *seconds)
        }
        Command::Sweep {
            start,
            end,
            step,
            interval_ms,
            json,
            csv,
        } => {
            let config = SweepConfig {
                start: *start,
                end: *end,
                step: *step,
                interval_ms: *interval_ms,
            };
            let engine = start_engine(profile, use_mock)?;
            cmd_sweep(engine, config, *json, csv.as_deref())
        }
    }
}

/// Initialize the tracing stack
///
/// Log output goes to stderr so tables, JSON, and CSV on stdout stay
/// machine readable. Returns the guard that flushes the file appender on
/// exit.
fn init_logging(
    log_dir: Option<&Path>,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,ivbench=debug"));
    let registry = tracing_subscriber::registry().with(filter);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "ivbench.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
            Ok(Some(guard))
        }
        None => {
            registry
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
            Ok(None)
        }
    }
}

/// Spawned engine with its frontend handle
struct RunningEngine {
    handle: EngineHandle,
    thread: std::thread::JoinHandle<()>,
}

impl RunningEngine {
    fn shutdown(self) {
        self.handle.shutdown();
        let _ = self.thread.join();
    }
}

/// Spawn the engine, pick the transport, and open the link
fn start_engine(profile: BenchProfile, use_mock: bool) -> Result<RunningEngine> {
    let (engine, handle) = BenchEngine::new(profile);
    let thread = std::thread::spawn(move || engine.run());
    let engine = RunningEngine { handle, thread };

    if use_mock {
        #[cfg(feature = "mock-instrument")]
        engine.handle.use_mock_instrument(true);
    }

    engine.handle.open_link(None);
    if let Err(e) = wait_for_open(&engine.handle, Duration::from_secs(10)) {
        engine.shutdown();
        return Err(e);
    }
    Ok(engine)
}

/// Wait for the link to open, surfacing the first link error
fn wait_for_open(handle: &EngineHandle, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        for event in handle.drain() {
            match event {
                EngineEvent::LinkStatus(LinkStatus::Open) => return Ok(()),
                EngineEvent::LinkError(message) => bail!("link error: {message}"),
                EngineEvent::Shutdown => bail!("engine stopped before the link opened"),
                _ => {}
            }
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    bail!("timed out waiting for the link to open");
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

fn cmd_list_ports() -> Result<()> {
    let ports = list_ports()?;

    if ports.is_empty() {
        println!("No serial ports found.");
        return Ok(());
    }

    for port in &ports {
        println!("{port}");
    }

    println!();
    println!("{} port(s) found.", ports.len());
    Ok(())
}

fn cmd_init_profile(profile: &BenchProfile) -> Result<()> {
    profile.save()?;
    match config::profile_path() {
        Some(path) => println!("Wrote profile to {}", path.display()),
        None => println!("Wrote profile."),
    }
    Ok(())
}

fn cmd_monitor(engine: RunningEngine, seconds: u64) -> Result<()> {
    println!("Streaming telemetry (Ctrl-C to stop)...");
    println!(
        "{:>14}  {:>10}  {:>10}  {:>10}  {:>10}  Range",
        "Time", "Set uA", "Drop V", "Corr uA", "Err uA"
    );

    let deadline = if seconds > 0 {
        Some(Instant::now() + Duration::from_secs(seconds))
    } else {
        None
    };
    let mut last_stats = None;

    'stream: loop {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                break;
            }
        }

        for event in engine.handle.drain() {
            match event {
                EngineEvent::Sample(sample) => {
                    let range = match (sample.high_voltage, sample.high_current) {
                        (true, true) => "HV+HC",
                        (true, false) => "HV",
                        (false, true) => "HC",
                        (false, false) => "low",
                    };
                    println!(
                        "{:>14}  {:>10.3}  {:>10.4}  {:>10.3}  {:>10.3}  {}",
                        Local::now().format("%H:%M:%S%.3f"),
                        sample.set_current_ua,
                        sample.drop_voltage_v,
                        sample.corrected_current_ua,
                        sample.current_error_ua,
                        range,
                    );
                }
                EngineEvent::Stats(stats) => last_stats = Some(stats),
                EngineEvent::LinkError(message) => eprintln!("link error: {message}"),
                EngineEvent::Shutdown => break 'stream,
                _ => {}
            }
        }

        std::thread::sleep(Duration::from_millis(50));
    }

    if let Some(stats) = last_stats {
        println!();
        println!(
            "{} frames decoded, {} malformed, {:.1} frames/s",
            stats.frames_decoded, stats.malformed_frames, stats.sample_rate_hz
        );
    }

    engine.shutdown();
    Ok(())
}

fn cmd_sweep(
    engine: RunningEngine,
    config: SweepConfig,
    json: bool,
    csv: Option<&Path>,
) -> Result<()> {
    if let Err(e) = config.validate() {
        engine.shutdown();
        return Err(e.into());
    }

    eprintln!(
        "Sweeping {} -> {} in steps of {} every {} ms...",
        config.start, config.end, config.step, config.interval_ms
    );
    engine.handle.start_sweep(config);

    let outcome = match wait_for_outcome(&engine.handle, &config) {
        Ok(outcome) => outcome,
        Err(e) => {
            engine.shutdown();
            return Err(e);
        }
    };

    match outcome.termination {
        SweepTermination::Completed => {}
        SweepTermination::Stopped => eprintln!("sweep stopped early"),
        SweepTermination::Aborted => {
            engine.shutdown();
            bail!("sweep aborted after repeated write failures");
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_curve_table(&outcome);
    }
    if let Some(path) = csv {
        write_curve_csv(&outcome, path)?;
        eprintln!("Wrote {}", path.display());
    }

    engine.shutdown();
    Ok(())
}

/// Block until the engine reports the sweep outcome
///
/// The deadline allows the full nominal sweep duration plus a margin for
/// serial latency.
fn wait_for_outcome(handle: &EngineHandle, config: &SweepConfig) -> Result<SweepOutcome> {
    let span = (config.end as i64 - config.start as i64).unsigned_abs();
    let ticks = span.div_ceil(config.step.unsigned_abs().max(1) as u64);
    let deadline = Instant::now()
        + Duration::from_millis(config.interval_ms.saturating_mul(ticks + 2))
        + Duration::from_secs(5);

    while Instant::now() < deadline {
        for event in handle.drain() {
            match event {
                EngineEvent::SweepFinished(outcome) => return Ok(outcome),
                EngineEvent::SweepError(message) => bail!("sweep rejected: {message}"),
                EngineEvent::LinkError(message) => eprintln!("link error: {message}"),
                EngineEvent::Shutdown => bail!("engine stopped before the sweep finished"),
                _ => {}
            }
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    bail!("timed out waiting for the sweep to finish");
}

// ---------------------------------------------------------------------------
// Output rendering
// ---------------------------------------------------------------------------

fn print_curve_table(outcome: &SweepOutcome) {
    let Some(curve) = outcome.curve.as_ref() else {
        println!("No samples fell inside the aggregation window.");
        return;
    };

    println!(
        "{:>12}  {:>10}  {:>10}  {:>10}  {:>7}",
        "Current uA", "Mean V", "Min V", "Max V", "Samples"
    );
    println!(
        "{:>12}  {:>10}  {:>10}  {:>10}  {:>7}",
        "-".repeat(12),
        "-".repeat(10),
        "-".repeat(10),
        "-".repeat(10),
        "-".repeat(7),
    );

    for bin in &curve.bins {
        println!(
            "{:>12.3}  {:>10.4}  {:>10.4}  {:>10.4}  {:>7}",
            bin.current_ua, bin.mean_voltage_v, bin.min_voltage_v, bin.max_voltage_v, bin.samples
        );
    }

    println!();
    println!(
        "{} bins from {} captured pairs ({}).",
        curve.bins.len(),
        outcome.captured,
        outcome.termination
    );
}

/// Write the aggregated curve as CSV with a header row
fn write_curve_csv(outcome: &SweepOutcome, path: &Path) -> Result<()> {
    let Some(curve) = outcome.curve.as_ref() else {
        bail!("no aggregated curve to write");
    };

    let mut file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    writeln!(file, "current_ua,mean_voltage_v,min_voltage_v,max_voltage_v,samples")?;
    for bin in &curve.bins {
        writeln!(
            file,
            "{},{},{},{},{}",
            bin.current_ua, bin.mean_voltage_v, bin.min_voltage_v, bin.max_voltage_v, bin.samples
        )?;
    }
    Ok(())
}
