//! # Pitch Monitor - Headless Host
//!
//! Runs the pitch engine against the default input device and prints the
//! stabilized pitch to the terminal.
//!
//! ## Architecture
//! - **Main Thread**: argument parsing, engine control, periodic readout
//! - **Audio Thread**: CPAL callback that fills the shared input buffer
//! - **Engine Thread**: inference loop writing the shared result buffer
//! - **Communication**: lock-free shared buffers for data, crossbeam channels
//!   for control and events

use anyhow::{Context, Result, bail};
use clap::Parser;
use cpal::traits::StreamTrait;
use crossbeam_channel::{after, select, tick};
use log::{info, warn};
use pitch_core::{
    EngineConfig, Event, FRAME_LEN, InferenceRuntime, PitchEngine, ProfileRegistry, RuntimeLoader,
    SharedInputBuffer, SharedResultBuffer, StabilizerMode, YinRuntime, audio, tuning,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Readings older than this are shown as silence.
const STALE_AFTER_MS: f64 = 500.0;

#[derive(Parser, Debug)]
#[command(name = "pitch-monitor")]
#[command(about = "Real-time pitch monitor", long_about = None)]
struct Cli {
    /// Instrument profile id
    #[arg(short, long, default_value = "auto")]
    profile: String,

    /// Stabilizer mode (full or light)
    #[arg(short, long, default_value = "full")]
    mode: StabilizerMode,

    /// Publish raw mapper output instead of stabilized pitch
    #[arg(long)]
    no_stabilizer: bool,

    /// Print per-cycle timing
    #[arg(long)]
    timing: bool,

    /// JSON file with a custom profile table
    #[arg(long)]
    profiles: Option<PathBuf>,

    /// Write the active profile table to this file and exit
    #[arg(long)]
    export_profiles: Option<PathBuf>,

    /// Target inference period in milliseconds
    #[arg(long, default_value_t = 16)]
    period_ms: u64,

    /// Stop after this many seconds (runs until killed when omitted)
    #[arg(short, long)]
    duration: Option<u64>,

    /// Readout interval in milliseconds
    #[arg(long, default_value_t = 100)]
    print_ms: u64,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let registry = match &cli.profiles {
        Some(path) => ProfileRegistry::load(path)
            .with_context(|| format!("Failed to load profiles from {}", path.display()))?,
        None => ProfileRegistry::builtin().clone(),
    };
    if let Some(path) = &cli.export_profiles {
        registry
            .save(path)
            .with_context(|| format!("Failed to write profiles to {}", path.display()))?;
        info!("Profile table written to {}", path.display());
        return Ok(());
    }
    if !registry.contains(&cli.profile) {
        warn!(
            "Unknown profile '{}'; available: {}",
            cli.profile,
            registry.ids().collect::<Vec<_>>().join(", ")
        );
    }
    if cli.period_ms == 0 {
        bail!("--period-ms must be at least 1");
    }

    let config = EngineConfig {
        cycle_period: Duration::from_millis(cli.period_ms),
        initial_profile: cli.profile.clone(),
        stabilizer_mode: cli.mode,
        stabilizer_enabled: !cli.no_stabilizer,
        timing: cli.timing,
        registry: Arc::new(registry),
    };

    let loader: RuntimeLoader =
        Box::new(|| Ok(Box::new(YinRuntime::default()) as Box<dyn InferenceRuntime>));
    let engine = PitchEngine::spawn(loader, config).context("Failed to start the pitch engine")?;

    engine.init()?;
    match engine.events().recv_timeout(Duration::from_secs(10)) {
        Ok(Event::Ready { ok: true, runtime }) => {
            info!("Runtime ready: {}", runtime.as_deref().unwrap_or("unknown"));
        }
        Ok(Event::Ready { ok: false, .. }) => {
            warn!("Runtime failed to load; pitch will read 0");
        }
        Ok(other) => warn!("Unexpected event before ready: {other:?}"),
        Err(_) => bail!("Timed out waiting for the inference runtime"),
    }

    let input = Arc::new(SharedInputBuffer::new(FRAME_LEN));
    let output = Arc::new(SharedResultBuffer::new());

    let (stream, device_rate) =
        audio::start_capture(Arc::clone(&input)).context("Failed to start audio capture")?;
    info!("Capturing at {device_rate} Hz");

    engine.start_polling(Some(input), Some(Arc::clone(&output)))?;

    let printer = tick(Duration::from_millis(cli.print_ms.max(10)));
    let deadline = match cli.duration {
        Some(secs) => after(Duration::from_secs(secs)),
        None => crossbeam_channel::never(),
    };

    loop {
        select! {
            recv(printer) -> _ => print_reading(&output),
            recv(engine.events()) -> event => match event {
                Ok(Event::Timing(t)) => println!(
                    "timing: preprocess {:.3} ms | inference {:.3} ms | total {:.3} ms",
                    t.preprocess_ms, t.inference_ms, t.total_ms
                ),
                Ok(event) => info!("Engine event: {event:?}"),
                Err(_) => {
                    warn!("Engine thread exited");
                    break;
                }
            },
            recv(deadline) -> _ => break,
        }
    }

    engine.stop_polling()?;
    if let Err(e) = stream.pause() {
        warn!("Failed to pause the audio stream: {e}");
    }
    engine.shutdown();
    info!("Pitch monitor finished");
    Ok(())
}

fn print_reading(output: &SharedResultBuffer) {
    let snapshot = output.snapshot();
    let age = pitch_core::shared::now_ms() - snapshot.timestamp_ms;
    if snapshot.timestamp_ms <= 0.0 || age > STALE_AFTER_MS || snapshot.pitch <= 0.0 {
        println!("   --.-- Hz  ---        conf {:.2}", snapshot.confidence);
        return;
    }
    let held = if snapshot.settled { "held" } else { "" };

    let pitch = snapshot.pitch as f32;
    let note = tuning::nearest_note(pitch)
        .map(|(name, cents)| format!("{name:<4} {cents:+6.1}c"))
        .unwrap_or_else(|| "---".to_string());
    println!(
        "{pitch:8.2} Hz  {note:<11} conf {:.2}  latency {:.1} ms  {held}",
        snapshot.confidence, snapshot.latency_ms
    );
}
