//! # Inference Engine
//!
//! Runs the per-cycle [`Pipeline`] on a dedicated background thread at a
//! fixed cadence and talks to the host through two channels:
//!
//! - **Commands** (host → engine): the typed control protocol in [`Command`]
//! - **Events** (engine → host): readiness, fallback results and timing
//!
//! Results normally go to a [`SharedResultBuffer`] the host polls; when the
//! host supplies none they are posted as [`Event::Result`] instead. Input
//! likewise comes from a [`SharedInputBuffer`] or, failing that, from
//! [`Command::PushFrame`] messages.
//!
//! ## Threading
//! - The engine thread only blocks while idle, while sleeping out the rest
//!   of a cycle, and inside the runtime's `infer` call.
//! - Runtime loading happens on a separate short-lived thread so commands
//!   keep flowing while the model loads.
//! - Stopping is cooperative: [`EngineHandle::stop_polling`] clears an atomic
//!   flag the loop checks before every cycle.

use crate::error::{PitchError, PitchResult};
use crate::pipeline::{CycleOutput, CycleTiming, Pipeline};
use crate::profiles::{DEFAULT_PROFILE_ID, ProfileRegistry};
use crate::runtime::{FRAME_LEN, HOP_LEN, InferenceRuntime, MODEL_SAMPLE_RATE, RuntimeLoader};
use crate::shared::{FrameInfo, SharedInputBuffer, SharedResultBuffer, now_ms};
use crate::stabilizer::StabilizerMode;
use crossbeam_channel::{Receiver, RecvError, Sender, never, select, unbounded};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type LoadResult = PitchResult<Box<dyn InferenceRuntime>>;

/// Inference failures are logged on the first occurrence and then every this many.
const FAILURE_LOG_INTERVAL: u64 = 200;

/// Host → engine control messages.
#[derive(Debug)]
pub enum Command {
    /// Begin loading the runtime. Answered by [`Event::Ready`].
    Init,
    /// Switch instrument profile. Stabilizer history is kept.
    SetProfile(String),
    /// Enable or disable per-cycle [`Event::Timing`] reports.
    SetTiming(bool),
    /// Enable or bypass the stabilizer stage.
    SetStabilizer(bool),
    /// Select the stabilizer mode. Stabilizer history is discarded.
    SetStabilizerMode(StabilizerMode),
    /// Start the cycle loop.
    StartPolling {
        input: Option<Arc<SharedInputBuffer>>,
        output: Option<Arc<SharedResultBuffer>>,
    },
    /// Deliver a frame when there is no shared input buffer.
    PushFrame {
        samples: Vec<f32>,
        captured_at_ms: Option<f64>,
    },
    /// Stop the cycle loop after the current cycle.
    StopPolling,
}

/// Engine → host messages.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Runtime initialization finished. `ok == false` means the engine will
    /// publish pitch 0 for as long as it polls.
    Ready { ok: bool, runtime: Option<String> },
    /// A cycle result, sent only when no shared output buffer is attached.
    /// `settled` is true once the stabilizer has held the same pitch for the
    /// profile's `stability_threshold` frames.
    Result {
        pitch: f32,
        confidence: f32,
        settled: bool,
    },
    /// Per-cycle timing, sent only while timing is enabled.
    Timing(CycleTiming),
}

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Target cycle period. Each cycle sleeps only what is left of it.
    pub cycle_period: Duration,
    pub initial_profile: String,
    pub stabilizer_mode: StabilizerMode,
    pub stabilizer_enabled: bool,
    pub timing: bool,
    pub registry: Arc<ProfileRegistry>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cycle_period: Duration::from_secs_f64(HOP_LEN as f64 / MODEL_SAMPLE_RATE as f64),
            initial_profile: DEFAULT_PROFILE_ID.to_string(),
            stabilizer_mode: StabilizerMode::Full,
            stabilizer_enabled: true,
            timing: false,
            registry: Arc::new(ProfileRegistry::builtin().clone()),
        }
    }
}

/// Entry point for spawning the engine thread.
pub struct PitchEngine;

impl PitchEngine {
    /// Spawns the engine thread. The runtime is not loaded until
    /// [`Command::Init`] arrives.
    pub fn spawn(loader: RuntimeLoader, config: EngineConfig) -> PitchResult<EngineHandle> {
        let (command_tx, command_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let polling = Arc::new(AtomicBool::new(false));

        let worker = Worker::new(loader, config, command_rx, event_tx, Arc::clone(&polling));
        let thread = thread::Builder::new()
            .name("pitch-inference".into())
            .spawn(move || worker.run())?;

        Ok(EngineHandle {
            commands: Some(command_tx),
            events: event_rx,
            polling,
            thread: Some(thread),
        })
    }
}

/// Host-side handle to a running engine. Dropping it stops the engine and
/// joins its thread.
pub struct EngineHandle {
    commands: Option<Sender<Command>>,
    events: Receiver<Event>,
    polling: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn send(&self, command: Command) -> PitchResult<()> {
        match &command {
            Command::StartPolling { .. } => self.polling.store(true, Ordering::Release),
            Command::StopPolling => self.polling.store(false, Ordering::Release),
            _ => {}
        }
        self.commands
            .as_ref()
            .ok_or_else(|| PitchError::Engine("engine already shut down".into()))?
            .send(command)
            .map_err(|_| PitchError::Engine("engine thread has exited".into()))
    }

    pub fn init(&self) -> PitchResult<()> {
        self.send(Command::Init)
    }

    pub fn set_profile(&self, id: &str) -> PitchResult<()> {
        self.send(Command::SetProfile(id.to_string()))
    }

    pub fn set_timing(&self, enabled: bool) -> PitchResult<()> {
        self.send(Command::SetTiming(enabled))
    }

    pub fn set_stabilizer(&self, enabled: bool) -> PitchResult<()> {
        self.send(Command::SetStabilizer(enabled))
    }

    pub fn set_stabilizer_mode(&self, mode: StabilizerMode) -> PitchResult<()> {
        self.send(Command::SetStabilizerMode(mode))
    }

    pub fn start_polling(
        &self,
        input: Option<Arc<SharedInputBuffer>>,
        output: Option<Arc<SharedResultBuffer>>,
    ) -> PitchResult<()> {
        self.send(Command::StartPolling { input, output })
    }

    pub fn push_frame(&self, samples: Vec<f32>, captured_at_ms: Option<f64>) -> PitchResult<()> {
        self.send(Command::PushFrame {
            samples,
            captured_at_ms,
        })
    }

    /// Cooperative stop: takes effect before the next cycle starts.
    pub fn stop_polling(&self) -> PitchResult<()> {
        self.send(Command::StopPolling)
    }

    /// Reflects the last start/stop sent through this handle, before the
    /// engine thread has necessarily acted on it.
    pub fn is_polling(&self) -> bool {
        self.polling.load(Ordering::Acquire)
    }

    pub fn events(&self) -> &Receiver<Event> {
        &self.events
    }

    /// Stops the engine and waits for its thread to exit.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        self.polling.store(false, Ordering::Release);
        // Disconnecting the command channel is the exit signal.
        self.commands.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("pitch inference thread panicked");
            }
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.close();
    }
}

enum RuntimeState {
    /// `Init` not received yet.
    Idle,
    Loading(Receiver<LoadResult>),
    Ready(Box<dyn InferenceRuntime>),
    /// Loading failed; cycles publish pitch 0.
    Failed,
}

/// What woke the engine thread up.
enum Wake {
    Command(Command),
    Loaded(Result<LoadResult, RecvError>),
    Timeout,
    Disconnected,
}

/// Where cycle input comes from.
enum FrameSource {
    Shared {
        buffer: Arc<SharedInputBuffer>,
        last_sequence: u64,
    },
    Messages {
        pending: bool,
        captured_at_ms: Option<f64>,
    },
}

impl FrameSource {
    fn messages() -> Self {
        FrameSource::Messages {
            pending: false,
            captured_at_ms: None,
        }
    }
}

struct Worker {
    period: Duration,
    commands: Receiver<Command>,
    events: Sender<Event>,
    polling: Arc<AtomicBool>,
    loader: Option<RuntimeLoader>,
    runtime: RuntimeState,
    pipeline: Pipeline,
    initial_mode: StabilizerMode,
    timing: bool,
    active: bool,
    source: FrameSource,
    output: Option<Arc<SharedResultBuffer>>,
    frame: Vec<f32>,
    failed_cycles: u64,
    warned_not_ready: bool,
}

impl Worker {
    fn new(
        loader: RuntimeLoader,
        config: EngineConfig,
        commands: Receiver<Command>,
        events: Sender<Event>,
        polling: Arc<AtomicBool>,
    ) -> Self {
        let mut pipeline = Pipeline::new(
            Arc::clone(&config.registry),
            &config.initial_profile,
            config.stabilizer_mode,
        );
        pipeline.set_stabilizer_enabled(config.stabilizer_enabled);

        Self {
            period: config.cycle_period,
            commands,
            events,
            polling,
            loader: Some(loader),
            runtime: RuntimeState::Idle,
            pipeline,
            initial_mode: config.stabilizer_mode,
            timing: config.timing,
            active: false,
            source: FrameSource::messages(),
            output: None,
            frame: vec![0.0; FRAME_LEN],
            failed_cycles: 0,
            warned_not_ready: false,
        }
    }

    fn run(mut self) {
        info!(
            "pitch engine started (profile '{}', mode {}, period {:?})",
            self.pipeline.profile_id(),
            self.initial_mode,
            self.period
        );

        loop {
            let running = if !self.active {
                let wake = self.wait(None);
                self.dispatch(wake)
            } else if self.polling.load(Ordering::Acquire) {
                let started = Instant::now();
                self.cycle(started);
                self.sleep_until(started + self.period)
            } else {
                self.stop();
                true
            };
            if !running {
                break;
            }
        }

        info!("pitch engine stopped");
    }

    /// Sleeps out the rest of the cycle, handling commands as they arrive.
    /// A cycle that overran its period still drains queued commands before
    /// the next one starts. Returns false once the host has gone away.
    fn sleep_until(&mut self, deadline: Instant) -> bool {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.wait(Some(remaining)) {
                Wake::Timeout => return true,
                wake => {
                    if !self.dispatch(wake) {
                        return false;
                    }
                }
            }
        }
    }

    /// Returns false once the host has gone away.
    fn dispatch(&mut self, wake: Wake) -> bool {
        match wake {
            Wake::Command(command) => self.handle(command),
            Wake::Loaded(result) => self.finish_loading(result),
            Wake::Timeout => {}
            Wake::Disconnected => return false,
        }
        true
    }

    fn wait(&self, timeout: Option<Duration>) -> Wake {
        let idle = never();
        let loading = match &self.runtime {
            RuntimeState::Loading(rx) => rx,
            _ => &idle,
        };

        match timeout {
            Some(timeout) => select! {
                recv(self.commands) -> msg => msg.map_or(Wake::Disconnected, Wake::Command),
                recv(loading) -> result => Wake::Loaded(result),
                default(timeout) => Wake::Timeout,
            },
            None => select! {
                recv(self.commands) -> msg => msg.map_or(Wake::Disconnected, Wake::Command),
                recv(loading) -> result => Wake::Loaded(result),
            },
        }
    }

    fn handle(&mut self, command: Command) {
        if !matches!(command, Command::PushFrame { .. }) {
            debug!("engine command: {command:?}");
        }
        match command {
            Command::Init => self.begin_loading(),
            Command::SetProfile(id) => {
                let resolved = self.pipeline.set_profile(&id);
                info!("instrument profile set to '{resolved}'");
            }
            Command::SetTiming(enabled) => self.timing = enabled,
            Command::SetStabilizer(enabled) => {
                self.pipeline.set_stabilizer_enabled(enabled);
                info!("stabilizer {}", if enabled { "enabled" } else { "bypassed" });
            }
            Command::SetStabilizerMode(mode) => {
                self.pipeline.set_stabilizer_mode(mode);
                info!("stabilizer mode set to {mode}");
            }
            Command::StartPolling { input, output } => self.start(input, output),
            Command::PushFrame {
                samples,
                captured_at_ms,
            } => self.accept_frame(&samples, captured_at_ms),
            // The handle already cleared the flag when it sent this.
            Command::StopPolling => {
                if self.active {
                    self.stop();
                }
            }
        }
    }

    fn begin_loading(&mut self) {
        if !matches!(self.runtime, RuntimeState::Idle) {
            // A repeated init is answered from the current state.
            self.emit_ready();
            return;
        }

        let Some(loader) = self.loader.take() else {
            self.fail_loading("runtime loader already consumed".to_string());
            return;
        };

        let (tx, rx) = crossbeam_channel::bounded::<LoadResult>(1);
        let spawned = thread::Builder::new()
            .name("pitch-runtime-init".into())
            .spawn(move || {
                let _ = tx.send(loader());
            });

        match spawned {
            Ok(_) => {
                info!("loading inference runtime...");
                self.runtime = RuntimeState::Loading(rx);
            }
            Err(e) => self.fail_loading(format!("could not spawn loader thread: {e}")),
        }
    }

    fn finish_loading(&mut self, result: Result<LoadResult, RecvError>) {
        match result {
            Ok(Ok(runtime)) => {
                info!("inference runtime '{}' ready", runtime.name());
                self.pipeline.attach(runtime.as_ref());
                self.runtime = RuntimeState::Ready(runtime);
                self.emit_ready();
            }
            Ok(Err(e)) => self.fail_loading(e.to_string()),
            Err(_) => self.fail_loading("loader thread exited without a result".to_string()),
        }
    }

    fn fail_loading(&mut self, reason: String) {
        error!("inference runtime unavailable, pitch output will stay at 0: {reason}");
        self.runtime = RuntimeState::Failed;
        self.emit_ready();
    }

    /// Reports a settled runtime state; silent while idle or still loading.
    fn emit_ready(&self) {
        let event = match &self.runtime {
            RuntimeState::Ready(runtime) => Event::Ready {
                ok: true,
                runtime: Some(runtime.name().to_string()),
            },
            RuntimeState::Failed => Event::Ready {
                ok: false,
                runtime: None,
            },
            RuntimeState::Idle | RuntimeState::Loading(_) => return,
        };
        self.emit(event);
    }

    fn start(
        &mut self,
        input: Option<Arc<SharedInputBuffer>>,
        output: Option<Arc<SharedResultBuffer>>,
    ) {
        self.source = match input {
            Some(buffer) => {
                if buffer.frame_len() != FRAME_LEN {
                    warn!(
                        "shared input holds {} samples, expected {FRAME_LEN}; the rest is zero-filled",
                        buffer.frame_len()
                    );
                }
                let last_sequence = buffer.sequence();
                FrameSource::Shared {
                    buffer,
                    last_sequence,
                }
            }
            None => FrameSource::messages(),
        };
        if output.is_none() {
            info!("no shared output buffer; results will be posted as events");
        }
        self.output = output;
        self.pipeline.reset();
        self.failed_cycles = 0;
        self.warned_not_ready = false;
        self.active = true;
        info!("polling started");
    }

    fn stop(&mut self) {
        self.active = false;
        self.output = None;
        self.source = FrameSource::messages();
        self.pipeline.reset();
        info!("polling stopped");
    }

    fn accept_frame(&mut self, samples: &[f32], captured_at_ms: Option<f64>) {
        match &mut self.source {
            FrameSource::Messages {
                pending,
                captured_at_ms: stamp,
            } => {
                let n = samples.len().min(self.frame.len());
                self.frame[..n].copy_from_slice(&samples[..n]);
                self.frame[n..].fill(0.0);
                *pending = true;
                *stamp = captured_at_ms;
            }
            FrameSource::Shared { .. } => {
                debug!("ignoring pushed frame while reading shared input");
            }
        }
    }

    /// Copies the newest unseen frame into `self.frame`.
    fn take_frame(&mut self) -> Option<FrameInfo> {
        match &mut self.source {
            FrameSource::Shared {
                buffer,
                last_sequence,
            } => {
                let info = buffer.read_latest(&mut self.frame);
                if info.sequence == *last_sequence {
                    return None;
                }
                *last_sequence = info.sequence;
                let filled = buffer.frame_len().min(self.frame.len());
                self.frame[filled..].fill(0.0);
                Some(info)
            }
            FrameSource::Messages {
                pending,
                captured_at_ms,
            } => {
                if !*pending {
                    return None;
                }
                *pending = false;
                Some(FrameInfo {
                    sequence: 0,
                    captured_at_ms: *captured_at_ms,
                })
            }
        }
    }

    fn cycle(&mut self, started: Instant) {
        match self.runtime {
            RuntimeState::Ready(_) => {}
            RuntimeState::Failed => {
                if let Some(info) = self.take_frame() {
                    self.publish(0.0, 0.0, false, info.captured_at_ms, started);
                }
                return;
            }
            RuntimeState::Idle | RuntimeState::Loading(_) => {
                if !self.warned_not_ready {
                    warn!("polling before the inference runtime is ready; waiting");
                    self.warned_not_ready = true;
                }
                return;
            }
        }

        let Some(info) = self.take_frame() else {
            return;
        };
        let RuntimeState::Ready(runtime) = &mut self.runtime else {
            return;
        };

        match self.pipeline.process(&self.frame, runtime.as_mut()) {
            Ok(output) => self.report(output, info.captured_at_ms, started),
            Err(e) => {
                self.failed_cycles += 1;
                if self.failed_cycles % FAILURE_LOG_INTERVAL == 1 {
                    warn!("inference cycle failed ({} so far): {e}", self.failed_cycles);
                }
            }
        }
    }

    fn report(&mut self, output: CycleOutput, captured_at_ms: Option<f64>, started: Instant) {
        self.publish(
            output.pitch,
            output.confidence,
            output.settled,
            captured_at_ms,
            started,
        );
        if self.timing {
            debug!(
                "cycle timing: preprocess {:.3} ms, inference {:.3} ms, total {:.3} ms",
                output.timing.preprocess_ms, output.timing.inference_ms, output.timing.total_ms
            );
            self.emit(Event::Timing(output.timing));
        }
    }

    fn publish(
        &self,
        pitch: f32,
        confidence: f32,
        settled: bool,
        captured_at_ms: Option<f64>,
        started: Instant,
    ) {
        let now = now_ms();
        let latency_ms = match captured_at_ms {
            Some(captured) => (now - captured).max(0.0),
            None => started.elapsed().as_secs_f64() * 1000.0,
        };
        match &self.output {
            Some(buffer) => buffer.publish(pitch, confidence, settled, now, latency_ms),
            None => self.emit(Event::Result {
                pitch,
                confidence,
                settled,
            }),
        }
    }

    fn emit(&self, event: Event) {
        // The host may have dropped its receiver; nothing to do then.
        let _ = self.events.send(event);
    }
}
