use approx::assert_relative_eq;
use pitch_core::shared::now_ms;
use pitch_core::{
    EngineConfig, EngineHandle, Event, FRAME_LEN, InferenceRuntime, ModelOutput, PitchEngine,
    PitchError, PitchResult, RuntimeLoader, SharedInputBuffer, SharedResultBuffer,
    StabilizerMode, bin_to_base_freq,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);
/// Length of the deliberately short shared input buffer.
const SHORT_LEN: usize = 16;

/// Knobs and counters shared between a test and its runtime.
#[derive(Default)]
struct Script {
    bin: AtomicUsize,
    calls: AtomicUsize,
    /// Whether the last input had anything past `SHORT_LEN`.
    tail_dirty: AtomicBool,
}

impl Script {
    fn set_bin(&self, bin: usize) {
        self.bin.store(bin, Ordering::SeqCst);
    }
}

/// Emits a one-hot classification at the scripted bin.
struct ScriptedRuntime {
    script: Arc<Script>,
    value: f32,
    failures_left: usize,
    delay: Duration,
}

impl ScriptedRuntime {
    fn new(bin: usize, value: f32) -> (Self, Arc<Script>) {
        let script = Arc::new(Script::default());
        script.set_bin(bin);
        let runtime = Self {
            script: Arc::clone(&script),
            value,
            failures_left: 0,
            delay: Duration::ZERO,
        };
        (runtime, script)
    }
}

impl InferenceRuntime for ScriptedRuntime {
    fn name(&self) -> &str {
        "scripted"
    }

    fn infer(&mut self, input: &[f32], output: &mut ModelOutput) -> PitchResult<()> {
        self.script.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .tail_dirty
            .store(input[SHORT_LEN..].iter().any(|&s| s != 0.0), Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(PitchError::Inference {
                reason: "scripted failure".into(),
            });
        }
        output.clear();
        output.classification[self.script.bin.load(Ordering::SeqCst)] = self.value;
        Ok(())
    }
}

fn into_loader(runtime: ScriptedRuntime) -> RuntimeLoader {
    Box::new(move || Ok(Box::new(runtime) as Box<dyn InferenceRuntime>))
}

fn loader(bin: usize, value: f32) -> RuntimeLoader {
    into_loader(ScriptedRuntime::new(bin, value).0)
}

fn failing_loader() -> RuntimeLoader {
    Box::new(|| {
        Err(PitchError::RuntimeLoad {
            reason: "no model weights".into(),
        })
    })
}

fn fast_config(profile: &str) -> EngineConfig {
    EngineConfig {
        cycle_period: Duration::from_millis(2),
        initial_profile: profile.to_string(),
        ..EngineConfig::default()
    }
}

/// Waits for the first event matching `pred`, skipping the others.
fn wait_for(handle: &EngineHandle, pred: impl Fn(&Event) -> bool) -> Option<Event> {
    let deadline = Instant::now() + WAIT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match handle.events().recv_timeout(remaining) {
            Ok(event) if pred(&event) => return Some(event),
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

fn wait_ready(handle: &EngineHandle) -> Event {
    wait_for(handle, |e| matches!(e, Event::Ready { .. })).expect("no ready event")
}

fn ready_engine(loader: RuntimeLoader, config: EngineConfig) -> EngineHandle {
    let handle = PitchEngine::spawn(loader, config).unwrap();
    handle.init().unwrap();
    assert!(matches!(wait_ready(&handle), Event::Ready { ok: true, .. }));
    handle
}

/// Pushes one frame and returns the `(pitch, confidence, settled)` it produced.
fn cycle_once(handle: &EngineHandle) -> (f32, f32, bool) {
    handle.push_frame(vec![0.1; FRAME_LEN], None).unwrap();
    match wait_for(handle, |e| matches!(e, Event::Result { .. })) {
        Some(Event::Result {
            pitch,
            confidence,
            settled,
        }) => (pitch, confidence, settled),
        other => panic!("expected a result, got {other:?}"),
    }
}

/// Keeps writing fresh frames into a shared input until dropped.
struct FrameWriter {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl FrameWriter {
    fn spawn(input: Arc<SharedInputBuffer>, every: Duration) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let thread = thread::spawn(move || {
            let frame = vec![0.2; input.frame_len()];
            while flag.load(Ordering::SeqCst) {
                input.write_frame(&frame, Some(now_ms()));
                thread::sleep(every);
            }
        });
        Self {
            running,
            thread: Some(thread),
        }
    }
}

impl Drop for FrameWriter {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[test]
fn init_reports_ready_with_runtime_name() {
    let handle = PitchEngine::spawn(loader(40, 0.9), fast_config("auto")).unwrap();
    handle.init().unwrap();
    assert_eq!(
        wait_ready(&handle),
        Event::Ready {
            ok: true,
            runtime: Some("scripted".into())
        }
    );

    // A second init answers from the loaded state.
    handle.init().unwrap();
    assert!(matches!(wait_ready(&handle), Event::Ready { ok: true, .. }));
    handle.shutdown();
}

#[test]
fn failed_runtime_keeps_publishing_zero() {
    let handle = PitchEngine::spawn(failing_loader(), fast_config("auto")).unwrap();
    handle.init().unwrap();
    assert_eq!(
        wait_ready(&handle),
        Event::Ready {
            ok: false,
            runtime: None
        }
    );

    handle.start_polling(None, None).unwrap();
    for _ in 0..3 {
        assert_eq!(cycle_once(&handle), (0.0, 0.0, false));
    }
}

#[test]
fn pushed_frames_produce_result_events() {
    let handle = ready_engine(loader(67, 0.9), fast_config("guitar"));
    handle.start_polling(None, None).unwrap();

    let (_, _, settled) = cycle_once(&handle);
    assert!(!settled);
    let mut last = (0.0, 0.0, false);
    for _ in 0..4 {
        last = cycle_once(&handle);
    }

    let (pitch, confidence, settled) = last;
    assert_relative_eq!(pitch, bin_to_base_freq(67), max_relative = 1e-3);
    assert_relative_eq!(confidence, 0.9, epsilon = 1e-6);
    // Guitar holds a note after three unchanged frames.
    assert!(settled);
}

#[test]
fn shared_buffers_carry_frames_and_results() {
    let handle = ready_engine(loader(67, 0.9), fast_config("guitar"));

    let input = Arc::new(SharedInputBuffer::new(FRAME_LEN));
    let output = Arc::new(SharedResultBuffer::new());
    handle
        .start_polling(Some(Arc::clone(&input)), Some(Arc::clone(&output)))
        .unwrap();

    let frame = vec![0.2; FRAME_LEN];
    let deadline = Instant::now() + WAIT;
    let mut frames = 0;
    while Instant::now() < deadline {
        input.write_frame(&frame, Some(now_ms()));
        frames += 1;
        thread::sleep(Duration::from_millis(5));
        if frames >= 8 && output.snapshot().timestamp_ms > 0.0 {
            break;
        }
    }

    let snapshot = output.snapshot();
    assert!(snapshot.timestamp_ms > 0.0);
    assert!(snapshot.latency_ms >= 0.0);
    assert_relative_eq!(snapshot.pitch as f32, bin_to_base_freq(67), max_relative = 1e-3);
    assert_relative_eq!(snapshot.confidence, 0.9, epsilon = 1e-6);

    // Results went to the buffer, not the event channel.
    assert!(
        handle
            .events()
            .try_iter()
            .all(|e| !matches!(e, Event::Result { .. }))
    );
}

#[test]
fn polling_state_follows_the_handle_immediately() {
    for _ in 0..20 {
        let handle = PitchEngine::spawn(loader(60, 0.9), fast_config("auto")).unwrap();
        assert!(!handle.is_polling());
        handle.start_polling(None, None).unwrap();
        assert!(handle.is_polling());
        handle.stop_polling().unwrap();
        assert!(!handle.is_polling());
    }

    // A stop immediately followed by a start leaves the engine polling.
    let handle = ready_engine(loader(60, 0.9), fast_config("auto"));
    handle.start_polling(None, None).unwrap();
    handle.stop_polling().unwrap();
    handle.start_polling(None, None).unwrap();
    thread::sleep(Duration::from_millis(20));
    assert!(handle.is_polling());
    let (pitch, _, _) = cycle_once(&handle);
    assert_relative_eq!(pitch, bin_to_base_freq(60), max_relative = 1e-3);
}

#[test]
fn timing_events_follow_the_toggle() {
    let handle = ready_engine(loader(50, 0.8), fast_config("auto"));

    handle.set_timing(true).unwrap();
    handle.start_polling(None, None).unwrap();
    handle.push_frame(vec![0.1; FRAME_LEN], None).unwrap();

    let Some(Event::Timing(timing)) = wait_for(&handle, |e| matches!(e, Event::Timing(_))) else {
        panic!("no timing event");
    };
    assert!(timing.total_ms >= timing.inference_ms);
    assert!(timing.preprocess_ms >= 0.0);
}

#[test]
fn commands_are_handled_when_cycles_overrun() {
    let (mut runtime, _) = ScriptedRuntime::new(60, 0.9);
    runtime.delay = Duration::from_millis(6);
    let handle = ready_engine(into_loader(runtime), fast_config("auto"));

    let input = Arc::new(SharedInputBuffer::new(FRAME_LEN));
    let output = Arc::new(SharedResultBuffer::new());
    handle
        .start_polling(Some(Arc::clone(&input)), Some(Arc::clone(&output)))
        .unwrap();
    let _writer = FrameWriter::spawn(input, Duration::from_millis(1));

    thread::sleep(Duration::from_millis(100));
    assert!(output.snapshot().timestamp_ms > 0.0);

    handle.set_timing(true).unwrap();
    assert!(wait_for(&handle, |e| matches!(e, Event::Timing(_))).is_some());
}

#[test]
fn bypassing_the_stabilizer_passes_outliers_through() {
    let (runtime, script) = ScriptedRuntime::new(67, 0.9);
    let handle = ready_engine(into_loader(runtime), fast_config("guitar"));
    handle.start_polling(None, None).unwrap();
    for _ in 0..5 {
        cycle_once(&handle);
    }

    // One outlier is absorbed by the median.
    script.set_bin(80);
    let (pitch, _, _) = cycle_once(&handle);
    assert_relative_eq!(pitch, bin_to_base_freq(67), max_relative = 1e-3);

    handle.set_stabilizer(false).unwrap();
    let (pitch, _, settled) = cycle_once(&handle);
    assert_relative_eq!(pitch, bin_to_base_freq(80), max_relative = 1e-3);
    assert!(!settled);

    // Re-enabling starts from empty history, so the new pitch passes straight through.
    script.set_bin(70);
    handle.set_stabilizer(true).unwrap();
    let (pitch, _, _) = cycle_once(&handle);
    assert_relative_eq!(pitch, bin_to_base_freq(70), max_relative = 1e-3);
}

#[test]
fn mode_switch_discards_history() {
    let (runtime, script) = ScriptedRuntime::new(60, 0.9);
    let handle = ready_engine(into_loader(runtime), fast_config("auto"));
    handle.start_polling(None, None).unwrap();
    for _ in 0..5 {
        cycle_once(&handle);
    }

    script.set_bin(64);
    let (pitch, _, _) = cycle_once(&handle);
    assert_relative_eq!(pitch, bin_to_base_freq(60), max_relative = 1e-3);

    handle.set_stabilizer_mode(StabilizerMode::Light).unwrap();
    let (pitch, _, _) = cycle_once(&handle);
    assert_relative_eq!(pitch, bin_to_base_freq(64), max_relative = 1e-3);
}

#[test]
fn profile_switch_keeps_history_and_applies_new_bounds() {
    let (runtime, script) = ScriptedRuntime::new(67, 0.9);
    let handle = ready_engine(into_loader(runtime), fast_config("guitar"));
    handle.start_polling(None, None).unwrap();
    for _ in 0..5 {
        cycle_once(&handle);
    }

    handle.set_profile("violin").unwrap();
    script.set_bin(70);
    let (pitch, _, _) = cycle_once(&handle);
    assert_relative_eq!(pitch, bin_to_base_freq(67), max_relative = 1e-3);

    // ~110 Hz is below the violin range and gets clamped to its floor.
    handle.set_stabilizer(false).unwrap();
    script.set_bin(40);
    let (pitch, _, _) = cycle_once(&handle);
    assert_relative_eq!(pitch, 190.0);
}

#[test]
fn cycles_follow_the_configured_period() {
    let (runtime, script) = ScriptedRuntime::new(60, 0.9);
    let config = EngineConfig {
        cycle_period: Duration::from_millis(10),
        ..fast_config("auto")
    };
    let handle = ready_engine(into_loader(runtime), config);

    let input = Arc::new(SharedInputBuffer::new(FRAME_LEN));
    handle
        .start_polling(Some(Arc::clone(&input)), Some(Arc::new(SharedResultBuffer::new())))
        .unwrap();
    let writer = FrameWriter::spawn(input, Duration::from_millis(1));

    thread::sleep(Duration::from_millis(500));
    handle.stop_polling().unwrap();
    drop(writer);

    // About 50 cycles; far fewer than the ~500 frames written.
    let calls = script.calls.load(Ordering::SeqCst);
    assert!((25..=60).contains(&calls), "{calls} cycles in 500 ms");
}

#[test]
fn short_shared_input_is_zero_padded() {
    let (runtime, script) = ScriptedRuntime::new(60, 0.9);
    let handle = ready_engine(into_loader(runtime), fast_config("auto"));

    handle.start_polling(None, None).unwrap();
    handle.push_frame(vec![0.5; FRAME_LEN], None).unwrap();
    assert!(wait_for(&handle, |e| matches!(e, Event::Result { .. })).is_some());
    assert!(script.tail_dirty.load(Ordering::SeqCst));

    let input = Arc::new(SharedInputBuffer::new(SHORT_LEN));
    handle.start_polling(Some(Arc::clone(&input)), None).unwrap();
    // Frames written before the engine switches over are skipped, so keep writing.
    let deadline = Instant::now() + WAIT;
    let mut result = None;
    while result.is_none() && Instant::now() < deadline {
        input.write_frame(&[0.5; SHORT_LEN], None);
        result = handle
            .events()
            .recv_timeout(Duration::from_millis(20))
            .ok()
            .filter(|e| matches!(e, Event::Result { .. }));
    }
    assert!(result.is_some());
    assert!(!script.tail_dirty.load(Ordering::SeqCst));
}

#[test]
fn stop_polling_stops_writes() {
    let handle = ready_engine(loader(60, 0.9), fast_config("auto"));

    let input = Arc::new(SharedInputBuffer::new(FRAME_LEN));
    let output = Arc::new(SharedResultBuffer::new());
    handle
        .start_polling(Some(Arc::clone(&input)), Some(Arc::clone(&output)))
        .unwrap();

    let deadline = Instant::now() + WAIT;
    while output.snapshot().timestamp_ms == 0.0 && Instant::now() < deadline {
        input.write_frame(&[0.1; FRAME_LEN], None);
        thread::sleep(Duration::from_millis(5));
    }
    assert!(output.snapshot().timestamp_ms > 0.0);

    handle.stop_polling().unwrap();
    assert!(!handle.is_polling());
    thread::sleep(Duration::from_millis(50));
    let stopped_at = output.snapshot().timestamp_ms;

    for _ in 0..10 {
        input.write_frame(&[0.1; FRAME_LEN], None);
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(output.snapshot().timestamp_ms, stopped_at);
}

#[test]
fn inference_errors_do_not_stop_the_loop() {
    let (mut runtime, _) = ScriptedRuntime::new(45, 0.7);
    runtime.failures_left = 3;
    let handle = ready_engine(into_loader(runtime), fast_config("auto"));
    handle.start_polling(None, None).unwrap();

    let deadline = Instant::now() + WAIT;
    let mut result = None;
    while result.is_none() && Instant::now() < deadline {
        handle.push_frame(vec![0.1; FRAME_LEN], None).unwrap();
        result = handle
            .events()
            .recv_timeout(Duration::from_millis(20))
            .ok()
            .filter(|e| matches!(e, Event::Result { .. }));
    }

    let Some(Event::Result {
        pitch, confidence, ..
    }) = result
    else {
        panic!("loop never recovered from failed cycles");
    };
    assert_relative_eq!(pitch, bin_to_base_freq(45), max_relative = 1e-3);
    assert_relative_eq!(confidence, 0.7, epsilon = 1e-6);
}

#[test]
fn polling_before_ready_waits_for_the_runtime() {
    let handle = PitchEngine::spawn(loader(60, 0.9), fast_config("auto")).unwrap();
    handle.start_polling(None, None).unwrap();
    handle.push_frame(vec![0.1; FRAME_LEN], None).unwrap();

    // No runtime yet, so no results.
    assert!(
        handle
            .events()
            .recv_timeout(Duration::from_millis(50))
            .is_err()
    );

    handle.init().unwrap();
    assert!(matches!(wait_ready(&handle), Event::Ready { ok: true, .. }));
    // The frame pushed earlier is still pending.
    assert!(wait_for(&handle, |e| matches!(e, Event::Result { .. })).is_some());
}

#[test]
fn dropping_the_handle_joins_a_polling_engine() {
    let handle = ready_engine(loader(60, 0.9), fast_config("auto"));
    handle.start_polling(None, None).unwrap();

    let started = Instant::now();
    drop(handle);
    assert!(started.elapsed() < WAIT);
}
