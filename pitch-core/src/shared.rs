//! # Shared Memory Channel
//!
//! Fixed-layout buffers exchanged between the capture side, the inference
//! loop and the host. Each buffer has exactly one writer and one reader and
//! no locks: every slot is an atomic holding a float bit pattern, so a reader
//! may see a mix of the previous and the newest write but never a value that
//! was not written by someone.
//!
//! ## Result buffer layout
//!
//! | slot | content |
//! |---|---|
//! | 0 | stabilized pitch (Hz) |
//! | 1 | confidence [0, 1] |
//! | 2 | settled flag (1.0 once the stabilizer holds a note, else 0.0) |
//! | 3 | reserved |
//! | 4 | last-update timestamp (ms since the Unix epoch) |
//! | 5 | end-to-end latency (ms) |

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub const SLOT_PITCH: usize = 0;
pub const SLOT_CONFIDENCE: usize = 1;
pub const SLOT_SETTLED: usize = 2;
pub const SLOT_TIMESTAMP: usize = 4;
pub const SLOT_LATENCY: usize = 5;
pub const RESULT_SLOTS: usize = 6;

/// Wall-clock milliseconds since the Unix epoch, used for every timestamp slot.
pub fn now_ms() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}

/// Copy of the result buffer at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ResultSnapshot {
    pub pitch: f64,
    pub confidence: f64,
    pub settled: bool,
    pub timestamp_ms: f64,
    pub latency_ms: f64,
}

/// Single-writer (inference loop) / single-reader (host) result block.
#[derive(Debug)]
pub struct SharedResultBuffer {
    slots: [AtomicU64; RESULT_SLOTS],
}

impl Default for SharedResultBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedResultBuffer {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicU64::new(0.0_f64.to_bits())),
        }
    }

    /// Reads one slot. Out-of-range slots read as 0.0.
    pub fn read_slot(&self, slot: usize) -> f64 {
        self.slots
            .get(slot)
            .map(|s| f64::from_bits(s.load(Ordering::Acquire)))
            .unwrap_or(0.0)
    }

    /// Writes one slot. Out-of-range slots are ignored.
    pub fn write_slot(&self, slot: usize, value: f64) {
        if let Some(s) = self.slots.get(slot) {
            s.store(value.to_bits(), Ordering::Release);
        }
    }

    /// Publishes one cycle's result. The timestamp is written last so a reader
    /// that sees a new timestamp also sees the pitch that goes with it.
    pub fn publish(
        &self,
        pitch: f32,
        confidence: f32,
        settled: bool,
        timestamp_ms: f64,
        latency_ms: f64,
    ) {
        self.write_slot(SLOT_PITCH, pitch as f64);
        self.write_slot(SLOT_CONFIDENCE, confidence as f64);
        self.write_slot(SLOT_SETTLED, if settled { 1.0 } else { 0.0 });
        self.write_slot(SLOT_LATENCY, latency_ms);
        self.write_slot(SLOT_TIMESTAMP, timestamp_ms);
    }

    pub fn snapshot(&self) -> ResultSnapshot {
        ResultSnapshot {
            timestamp_ms: self.read_slot(SLOT_TIMESTAMP),
            pitch: self.read_slot(SLOT_PITCH),
            confidence: self.read_slot(SLOT_CONFIDENCE),
            settled: self.read_slot(SLOT_SETTLED) > 0.5,
            latency_ms: self.read_slot(SLOT_LATENCY),
        }
    }
}

/// Metadata returned alongside a frame read from [`SharedInputBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FrameInfo {
    /// Number of frames written so far; 0 means nothing has been captured yet.
    pub sequence: u64,
    /// Capture time of the frame, if the writer supplied one.
    pub captured_at_ms: Option<f64>,
}

/// Single-writer (capture) / single-reader (inference loop) PCM window.
pub struct SharedInputBuffer {
    samples: Box<[AtomicU32]>,
    captured_at: AtomicU64,
    sequence: AtomicU64,
}

impl SharedInputBuffer {
    pub fn new(frame_len: usize) -> Self {
        Self {
            samples: (0..frame_len).map(|_| AtomicU32::new(0.0_f32.to_bits())).collect(),
            captured_at: AtomicU64::new(f64::NAN.to_bits()),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn frame_len(&self) -> usize {
        self.samples.len()
    }

    /// Overwrites the window with the newest frame. Extra input is ignored and
    /// a short frame leaves the remaining samples untouched.
    pub fn write_frame(&self, frame: &[f32], captured_at_ms: Option<f64>) {
        for (slot, &sample) in self.samples.iter().zip(frame) {
            slot.store(sample.to_bits(), Ordering::Relaxed);
        }
        self.captured_at
            .store(captured_at_ms.unwrap_or(f64::NAN).to_bits(), Ordering::Relaxed);
        self.sequence.fetch_add(1, Ordering::Release);
    }

    /// Copies the current window into `out` without allocating.
    pub fn read_latest(&self, out: &mut [f32]) -> FrameInfo {
        let sequence = self.sequence.load(Ordering::Acquire);
        for (dst, slot) in out.iter_mut().zip(self.samples.iter()) {
            *dst = f32::from_bits(slot.load(Ordering::Relaxed));
        }
        let captured = f64::from_bits(self.captured_at.load(Ordering::Relaxed));
        FrameInfo {
            sequence,
            captured_at_ms: captured.is_finite().then_some(captured),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for SharedInputBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedInputBuffer")
            .field("frame_len", &self.frame_len())
            .field("sequence", &self.sequence())
            .finish()
    }
}
