//! # Temporal Stabilizer Module
//!
//! Smooths the per-cycle raw pitch into a flicker-free output in three
//! stages:
//!
//! 1. **Confidence gate** - low-confidence estimates are dropped before they
//!    reach the history and the held pitch is returned unchanged.
//! 2. **Running median** - a short window of accepted pitches; one-frame
//!    outliers such as octave jumps cannot move the median.
//! 3. **Hysteresis** - the held pitch only moves when the median has drifted
//!    further than the profile's cent threshold.
//!
//! [`StabilizerMode::Light`] keeps the first two stages with a shorter window
//! and publishes the median directly, for lower-latency feedback.

use crate::profiles::InstrumentProfile;
use crate::tuning::cents_between;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

/// Samples needed before the median stage takes over from pass-through.
pub const MIN_MEDIAN_SAMPLES: usize = 3;
/// Largest median window accepted by [`Stabilizer::with_window`].
pub const MAX_MEDIAN_WINDOW: usize = 15;

/// Which stages the stabilizer runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StabilizerMode {
    /// Gate, median over 5 frames, hysteresis.
    #[default]
    Full,
    /// Gate and median over 3 frames; no hysteresis.
    Light,
}

impl StabilizerMode {
    pub fn default_window(self) -> usize {
        match self {
            StabilizerMode::Full => 5,
            StabilizerMode::Light => 3,
        }
    }

    fn uses_hysteresis(self) -> bool {
        matches!(self, StabilizerMode::Full)
    }
}

impl FromStr for StabilizerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(StabilizerMode::Full),
            "light" => Ok(StabilizerMode::Light),
            other => Err(format!("unknown stabilizer mode '{other}' (expected full or light)")),
        }
    }
}

impl fmt::Display for StabilizerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StabilizerMode::Full => f.write_str("full"),
            StabilizerMode::Light => f.write_str("light"),
        }
    }
}

/// Thresholds the stabilizer takes from the active profile.
#[derive(Debug, Clone, PartialEq)]
struct Thresholds {
    profile_id: String,
    gate_confidence: f32,
    hysteresis_cents: f32,
    stability_threshold: u32,
}

impl From<&InstrumentProfile> for Thresholds {
    fn from(profile: &InstrumentProfile) -> Self {
        Self {
            profile_id: profile.id.clone(),
            gate_confidence: profile.stabilizer_confidence,
            hysteresis_cents: profile.hysteresis_cents,
            stability_threshold: profile.stability_threshold,
        }
    }
}

/// Stateful smoother for one pitch stream.
#[derive(Debug, Clone)]
pub struct Stabilizer {
    mode: StabilizerMode,
    window: usize,
    thresholds: Thresholds,
    history: VecDeque<f32>,
    scratch: [f32; MAX_MEDIAN_WINDOW],
    /// Last accepted output, 0.0 before the first accepted frame.
    stable_pitch: f32,
    /// Consecutive accepted frames that left `stable_pitch` unchanged.
    held_frames: u32,
}

impl Stabilizer {
    pub fn new(profile: &InstrumentProfile, mode: StabilizerMode) -> Self {
        Self::with_window(profile, mode, mode.default_window())
    }

    /// Creates a stabilizer with an explicit median window, clamped to
    /// `MIN_MEDIAN_SAMPLES..=MAX_MEDIAN_WINDOW`.
    pub fn with_window(profile: &InstrumentProfile, mode: StabilizerMode, window: usize) -> Self {
        let window = window.clamp(MIN_MEDIAN_SAMPLES, MAX_MEDIAN_WINDOW);
        Self {
            mode,
            window,
            thresholds: Thresholds::from(profile),
            history: VecDeque::with_capacity(window + 1),
            scratch: [0.0; MAX_MEDIAN_WINDOW],
            stable_pitch: 0.0,
            held_frames: 0,
        }
    }

    /// Feeds one raw estimate and returns the stabilized pitch (0.0 = none yet).
    pub fn process(&mut self, raw_pitch: f32, confidence: f32) -> f32 {
        // Unvoiced frames are gated too; a zero in the window would drag the median down.
        if confidence < self.thresholds.gate_confidence || !(raw_pitch > 0.0 && raw_pitch.is_finite()) {
            return self.stable_pitch;
        }

        self.history.push_back(raw_pitch);
        while self.history.len() > self.window {
            self.history.pop_front();
        }

        if self.history.len() < MIN_MEDIAN_SAMPLES {
            self.commit(raw_pitch);
            return self.stable_pitch;
        }

        let median = self.median();
        if !self.mode.uses_hysteresis() || self.stable_pitch <= 0.0 {
            self.commit(median);
        } else if cents_between(median, self.stable_pitch).abs() > self.thresholds.hysteresis_cents {
            self.commit(median);
        } else {
            self.held_frames = self.held_frames.saturating_add(1);
        }
        self.stable_pitch
    }

    /// Clears history and the held pitch.
    pub fn reset(&mut self) {
        self.history.clear();
        self.stable_pitch = 0.0;
        self.held_frames = 0;
    }

    /// Swaps in another profile's thresholds. History and the held pitch are kept.
    pub fn set_profile(&mut self, profile: &InstrumentProfile) {
        self.thresholds = Thresholds::from(profile);
    }

    pub fn profile_id(&self) -> &str {
        &self.thresholds.profile_id
    }

    pub fn mode(&self) -> StabilizerMode {
        self.mode
    }

    pub fn stable_pitch(&self) -> f32 {
        self.stable_pitch
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// True once the held pitch has survived `stability_threshold` accepted
    /// frames without moving.
    pub fn is_settled(&self) -> bool {
        self.stable_pitch > 0.0 && self.held_frames >= self.thresholds.stability_threshold
    }

    fn commit(&mut self, pitch: f32) {
        if pitch == self.stable_pitch {
            self.held_frames = self.held_frames.saturating_add(1);
        } else {
            self.stable_pitch = pitch;
            self.held_frames = 0;
        }
    }

    /// Median of the history window; lower middle on an even count.
    fn median(&mut self) -> f32 {
        let n = self.history.len();
        let buf = &mut self.scratch[..n];
        for (dst, &src) in buf.iter_mut().zip(&self.history) {
            *dst = src;
        }
        buf.sort_unstable_by(f32::total_cmp);
        buf[(n - 1) / 2]
    }
}
