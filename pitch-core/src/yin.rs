//! # YIN Surrogate Runtime
//!
//! A non-neural stand-in for the pitch model. It estimates the period with
//! the YIN difference function and renders the result in the model's output
//! format, so the rest of the pipeline cannot tell the two apart:
//!
//! - the classification vector holds a Gaussian bump around the estimated
//!   bin, scaled by the YIN clarity (1 - aperiodicity)
//! - the regression vector holds, for every bin in the bump, the cents
//!   offset from that bin's base frequency to the estimate
//!
//! Used by hosts that run without model weights, and by tests.

use crate::error::PitchResult;
use crate::pitch::{BIN_BASE, BIN_MAX, NUM_BINS, freq_to_bin};
use crate::preprocess::compute_rms;
use crate::runtime::{FRAME_LEN, InferenceRuntime, MODEL_SAMPLE_RATE, ModelOutput, check_input_len};

/// Absolute threshold on the normalized difference function.
const YIN_THRESHOLD: f32 = 0.15;
/// Width of the rendered bump, in bins.
const BUMP_SIGMA: f32 = 1.25;
const BUMP_RADIUS: isize = 6;
const CENTS_PER_BIN: f32 = 1200.0 / 20.0;
/// Inputs quieter than this produce an all-zero classification.
const SILENCE_RMS: f32 = 0.01;

/// YIN period estimator that emits model-shaped tensors.
pub struct YinRuntime {
    sample_rate: u32,
    frame_len: usize,
    min_tau: usize,
    max_tau: usize,
    yin_buffer: Vec<f32>,
}

impl Default for YinRuntime {
    fn default() -> Self {
        Self::new(MODEL_SAMPLE_RATE, FRAME_LEN)
    }
}

impl YinRuntime {
    pub fn new(sample_rate: u32, frame_len: usize) -> Self {
        let half = frame_len / 2;
        // Shortest period searched corresponds to the top searchable bin.
        let max_freq = crate::pitch::bin_to_base_freq(BIN_MAX);
        let min_tau = ((sample_rate as f32 / max_freq).floor() as usize).max(2);
        Self {
            sample_rate,
            frame_len,
            min_tau,
            max_tau: half.saturating_sub(1),
            yin_buffer: vec![0.0; half],
        }
    }

    /// Estimates `(frequency, clarity)` for one window.
    ///
    /// # Returns
    /// * `Some((frequency, clarity))` - clarity in [0, 1], higher is more periodic
    /// * `None` - silence or no usable period
    pub fn estimate(&mut self, signal: &[f32]) -> Option<(f32, f32)> {
        let half = self.frame_len / 2;
        if signal.len() < self.frame_len || self.min_tau + 1 >= self.max_tau {
            return None;
        }
        if compute_rms(signal) < SILENCE_RMS {
            return None;
        }

        // Difference function
        for tau in 1..half {
            let mut diff = 0.0;
            for i in 0..half {
                let delta = signal[i] - signal[i + tau];
                diff += delta * delta;
            }
            self.yin_buffer[tau] = diff;
        }

        // Cumulative mean normalized difference
        self.yin_buffer[0] = 1.0;
        let mut running_sum = 0.0;
        for tau in 1..half {
            running_sum += self.yin_buffer[tau];
            self.yin_buffer[tau] = if running_sum > 0.0 {
                self.yin_buffer[tau] * tau as f32 / running_sum
            } else {
                1.0
            };
        }

        // First dip under the threshold, walked down to its local minimum.
        // Falls back to the global minimum so weak periodicity still yields
        // a low-clarity estimate.
        let mut period = None;
        let mut tau = self.min_tau;
        while tau < self.max_tau {
            if self.yin_buffer[tau] < YIN_THRESHOLD {
                while tau + 1 < self.max_tau && self.yin_buffer[tau + 1] < self.yin_buffer[tau] {
                    tau += 1;
                }
                period = Some(tau);
                break;
            }
            tau += 1;
        }
        let period = period.or_else(|| {
            (self.min_tau..self.max_tau)
                .min_by(|&a, &b| self.yin_buffer[a].total_cmp(&self.yin_buffer[b]))
        })?;

        let clarity = (1.0 - self.yin_buffer[period]).clamp(0.0, 1.0);

        // Parabolic interpolation
        let y1 = self.yin_buffer[period - 1];
        let y2 = self.yin_buffer[period];
        let y3 = self.yin_buffer[period + 1];
        let denom = y1 - 2.0 * y2 + y3;
        let period_f = if denom.abs() > f32::EPSILON {
            period as f32 + (y1 - y3) / (2.0 * denom)
        } else {
            period as f32
        };

        let frequency = self.sample_rate as f32 / period_f;
        (frequency.is_finite() && frequency > 0.0).then_some((frequency, clarity))
    }
}

impl InferenceRuntime for YinRuntime {
    fn name(&self) -> &str {
        "yin-surrogate"
    }

    fn num_bins(&self) -> usize {
        NUM_BINS
    }

    fn has_regression(&self) -> bool {
        true
    }

    fn infer(&mut self, input: &[f32], output: &mut ModelOutput) -> PitchResult<()> {
        check_input_len(input, self.frame_len)?;
        output.clear();

        let Some((frequency, clarity)) = self.estimate(input) else {
            return Ok(());
        };

        let center = freq_to_bin(frequency);
        if !(center >= BIN_BASE as f32 && center <= BIN_MAX as f32) {
            return Ok(());
        }

        let nearest = center.round() as isize;
        for bin in (nearest - BUMP_RADIUS)..=(nearest + BUMP_RADIUS) {
            let Ok(idx) = usize::try_from(bin) else {
                continue;
            };
            if idx >= output.classification.len() {
                continue;
            }
            let distance = center - idx as f32;
            output.classification[idx] =
                clarity * (-(distance * distance) / (2.0 * BUMP_SIGMA * BUMP_SIGMA)).exp();
            if let Some(regression) = output.regression.as_mut() {
                regression[idx] = distance * CENTS_PER_BIN;
            }
        }
        Ok(())
    }
}
