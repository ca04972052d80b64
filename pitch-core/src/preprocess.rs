//! # Frame Preprocessing Module
//!
//! Conditions a raw PCM frame before it is handed to the inference runtime:
//! quiet signals are boosted towards a target loudness, then every sample
//! goes through a fixed logarithmic compansion curve.
//!
//! Nothing here allocates; the caller owns both buffers.

use crate::profiles::GainParams;

/// Root-mean-square loudness of a frame. Zero for an empty frame.
pub fn compute_rms(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = frame.iter().map(|&s| s * s).sum();
    (sum_sq / frame.len() as f32).sqrt()
}

/// Gain that brings `rms` up towards `params.target_rms`.
///
/// Never attenuates and never amplifies frames at or below the noise floor.
pub fn compute_gain(rms: f32, params: &GainParams) -> f32 {
    if rms > 0.0 && rms < params.target_rms && rms > params.min_rms_for_gain {
        (params.target_rms / rms).min(params.max_gain)
    } else {
        1.0
    }
}

/// Dynamic-range compressor applied to each sample: `sign(x) * ln(1 + 10|x|)`.
#[inline]
pub fn compress(x: f32) -> f32 {
    x.signum() * (10.0 * x.abs()).ln_1p()
}

/// Normalizes and compresses `frame` into `out`, returning the applied gain.
///
/// `out` must be at least as long as `frame`; extra samples are zeroed.
/// When `params` is `None` the default gain parameters apply.
pub fn preprocess(frame: &[f32], params: Option<&GainParams>, out: &mut [f32]) -> f32 {
    let params = params.copied().unwrap_or_default();
    let gain = compute_gain(compute_rms(frame), &params);

    let n = frame.len().min(out.len());
    for (dst, &src) in out[..n].iter_mut().zip(frame) {
        let y = compress(src * gain);
        // NaN input would otherwise poison the whole tensor.
        *dst = if y.is_finite() { y } else { 0.0 };
    }
    out[n..].fill(0.0);
    gain
}
