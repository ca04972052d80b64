//! # Classification-to-Pitch Module
//!
//! Turns the per-bin output of the pitch model into a single frequency and
//! confidence. Bins are log-spaced at 20 per octave starting from C1, so a
//! weighted average of `log2(f)` over the bins around the peak interpolates
//! between them for sub-bin precision. Optional regression offsets (in cents)
//! refine each bin's frequency before averaging.
//!
//! Everything in this module is pure and allocation-free.

use crate::profiles::InstrumentProfile;

/// Length of the model's classification and regression vectors.
pub const NUM_BINS: usize = 128;
/// First bin searched for a peak.
pub const BIN_BASE: usize = 5;
/// Last bin searched for a peak (inclusive).
pub const BIN_MAX: usize = 120;
/// Log spacing of the bins.
pub const BINS_PER_OCTAVE: f32 = 20.0;
/// Frequency of [`BIN_BASE`] (C1).
pub const BASE_FREQ_HZ: f32 = 32.703;
/// Half-width of the refinement window around the peak (9 bins total).
pub const REFINE_RADIUS: usize = 4;

/// A single raw pitch estimate for one cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PitchEstimate {
    /// Frequency in Hz, 0.0 when there is no pitch.
    pub pitch: f32,
    /// Peak classification value, in [0, 1].
    pub confidence: f32,
    /// Index of the peak bin, if one was found.
    pub peak_bin: Option<usize>,
}

impl PitchEstimate {
    /// The "nothing found" estimate.
    pub const NONE: PitchEstimate = PitchEstimate {
        pitch: 0.0,
        confidence: 0.0,
        peak_bin: None,
    };
}

/// Base frequency of a bin, before any regression offset.
pub fn bin_to_base_freq(bin: usize) -> f32 {
    BASE_FREQ_HZ * ((bin as f32 - BIN_BASE as f32) / BINS_PER_OCTAVE).exp2()
}

/// Fractional bin index of a frequency. Inverse of [`bin_to_base_freq`].
pub fn freq_to_bin(freq: f32) -> f32 {
    BIN_BASE as f32 + BINS_PER_OCTAVE * (freq / BASE_FREQ_HZ).log2()
}

/// Index and value of the largest classification value in the searchable
/// range. Ties resolve to the lowest index; NaNs are skipped.
fn find_peak(classification: &[f32]) -> Option<(usize, f32)> {
    let mut peak: Option<(usize, f32)> = None;
    for (bin, &value) in classification
        .iter()
        .enumerate()
        .take(BIN_MAX + 1)
        .skip(BIN_BASE)
    {
        match peak {
            Some((_, best)) if !(value > best) => {}
            _ if value.is_nan() => {}
            _ => peak = Some((bin, value)),
        }
    }
    peak
}

/// Maps one classification vector (plus optional regression offsets) to a
/// pitch estimate under the given profile.
///
/// Fails soft: a vector too short to cover the searchable bins yields
/// [`PitchEstimate::NONE`]. A peak below `profile.confidence_threshold`
/// yields pitch 0 but keeps the observed peak value as confidence.
///
/// A missing regression vector behaves exactly like all-zero offsets.
pub fn map_to_pitch(
    classification: &[f32],
    profile: &InstrumentProfile,
    regression: Option<&[f32]>,
) -> PitchEstimate {
    if classification.len() <= BIN_MAX {
        return PitchEstimate::NONE;
    }

    let Some((peak_bin, peak_value)) = find_peak(classification) else {
        return PitchEstimate::NONE;
    };
    let confidence = peak_value.clamp(0.0, 1.0);

    if peak_value < profile.confidence_threshold {
        return PitchEstimate {
            pitch: 0.0,
            confidence,
            peak_bin: Some(peak_bin),
        };
    }

    let lo = peak_bin.saturating_sub(REFINE_RADIUS).max(BIN_BASE);
    let hi = (peak_bin + REFINE_RADIUS).min(BIN_MAX);

    let mut weighted_log = 0.0_f64;
    let mut weight_sum = 0.0_f64;
    for bin in lo..=hi {
        let p = classification[bin];
        if !(p > 0.0 && p.is_finite()) {
            continue;
        }
        let offset_cents = regression
            .and_then(|r| r.get(bin))
            .copied()
            .filter(|c| c.is_finite())
            .unwrap_or(0.0);
        let freq = bin_to_base_freq(bin) as f64 * (offset_cents as f64 / 1200.0).exp2();
        weighted_log += p as f64 * freq.log2();
        weight_sum += p as f64;
    }

    let refined = (weighted_log / weight_sum).exp2() as f32;
    let raw = if weight_sum > 0.0 && refined.is_finite() {
        refined
    } else {
        bin_to_base_freq(peak_bin)
    };

    PitchEstimate {
        pitch: raw.clamp(profile.min_hz, profile.max_hz),
        confidence,
        peak_bin: Some(peak_bin),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::ProfileRegistry;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    fn auto() -> &'static InstrumentProfile {
        ProfileRegistry::builtin().get("auto")
    }

    fn one_hot(bin: usize, value: f32) -> Vec<f32> {
        let mut v = vec![0.0; NUM_BINS];
        v[bin] = value;
        v
    }

    #[test]
    fn bin_scale_is_twenty_per_octave() {
        assert_relative_eq!(bin_to_base_freq(BIN_BASE), BASE_FREQ_HZ);
        assert_relative_eq!(bin_to_base_freq(BIN_BASE + 20), 2.0 * BASE_FREQ_HZ, max_relative = 1e-6);
        assert_abs_diff_eq!(freq_to_bin(bin_to_base_freq(67)), 67.0, epsilon = 1e-3);
    }

    #[test]
    fn short_vector_yields_nothing() {
        let short = vec![1.0; BIN_MAX];
        assert_eq!(map_to_pitch(&short, auto(), None), PitchEstimate::NONE);
        assert_eq!(map_to_pitch(&[], auto(), None), PitchEstimate::NONE);
    }

    #[test]
    fn peak_below_threshold_reports_its_confidence() {
        let est = map_to_pitch(&one_hot(60, 0.3), auto(), None);
        assert_eq!(est.pitch, 0.0);
        assert_eq!(est.confidence, 0.3);
        assert_eq!(est.peak_bin, Some(60));
    }

    #[test]
    fn isolated_peak_maps_to_base_frequency() {
        let est = map_to_pitch(&one_hot(50, 0.8), auto(), None);
        assert_relative_eq!(est.pitch, bin_to_base_freq(50), max_relative = 1e-5);
        assert_eq!(est.confidence, 0.8);
        assert_eq!(est.peak_bin, Some(50));
    }

    #[test]
    fn equal_neighbours_interpolate_geometrically() {
        let mut v = one_hot(50, 0.9);
        v[51] = 0.9;
        let est = map_to_pitch(&v, auto(), None);
        let expected = (bin_to_base_freq(50) * bin_to_base_freq(51)).sqrt();
        assert_relative_eq!(est.pitch, expected, max_relative = 1e-5);
        // First occurrence wins the tie.
        assert_eq!(est.peak_bin, Some(50));
    }

    #[test]
    fn bins_outside_the_search_range_are_ignored() {
        let mut v = one_hot(60, 0.7);
        v[2] = 1.0;
        v[125] = 1.0;
        assert_eq!(map_to_pitch(&v, auto(), None).peak_bin, Some(60));
    }

    #[test]
    fn result_is_clamped_to_profile_range() {
        let guitar = ProfileRegistry::builtin().get("guitar");
        let high = map_to_pitch(&one_hot(BIN_MAX, 0.95), guitar, None);
        assert_eq!(high.pitch, guitar.max_hz);

        let low = map_to_pitch(&one_hot(BIN_BASE, 0.95), guitar, None);
        assert_eq!(low.pitch, guitar.min_hz);
    }

    #[test]
    fn regression_offset_refines_the_estimate() {
        let class = one_hot(70, 0.9);
        let plain = map_to_pitch(&class, auto(), None);

        let mut regression = vec![0.0; NUM_BINS];
        regression[70] = 25.0;
        let refined = map_to_pitch(&class, auto(), Some(&regression));

        assert!(refined.pitch > plain.pitch);
        assert_abs_diff_eq!(
            1200.0 * (refined.pitch / plain.pitch).log2(),
            25.0,
            epsilon = 0.01
        );
    }

    #[test]
    fn zero_regression_matches_absent_regression() {
        let mut class = one_hot(64, 0.7);
        class[63] = 0.2;
        class[66] = 0.4;
        let zeros = vec![0.0; NUM_BINS];
        assert_eq!(
            map_to_pitch(&class, auto(), None),
            map_to_pitch(&class, auto(), Some(&zeros))
        );
    }

    #[test]
    fn non_finite_weights_never_reach_the_output() {
        let mut class = one_hot(60, 0.9);
        class[61] = f32::INFINITY;
        let est = map_to_pitch(&class, auto(), None);
        assert!(est.pitch.is_finite());
        assert!(est.pitch >= bin_to_base_freq(60) && est.pitch <= bin_to_base_freq(61));
        assert_eq!(est.confidence, 1.0);

        let mut lone = vec![0.0; NUM_BINS];
        lone[70] = f32::INFINITY;
        let est = map_to_pitch(&lone, auto(), None);
        assert_relative_eq!(est.pitch, bin_to_base_freq(70));
    }
}
