//! # Musical Tuning Module
//!
//! Cent arithmetic and note naming in 12-tone equal temperament (A4 = 440 Hz).
//! Used by the stabilizer's hysteresis stage and by hosts that label the
//! stabilized pitch.

const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Interval from `reference` to `freq` in cents.
///
/// Positive values mean `freq` is sharp of `reference`, negative flat.
pub fn cents_between(freq: f32, reference: f32) -> f32 {
    1200.0 * (freq / reference).log2()
}

/// Shifts a frequency by a number of cents.
pub fn shift_by_cents(freq: f32, cents: f32) -> f32 {
    freq * (cents / 1200.0).exp2()
}

/// Fractional MIDI note number of a frequency (69.0 = A4).
pub fn midi_from_freq(freq: f32) -> f32 {
    69.0 + 12.0 * (freq / 440.0).log2()
}

/// Frequency of a MIDI note number.
pub fn freq_from_midi(midi: i32) -> f32 {
    440.0 * ((midi - 69) as f32 / 12.0).exp2()
}

/// Finds the nearest equal-tempered note to a frequency.
///
/// # Returns
/// * `Some((note_name, cents_deviation))` - e.g. `("A4", -3.2)`
/// * `None` - for non-positive or non-finite input
pub fn nearest_note(freq: f32) -> Option<(String, f32)> {
    if !(freq.is_finite() && freq > 0.0) {
        return None;
    }
    let midi = midi_from_freq(freq).round() as i32;
    let name = NOTE_NAMES[midi.rem_euclid(12) as usize];
    let octave = midi.div_euclid(12) - 1;
    let deviation = cents_between(freq, freq_from_midi(midi));
    Some((format!("{name}{octave}"), deviation))
}
