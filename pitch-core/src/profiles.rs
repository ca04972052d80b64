//! # Instrument Profile Module
//!
//! Named tuning presets that parameterize the mapper, the preprocessor and the
//! stabilizer. The builtin table is computed once on first use and is never
//! mutated afterwards; hosts that want different presets load a replacement
//! table at startup and share it read-only.
//!
//! ## Features
//! - Builtin presets for common instruments plus an `auto` catch-all
//! - Fallback to `auto` for unknown ids
//! - JSON loading and saving of complete profile tables
//! - Bounds validation of every entry

use crate::error::{PitchError, PitchResult};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Id of the profile used when a lookup misses.
pub const DEFAULT_PROFILE_ID: &str = "auto";

/// Gain-normalization parameters for the frame preprocessor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GainParams {
    /// Loudness the preprocessor boosts quiet frames towards.
    pub target_rms: f32,
    /// Frames at or below this RMS are treated as noise floor and left alone.
    pub min_rms_for_gain: f32,
    /// Upper bound on the applied gain.
    pub max_gain: f32,
}

impl Default for GainParams {
    fn default() -> Self {
        Self {
            target_rms: 0.05,
            min_rms_for_gain: 0.002,
            max_gain: 8.0,
        }
    }
}

/// A single tuning preset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentProfile {
    /// Registry key. Filled from the table key when loading JSON.
    #[serde(default)]
    pub id: String,
    /// Display name
    pub name: String,
    /// Lowest pitch reported, in Hz. Mapper output is clamped to it.
    pub min_hz: f32,
    /// Highest pitch reported, in Hz.
    pub max_hz: f32,
    /// Minimum peak classification value the mapper accepts as a pitch.
    pub confidence_threshold: f32,
    /// Minimum confidence the stabilizer lets into its history.
    pub stabilizer_confidence: f32,
    /// Frames the stable pitch must be held before it counts as settled.
    pub stability_threshold: u32,
    /// Minimum movement, in cents, before the stable pitch is updated.
    pub hysteresis_cents: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gain: Option<GainParams>,
}

impl InstrumentProfile {
    /// Gain parameters for this profile, or the defaults when it has none.
    pub fn gain_params(&self) -> GainParams {
        self.gain.unwrap_or_default()
    }

    /// Checks every bound a profile must satisfy.
    pub fn validate(&self) -> PitchResult<()> {
        let fail = |reason: String| {
            Err(PitchError::ProfileInvalid {
                id: self.id.clone(),
                reason,
            })
        };

        if !(self.min_hz > 0.0 && self.min_hz < self.max_hz) {
            return fail(format!(
                "expected 0 < minHz < maxHz, got {} / {}",
                self.min_hz, self.max_hz
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return fail(format!(
                "confidenceThreshold {} outside [0, 1]",
                self.confidence_threshold
            ));
        }
        if !(0.0..=1.0).contains(&self.stabilizer_confidence) {
            return fail(format!(
                "stabilizerConfidence {} outside [0, 1]",
                self.stabilizer_confidence
            ));
        }
        if self.stability_threshold < 1 {
            return fail("stabilityThreshold must be at least 1".to_string());
        }
        if !(self.hysteresis_cents > 0.0) {
            return fail(format!(
                "hysteresisCents must be positive, got {}",
                self.hysteresis_cents
            ));
        }
        if let Some(gain) = &self.gain {
            if !(gain.max_gain >= 1.0) {
                return fail(format!("maxGain {} below 1", gain.max_gain));
            }
            if !(gain.min_rms_for_gain >= 0.0 && gain.target_rms > gain.min_rms_for_gain) {
                return fail(format!(
                    "expected targetRms > minRmsForGain >= 0, got {} / {}",
                    gain.target_rms, gain.min_rms_for_gain
                ));
            }
        }
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn preset(
    id: &str,
    name: &str,
    min_hz: f32,
    max_hz: f32,
    confidence_threshold: f32,
    stabilizer_confidence: f32,
    stability_threshold: u32,
    hysteresis_cents: f32,
    gain: Option<GainParams>,
) -> InstrumentProfile {
    InstrumentProfile {
        id: id.to_string(),
        name: name.to_string(),
        min_hz,
        max_hz,
        confidence_threshold,
        stabilizer_confidence,
        stability_threshold,
        hysteresis_cents,
        gain,
    }
}

/// The builtin presets, computed once.
static BUILTIN: Lazy<ProfileRegistry> = Lazy::new(|| {
    let voice_gain = GainParams {
        target_rms: 0.08,
        min_rms_for_gain: 0.003,
        max_gain: 6.0,
    };
    let quiet_gain = GainParams {
        target_rms: 0.06,
        min_rms_for_gain: 0.0015,
        max_gain: 10.0,
    };

    let profiles = vec![
        preset("auto", "Auto", 50.0, 1600.0, 0.50, 0.50, 3, 30.0, None),
        preset("vocals", "Vocals", 80.0, 1100.0, 0.55, 0.50, 4, 40.0, Some(voice_gain)),
        preset("trumpet", "Trumpet", 160.0, 1050.0, 0.60, 0.55, 3, 25.0, None),
        preset("guitar", "Guitar", 80.0, 1200.0, 0.58, 0.50, 3, 20.0, Some(quiet_gain)),
        preset("bass", "Bass", 38.0, 400.0, 0.50, 0.45, 5, 30.0, Some(quiet_gain)),
        preset("violin", "Violin", 190.0, 1700.0, 0.60, 0.55, 3, 25.0, None),
        preset("piano", "Piano", 40.0, 1700.0, 0.55, 0.50, 3, 20.0, None),
    ];

    match ProfileRegistry::from_profiles(profiles) {
        Ok(registry) => registry,
        // The builtin table is fixed; a failure here is a programming error.
        Err(e) => panic!("builtin profile table is invalid: {e}"),
    }
});

/// An immutable table of instrument profiles.
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    profiles: BTreeMap<String, InstrumentProfile>,
    fallback: InstrumentProfile,
}

impl ProfileRegistry {
    /// The process-wide builtin table.
    pub fn builtin() -> &'static ProfileRegistry {
        &BUILTIN
    }

    /// Builds a registry from a list of profiles, validating each.
    ///
    /// The list must contain the [`DEFAULT_PROFILE_ID`] entry, which doubles as
    /// the fallback for unknown ids.
    pub fn from_profiles(list: Vec<InstrumentProfile>) -> PitchResult<Self> {
        let mut profiles = BTreeMap::new();
        for profile in list {
            profile.validate()?;
            profiles.insert(profile.id.clone(), profile);
        }
        let fallback = profiles
            .get(DEFAULT_PROFILE_ID)
            .cloned()
            .ok_or_else(|| PitchError::ProfileNotFound(DEFAULT_PROFILE_ID.to_string()))?;
        Ok(Self { profiles, fallback })
    }

    /// Parses a JSON object of `id -> profile`.
    pub fn from_json(text: &str) -> PitchResult<Self> {
        let table: BTreeMap<String, InstrumentProfile> = serde_json::from_str(text)?;
        let list = table
            .into_iter()
            .map(|(id, mut profile)| {
                profile.id = id;
                profile
            })
            .collect();
        Self::from_profiles(list)
    }

    /// Loads a profile table from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> PitchResult<Self> {
        let data = fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    /// Saves this table as pretty JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> PitchResult<()> {
        let json = serde_json::to_string_pretty(&self.profiles)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Looks up a profile, falling back to `auto` for unknown ids.
    pub fn get(&self, id: &str) -> &InstrumentProfile {
        self.profiles.get(id).unwrap_or(&self.fallback)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.profiles.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &InstrumentProfile> {
        self.profiles.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_profiles_satisfy_bounds() {
        let registry = ProfileRegistry::builtin();
        for profile in registry.iter() {
            assert!(profile.min_hz > 0.0, "{}", profile.id);
            assert!(profile.min_hz < profile.max_hz, "{}", profile.id);
            assert!((0.0..=1.0).contains(&profile.confidence_threshold));
            assert!((0.0..=1.0).contains(&profile.stabilizer_confidence));
            assert!(profile.stability_threshold >= 1);
            assert!(profile.hysteresis_cents > 0.0);
            assert!(profile.validate().is_ok());
        }
    }

    #[test]
    fn builtin_contains_common_instruments() {
        let registry = ProfileRegistry::builtin();
        for id in ["auto", "vocals", "trumpet", "guitar", "bass"] {
            assert!(registry.contains(id), "missing {id}");
        }
        assert_eq!(registry.get("guitar").confidence_threshold, 0.58);
    }

    #[test]
    fn unknown_id_falls_back_to_auto() {
        let registry = ProfileRegistry::builtin();
        assert_eq!(registry.get("kazoo").id, DEFAULT_PROFILE_ID);
    }

    #[test]
    fn json_table_round_trips_through_disk() {
        let path = std::env::temp_dir().join(format!("pitch-core-profiles-{}.json", std::process::id()));
        ProfileRegistry::builtin().save(&path).unwrap();
        let loaded = ProfileRegistry::load(&path).unwrap();
        let _ = fs::remove_file(&path);

        assert_eq!(loaded.get("guitar"), ProfileRegistry::builtin().get("guitar"));
        assert_eq!(loaded.ids().count(), ProfileRegistry::builtin().ids().count());
    }

    #[test]
    fn json_without_auto_is_rejected() {
        let text = r#"{
            "flute": {
                "name": "Flute", "minHz": 250.0, "maxHz": 2000.0,
                "confidenceThreshold": 0.6, "stabilizerConfidence": 0.5,
                "stabilityThreshold": 3, "hysteresisCents": 25.0
            }
        }"#;
        assert!(matches!(
            ProfileRegistry::from_json(text),
            Err(PitchError::ProfileNotFound(_))
        ));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let text = r#"{
            "auto": {
                "name": "Auto", "minHz": 500.0, "maxHz": 100.0,
                "confidenceThreshold": 0.5, "stabilizerConfidence": 0.5,
                "stabilityThreshold": 3, "hysteresisCents": 30.0
            }
        }"#;
        assert!(matches!(
            ProfileRegistry::from_json(text),
            Err(PitchError::ProfileInvalid { .. })
        ));

        let mut profile = ProfileRegistry::builtin().get("auto").clone();
        profile.hysteresis_cents = 0.0;
        assert!(profile.validate().is_err());

        profile.hysteresis_cents = 30.0;
        profile.gain = Some(GainParams {
            target_rms: 0.01,
            min_rms_for_gain: 0.05,
            max_gain: 4.0,
        });
        assert!(profile.validate().is_err());
    }
}
