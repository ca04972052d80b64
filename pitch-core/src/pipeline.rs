//! # Per-Cycle Pipeline
//!
//! One inference cycle without any threading: preprocess the PCM window,
//! run the runtime, map the tensors to a pitch and pass it through the
//! stabilizer. The engine thread owns one of these; tests drive it directly.
//!
//! The input tensor and the model output are allocated once. After that a
//! cycle does not touch the heap.

use crate::error::PitchResult;
use crate::pitch::{PitchEstimate, map_to_pitch};
use crate::preprocess::preprocess;
use crate::profiles::{InstrumentProfile, ProfileRegistry};
use crate::runtime::{FRAME_LEN, InferenceRuntime, ModelOutput};
use crate::stabilizer::{Stabilizer, StabilizerMode};
use log::{trace, warn};
use std::sync::Arc;
use std::time::Instant;

/// Wall-clock cost of one cycle's stages, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CycleTiming {
    pub preprocess_ms: f64,
    pub inference_ms: f64,
    pub total_ms: f64,
}

/// Result of one cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleOutput {
    /// Mapper output before stabilization.
    pub raw: PitchEstimate,
    /// Published pitch: stabilized, or raw when the stabilizer is off.
    pub pitch: f32,
    pub confidence: f32,
    /// Stabilizer is holding a note; always false while bypassed.
    pub settled: bool,
    /// Gain the preprocessor applied to the frame.
    pub gain: f32,
    pub timing: CycleTiming,
}

pub struct Pipeline {
    registry: Arc<ProfileRegistry>,
    profile_id: String,
    stabilizer: Stabilizer,
    stabilizer_enabled: bool,
    tensor: Vec<f32>,
    output: Option<ModelOutput>,
}

impl Pipeline {
    pub fn new(registry: Arc<ProfileRegistry>, profile_id: &str, mode: StabilizerMode) -> Self {
        let profile_id = resolve_profile_id(&registry, profile_id);
        let stabilizer = Stabilizer::new(registry.get(&profile_id), mode);
        Self {
            registry,
            profile_id,
            stabilizer,
            stabilizer_enabled: true,
            tensor: vec![0.0; FRAME_LEN],
            output: None,
        }
    }

    /// Sizes the output tensors for `runtime`. Called once when it becomes ready.
    pub fn attach(&mut self, runtime: &dyn InferenceRuntime) {
        self.output = Some(ModelOutput::for_runtime(runtime));
    }

    pub fn profile(&self) -> &InstrumentProfile {
        self.registry.get(&self.profile_id)
    }

    pub fn profile_id(&self) -> &str {
        &self.profile_id
    }

    /// Switches profile without touching stabilizer history. Unknown ids fall
    /// back to the default profile; the resolved id is returned.
    pub fn set_profile(&mut self, id: &str) -> &str {
        self.profile_id = resolve_profile_id(&self.registry, id);
        self.stabilizer.set_profile(self.registry.get(&self.profile_id));
        &self.profile_id
    }

    /// Replaces the stabilizer, discarding its history.
    pub fn set_stabilizer_mode(&mut self, mode: StabilizerMode) {
        self.stabilizer = Stabilizer::new(self.registry.get(&self.profile_id), mode);
    }

    /// Enables or bypasses the stabilizer. Re-enabling starts from empty
    /// history so frames from before the bypass are not mixed in.
    pub fn set_stabilizer_enabled(&mut self, enabled: bool) {
        if enabled && !self.stabilizer_enabled {
            self.stabilizer.reset();
        }
        self.stabilizer_enabled = enabled;
    }

    pub fn stabilizer(&self) -> &Stabilizer {
        &self.stabilizer
    }

    /// Clears stabilizer state.
    pub fn reset(&mut self) {
        self.stabilizer.reset();
    }

    /// Runs one cycle on `frame`.
    ///
    /// Errors only when the runtime fails; the caller treats that as "no
    /// result this cycle".
    pub fn process(
        &mut self,
        frame: &[f32],
        runtime: &mut dyn InferenceRuntime,
    ) -> PitchResult<CycleOutput> {
        let started = Instant::now();
        let profile = self.registry.get(&self.profile_id);

        let gain_params = profile.gain_params();
        let gain = preprocess(frame, Some(&gain_params), &mut self.tensor);
        let preprocessed = Instant::now();

        let output = self.output.get_or_insert_with(|| {
            warn!("model output was not pre-allocated; sizing it now");
            ModelOutput::for_runtime(&*runtime)
        });
        runtime.infer(&self.tensor, output)?;
        let inferred = Instant::now();

        let raw = map_to_pitch(&output.classification, profile, output.regression());
        trace!(
            "raw pitch {:.2} Hz conf {:.3} bin {:?}",
            raw.pitch, raw.confidence, raw.peak_bin
        );

        let (pitch, settled) = if self.stabilizer_enabled {
            let pitch = self.stabilizer.process(raw.pitch, raw.confidence);
            (pitch, self.stabilizer.is_settled())
        } else {
            (raw.pitch, false)
        };
        let finished = Instant::now();

        Ok(CycleOutput {
            raw,
            pitch,
            confidence: raw.confidence,
            settled,
            gain,
            timing: CycleTiming {
                preprocess_ms: ms_between(started, preprocessed),
                inference_ms: ms_between(preprocessed, inferred),
                total_ms: ms_between(started, finished),
            },
        })
    }
}

fn ms_between(from: Instant, to: Instant) -> f64 {
    to.saturating_duration_since(from).as_secs_f64() * 1000.0
}

fn resolve_profile_id(registry: &ProfileRegistry, id: &str) -> String {
    if registry.contains(id) {
        id.to_string()
    } else {
        let fallback = registry.get(id).id.clone();
        warn!("unknown instrument profile '{id}', using '{fallback}'");
        fallback
    }
}
