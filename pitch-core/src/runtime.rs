//! Inference runtime abstraction.
//!
//! The pitch model is opaque to the pipeline: anything that turns a
//! preprocessed PCM window into a per-bin classification vector (and
//! optionally per-bin regression offsets in cents) can drive the loop.

use crate::error::{PitchError, PitchResult};
use crate::pitch::NUM_BINS;

/// Sample rate the model expects, in Hz.
pub const MODEL_SAMPLE_RATE: u32 = 16_000;
/// Samples per model input window.
pub const FRAME_LEN: usize = 1024;
/// Model hop size; one inference cycle per hop.
pub const HOP_LEN: usize = 256;

/// Output tensors of one inference call. Allocated once and reused.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    pub classification: Vec<f32>,
    pub regression: Option<Vec<f32>>,
}

impl ModelOutput {
    pub fn new(num_bins: usize, with_regression: bool) -> Self {
        Self {
            classification: vec![0.0; num_bins],
            regression: with_regression.then(|| vec![0.0; num_bins]),
        }
    }

    /// Sized for the runtime that will fill it.
    pub fn for_runtime(runtime: &dyn InferenceRuntime) -> Self {
        Self::new(runtime.num_bins(), runtime.has_regression())
    }

    pub fn clear(&mut self) {
        self.classification.fill(0.0);
        if let Some(regression) = self.regression.as_mut() {
            regression.fill(0.0);
        }
    }

    pub fn regression(&self) -> Option<&[f32]> {
        self.regression.as_deref()
    }
}

/// A loaded pitch model.
pub trait InferenceRuntime: Send {
    /// Human-readable backend name for logs.
    fn name(&self) -> &str;

    /// Length of the classification vector this runtime produces.
    fn num_bins(&self) -> usize {
        NUM_BINS
    }

    /// Whether the runtime fills `ModelOutput::regression`.
    fn has_regression(&self) -> bool {
        false
    }

    /// Runs one forward pass. Implementations write into `output` in place.
    fn infer(&mut self, input: &[f32], output: &mut ModelOutput) -> PitchResult<()>;
}

/// Deferred runtime construction, run on its own thread by the engine.
pub type RuntimeLoader = Box<dyn FnOnce() -> PitchResult<Box<dyn InferenceRuntime>> + Send>;

/// Checks an input window against the expected length.
pub fn check_input_len(input: &[f32], expected: usize) -> PitchResult<()> {
    if input.len() != expected {
        return Err(PitchError::ShapeMismatch {
            expected,
            got: input.len(),
        });
    }
    Ok(())
}
