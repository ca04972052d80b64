// pitch-core/src/lib.rs

//! The core logic for the real-time pitch monitor.
//! This crate turns audio frames into a stabilized pitch estimate:
//! instrument profiles, frame preprocessing, classification-to-pitch
//! mapping, temporal stabilization and the inference loop that ties them
//! together. It is completely headless and contains no UI code.

pub mod audio;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod pitch;
pub mod preprocess;
pub mod profiles;
pub mod runtime;
pub mod shared;
pub mod stabilizer;
pub mod tuning;
pub mod yin;

pub use engine::{Command, EngineConfig, EngineHandle, Event, PitchEngine};
pub use error::{PitchError, PitchResult};
pub use pipeline::{CycleOutput, CycleTiming, Pipeline};
pub use pitch::{
    BASE_FREQ_HZ, BIN_BASE, BIN_MAX, BINS_PER_OCTAVE, NUM_BINS, PitchEstimate, bin_to_base_freq,
    map_to_pitch,
};
pub use preprocess::{compute_rms, preprocess};
pub use profiles::{DEFAULT_PROFILE_ID, GainParams, InstrumentProfile, ProfileRegistry};
pub use runtime::{FRAME_LEN, HOP_LEN, InferenceRuntime, MODEL_SAMPLE_RATE, ModelOutput, RuntimeLoader};
pub use shared::{ResultSnapshot, SharedInputBuffer, SharedResultBuffer};
pub use stabilizer::{Stabilizer, StabilizerMode};
pub use yin::YinRuntime;
