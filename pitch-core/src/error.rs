//! Error types for the pitch pipeline.
//!
//! Only configuration and runtime-loading paths return these. The per-cycle
//! path (mapping, stabilizing, profile lookup) fails soft and never errors.

use thiserror::Error;

/// Pitch pipeline error types
#[derive(Error, Debug)]
pub enum PitchError {
    /// A profile failed bounds validation
    #[error("Invalid profile '{id}': {reason}")]
    ProfileInvalid { id: String, reason: String },

    /// A profile table is missing a required entry
    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    /// Profile table could not be parsed
    #[error("Failed to parse profile table: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Inference runtime could not be prepared
    #[error("Failed to load inference runtime: {reason}")]
    RuntimeLoad { reason: String },

    /// A single inference call failed
    #[error("Inference failed: {reason}")]
    Inference { reason: String },

    /// Tensor shape did not match what the runtime expects
    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: usize, got: usize },

    /// Engine thread could not be reached or spawned
    #[error("Engine error: {0}")]
    Engine(String),
}

/// Result type for pitch pipeline operations
pub type PitchResult<T> = Result<T, PitchError>;
