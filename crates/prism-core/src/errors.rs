//! Error types for PRISM.
//!
//! Recoverable failures (configuration, backend launches, transforms) are
//! reported through [`PrismError`]. Violated call-sequence preconditions are
//! programming errors and panic at the call site instead.

use thiserror::Error;

/// Unified error type for all PRISM operations.
#[derive(Error, Debug)]
pub enum PrismError {
    /// Accelerator errors (runtime, kernel compilation, launches, copies)
    #[error("GPU error in {context}: {message}")]
    GpuError { context: String, message: String },

    /// Grid transform planning or execution failures
    #[error("FFT error in {context}: {message}")]
    FftError { context: String, message: String },

    /// Configuration validation errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Input validation errors (box shape, atom counts, charges)
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// I/O errors (configuration files)
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// TOML parse errors
    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),
}

impl PrismError {
    /// Creates a GPU error with context.
    pub fn gpu(context: impl Into<String>, message: impl Into<String>) -> Self {
        PrismError::GpuError {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Creates a transform error with context.
    pub fn fft(context: impl Into<String>, message: impl Into<String>) -> Self {
        PrismError::FftError {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        PrismError::ConfigError(message.into())
    }

    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        PrismError::ValidationError(message.into())
    }

    /// Whether the error came from the accelerator or transform backend.
    ///
    /// Backend failures during a step are fatal to the simulation; callers
    /// abort rather than retry.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            PrismError::GpuError { .. } | PrismError::FftError { .. }
        )
    }
}
