//! Error types for yuelu-mistralrs.

use thiserror::Error;
use yuelu_rag::RagError;

/// Errors that can occur when loading or running a mistral.rs model.
#[derive(Debug, Error)]
pub enum MistralRsError {
    /// Model loading failed
    #[error("Model loading failed: {0}")]
    ModelLoad(String),

    /// Model directory not found
    #[error("Model not found at path: {path}")]
    ModelNotFound { path: String },

    /// Out of memory during model loading or inference
    #[error("Out of memory: {details}. Try a smaller max_new_tokens or enabling ISQ quantization.")]
    OutOfMemory { details: String },

    /// Inference failed
    #[error("Inference failed: {0}")]
    Inference(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl MistralRsError {
    /// Classify an engine failure message.
    pub(crate) fn from_engine(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("out of memory") {
            Self::OutOfMemory { details: message }
        } else {
            Self::Inference(message)
        }
    }
}

impl From<MistralRsError> for RagError {
    fn from(e: MistralRsError) -> Self {
        RagError::Generation(e.to_string())
    }
}

/// Result type alias for MistralRsError
pub type Result<T> = std::result::Result<T, MistralRsError>;
