//! Error types for the `yuelu-rag` crate.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Classification of an embedding-service failure.
///
/// Lets callers tell transport problems apart from requests the service
/// rejected, and decide whether a retry can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingFailure {
    /// The request never produced an HTTP response.
    Network,
    /// The API key was missing or rejected.
    Auth,
    /// The service throttled the request (HTTP 429).
    RateLimited,
    /// The service failed internally (HTTP 5xx).
    Server,
    /// The service rejected the input itself (HTTP 400/413/422, empty key, ...).
    InvalidInput,
    /// The response could not be understood or did not match the request.
    InvalidResponse,
}

impl EmbeddingFailure {
    /// Whether repeating the same request may succeed.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Network | Self::RateLimited | Self::Server)
    }
}

impl fmt::Display for EmbeddingFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Network => "network",
            Self::Auth => "auth",
            Self::RateLimited => "rate limited",
            Self::Server => "server",
            Self::InvalidInput => "invalid input",
            Self::InvalidResponse => "invalid response",
        };
        f.write_str(label)
    }
}

/// Errors that can occur in RAG operations.
#[derive(Debug, Error)]
pub enum RagError {
    /// The embedding provider could not produce vectors.
    #[error("Embedding service error ({provider}, {kind}): {message}")]
    EmbeddingService {
        /// The embedding provider that produced the error.
        provider: String,
        /// What kind of failure occurred.
        kind: EmbeddingFailure,
        /// A description of the failure.
        message: String,
    },

    /// A vector did not have the dimension the deployment is configured for.
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// The configured dimension.
        expected: usize,
        /// The dimension that was observed.
        actual: usize,
    },

    /// A persisted index artifact is missing.
    #[error("Index artifact not found: {}", path.display())]
    IndexNotFound {
        /// The missing artifact.
        path: PathBuf,
    },

    /// The persisted index artifacts are unreadable or disagree with each other.
    #[error("Index corrupt: {0}")]
    IndexCorrupt(String),

    /// Retrieval failed while answering a query.
    #[error("Retrieval error: {0}")]
    Retrieval(#[source] Box<RagError>),

    /// The language model failed while decoding.
    #[error("Generation error: {0}")]
    Generation(String),

    /// A filesystem operation failed.
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        /// The path being read or written.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Index metadata could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A configuration validation error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl RagError {
    /// Build an [`RagError::Io`] for `path`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    /// Whether this is an embedding failure worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::EmbeddingService { kind, .. } if kind.is_transient())
    }
}

/// A convenience result type for RAG operations.
pub type Result<T> = std::result::Result<T, RagError>;
