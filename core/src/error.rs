use thiserror::Error;

/// Ferry error types.
///
/// Each variant corresponds to one failure kind of the mirroring engine.
/// The retry machinery inspects [`FerryError::is_retriable`] to decide
/// whether an operation may be attempted again.
#[derive(Error, Debug)]
pub enum FerryError {
    /// Authentication against a registry failed (missing or rejected credentials).
    ///
    /// Note: docker.io masks "repository does not exist" as 401, so the
    /// message must distinguish both cases for the user.
    #[error("Unauthorized: {registry} - {message}")]
    Unauthorized { registry: String, message: String },

    /// A manifest, blob, tag or image was not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The registry returned 429 Too Many Requests.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Transient network or server failure (connect error, 5xx, truncated body).
    #[error("Transient error: {0}")]
    Transient(String),

    /// The remote endpoint violated the registry protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A blob's computed digest differs from the digest declared in the manifest.
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Dedup lease contention: another worker is fetching the same layer.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The user-supplied image modifier failed.
    #[error("Modifier failed: {0}")]
    ModifierFailed(String),

    /// Invalid or incomplete configuration; fatal at plan time.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The run was cancelled before the operation completed.
    #[error("Cancelled")]
    Cancelled,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl FerryError {
    /// Whether the owning component may retry the failed operation.
    ///
    /// `Conflict` is retriable by the dedup-lease caller only; HTTP retry
    /// loops treat it as fatal.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            FerryError::Transient(_) | FerryError::RateLimited(_) | FerryError::Conflict(_)
        )
    }

    /// Whether this error is a rate limit and deserves the longer backoff multiplier.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, FerryError::RateLimited(_))
    }
}

impl From<serde_json::Error> for FerryError {
    fn from(err: serde_json::Error) -> Self {
        FerryError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for FerryError {
    fn from(err: serde_yaml::Error) -> Self {
        FerryError::Serialization(err.to_string())
    }
}

/// Result type alias for Ferry operations.
pub type Result<T> = std::result::Result<T, FerryError>;
