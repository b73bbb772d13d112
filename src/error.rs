//! Error types for the cadence engine.

/// Top-level error type for the scheduling and concern-lifecycle engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Completion, classifier or delivery call failed or timed out.
    #[error("transient external failure: {0}")]
    TransientExternal(String),

    /// Malformed configuration (routine table, topic policy, limits).
    #[error("config error: {0}")]
    Config(String),

    /// Persistence store unavailable or a statement failed.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A persisted record broke an engine invariant.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

impl EngineError {
    /// Returns `true` for failures worth retrying with backoff: external
    /// call failures and I/O errors such as a broken delivery stream.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientExternal(_) | Self::Io(_))
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, EngineError>;
