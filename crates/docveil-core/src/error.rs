use thiserror::Error;

/// Unified error type for the delivery engine.
///
/// Capability, session, and path failures are client-facing rejections and
/// map to a stable reason string; vault, marking, and IO failures are server
/// errors and never leak internal detail to the client.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("capability has expired")]
    Expired,

    #[error("capability signature mismatch")]
    InvalidSignature,

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("no active session for subject")]
    NoActiveSession,

    #[error("requested path escapes the document library")]
    PathTraversalRejected,

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("marking failed: {0}")]
    MarkingFailed(String),

    #[error("AEAD encryption failed")]
    SealFailure,

    #[error("integrity check failed (authentication tag mismatch or truncated blob)")]
    Integrity,

    #[error("payload too large: {needed} carrier bytes needed, {available} available")]
    PayloadTooLarge { needed: usize, available: usize },

    #[error("image decode failed: {0}")]
    InvalidImage(String),

    #[error("worker task failed: {0}")]
    Worker(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}

impl EngineError {
    /// True when the failure is a potential security event that must be
    /// paired with a violation audit record before the caller sees it.
    pub fn is_violation(&self) -> bool {
        matches!(
            self,
            EngineError::Expired | EngineError::InvalidSignature | EngineError::NoActiveSession
        )
    }
}
