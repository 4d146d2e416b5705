//! Error types for the fastboot service

use thiserror::Error;

/// Fastboot service errors.
///
/// Each variant that reaches the host maps to one `FAIL` reply; the
/// `Display` text is the reply payload.
#[derive(Debug, Error)]
pub enum FastbootError {
    /// Bad command arity or argument
    #[error("Invalid parameter")]
    InvalidParameter,

    /// Command blocked by the current lock state
    #[error("command not allowed in {0} state")]
    NotAllowed(&'static str),

    /// Flash of a non-whitelisted label while locked
    #[error("Prohibited command in {0} state.")]
    Prohibited(&'static str),

    /// Allocation failed
    #[error("Memory allocation failure")]
    OutOfMemory,

    /// Bulk I/O failed; fatal to the session
    #[error("transport error: {0}")]
    Transport(String),

    /// Block write/erase failed
    #[error("Flash failure: {0}")]
    Flash(String),

    /// Signature or certificate check failed
    #[error("verification failed: {0}")]
    Verification(String),

    /// Command name not registered
    #[error("unknown command")]
    UnknownCommand,

    /// Operation not supported by this device or image
    #[error("unsupported operation")]
    Unsupported,

    /// Named entity (partition, file, variable) missing
    #[error("{0} not found")]
    NotFound(String),

    /// IO error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for fastboot operations
pub type Result<T> = std::result::Result<T, FastbootError>;

impl FastbootError {
    /// Whether this error must terminate the session instead of being
    /// reported to the host as a `FAIL`.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}
