use thiserror::Error;

/// Transport and protocol failures talking to a runtime sidecar.
///
/// Adapters translate, never handle: no retries, no store access. The
/// mapping is mechanical — connect/read timeouts become `Timeout`/
/// `Transient`, recognized 4xx bodies become their matching kind, anything
/// else from the runtime becomes `Runtime`.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime call timed out: {0}")]
    Timeout(String),

    #[error("runtime unreachable: {0}")]
    Transient(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Non-recoverable runtime status or an unparseable body.
    #[error("runtime error (status {status}): {message}")]
    Runtime { status: u16, message: String },

    /// The adapter cannot express the request (unknown capability/operation
    /// for this runtime kind, malformed meta).
    #[error("runtime protocol error: {0}")]
    Protocol(String),
}
