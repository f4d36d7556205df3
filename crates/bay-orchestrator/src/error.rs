use bay_domain::{Capability, DomainError, SandboxId};
use bay_driver::DriverError;
use bay_runtime::RuntimeError;
use bay_store::StoreError;
use thiserror::Error;

/// The unified failure taxonomy. Each kind maps to exactly one HTTP status
/// at the boundary; the kind — not the message — drives whether managers
/// compensate and whether GC re-queues.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("no container serves capability '{0}'")]
    CapabilityNotSupported(Capability),

    #[error("sandbox {0} has expired")]
    SandboxExpired(SandboxId),

    #[error("sandbox {0} has an infinite TTL")]
    SandboxTtlInfinite(SandboxId),

    #[error("session not ready for sandbox {sandbox_id}: {detail}")]
    SessionNotReady { sandbox_id: SandboxId, detail: String },

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("transient upstream failure: {0}")]
    Transient(String),

    #[error("upstream timeout: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable code for error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::Forbidden(_) => "forbidden",
            Error::Conflict(_) => "conflict",
            Error::Validation(_) => "validation",
            Error::InvalidPath(_) => "invalid_path",
            Error::CapabilityNotSupported(_) => "capability_not_supported",
            Error::SandboxExpired(_) => "sandbox_expired",
            Error::SandboxTtlInfinite(_) => "sandbox_ttl_infinite",
            Error::SessionNotReady { .. } => "session_not_ready",
            Error::Runtime(_) => "runtime_error",
            Error::Transient(_) => "transient",
            Error::Timeout(_) => "timeout",
            Error::Internal(_) => "internal",
        }
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::SandboxNotFound(_)
            | StoreError::SessionNotFound(_)
            | StoreError::CargoNotFound(_) => Error::NotFound(e.to_string()),
            StoreError::VersionConflict { .. } | StoreError::DuplicateIdempotencyKey { .. } => {
                Error::Conflict(e.to_string())
            }
            StoreError::Serialization(_) | StoreError::Internal(_) => {
                Error::Internal(e.to_string())
            }
        }
    }
}

impl From<DriverError> for Error {
    fn from(e: DriverError) -> Self {
        match e {
            DriverError::Transient(_) => Error::Transient(e.to_string()),
            DriverError::NotFound(_) => Error::NotFound(e.to_string()),
            DriverError::Conflict(_) => Error::Conflict(e.to_string()),
            DriverError::Invariant(_) | DriverError::Fatal(_) => Error::Internal(e.to_string()),
        }
    }
}

impl From<RuntimeError> for Error {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::Timeout(_) => Error::Timeout(e.to_string()),
            RuntimeError::Transient(_) => Error::Transient(e.to_string()),
            RuntimeError::InvalidPath(m) => Error::InvalidPath(m),
            RuntimeError::Validation(m) => Error::Validation(m),
            RuntimeError::NotFound(m) => Error::NotFound(m),
            RuntimeError::Runtime { .. } | RuntimeError::Protocol(_) => {
                Error::Runtime(e.to_string())
            }
        }
    }
}

impl From<DomainError> for Error {
    fn from(e: DomainError) -> Self {
        match e {
            DomainError::InvalidPath { .. } => Error::InvalidPath(e.to_string()),
            _ => Error::Validation(e.to_string()),
        }
    }
}
