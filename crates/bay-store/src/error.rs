use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sandbox not found: {0}")]
    SandboxNotFound(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("cargo not found: {0}")]
    CargoNotFound(String),

    /// CAS write lost: the row's `version` moved underneath the writer.
    /// Reload and retry.
    #[error("version conflict on sandbox {id}: expected {expected}, found {found}")]
    VersionConflict { id: String, expected: u64, found: u64 },

    /// Insert-only idempotency slot already taken.
    #[error("idempotency key already recorded for owner {owner}: {key}")]
    DuplicateIdempotencyKey { owner: String, key: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal store error: {0}")]
    Internal(String),
}
