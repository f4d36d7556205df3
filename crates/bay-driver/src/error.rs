use thiserror::Error;

/// Fabric failures, classified.
///
/// The driver reports *what happened*, never what to do about it: retries,
/// timeouts beyond protocol minima, and rate limiting live in the layers
/// above.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Likely to succeed on retry (connection refused, daemon busy, 5xx).
    #[error("transient fabric error: {0}")]
    Transient(String),

    #[error("fabric resource not found: {0}")]
    NotFound(String),

    /// Name collisions, resources still in use.
    #[error("fabric conflict: {0}")]
    Conflict(String),

    /// Bay asked for something the fabric cannot express, or an internal
    /// precondition does not hold.
    #[error("driver invariant violated: {0}")]
    Invariant(String),

    /// The fabric itself is unusable (daemon handshake failed, auth broken).
    #[error("fatal driver error: {0}")]
    Fatal(String),
}

impl DriverError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DriverError::NotFound(_))
    }
}
