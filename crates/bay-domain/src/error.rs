use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid profile '{profile_id}': {message}")]
    InvalidProfile { profile_id: String, message: String },

    #[error("invalid path '{path}': {message}")]
    InvalidPath { path: String, message: String },

    #[error("unknown capability: {0}")]
    UnknownCapability(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
