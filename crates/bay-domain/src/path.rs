use std::path::{Component, Path};

use crate::error::DomainError;

/// Validate a caller-supplied workspace path.
///
/// All path arguments on the public surface are relative paths rooted at
/// `/workspace`. Absolute paths, `..` components, and empty paths are
/// rejected before anything reaches the fabric. The runtimes duplicate this
/// check on their side.
pub fn validate_workspace_path(path: &str) -> Result<(), DomainError> {
    if path.is_empty() {
        return Err(DomainError::InvalidPath {
            path: path.to_string(),
            message: "path is empty".into(),
        });
    }
    if path.starts_with('/') || path.starts_with('\\') {
        return Err(DomainError::InvalidPath {
            path: path.to_string(),
            message: "path must be relative to /workspace".into(),
        });
    }

    for component in Path::new(path).components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => {
                return Err(DomainError::InvalidPath {
                    path: path.to_string(),
                    message: "path must not contain '..'".into(),
                })
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(DomainError::InvalidPath {
                    path: path.to_string(),
                    message: "path must be relative to /workspace".into(),
                })
            }
        }
    }
    Ok(())
}
