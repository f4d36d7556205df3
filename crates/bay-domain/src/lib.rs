pub mod error;
pub mod path;
pub mod profile;
pub mod types;


pub use error::DomainError;
pub use path::validate_workspace_path;
pub use profile::{ContainerSpec, Profile, ResourceLimits};
pub use types::{
    Capability, CargoId, ContainerStatus, OwnerId, ProfileId, RuntimeType, SandboxId, SessionId,
};
