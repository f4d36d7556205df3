pub mod docker;
pub mod driver;
pub mod error;
pub mod local;

pub use docker::DockerDriver;
pub use driver::{
    ContainerCreateSpec, Driver, ManagedResource, ResourceKind, ResourceLabels, VolumeEntry,
    LABEL_CARGO, LABEL_MANAGED, LABEL_OWNER, LABEL_PROFILE, LABEL_SANDBOX, LABEL_SESSION,
    WORKSPACE_MOUNT,
};
pub use error::DriverError;
pub use local::LocalDriver;
