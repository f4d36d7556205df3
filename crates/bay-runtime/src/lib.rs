pub mod api;
pub mod error;
pub mod http;

pub use api::{
    CapabilityCall, CapabilityInfo, RuntimeApi, RuntimeConnector, RuntimeDescription,
    RuntimeInfo, WorkspaceInfo, SUPPORTED_API_MAJOR,
};
pub use error::RuntimeError;
pub use http::{HttpConnector, HttpRuntime};
