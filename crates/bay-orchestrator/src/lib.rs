pub mod cargo;
pub mod error;
pub mod idempotency;
pub mod ids;
pub mod locks;
pub mod registry;
pub mod router;
pub mod sandbox;
pub mod session;

pub use cargo::CargoManager;
pub use error::Error;
pub use idempotency::{with_idempotency, StoredResponse};
pub use locks::LockTable;
pub use registry::ProfileRegistry;
pub use router::{CapabilityRequest, CapabilityRouter};
pub use sandbox::SandboxManager;
pub use session::SessionManager;
