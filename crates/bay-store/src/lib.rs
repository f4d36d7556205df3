pub mod error;
pub mod memory;
pub mod sqlite_store;
pub mod state;
pub mod store;

pub use error::StoreError;
pub use memory::InMemoryStore;
pub use sqlite_store::SqliteStore;
pub use state::{
    CargoRecord, DesiredState, IdempotencyRecord, SandboxRecord, SessionContainer,
    SessionRecord, SessionState, request_fingerprint,
};
pub use store::{LiveIds, MetadataStore, SandboxQuery};
