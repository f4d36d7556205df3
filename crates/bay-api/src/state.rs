use std::sync::Arc;
use std::time::Duration;

use bay_gc::GcScheduler;
use bay_orchestrator::{CapabilityRouter, CargoManager, ProfileRegistry, SandboxManager};
use bay_store::MetadataStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn MetadataStore>,
    pub sandboxes: Arc<SandboxManager>,
    pub cargos: Arc<CargoManager>,
    pub router: Arc<CapabilityRouter>,
    pub gc: Arc<GcScheduler>,
    pub registry: Arc<ProfileRegistry>,
    pub auth_token: Arc<String>,
    pub idempotency_retention: Duration,
}
