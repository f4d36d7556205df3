use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use bay_domain::{CargoId, ContainerStatus, OwnerId, ProfileId, SandboxId, SessionId};

use crate::error::DriverError;

// ── Labels ────────────────────────────────────────────────────────────────────

pub const LABEL_MANAGED: &str = "bay.managed";
pub const LABEL_OWNER: &str = "bay.owner";
pub const LABEL_SANDBOX: &str = "bay.sandbox_id";
pub const LABEL_SESSION: &str = "bay.session_id";
pub const LABEL_CARGO: &str = "bay.cargo_id";
pub const LABEL_PROFILE: &str = "bay.profile_id";

/// Identifying labels stamped on every resource Bay creates. The orphan
/// reaper attributes fabric resources back to metadata rows through these,
/// so every create call must carry them.
#[derive(Debug, Clone, Default)]
pub struct ResourceLabels {
    pub owner: Option<OwnerId>,
    pub sandbox_id: Option<SandboxId>,
    pub session_id: Option<SessionId>,
    pub cargo_id: Option<CargoId>,
    pub profile_id: Option<ProfileId>,
}

impl ResourceLabels {
    pub fn to_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert(LABEL_MANAGED.to_string(), "true".to_string());
        if let Some(v) = &self.owner {
            map.insert(LABEL_OWNER.to_string(), v.to_string());
        }
        if let Some(v) = &self.sandbox_id {
            map.insert(LABEL_SANDBOX.to_string(), v.to_string());
        }
        if let Some(v) = &self.session_id {
            map.insert(LABEL_SESSION.to_string(), v.to_string());
        }
        if let Some(v) = &self.cargo_id {
            map.insert(LABEL_CARGO.to_string(), v.to_string());
        }
        if let Some(v) = &self.profile_id {
            map.insert(LABEL_PROFILE.to_string(), v.to_string());
        }
        map
    }
}

// ── Resource views ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Container,
    Volume,
    Network,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Container => write!(f, "container"),
            ResourceKind::Volume => write!(f, "volume"),
            ResourceKind::Network => write!(f, "network"),
        }
    }
}

/// A fabric resource carrying `bay.managed=true`, as seen by the reconcile
/// pass.
#[derive(Debug, Clone)]
pub struct ManagedResource {
    pub kind: ResourceKind,
    /// Opaque fabric reference usable with [`Driver::destroy_resource`].
    pub reference: String,
    pub labels: HashMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl ManagedResource {
    pub fn sandbox_id(&self) -> Option<SandboxId> {
        self.labels.get(LABEL_SANDBOX).map(SandboxId::new)
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.labels.get(LABEL_SESSION).map(SessionId::new)
    }

    pub fn cargo_id(&self) -> Option<CargoId> {
        self.labels.get(LABEL_CARGO).map(CargoId::new)
    }
}

/// Entry returned by directory listings on a volume.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct VolumeEntry {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
}

// ── Container creation ────────────────────────────────────────────────────────

/// Everything the fabric needs to create one container of a session group.
#[derive(Debug, Clone)]
pub struct ContainerCreateSpec {
    /// Unique fabric-level name.
    pub name: String,
    /// Logical name from the profile. Set as the container hostname so peers
    /// on the session network reach it without discovery.
    pub hostname: String,
    pub image: String,
    pub env: HashMap<String, String>,
    pub cpu: f64,
    pub memory_mb: u64,
    /// Isolated session network the container joins.
    pub network_ref: String,
    /// Cargo volume mounted at `/workspace`; None for volume-less groups.
    pub volume_ref: Option<String>,
    pub labels: ResourceLabels,
}

/// Mount path inside every runtime container.
pub const WORKSPACE_MOUNT: &str = "/workspace";

// ── Driver contract ───────────────────────────────────────────────────────────

/// Capability-ordered interface over the container fabric.
///
/// Implementations carry no business policy: no retries, no rate limiting,
/// no metadata access. Every resource created here carries identifying
/// labels so the reconcile pass can attribute it.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Whether this fabric allows Bay to read and write volume contents
    /// directly, without a running container.
    fn supports_volume_io(&self) -> bool {
        false
    }

    // ── Networks ──────────────────────────────────────────────────────────────

    async fn create_network(
        &self,
        session_id: &SessionId,
        labels: &ResourceLabels,
    ) -> Result<String, DriverError>;

    async fn delete_network(&self, network_ref: &str) -> Result<(), DriverError>;

    // ── Volumes ───────────────────────────────────────────────────────────────

    async fn create_volume(
        &self,
        name: &str,
        labels: &ResourceLabels,
    ) -> Result<String, DriverError>;

    async fn delete_volume(&self, driver_ref: &str) -> Result<(), DriverError>;

    async fn volume_exists(&self, driver_ref: &str) -> Result<bool, DriverError>;

    // ── Containers ────────────────────────────────────────────────────────────

    async fn create_container(&self, spec: &ContainerCreateSpec) -> Result<String, DriverError>;

    /// Start and return the endpoint (base URL) where the runtime sidecar
    /// listening on `runtime_port` is reachable from Bay.
    async fn start_container(
        &self,
        container_id: &str,
        runtime_port: u16,
    ) -> Result<String, DriverError>;

    async fn stop_container(&self, container_id: &str) -> Result<(), DriverError>;

    async fn destroy_container(&self, container_id: &str) -> Result<(), DriverError>;

    async fn container_status(&self, container_id: &str) -> Result<ContainerStatus, DriverError>;

    // ── Reconcile support ─────────────────────────────────────────────────────

    /// All fabric resources labeled `bay.managed=true`.
    async fn list_managed_resources(&self) -> Result<Vec<ManagedResource>, DriverError>;

    async fn destroy_resource(&self, resource: &ManagedResource) -> Result<(), DriverError>;

    // ── Direct volume I/O (optional capability) ───────────────────────────────
    //
    // Implemented only by fabrics where `supports_volume_io()` is true.

    async fn volume_read(&self, _driver_ref: &str, _path: &str) -> Result<Vec<u8>, DriverError> {
        Err(DriverError::Invariant(
            "driver does not support direct volume I/O".into(),
        ))
    }

    async fn volume_write(
        &self,
        _driver_ref: &str,
        _path: &str,
        _bytes: &[u8],
    ) -> Result<(), DriverError> {
        Err(DriverError::Invariant(
            "driver does not support direct volume I/O".into(),
        ))
    }

    async fn volume_list(
        &self,
        _driver_ref: &str,
        _path: &str,
    ) -> Result<Vec<VolumeEntry>, DriverError> {
        Err(DriverError::Invariant(
            "driver does not support direct volume I/O".into(),
        ))
    }

    async fn volume_delete_path(
        &self,
        _driver_ref: &str,
        _path: &str,
    ) -> Result<(), DriverError> {
        Err(DriverError::Invariant(
            "driver does not support direct volume I/O".into(),
        ))
    }
}
