use chrono::{DateTime, Utc};
use bay_domain::{Capability, Profile};
use bay_store::{CargoRecord, SandboxRecord};
use serde::{Deserialize, Serialize};

// ── Requests ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateSandboxBody {
    pub profile_id: String,
    pub cargo_id: Option<String>,
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ExtendTtlBody {
    pub seconds: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateCargoBody {
    pub size_limit_mb: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListSandboxesQuery {
    pub cursor: Option<String>,
    pub limit: Option<u32>,
    pub profile_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GcRunBody {
    pub task: Option<String>,
}

// ── Views ─────────────────────────────────────────────────────────────────────

/// Caller-facing sandbox shape. Fabric identifiers never appear here; the
/// session id leaks only as an opaque generation marker so callers can
/// observe replacement.
#[derive(Debug, Serialize, Deserialize)]
pub struct SandboxView {
    pub id: String,
    pub owner: String,
    pub profile_id: String,
    pub cargo_id: Option<String>,
    pub status: String,
    pub session_generation: Option<String>,
    pub ttl_seconds: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub idle_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<&SandboxRecord> for SandboxView {
    fn from(record: &SandboxRecord) -> Self {
        let status = if record.current_session_id.is_some() {
            "running"
        } else {
            "idle"
        };
        SandboxView {
            id: record.id.to_string(),
            owner: record.owner.to_string(),
            profile_id: record.profile_id.to_string(),
            cargo_id: record.cargo_id.as_ref().map(|c| c.to_string()),
            status: status.to_string(),
            session_generation: record.current_session_id.as_ref().map(|s| s.to_string()),
            ttl_seconds: record.ttl_seconds,
            expires_at: record.expires_at,
            idle_expires_at: record.idle_expires_at,
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CargoView {
    pub id: String,
    pub owner: String,
    pub managed: bool,
    pub size_limit_mb: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

impl From<&CargoRecord> for CargoView {
    fn from(record: &CargoRecord) -> Self {
        CargoView {
            id: record.id.to_string(),
            owner: record.owner.to_string(),
            managed: record.managed,
            size_limit_mb: record.size_limit_mb,
            created_at: record.created_at,
            last_accessed_at: record.last_accessed_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ProfileContainerView {
    pub name: String,
    pub runtime_type: String,
    pub capabilities: Vec<Capability>,
}

#[derive(Debug, Serialize)]
pub struct ProfileView {
    pub id: String,
    pub capabilities: Vec<Capability>,
    pub idle_timeout_seconds: u64,
    pub default_ttl_seconds: Option<u64>,
    pub containers: Vec<ProfileContainerView>,
}

impl From<&Profile> for ProfileView {
    fn from(profile: &Profile) -> Self {
        ProfileView {
            id: profile.id.to_string(),
            capabilities: profile.capabilities().into_iter().collect(),
            idle_timeout_seconds: profile.idle_timeout_seconds,
            default_ttl_seconds: profile.default_ttl_seconds,
            containers: profile
                .containers
                .iter()
                .map(|c| ProfileContainerView {
                    name: c.name.clone(),
                    runtime_type: c.runtime_type.to_string(),
                    capabilities: c.capabilities.iter().copied().collect(),
                })
                .collect(),
        }
    }
}
