use chrono::{DateTime, Duration, Utc};
use bay_domain::{
    Capability, CargoId, ContainerStatus, OwnerId, ProfileId, RuntimeType, SandboxId, SessionId,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ── Sandbox ───────────────────────────────────────────────────────────────────

/// What the caller last asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    Running,
    Stopped,
    Deleted,
}

impl std::fmt::Display for DesiredState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DesiredState::Running => "running",
            DesiredState::Stopped => "stopped",
            DesiredState::Deleted => "deleted",
        };
        write!(f, "{}", s)
    }
}

/// The durable caller-visible handle. One row per sandbox; tombstoned rows
/// (`deleted_at` set) are invisible to public reads but retained briefly for
/// audit and idempotent replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRecord {
    pub id: SandboxId,
    pub owner: OwnerId,
    pub profile_id: ProfileId,
    pub cargo_id: Option<CargoId>,
    pub desired_state: DesiredState,
    /// None means infinite.
    pub ttl_seconds: Option<u64>,
    /// Null iff `ttl_seconds` is null/zero.
    pub expires_at: Option<DateTime<Utc>>,
    /// Pushed forward by keepalive; consulted by the idle reaper.
    pub idle_expires_at: Option<DateTime<Utc>>,
    pub current_session_id: Option<SessionId>,
    pub deleted_at: Option<DateTime<Utc>>,
    /// Bumped by the store on every successful CAS write.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SandboxRecord {
    pub fn new(
        id: SandboxId,
        owner: OwnerId,
        profile_id: ProfileId,
        cargo_id: Option<CargoId>,
        ttl_seconds: Option<u64>,
        now: DateTime<Utc>,
    ) -> Self {
        let ttl = ttl_seconds.filter(|t| *t > 0);
        Self {
            id,
            owner,
            profile_id,
            cargo_id,
            desired_state: DesiredState::Running,
            ttl_seconds: ttl,
            expires_at: ttl.map(|t| now + Duration::seconds(t as i64)),
            idle_expires_at: None,
            current_session_id: None,
            deleted_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_tombstoned(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }

    /// Mark deleted. The row survives as a tombstone until purged.
    pub fn tombstone(&mut self, now: DateTime<Utc>) {
        self.desired_state = DesiredState::Deleted;
        self.deleted_at = Some(now);
        self.current_session_id = None;
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

/// Session lifecycle.
///
/// Transitions:
///   Pending → Starting → Running
///   Running → Degraded (non-primary container exited) → Running
///   Pending | Starting | Running | Degraded → Stopping → Stopped
///   any → Failed (unrecoverable creation error)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Pending,
    Starting,
    Running,
    Degraded,
    Stopping,
    Stopped,
    Failed,
}

impl SessionState {
    /// States that count against the one-active-session-per-sandbox invariant.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Pending
                | SessionState::Starting
                | SessionState::Running
                | SessionState::Degraded
        )
    }

    /// States a capability call may be routed to.
    pub fn is_serving(self) -> bool {
        matches!(self, SessionState::Running | SessionState::Degraded)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Pending => "pending",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Degraded => "degraded",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
            SessionState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// One container within a session's group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContainer {
    /// Logical name from the profile; also the container hostname.
    pub name: String,
    /// Fabric identifier. Never exposed to callers.
    pub container_id: String,
    /// Base URL of the runtime sidecar. Set only after readiness succeeded.
    pub endpoint: Option<String>,
    pub runtime_type: RuntimeType,
    pub capabilities: Vec<Capability>,
    pub observed_status: ContainerStatus,
}

/// One generation of container group bound to a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub sandbox_id: SandboxId,
    /// Isolated network created for this session.
    pub network_ref: Option<String>,
    /// Ordered per the profile.
    pub containers: Vec<SessionContainer>,
    pub observed_state: SessionState,
    pub desired_state: DesiredState,
    /// Capabilities currently unserved because their container exited.
    pub unavailable_capabilities: Vec<Capability>,
    pub idle_timeout_seconds: u64,
    pub last_observed_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    /// last_active_at + idle_timeout; kept denormalized for the idle reaper.
    pub idle_expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub skills_injected_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    pub fn new(
        id: SessionId,
        sandbox_id: SandboxId,
        idle_timeout_seconds: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            sandbox_id,
            network_ref: None,
            containers: Vec::new(),
            observed_state: SessionState::Pending,
            desired_state: DesiredState::Running,
            unavailable_capabilities: Vec::new(),
            idle_timeout_seconds,
            last_observed_at: now,
            last_active_at: now,
            idle_expires_at: now + Duration::seconds(idle_timeout_seconds as i64),
            created_at: now,
            skills_injected_at: None,
        }
    }

    /// Refresh activity and push the idle deadline out.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_active_at = now;
        self.idle_expires_at = now + Duration::seconds(self.idle_timeout_seconds as i64);
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.observed_state = SessionState::Running;
        self.unavailable_capabilities.clear();
        self.last_observed_at = now;
        self.touch(now);
    }

    pub fn mark_degraded(&mut self, unavailable: Vec<Capability>, now: DateTime<Utc>) {
        self.observed_state = SessionState::Degraded;
        self.unavailable_capabilities = unavailable;
        self.last_observed_at = now;
    }

    pub fn mark_failed(&mut self, now: DateTime<Utc>) {
        self.observed_state = SessionState::Failed;
        self.last_observed_at = now;
    }

    pub fn container(&self, name: &str) -> Option<&SessionContainer> {
        self.containers.iter().find(|c| c.name == name)
    }
}

// ── Cargo ─────────────────────────────────────────────────────────────────────

/// Persistent data volume metadata. A managed cargo's lifecycle is bound to
/// one sandbox; an external cargo outlives every sandbox that references it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CargoRecord {
    pub id: CargoId,
    pub owner: OwnerId,
    /// Opaque identifier in the container fabric.
    pub driver_ref: String,
    pub managed: bool,
    /// Non-null iff `managed`.
    pub managed_by_sandbox_id: Option<SandboxId>,
    pub size_limit_mb: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

// ── Idempotency ───────────────────────────────────────────────────────────────

/// A persisted outcome keyed by (owner, key). Replays with a matching
/// fingerprint return the stored response byte-identically; a mismatched
/// fingerprint is a client bug, surfaced as a conflict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub owner: OwnerId,
    pub request_fingerprint: String,
    pub response_status: u16,
    pub response_body: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// SHA-256 hex over method, path, and body. Header order and transport
/// details deliberately excluded.
pub fn request_fingerprint(method: &str, path: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(b"\n");
    hasher.update(path.as_bytes());
    hasher.update(b"\n");
    hasher.update(body);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_sandbox_zero_ttl_means_infinite() {
        let now = Utc::now();
        let sb = SandboxRecord::new(
            SandboxId::new("sb-1"),
            OwnerId::new("acme"),
            ProfileId::new("python-default"),
            None,
            Some(0),
            now,
        );
        assert_eq!(sb.ttl_seconds, None);
        assert_eq!(sb.expires_at, None);
        assert!(!sb.is_expired(now + Duration::days(365)));
    }

    #[test]
    fn expires_at_set_iff_ttl_set() {
        let now = Utc::now();
        let sb = SandboxRecord::new(
            SandboxId::new("sb-2"),
            OwnerId::new("acme"),
            ProfileId::new("python-default"),
            None,
            Some(600),
            now,
        );
        assert_eq!(sb.expires_at, Some(now + Duration::seconds(600)));
        assert!(sb.is_expired(now + Duration::seconds(601)));
        assert!(!sb.is_expired(now + Duration::seconds(599)));
    }

    #[test]
    fn tombstone_clears_current_session() {
        let now = Utc::now();
        let mut sb = SandboxRecord::new(
            SandboxId::new("sb-3"),
            OwnerId::new("acme"),
            ProfileId::new("python-default"),
            None,
            None,
            now,
        );
        sb.current_session_id = Some(SessionId::new("sess-1"));
        sb.tombstone(now);
        assert!(sb.is_tombstoned());
        assert_eq!(sb.current_session_id, None);
        assert_eq!(sb.desired_state, DesiredState::Deleted);
    }

    #[test]
    fn session_touch_extends_idle_deadline() {
        let now = Utc::now();
        let mut sess = SessionRecord::new(
            SessionId::new("sess-1"),
            SandboxId::new("sb-1"),
            300,
            now,
        );
        let later = now + Duration::seconds(200);
        sess.touch(later);
        assert_eq!(sess.idle_expires_at, later + Duration::seconds(300));
    }

    #[test]
    fn active_states_match_invariant_set() {
        assert!(SessionState::Pending.is_active());
        assert!(SessionState::Starting.is_active());
        assert!(SessionState::Running.is_active());
        assert!(SessionState::Degraded.is_active());
        assert!(!SessionState::Stopped.is_active());
        assert!(!SessionState::Failed.is_active());

        assert!(SessionState::Running.is_serving());
        assert!(SessionState::Degraded.is_serving());
        assert!(!SessionState::Starting.is_serving());
    }

    #[test]
    fn fingerprint_is_stable_and_body_sensitive() {
        let a = request_fingerprint("POST", "/v1/sandboxes", b"{\"ttl\":600}");
        let b = request_fingerprint("POST", "/v1/sandboxes", b"{\"ttl\":600}");
        let c = request_fingerprint("POST", "/v1/sandboxes", b"{\"ttl\":900}");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
