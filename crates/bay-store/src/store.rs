use async_trait::async_trait;
use chrono::{DateTime, Utc};
use bay_domain::{CargoId, OwnerId, ProfileId, SandboxId, SessionId};

use crate::error::StoreError;
use crate::state::{CargoRecord, IdempotencyRecord, SandboxRecord, SessionRecord};

/// Filters for the public sandbox listing.
#[derive(Debug, Clone, Default)]
pub struct SandboxQuery {
    /// Opaque cursor: return sandboxes with id greater than this.
    pub cursor: Option<SandboxId>,
    pub limit: u32,
    pub profile_id: Option<ProfileId>,
}

/// Durable source of truth for sandboxes, sessions, cargos, and idempotency
/// records.
///
/// Infrastructure side-effects always happen outside the store; every
/// lifecycle mutation here is a single transaction, so a transient write
/// failure leaves no observable partial state. Sandbox writes go through a
/// `version` CAS — the authoritative cross-process arbiter; the in-process
/// per-sandbox mutex merely makes conflicts rare.
#[async_trait]
pub trait MetadataStore: Send + Sync + 'static {
    // ── Sandboxes ─────────────────────────────────────────────────────────────

    /// Persist a new sandbox, and its managed cargo when one was created
    /// alongside it, in one transaction.
    async fn create_sandbox(
        &self,
        sandbox: &SandboxRecord,
        managed_cargo: Option<&CargoRecord>,
    ) -> Result<(), StoreError>;

    /// Tombstoned rows are returned — callers decide visibility.
    async fn get_sandbox(&self, id: &SandboxId) -> Result<Option<SandboxRecord>, StoreError>;

    /// Public listing: tombstones excluded, ordered by id, paginated.
    async fn list_sandboxes(
        &self,
        owner: &OwnerId,
        query: &SandboxQuery,
    ) -> Result<Vec<SandboxRecord>, StoreError>;

    /// CAS update: succeeds only if the stored `version` equals
    /// `record.version`, then writes the record with `version + 1` and
    /// returns the stored row. `VersionConflict` means reload and retry.
    async fn update_sandbox(&self, record: &SandboxRecord) -> Result<SandboxRecord, StoreError>;

    /// Non-tombstoned sandboxes for one owner (quota checks).
    async fn count_live_sandboxes(&self, owner: &OwnerId) -> Result<u64, StoreError>;

    /// Non-tombstoned sandboxes referencing a cargo (external-cargo delete guard).
    async fn count_sandboxes_referencing_cargo(
        &self,
        cargo_id: &CargoId,
    ) -> Result<u64, StoreError>;

    /// GC: sandboxes with `expires_at <= now`, tombstones excluded.
    async fn expired_sandboxes(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<SandboxRecord>, StoreError>;

    /// GC: drop tombstones older than `cutoff`. Returns how many were purged.
    async fn purge_tombstones(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    // ── Sessions ──────────────────────────────────────────────────────────────

    async fn insert_session(&self, session: &SessionRecord) -> Result<(), StoreError>;

    async fn get_session(&self, id: &SessionId) -> Result<Option<SessionRecord>, StoreError>;

    async fn update_session(&self, session: &SessionRecord) -> Result<(), StoreError>;

    async fn delete_session(&self, id: &SessionId) -> Result<(), StoreError>;

    /// The one session (if any) in an active state for this sandbox.
    async fn active_session_for(
        &self,
        sandbox_id: &SandboxId,
    ) -> Result<Option<SessionRecord>, StoreError>;

    /// GC: serving sessions whose idle deadline passed.
    async fn idle_sessions(&self, now: DateTime<Utc>) -> Result<Vec<SessionRecord>, StoreError>;

    /// GC: sessions stuck in `failed` whose fabric resources still need a
    /// teardown sweep.
    async fn failed_sessions(&self) -> Result<Vec<SessionRecord>, StoreError>;

    /// Every sandbox/session id with a live metadata row. Feeds the orphan
    /// resource reaper; tombstoned sandboxes are not live.
    async fn live_ids(&self) -> Result<LiveIds, StoreError>;

    // ── Cargos ────────────────────────────────────────────────────────────────

    async fn insert_cargo(&self, cargo: &CargoRecord) -> Result<(), StoreError>;

    async fn get_cargo(&self, id: &CargoId) -> Result<Option<CargoRecord>, StoreError>;

    async fn list_cargos(&self, owner: &OwnerId) -> Result<Vec<CargoRecord>, StoreError>;

    async fn update_cargo(&self, cargo: &CargoRecord) -> Result<(), StoreError>;

    async fn delete_cargo(&self, id: &CargoId) -> Result<(), StoreError>;

    /// GC: managed cargos whose owning sandbox row is gone, or tombstoned
    /// before `cutoff`.
    async fn orphaned_managed_cargos(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<CargoRecord>, StoreError>;

    // ── Idempotency ───────────────────────────────────────────────────────────

    async fn get_idempotency(
        &self,
        owner: &OwnerId,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Insert-only; an existing (owner, key) slot yields
    /// `DuplicateIdempotencyKey` so racing writers converge on one record.
    async fn put_idempotency(&self, record: &IdempotencyRecord) -> Result<(), StoreError>;

    /// GC: drop records with `expires_at <= now`. Returns how many.
    async fn purge_expired_idempotency(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Snapshot of ids that currently have live metadata rows.
#[derive(Debug, Clone, Default)]
pub struct LiveIds {
    pub sandboxes: std::collections::BTreeSet<SandboxId>,
    pub sessions: std::collections::BTreeSet<SessionId>,
    pub cargos: std::collections::BTreeSet<CargoId>,
}
