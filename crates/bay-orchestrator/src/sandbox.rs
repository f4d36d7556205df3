use std::sync::Arc;

use chrono::{Duration, Utc};
use bay_domain::{CargoId, OwnerId, ProfileId, SandboxId};
use bay_store::{MetadataStore, SandboxQuery, SandboxRecord, StoreError};
use tracing::{info, warn};

use crate::cargo::CargoManager;
use crate::error::Error;
use crate::ids::new_sandbox_id;
use crate::locks::LockTable;
use crate::registry::ProfileRegistry;
use crate::session::SessionManager;

/// The public sandbox lifecycle surface. Serializes every transition per
/// sandbox through the lock table; the session is lazy and owned by the
/// [`SessionManager`].
pub struct SandboxManager {
    store: Arc<dyn MetadataStore>,
    locks: LockTable,
    sessions: Arc<SessionManager>,
    cargos: Arc<CargoManager>,
    registry: Arc<ProfileRegistry>,
    max_sandboxes_per_owner: Option<u64>,
}

impl SandboxManager {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        locks: LockTable,
        sessions: Arc<SessionManager>,
        cargos: Arc<CargoManager>,
        registry: Arc<ProfileRegistry>,
        max_sandboxes_per_owner: Option<u64>,
    ) -> Self {
        Self { store, locks, sessions, cargos, registry, max_sandboxes_per_owner }
    }

    /// Tombstone-filtered, owner-checked load.
    async fn visible(&self, owner: &OwnerId, id: &SandboxId) -> Result<SandboxRecord, Error> {
        let sandbox = self
            .store
            .get_sandbox(id)
            .await?
            .filter(|s| !s.is_tombstoned())
            .ok_or_else(|| Error::NotFound(format!("sandbox '{id}' not found")))?;
        if &sandbox.owner != owner {
            return Err(Error::Forbidden(format!(
                "sandbox '{id}' belongs to another owner"
            )));
        }
        Ok(sandbox)
    }

    // ── create ────────────────────────────────────────────────────────────────

    /// Persist a new sandbox. No session is started — that happens lazily on
    /// the first capability call. A null `cargo_id` creates a managed cargo
    /// whose lifecycle is bound to this sandbox.
    pub async fn create(
        &self,
        owner: &OwnerId,
        profile_id: &ProfileId,
        cargo_id: Option<&CargoId>,
        ttl_seconds: Option<u64>,
    ) -> Result<SandboxRecord, Error> {
        let profile = self.registry.get(profile_id)?;

        if let Some(max) = self.max_sandboxes_per_owner {
            let live = self.store.count_live_sandboxes(owner).await?;
            if live >= max {
                return Err(Error::Conflict(format!(
                    "owner has {live} live sandboxes; limit is {max}"
                )));
            }
        }

        let id = new_sandbox_id();
        let ttl = ttl_seconds.or(profile.default_ttl_seconds);

        let (attached_cargo_id, managed_cargo) = match cargo_id {
            Some(cargo_id) => {
                let cargo = self.cargos.get(owner, cargo_id).await?;
                if cargo.managed {
                    return Err(Error::Conflict(format!(
                        "cargo '{cargo_id}' is managed by another sandbox"
                    )));
                }
                // One sandbox per cargo at a time — no shared mounts.
                let references = self.store.count_sandboxes_referencing_cargo(cargo_id).await?;
                if references > 0 {
                    return Err(Error::Conflict(format!(
                        "cargo '{cargo_id}' is already attached to a sandbox"
                    )));
                }
                (cargo.id, None)
            }
            None => {
                let cargo = self.cargos.provision(owner, None, Some(&id)).await?;
                (cargo.id.clone(), Some(cargo))
            }
        };

        let mut record = SandboxRecord::new(
            id,
            owner.clone(),
            profile_id.clone(),
            Some(attached_cargo_id),
            ttl,
            Utc::now(),
        );
        record.idle_expires_at =
            Some(record.created_at + Duration::seconds(profile.idle_timeout_seconds as i64));

        if let Err(e) = self.store.create_sandbox(&record, managed_cargo.as_ref()).await {
            if let Some(cargo) = &managed_cargo {
                self.cargos.abandon(cargo).await;
            }
            return Err(e.into());
        }
        info!(sandbox_id = %record.id, owner = %owner, profile_id = %profile_id, "sandbox created");
        Ok(record)
    }

    // ── reads ─────────────────────────────────────────────────────────────────

    pub async fn get(&self, owner: &OwnerId, id: &SandboxId) -> Result<SandboxRecord, Error> {
        self.visible(owner, id).await
    }

    pub async fn list(
        &self,
        owner: &OwnerId,
        query: &SandboxQuery,
    ) -> Result<Vec<SandboxRecord>, Error> {
        Ok(self.store.list_sandboxes(owner, query).await?)
    }

    // ── lifecycle ─────────────────────────────────────────────────────────────

    /// Tear down the session; the sandbox and its cargo stay.
    pub async fn stop(&self, owner: &OwnerId, id: &SandboxId) -> Result<SandboxRecord, Error> {
        let _guard = self.locks.lock(id).await;
        self.visible(owner, id).await?;
        self.sessions.stop(id).await
    }

    /// Tombstone, stop the session, cascade the managed cargo, release the
    /// lock entry. External cargos are never cascaded.
    pub async fn delete(&self, owner: &OwnerId, id: &SandboxId) -> Result<(), Error> {
        {
            let _guard = self.locks.lock(id).await;
            let sandbox = self.visible(owner, id).await?;
            self.delete_under_lock(sandbox).await?;
        }
        self.locks.remove(id).await;
        Ok(())
    }

    /// GC entry point: re-check expiry under the lock, then delete. Returns
    /// false when the sandbox vanished or was extended in the meantime.
    pub async fn delete_if_expired(
        &self,
        id: &SandboxId,
        now: chrono::DateTime<Utc>,
    ) -> Result<bool, Error> {
        {
            let _guard = self.locks.lock(id).await;
            let Some(sandbox) = self.store.get_sandbox(id).await? else {
                return Ok(false);
            };
            if sandbox.is_tombstoned() || !sandbox.is_expired(now) {
                return Ok(false);
            }
            self.delete_under_lock(sandbox).await?;
        }
        self.locks.remove(id).await;
        Ok(true)
    }

    async fn delete_under_lock(&self, sandbox: SandboxRecord) -> Result<(), Error> {
        let id = sandbox.id.clone();
        let owner = sandbox.owner.clone();

        // Tombstone first: readers stop seeing the sandbox, and an
        // in-flight readiness poll observes it and aborts.
        let mut dead = sandbox;
        dead.tombstone(Utc::now());
        let dead = match self.store.update_sandbox(&dead).await {
            Ok(s) => s,
            Err(StoreError::VersionConflict { .. }) => {
                let mut retry = self.visible(&owner, &id).await?;
                retry.tombstone(Utc::now());
                self.store.update_sandbox(&retry).await?
            }
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = self.sessions.stop(&id).await {
            warn!(sandbox_id = %id, error = %e, "session teardown during delete failed; orphan reaper will converge");
        }

        if let Some(cargo_id) = &dead.cargo_id {
            match self.store.get_cargo(cargo_id).await {
                Ok(Some(cargo))
                    if cargo.managed && cargo.managed_by_sandbox_id.as_ref() == Some(&id) =>
                {
                    if let Err(e) = self.cargos.delete_managed(cargo_id).await {
                        warn!(sandbox_id = %id, cargo_id = %cargo_id, error = %e, "managed cargo cascade failed; orphan reaper will converge");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(sandbox_id = %id, cargo_id = %cargo_id, error = %e, "cargo lookup during delete failed");
                }
            }
        }
        info!(sandbox_id = %id, owner = %owner, "sandbox deleted");
        Ok(())
    }

    /// Add seconds to `expires_at`. Extension is from the current deadline,
    /// not from now, so repeated extensions add exactly their sum.
    pub async fn extend_ttl(
        &self,
        owner: &OwnerId,
        id: &SandboxId,
        seconds: u64,
    ) -> Result<SandboxRecord, Error> {
        if seconds == 0 {
            return Err(Error::Validation("extension must be positive".into()));
        }
        let _guard = self.locks.lock(id).await;

        for _ in 0..3 {
            let sandbox = self.visible(owner, id).await?;
            if sandbox.is_expired(Utc::now()) {
                return Err(Error::SandboxExpired(id.clone()));
            }
            let (Some(ttl), Some(expires_at)) = (sandbox.ttl_seconds, sandbox.expires_at) else {
                return Err(Error::SandboxTtlInfinite(id.clone()));
            };

            let mut extended = sandbox;
            extended.ttl_seconds = Some(ttl + seconds);
            extended.expires_at = Some(expires_at + Duration::seconds(seconds as i64));
            match self.store.update_sandbox(&extended).await {
                Ok(updated) => {
                    info!(sandbox_id = %id, seconds, "ttl extended");
                    return Ok(updated);
                }
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::Conflict(format!(
            "sandbox '{id}' is being modified concurrently; retry"
        )))
    }

    /// Push the idle deadline out. Never starts a session.
    pub async fn keepalive(&self, owner: &OwnerId, id: &SandboxId) -> Result<SandboxRecord, Error> {
        let _guard = self.locks.lock(id).await;

        for _ in 0..3 {
            let sandbox = self.visible(owner, id).await?;
            let profile = self.registry.get(&sandbox.profile_id)?;

            let mut alive = sandbox;
            alive.idle_expires_at =
                Some(Utc::now() + Duration::seconds(profile.idle_timeout_seconds as i64));
            match self.store.update_sandbox(&alive).await {
                Ok(updated) => return Ok(updated),
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::Conflict(format!(
            "sandbox '{id}' is being modified concurrently; retry"
        )))
    }
}
