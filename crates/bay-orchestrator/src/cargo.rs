use std::sync::Arc;

use chrono::Utc;
use bay_domain::{validate_workspace_path, CargoId, OwnerId, SandboxId};
use bay_driver::{Driver, ResourceLabels, VolumeEntry};
use bay_store::{CargoRecord, MetadataStore};
use tracing::{debug, warn};

use crate::error::Error;
use crate::ids::new_cargo_id;

const DEFAULT_SIZE_LIMIT_MB: u64 = 1024;

/// Creates, attaches, and deletes persistent data volumes.
///
/// Managed cargos are born and die with one sandbox; external cargos are
/// owned by the principal and refuse deletion while any live sandbox
/// references them.
pub struct CargoManager {
    store: Arc<dyn MetadataStore>,
    driver: Arc<dyn Driver>,
}

impl CargoManager {
    pub fn new(store: Arc<dyn MetadataStore>, driver: Arc<dyn Driver>) -> Self {
        Self { store, driver }
    }

    fn owned(&self, cargo: CargoRecord, owner: &OwnerId) -> Result<CargoRecord, Error> {
        if &cargo.owner != owner {
            return Err(Error::Forbidden(format!(
                "cargo {} belongs to another owner",
                cargo.id
            )));
        }
        Ok(cargo)
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Create an external cargo: volume first, then the metadata row; the
    /// volume is abandoned to the orphan reaper if the row write fails.
    pub async fn create_external(
        &self,
        owner: &OwnerId,
        size_limit_mb: Option<u64>,
    ) -> Result<CargoRecord, Error> {
        let record = self
            .provision(owner, size_limit_mb, None)
            .await?;
        if let Err(e) = self.store.insert_cargo(&record).await {
            if let Err(cleanup) = self.driver.delete_volume(&record.driver_ref).await {
                warn!(cargo_id = %record.id, error = %cleanup, "volume cleanup after failed insert");
            }
            return Err(e.into());
        }
        Ok(record)
    }

    /// Create the volume for a managed cargo without persisting the row —
    /// the sandbox create transaction inserts both atomically.
    pub async fn provision(
        &self,
        owner: &OwnerId,
        size_limit_mb: Option<u64>,
        managed_by: Option<&SandboxId>,
    ) -> Result<CargoRecord, Error> {
        let id = new_cargo_id();
        let labels = ResourceLabels {
            owner: Some(owner.clone()),
            cargo_id: Some(id.clone()),
            sandbox_id: managed_by.cloned(),
            ..Default::default()
        };
        let driver_ref = self.driver.create_volume(id.as_str(), &labels).await?;
        debug!(cargo_id = %id, driver_ref = %driver_ref, managed = managed_by.is_some(), "cargo volume created");

        let now = Utc::now();
        Ok(CargoRecord {
            id,
            owner: owner.clone(),
            driver_ref,
            managed: managed_by.is_some(),
            managed_by_sandbox_id: managed_by.cloned(),
            size_limit_mb: size_limit_mb.unwrap_or(DEFAULT_SIZE_LIMIT_MB),
            created_at: now,
            last_accessed_at: now,
        })
    }

    /// Undo a `provision` whose enclosing transaction failed.
    pub async fn abandon(&self, record: &CargoRecord) {
        if let Err(e) = self.driver.delete_volume(&record.driver_ref).await {
            warn!(cargo_id = %record.id, error = %e, "abandoning cargo volume failed; orphan reaper will retry");
        }
    }

    pub async fn get(&self, owner: &OwnerId, id: &CargoId) -> Result<CargoRecord, Error> {
        let cargo = self
            .store
            .get_cargo(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("cargo '{id}' not found")))?;
        self.owned(cargo, owner)
    }

    pub async fn list(&self, owner: &OwnerId) -> Result<Vec<CargoRecord>, Error> {
        Ok(self.store.list_cargos(owner).await?)
    }

    /// Public delete: external cargos only, and only when unreferenced.
    pub async fn delete(&self, owner: &OwnerId, id: &CargoId) -> Result<(), Error> {
        let cargo = self.get(owner, id).await?;
        if cargo.managed {
            return Err(Error::Conflict(format!(
                "cargo '{id}' is managed; it is deleted with its sandbox"
            )));
        }
        let references = self.store.count_sandboxes_referencing_cargo(id).await?;
        if references > 0 {
            return Err(Error::Conflict(format!(
                "cargo '{id}' is referenced by {references} sandbox(es)"
            )));
        }
        self.driver.delete_volume(&cargo.driver_ref).await?;
        self.store.delete_cargo(id).await?;
        Ok(())
    }

    /// Sandbox-lifecycle delete. Volume-not-found is tolerated — the fabric
    /// may already have been cleaned by a previous attempt.
    pub async fn delete_managed(&self, id: &CargoId) -> Result<(), Error> {
        let Some(cargo) = self.store.get_cargo(id).await? else {
            return Ok(());
        };
        match self.driver.delete_volume(&cargo.driver_ref).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        self.store.delete_cargo(id).await?;
        debug!(cargo_id = %id, "managed cargo deleted");
        Ok(())
    }

    // ── Path operations ───────────────────────────────────────────────────────
    //
    // Served by direct volume I/O where the fabric allows it. On fabrics
    // without it the sandbox filesystem capability is the supported route,
    // so these refuse with Conflict rather than spinning up a session.

    fn require_volume_io(&self) -> Result<(), Error> {
        if self.driver.supports_volume_io() {
            Ok(())
        } else {
            Err(Error::Conflict(
                "this fabric has no direct volume access; use the sandbox filesystem capability"
                    .into(),
            ))
        }
    }

    async fn touch(&self, mut cargo: CargoRecord) {
        cargo.last_accessed_at = Utc::now();
        if let Err(e) = self.store.update_cargo(&cargo).await {
            warn!(cargo_id = %cargo.id, error = %e, "cargo access timestamp update failed");
        }
    }

    pub async fn read(&self, owner: &OwnerId, id: &CargoId, path: &str) -> Result<Vec<u8>, Error> {
        validate_workspace_path(path)?;
        self.require_volume_io()?;
        let cargo = self.get(owner, id).await?;
        let bytes = self.driver.volume_read(&cargo.driver_ref, path).await?;
        self.touch(cargo).await;
        Ok(bytes)
    }

    pub async fn write(
        &self,
        owner: &OwnerId,
        id: &CargoId,
        path: &str,
        bytes: &[u8],
    ) -> Result<(), Error> {
        validate_workspace_path(path)?;
        self.require_volume_io()?;
        let cargo = self.get(owner, id).await?;
        self.driver.volume_write(&cargo.driver_ref, path, bytes).await?;
        self.touch(cargo).await;
        Ok(())
    }

    pub async fn list_path(
        &self,
        owner: &OwnerId,
        id: &CargoId,
        path: &str,
    ) -> Result<Vec<VolumeEntry>, Error> {
        if !path.is_empty() {
            validate_workspace_path(path)?;
        }
        self.require_volume_io()?;
        let cargo = self.get(owner, id).await?;
        let entries = self.driver.volume_list(&cargo.driver_ref, path).await?;
        self.touch(cargo).await;
        Ok(entries)
    }

    pub async fn delete_path(
        &self,
        owner: &OwnerId,
        id: &CargoId,
        path: &str,
    ) -> Result<(), Error> {
        validate_workspace_path(path)?;
        self.require_volume_io()?;
        let cargo = self.get(owner, id).await?;
        self.driver.volume_delete_path(&cargo.driver_ref, path).await?;
        self.touch(cargo).await;
        Ok(())
    }
}
