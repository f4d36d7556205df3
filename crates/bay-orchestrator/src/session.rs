use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use bay_domain::{Capability, ContainerStatus, Profile, SandboxId, SessionId};
use bay_driver::{ContainerCreateSpec, Driver, ResourceLabels, WORKSPACE_MOUNT};
use bay_runtime::RuntimeConnector;
use bay_store::{
    DesiredState, MetadataStore, SandboxRecord, SessionContainer, SessionRecord, SessionState,
    StoreError,
};
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::ids::new_session_id;

/// Owns the container-group lifecycle for one sandbox at a time.
///
/// Callers hold the sandbox's entry in the lock table across every method
/// here; the store's `version` CAS backs that up across processes. Session
/// start is all-or-nothing: a partial group is never exposed, and every
/// failure path tears down exactly what this attempt created.
pub struct SessionManager {
    store: Arc<dyn MetadataStore>,
    driver: Arc<dyn Driver>,
    connector: Arc<dyn RuntimeConnector>,
    readiness_budget: Duration,
    poll_interval: Duration,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        driver: Arc<dyn Driver>,
        connector: Arc<dyn RuntimeConnector>,
        readiness_budget: Duration,
    ) -> Self {
        Self {
            store,
            driver,
            connector,
            readiness_budget,
            poll_interval: Duration::from_millis(500),
        }
    }

    /// Shrink the probe interval. Test hook.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn reload_sandbox(&self, id: &SandboxId) -> Result<SandboxRecord, Error> {
        self.store
            .get_sandbox(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("sandbox '{id}' not found")))
    }

    // ── ensure_running ────────────────────────────────────────────────────────

    /// Return the sandbox's serving session, starting a fresh one if needed.
    pub async fn ensure_running(
        &self,
        sandbox_id: &SandboxId,
        profile: &Profile,
    ) -> Result<(SandboxRecord, SessionRecord), Error> {
        let mut sandbox = self.reload_sandbox(sandbox_id).await?;
        if sandbox.is_tombstoned() {
            return Err(Error::NotFound(format!("sandbox '{sandbox_id}' not found")));
        }

        if let Some(mut session) = self.store.active_session_for(sandbox_id).await? {
            if session.observed_state.is_serving() {
                session.touch(Utc::now());
                self.store.update_session(&session).await?;
                return Ok((sandbox, session));
            }
            // A pending/starting row under our lock means a previous attempt
            // died mid-start — or another instance is starting right now.
            // Claim the sandbox through the CAS first: a live starter has
            // bumped the version, our claim loses, and its group is safe.
            let mut claimed = sandbox.clone();
            claimed.current_session_id = None;
            sandbox = self.store.update_sandbox(&claimed).await?;
            warn!(
                sandbox_id = %sandbox_id,
                session_id = %session.id,
                state = %session.observed_state,
                "sweeping stale session before restart"
            );
            self.teardown_session(&session).await;
        }

        // Reservation: the pending row and current_session_id commit before
        // any fabric work, so a concurrent instance's CAS loses cleanly.
        let mut session = SessionRecord::new(
            new_session_id(),
            sandbox_id.clone(),
            profile.idle_timeout_seconds,
            Utc::now(),
        );
        self.store.insert_session(&session).await?;

        let mut reserved = sandbox.clone();
        reserved.current_session_id = Some(session.id.clone());
        reserved.desired_state = DesiredState::Running;
        let sandbox = match self.store.update_sandbox(&reserved).await {
            Ok(s) => s,
            Err(e) => {
                self.store.delete_session(&session.id).await.ok();
                return Err(e.into());
            }
        };

        match self.start_group(&sandbox, &mut session, profile).await {
            Ok(()) => {
                info!(sandbox_id = %sandbox_id, session_id = %session.id, "session running");
                Ok((sandbox, session))
            }
            Err(e) => {
                warn!(
                    sandbox_id = %sandbox_id,
                    session_id = %session.id,
                    error = %e,
                    "session start failed; compensating"
                );
                self.compensate(&sandbox, &session).await;
                Err(e)
            }
        }
    }

    /// Build the group: network, containers in profile order, readiness,
    /// meta verification. Endpoints are persisted only after readiness so
    /// no caller can race to an unready runtime.
    async fn start_group(
        &self,
        sandbox: &SandboxRecord,
        session: &mut SessionRecord,
        profile: &Profile,
    ) -> Result<(), Error> {
        session.observed_state = SessionState::Starting;
        self.store.update_session(session).await?;

        let labels = ResourceLabels {
            owner: Some(sandbox.owner.clone()),
            sandbox_id: Some(sandbox.id.clone()),
            session_id: Some(session.id.clone()),
            cargo_id: sandbox.cargo_id.clone(),
            profile_id: Some(sandbox.profile_id.clone()),
        };

        let network_ref = self.driver.create_network(&session.id, &labels).await?;
        session.network_ref = Some(network_ref.clone());
        self.store.update_session(session).await?;

        let volume_ref = match &sandbox.cargo_id {
            Some(cargo_id) => {
                let cargo = self.store.get_cargo(cargo_id).await?.ok_or_else(|| {
                    Error::Internal(format!(
                        "sandbox {} references missing cargo {cargo_id}",
                        sandbox.id
                    ))
                })?;
                Some(cargo.driver_ref)
            }
            None => None,
        };

        let mut endpoints = Vec::with_capacity(profile.containers.len());
        for spec in &profile.containers {
            let create = ContainerCreateSpec {
                name: format!("bay-{}-{}", session.id, spec.name),
                hostname: spec.name.clone(),
                image: spec.image.clone(),
                env: spec.env.clone(),
                cpu: spec.resources.cpu,
                memory_mb: spec.resources.memory_mb,
                network_ref: network_ref.clone(),
                volume_ref: volume_ref.clone(),
                labels: labels.clone(),
            };
            let container_id = self.driver.create_container(&create).await?;
            session.containers.push(SessionContainer {
                name: spec.name.clone(),
                container_id: container_id.clone(),
                endpoint: None,
                runtime_type: spec.runtime_type,
                capabilities: spec.capabilities.iter().copied().collect(),
                observed_status: ContainerStatus::Created,
            });
            self.store.update_session(session).await?;

            let endpoint = self.driver.start_container(&container_id, spec.runtime_port).await?;
            if let Some(entry) = session.containers.last_mut() {
                entry.observed_status = ContainerStatus::Running;
            }
            endpoints.push(endpoint);
        }
        self.store.update_session(session).await?;

        self.await_readiness(sandbox, session, profile, &endpoints).await?;
        self.verify_meta(session, profile, &endpoints).await?;

        for (entry, endpoint) in session.containers.iter_mut().zip(&endpoints) {
            entry.endpoint = Some(endpoint.clone());
        }
        session.mark_running(Utc::now());
        self.store.update_session(session).await?;
        Ok(())
    }

    /// Poll every runtime's health endpoint under one total budget. The
    /// loop is cancellable by sandbox deletion: the sandbox row is re-read
    /// between attempts and a tombstone aborts the start.
    async fn await_readiness(
        &self,
        sandbox: &SandboxRecord,
        session: &SessionRecord,
        profile: &Profile,
        endpoints: &[String],
    ) -> Result<(), Error> {
        let deadline = tokio::time::Instant::now() + self.readiness_budget;
        for (spec, endpoint) in profile.containers.iter().zip(endpoints) {
            let client = self.connector.connect(endpoint, spec.runtime_type);
            loop {
                match client.health().await {
                    Ok(()) => break,
                    Err(e) => {
                        if tokio::time::Instant::now() >= deadline {
                            return Err(Error::SessionNotReady {
                                sandbox_id: sandbox.id.clone(),
                                detail: format!(
                                    "container '{}' not ready within budget: {e}",
                                    spec.name
                                ),
                            });
                        }
                        debug!(
                            session_id = %session.id,
                            container = %spec.name,
                            error = %e,
                            "readiness probe failed; retrying"
                        );
                        tokio::time::sleep(self.poll_interval).await;
                        let current = self.reload_sandbox(&sandbox.id).await?;
                        if current.is_tombstoned() {
                            return Err(Error::NotFound(format!(
                                "sandbox '{}' deleted during start",
                                sandbox.id
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Cross-check each runtime's self-description against the profile.
    async fn verify_meta(
        &self,
        session: &SessionRecord,
        profile: &Profile,
        endpoints: &[String],
    ) -> Result<(), Error> {
        for (spec, endpoint) in profile.containers.iter().zip(endpoints) {
            let client = self.connector.connect(endpoint, spec.runtime_type);
            let meta = client.meta().await?;
            if meta.workspace.mount_path != WORKSPACE_MOUNT {
                return Err(Error::Runtime(format!(
                    "container '{}' advertises mount path '{}', expected '{}'",
                    spec.name, meta.workspace.mount_path, WORKSPACE_MOUNT
                )));
            }
            if !meta.api_version_compatible() {
                return Err(Error::Runtime(format!(
                    "container '{}' speaks api version '{}', incompatible with this server",
                    spec.name, meta.runtime.api_version
                )));
            }
            // Capabilities the runtime advertises beyond the profile's
            // claims are ignored; missing ones fail the start.
            let advertised = meta.known_capabilities();
            for capability in &spec.capabilities {
                if !advertised.contains(capability) {
                    return Err(Error::Runtime(format!(
                        "container '{}' does not advertise capability '{capability}' claimed by the profile",
                        spec.name
                    )));
                }
            }
            debug!(session_id = %session.id, container = %spec.name, "runtime meta verified");
        }
        Ok(())
    }

    // ── Teardown paths ────────────────────────────────────────────────────────

    /// Destroy the fabric footprint of one session and drop its row.
    /// Best-effort: failures are logged and left to the orphan reaper.
    async fn teardown_session(&self, session: &SessionRecord) {
        self.destroy_fabric(session).await;
        if let Err(e) = self.store.delete_session(&session.id).await {
            warn!(session_id = %session.id, error = %e, "session row delete failed");
        }
    }

    /// Containers then network, exactly what the session recorded.
    async fn destroy_fabric(&self, session: &SessionRecord) {
        for container in &session.containers {
            if let Err(e) = self.driver.destroy_container(&container.container_id).await {
                if !e.is_not_found() {
                    warn!(
                        session_id = %session.id,
                        container_id = %container.container_id,
                        error = %e,
                        "container teardown failed"
                    );
                }
            }
        }
        if let Some(network_ref) = &session.network_ref {
            if let Err(e) = self.driver.delete_network(network_ref).await {
                if !e.is_not_found() {
                    warn!(session_id = %session.id, error = %e, "network teardown failed");
                }
            }
        }
    }

    /// Compensation for a failed start: the explicit teardown loop over
    /// what this attempt created, then clearing the sandbox's reservation.
    /// The session row stays, marked `failed` with no endpoint persisted;
    /// the GC failed-session sweep drops it later.
    async fn compensate(&self, sandbox: &SandboxRecord, session: &SessionRecord) {
        let mut failed = session.clone();
        failed.mark_failed(Utc::now());
        if let Err(e) = self.store.update_session(&failed).await {
            warn!(session_id = %session.id, error = %e, "marking session failed");
        }
        self.destroy_fabric(&failed).await;
        self.clear_current_session(&sandbox.id, &session.id).await;
    }

    /// CAS-clear `current_session_id` when it still points at `session_id`.
    /// One reload-retry: under the lock only a cross-process writer can
    /// interleave, and if it did, its view wins.
    async fn clear_current_session(&self, sandbox_id: &SandboxId, session_id: &SessionId) {
        for _ in 0..2 {
            let Ok(Some(mut sandbox)) = self.store.get_sandbox(sandbox_id).await else {
                return;
            };
            if sandbox.current_session_id.as_ref() != Some(session_id) {
                return;
            }
            sandbox.current_session_id = None;
            match self.store.update_sandbox(&sandbox).await {
                Ok(_) => return,
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(e) => {
                    warn!(sandbox_id = %sandbox_id, error = %e, "clearing current session");
                    return;
                }
            }
        }
    }

    // ── stop ──────────────────────────────────────────────────────────────────

    /// Tear down the sandbox's session (live, stuck, or failed). The
    /// sandbox and cargo are retained.
    pub async fn stop(&self, sandbox_id: &SandboxId) -> Result<SandboxRecord, Error> {
        let sandbox = self.reload_sandbox(sandbox_id).await?;

        let session = match self.store.active_session_for(sandbox_id).await? {
            Some(session) => Some(session),
            None => match &sandbox.current_session_id {
                Some(session_id) => self.store.get_session(session_id).await?,
                None => None,
            },
        };

        if let Some(mut session) = session {
            session.observed_state = SessionState::Stopping;
            session.desired_state = DesiredState::Stopped;
            self.store.update_session(&session).await?;
            self.teardown_session(&session).await;
            info!(sandbox_id = %sandbox_id, session_id = %session.id, "session stopped");
        }

        let mut stopped = self.reload_sandbox(sandbox_id).await?;
        stopped.current_session_id = None;
        if stopped.desired_state != DesiredState::Deleted {
            stopped.desired_state = DesiredState::Stopped;
        }
        match self.store.update_sandbox(&stopped).await {
            Ok(s) => Ok(s),
            Err(StoreError::VersionConflict { .. }) => {
                let mut retry = self.reload_sandbox(sandbox_id).await?;
                retry.current_session_id = None;
                if retry.desired_state != DesiredState::Deleted {
                    retry.desired_state = DesiredState::Stopped;
                }
                Ok(self.store.update_sandbox(&retry).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Sweep a failed session found by GC: fabric teardown plus the
    /// reservation clear, without touching desired state.
    pub async fn reap_failed(&self, session: &SessionRecord) {
        self.teardown_session(session).await;
        self.clear_current_session(&session.sandbox_id, &session.id).await;
    }

    // ── observe ───────────────────────────────────────────────────────────────

    /// Re-read container statuses from the driver and reclassify the
    /// session. Exit of the primary (first) container fails the session;
    /// exit of any other degrades it, recording which capabilities are now
    /// unserved.
    pub async fn observe(
        &self,
        session_id: &SessionId,
        profile: &Profile,
    ) -> Result<SessionRecord, Error> {
        let mut session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session '{session_id}' not found")))?;
        if !session.observed_state.is_active() {
            return Ok(session);
        }

        for container in &mut session.containers {
            container.observed_status =
                self.driver.container_status(&container.container_id).await?;
        }
        let now = Utc::now();
        session.last_observed_at = now;

        let primary_down = session
            .containers
            .first()
            .map_or(true, |c| !c.observed_status.is_running());
        if primary_down {
            session.mark_failed(now);
            self.store.update_session(&session).await?;
            warn!(session_id = %session_id, "primary container exited; session failed");
            return Ok(session);
        }

        let mut unavailable: Vec<Capability> = Vec::new();
        for container in session.containers.iter().filter(|c| !c.observed_status.is_running()) {
            for capability in &container.capabilities {
                // Only capabilities this container actually serves for the
                // profile become unavailable; another container may cover
                // the rest.
                let serving = profile
                    .select_container(*capability)
                    .map(|spec| spec.name == container.name)
                    .unwrap_or(false);
                if serving && !unavailable.contains(capability) {
                    unavailable.push(*capability);
                }
            }
        }

        if unavailable.is_empty() {
            if session.observed_state == SessionState::Degraded {
                session.mark_running(now);
            }
        } else {
            warn!(
                session_id = %session_id,
                unavailable = ?unavailable,
                "session degraded"
            );
            session.mark_degraded(unavailable, now);
        }
        self.store.update_session(&session).await?;
        Ok(session)
    }
}
