use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use bay_domain::{validate_workspace_path, Capability, OwnerId, SandboxId};
use bay_runtime::{CapabilityCall, RuntimeConnector};
use bay_store::{DesiredState, MetadataStore, SessionRecord};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Error;
use crate::locks::LockTable;
use crate::registry::ProfileRegistry;
use crate::session::SessionManager;

/// One logical capability invocation as it arrives from the surface.
#[derive(Debug, Clone)]
pub struct CapabilityRequest {
    pub capability: Capability,
    pub operation: String,
    pub payload: Value,
    /// Caller-supplied; clamped to the configured ceiling.
    pub timeout: Option<Duration>,
}

/// Maps a logical capability to the right container of a sandbox's session
/// and invokes it through the runtime adapter.
///
/// The per-sandbox lock is held only while the session is arranged; the
/// runtime call itself runs lock-free so one slow execution cannot block
/// lifecycle operations. Nothing here retries — that is the caller's
/// contract.
pub struct CapabilityRouter {
    store: Arc<dyn MetadataStore>,
    sessions: Arc<SessionManager>,
    locks: LockTable,
    connector: Arc<dyn RuntimeConnector>,
    registry: Arc<ProfileRegistry>,
    default_timeout: Duration,
    timeout_ceiling: Duration,
}

impl CapabilityRouter {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        sessions: Arc<SessionManager>,
        locks: LockTable,
        connector: Arc<dyn RuntimeConnector>,
        registry: Arc<ProfileRegistry>,
        default_timeout: Duration,
        timeout_ceiling: Duration,
    ) -> Self {
        Self {
            store,
            sessions,
            locks,
            connector,
            registry,
            default_timeout,
            timeout_ceiling,
        }
    }

    pub async fn invoke(
        &self,
        owner: &OwnerId,
        sandbox_id: &SandboxId,
        request: CapabilityRequest,
    ) -> Result<Value, Error> {
        let sandbox = self
            .store
            .get_sandbox(sandbox_id)
            .await?
            .filter(|s| !s.is_tombstoned() && s.desired_state != DesiredState::Deleted)
            .ok_or_else(|| Error::NotFound(format!("sandbox '{sandbox_id}' not found")))?;
        if &sandbox.owner != owner {
            return Err(Error::Forbidden(format!(
                "sandbox '{sandbox_id}' belongs to another owner"
            )));
        }
        if sandbox.is_expired(Utc::now()) {
            return Err(Error::SandboxExpired(sandbox_id.clone()));
        }

        // Path checks happen before any fabric or runtime traffic.
        if request.capability == Capability::Filesystem {
            let path = request
                .payload
                .get("path")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Validation("filesystem operations require 'path'".into()))?;
            validate_workspace_path(path)?;
        }

        let profile = self.registry.get(&sandbox.profile_id)?;
        let chosen = profile
            .select_container(request.capability)
            .ok_or(Error::CapabilityNotSupported(request.capability))?;

        // Arrange the session under the lock, then release before the call.
        let session = {
            let _guard = self.locks.lock(sandbox_id).await;
            let (_, session) = self.sessions.ensure_running(sandbox_id, profile).await?;
            session
        };

        let session = self.sessions.observe(&session.id, profile).await?;
        if !session.observed_state.is_serving() {
            return Err(Error::SessionNotReady {
                sandbox_id: sandbox_id.clone(),
                detail: format!("session is {}", session.observed_state),
            });
        }
        if session.unavailable_capabilities.contains(&request.capability) {
            return Err(Error::SessionNotReady {
                sandbox_id: sandbox_id.clone(),
                detail: format!(
                    "capability '{}' is unavailable: its container exited",
                    request.capability
                ),
            });
        }

        let container = session.container(&chosen.name).ok_or_else(|| {
            Error::Internal(format!(
                "session {} has no container '{}' required by the profile",
                session.id, chosen.name
            ))
        })?;
        let endpoint = container.endpoint.as_deref().ok_or_else(|| Error::SessionNotReady {
            sandbox_id: sandbox_id.clone(),
            detail: format!("container '{}' has no endpoint yet", chosen.name),
        })?;

        let timeout = request
            .timeout
            .unwrap_or(self.default_timeout)
            .min(self.timeout_ceiling);
        debug!(
            sandbox_id = %sandbox_id,
            session_id = %session.id,
            capability = %request.capability,
            operation = %request.operation,
            container = %chosen.name,
            "routing capability call"
        );

        let client = self.connector.connect(endpoint, container.runtime_type);
        let result = client
            .invoke(&CapabilityCall {
                capability: request.capability,
                operation: request.operation,
                payload: request.payload,
                timeout,
            })
            .await?;

        self.record_activity(&session).await;
        Ok(result)
    }

    /// Activity refresh after a successful call — a plain store write, no
    /// lock needed.
    async fn record_activity(&self, session: &SessionRecord) {
        match self.store.get_session(&session.id).await {
            Ok(Some(mut fresh)) => {
                fresh.touch(Utc::now());
                if let Err(e) = self.store.update_session(&fresh).await {
                    warn!(session_id = %session.id, error = %e, "activity refresh failed");
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "activity refresh read failed");
            }
        }
    }
}
