use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use bay_domain::{CargoId, OwnerId, SandboxId, SessionId};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::state::{CargoRecord, IdempotencyRecord, SandboxRecord, SessionRecord};
use crate::store::{LiveIds, MetadataStore, SandboxQuery};

#[derive(Debug, Default)]
struct Inner {
    sandboxes: HashMap<SandboxId, SandboxRecord>,
    sessions: HashMap<SessionId, SessionRecord>,
    cargos: HashMap<CargoId, CargoRecord>,
    idempotency: HashMap<(OwnerId, String), IdempotencyRecord>,
}

/// In-memory implementation of [`MetadataStore`].
///
/// All data is lost on process exit. Suitable for tests and ephemeral
/// single-instance deployments with the local driver.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for InMemoryStore {
    // ── Sandboxes ─────────────────────────────────────────────────────────────

    async fn create_sandbox(
        &self,
        sandbox: &SandboxRecord,
        managed_cargo: Option<&CargoRecord>,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.sandboxes.insert(sandbox.id.clone(), sandbox.clone());
        if let Some(cargo) = managed_cargo {
            guard.cargos.insert(cargo.id.clone(), cargo.clone());
        }
        Ok(())
    }

    async fn get_sandbox(&self, id: &SandboxId) -> Result<Option<SandboxRecord>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.sandboxes.get(id).cloned())
    }

    async fn list_sandboxes(
        &self,
        owner: &OwnerId,
        query: &SandboxQuery,
    ) -> Result<Vec<SandboxRecord>, StoreError> {
        let guard = self.inner.read().await;
        let mut matched: Vec<SandboxRecord> = guard
            .sandboxes
            .values()
            .filter(|s| &s.owner == owner && !s.is_tombstoned())
            .filter(|s| {
                query
                    .profile_id
                    .as_ref()
                    .map_or(true, |p| &s.profile_id == p)
            })
            .filter(|s| query.cursor.as_ref().map_or(true, |c| &s.id > c))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        matched.truncate(query.limit.max(1) as usize);
        Ok(matched)
    }

    async fn update_sandbox(&self, record: &SandboxRecord) -> Result<SandboxRecord, StoreError> {
        let mut guard = self.inner.write().await;
        let stored = guard
            .sandboxes
            .get_mut(&record.id)
            .ok_or_else(|| StoreError::SandboxNotFound(record.id.to_string()))?;
        if stored.version != record.version {
            return Err(StoreError::VersionConflict {
                id: record.id.to_string(),
                expected: record.version,
                found: stored.version,
            });
        }
        let mut next = record.clone();
        next.version += 1;
        next.updated_at = Utc::now();
        *stored = next.clone();
        Ok(next)
    }

    async fn count_live_sandboxes(&self, owner: &OwnerId) -> Result<u64, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .sandboxes
            .values()
            .filter(|s| &s.owner == owner && !s.is_tombstoned())
            .count() as u64)
    }

    async fn count_sandboxes_referencing_cargo(
        &self,
        cargo_id: &CargoId,
    ) -> Result<u64, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .sandboxes
            .values()
            .filter(|s| !s.is_tombstoned() && s.cargo_id.as_ref() == Some(cargo_id))
            .count() as u64)
    }

    async fn expired_sandboxes(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<SandboxRecord>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .sandboxes
            .values()
            .filter(|s| !s.is_tombstoned() && s.is_expired(now))
            .cloned()
            .collect())
    }

    async fn purge_tombstones(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut guard = self.inner.write().await;
        let before = guard.sandboxes.len();
        guard
            .sandboxes
            .retain(|_, s| s.deleted_at.map_or(true, |at| at > cutoff));
        Ok((before - guard.sandboxes.len()) as u64)
    }

    // ── Sessions ──────────────────────────────────────────────────────────────

    async fn insert_session(&self, session: &SessionRecord) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<SessionRecord>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.sessions.get(id).cloned())
    }

    async fn update_session(&self, session: &SessionRecord) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        if !guard.sessions.contains_key(&session.id) {
            return Err(StoreError::SessionNotFound(session.id.to_string()));
        }
        guard.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn delete_session(&self, id: &SessionId) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.sessions.remove(id);
        Ok(())
    }

    async fn active_session_for(
        &self,
        sandbox_id: &SandboxId,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .sessions
            .values()
            .find(|s| &s.sandbox_id == sandbox_id && s.observed_state.is_active())
            .cloned())
    }

    async fn idle_sessions(&self, now: DateTime<Utc>) -> Result<Vec<SessionRecord>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .sessions
            .values()
            .filter(|s| s.observed_state.is_serving() && s.idle_expires_at <= now)
            .cloned()
            .collect())
    }

    async fn failed_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .sessions
            .values()
            .filter(|s| s.observed_state == crate::state::SessionState::Failed)
            .cloned()
            .collect())
    }

    async fn live_ids(&self) -> Result<LiveIds, StoreError> {
        let guard = self.inner.read().await;
        Ok(LiveIds {
            sandboxes: guard
                .sandboxes
                .values()
                .filter(|s| !s.is_tombstoned())
                .map(|s| s.id.clone())
                .collect(),
            sessions: guard.sessions.keys().cloned().collect(),
            cargos: guard.cargos.keys().cloned().collect(),
        })
    }

    // ── Cargos ────────────────────────────────────────────────────────────────

    async fn insert_cargo(&self, cargo: &CargoRecord) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.cargos.insert(cargo.id.clone(), cargo.clone());
        Ok(())
    }

    async fn get_cargo(&self, id: &CargoId) -> Result<Option<CargoRecord>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.cargos.get(id).cloned())
    }

    async fn list_cargos(&self, owner: &OwnerId) -> Result<Vec<CargoRecord>, StoreError> {
        let guard = self.inner.read().await;
        let mut matched: Vec<CargoRecord> = guard
            .cargos
            .values()
            .filter(|c| &c.owner == owner)
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matched)
    }

    async fn update_cargo(&self, cargo: &CargoRecord) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        if !guard.cargos.contains_key(&cargo.id) {
            return Err(StoreError::CargoNotFound(cargo.id.to_string()));
        }
        guard.cargos.insert(cargo.id.clone(), cargo.clone());
        Ok(())
    }

    async fn delete_cargo(&self, id: &CargoId) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.cargos.remove(id);
        Ok(())
    }

    async fn orphaned_managed_cargos(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<CargoRecord>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .cargos
            .values()
            .filter(|c| c.managed)
            .filter(|c| match &c.managed_by_sandbox_id {
                None => true,
                Some(sid) => match guard.sandboxes.get(sid) {
                    None => true,
                    Some(sb) => sb.deleted_at.map_or(false, |at| at <= cutoff),
                },
            })
            .cloned()
            .collect())
    }

    // ── Idempotency ───────────────────────────────────────────────────────────

    async fn get_idempotency(
        &self,
        owner: &OwnerId,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .idempotency
            .get(&(owner.clone(), key.to_string()))
            .cloned())
    }

    async fn put_idempotency(&self, record: &IdempotencyRecord) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let slot = (record.owner.clone(), record.key.clone());
        if guard.idempotency.contains_key(&slot) {
            return Err(StoreError::DuplicateIdempotencyKey {
                owner: record.owner.to_string(),
                key: record.key.clone(),
            });
        }
        guard.idempotency.insert(slot, record.clone());
        Ok(())
    }

    async fn purge_expired_idempotency(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut guard = self.inner.write().await;
        let before = guard.idempotency.len();
        guard.idempotency.retain(|_, r| r.expires_at > now);
        Ok((before - guard.idempotency.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bay_domain::ProfileId;
    use chrono::Duration;

    fn sandbox(id: &str, owner: &str, ttl: Option<u64>) -> SandboxRecord {
        SandboxRecord::new(
            SandboxId::new(id),
            OwnerId::new(owner),
            ProfileId::new("python-default"),
            None,
            ttl,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn create_and_get() {
        let store = InMemoryStore::new();
        store.create_sandbox(&sandbox("sb-a", "acme", None), None).await.unwrap();

        let got = store.get_sandbox(&SandboxId::new("sb-a")).await.unwrap();
        assert!(got.is_some());
        assert_eq!(got.unwrap().owner.as_str(), "acme");
    }

    #[tokio::test]
    async fn cas_update_rejects_stale_writer() {
        let store = InMemoryStore::new();
        store.create_sandbox(&sandbox("sb-cas", "acme", None), None).await.unwrap();

        let fresh = store.get_sandbox(&SandboxId::new("sb-cas")).await.unwrap().unwrap();
        let mut stale = fresh.clone();

        // First writer wins and bumps the version.
        let updated = store.update_sandbox(&fresh).await.unwrap();
        assert_eq!(updated.version, fresh.version + 1);

        // Second writer holds the old version.
        stale.ttl_seconds = Some(999);
        let err = store.update_sandbox(&stale).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn listing_excludes_tombstones_and_paginates() {
        let store = InMemoryStore::new();
        for id in ["sb-1", "sb-2", "sb-3"] {
            store.create_sandbox(&sandbox(id, "acme", None), None).await.unwrap();
        }
        let mut dead = store.get_sandbox(&SandboxId::new("sb-2")).await.unwrap().unwrap();
        dead.tombstone(Utc::now());
        store.update_sandbox(&dead).await.unwrap();

        let owner = OwnerId::new("acme");
        let page = store
            .list_sandboxes(&owner, &SandboxQuery { cursor: None, limit: 10, profile_id: None })
            .await
            .unwrap();
        let ids: Vec<&str> = page.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["sb-1", "sb-3"]);

        let after = store
            .list_sandboxes(
                &owner,
                &SandboxQuery {
                    cursor: Some(SandboxId::new("sb-1")),
                    limit: 10,
                    profile_id: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id.as_str(), "sb-3");
    }

    #[tokio::test]
    async fn expired_query_skips_infinite_ttl() {
        let store = InMemoryStore::new();
        store.create_sandbox(&sandbox("sb-inf", "acme", None), None).await.unwrap();
        store.create_sandbox(&sandbox("sb-ttl", "acme", Some(1)), None).await.unwrap();

        let soon = Utc::now() + Duration::seconds(5);
        let expired = store.expired_sandboxes(soon).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id.as_str(), "sb-ttl");
    }

    #[tokio::test]
    async fn one_active_session_lookup() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let sid = SandboxId::new("sb-s");

        let mut old = SessionRecord::new(SessionId::new("sess-old"), sid.clone(), 300, now);
        old.observed_state = crate::state::SessionState::Stopped;
        store.insert_session(&old).await.unwrap();

        let mut live = SessionRecord::new(SessionId::new("sess-live"), sid.clone(), 300, now);
        live.mark_running(now);
        store.insert_session(&live).await.unwrap();

        let active = store.active_session_for(&sid).await.unwrap().unwrap();
        assert_eq!(active.id.as_str(), "sess-live");
    }

    #[tokio::test]
    async fn idle_sessions_by_deadline() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        let mut idle = SessionRecord::new(
            SessionId::new("sess-idle"),
            SandboxId::new("sb-i"),
            1,
            now - Duration::seconds(60),
        );
        idle.observed_state = crate::state::SessionState::Running;
        store.insert_session(&idle).await.unwrap();

        let mut fresh = SessionRecord::new(SessionId::new("sess-fresh"), SandboxId::new("sb-f"), 600, now);
        fresh.mark_running(now);
        store.insert_session(&fresh).await.unwrap();

        let idlers = store.idle_sessions(now).await.unwrap();
        assert_eq!(idlers.len(), 1);
        assert_eq!(idlers[0].id.as_str(), "sess-idle");
    }

    #[tokio::test]
    async fn orphaned_managed_cargo_detection() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        let mut sb = sandbox("sb-c", "acme", None);
        sb.cargo_id = Some(CargoId::new("cargo-m"));
        store.create_sandbox(&sb, None).await.unwrap();

        let cargo = CargoRecord {
            id: CargoId::new("cargo-m"),
            owner: OwnerId::new("acme"),
            driver_ref: "vol-1".into(),
            managed: true,
            managed_by_sandbox_id: Some(sb.id.clone()),
            size_limit_mb: 512,
            created_at: now,
            last_accessed_at: now,
        };
        store.insert_cargo(&cargo).await.unwrap();

        // Sandbox alive → not orphaned.
        assert!(store.orphaned_managed_cargos(now).await.unwrap().is_empty());

        let mut dead = store.get_sandbox(&sb.id).await.unwrap().unwrap();
        dead.tombstone(now - Duration::minutes(30));
        store.update_sandbox(&dead).await.unwrap();

        let orphans = store
            .orphaned_managed_cargos(now - Duration::minutes(15))
            .await
            .unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id.as_str(), "cargo-m");
    }

    #[tokio::test]
    async fn idempotency_insert_once() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let rec = IdempotencyRecord {
            key: "k1".into(),
            owner: OwnerId::new("acme"),
            request_fingerprint: "abc".into(),
            response_status: 201,
            response_body: "{}".into(),
            created_at: now,
            expires_at: now + Duration::hours(24),
        };
        store.put_idempotency(&rec).await.unwrap();
        let err = store.put_idempotency(&rec).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateIdempotencyKey { .. }));

        let got = store
            .get_idempotency(&OwnerId::new("acme"), "k1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.response_status, 201);

        let purged = store
            .purge_expired_idempotency(now + Duration::hours(25))
            .await
            .unwrap();
        assert_eq!(purged, 1);
    }
}
