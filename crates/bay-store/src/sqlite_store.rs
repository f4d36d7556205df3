use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use bay_domain::{CargoId, OwnerId, SandboxId, SessionId};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::error::StoreError;
use crate::state::{CargoRecord, IdempotencyRecord, SandboxRecord, SessionRecord};
use crate::store::{LiveIds, MetadataStore, SandboxQuery};

// DDL — idempotent; run at every startup via migrate().
//
// Scalar columns carry everything the GC predicates and the CAS need to be
// indexed; the full row lives in the JSON `state` column.
const MIGRATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS sandboxes (
    id          TEXT PRIMARY KEY,
    owner       TEXT NOT NULL,
    profile_id  TEXT NOT NULL,
    cargo_id    TEXT,
    version     INTEGER NOT NULL,
    deleted_at  TEXT,
    expires_at  TEXT,
    state       TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sandboxes_owner   ON sandboxes (owner, id);
CREATE INDEX IF NOT EXISTS idx_sandboxes_expires ON sandboxes (expires_at)
    WHERE expires_at IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_sandboxes_cargo   ON sandboxes (cargo_id)
    WHERE cargo_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS sessions (
    id              TEXT PRIMARY KEY,
    sandbox_id      TEXT NOT NULL,
    observed_state  TEXT NOT NULL,
    idle_expires_at TEXT NOT NULL,
    state           TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_sandbox ON sessions (sandbox_id);
CREATE INDEX IF NOT EXISTS idx_sessions_idle    ON sessions (idle_expires_at);

CREATE TABLE IF NOT EXISTS cargos (
    id         TEXT PRIMARY KEY,
    owner      TEXT NOT NULL,
    managed    INTEGER NOT NULL,
    managed_by TEXT,
    state      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cargos_owner ON cargos (owner, id);

CREATE TABLE IF NOT EXISTS idempotency_keys (
    owner      TEXT NOT NULL,
    key        TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    record     TEXT NOT NULL,
    PRIMARY KEY (owner, key)
);
CREATE INDEX IF NOT EXISTS idx_idempotency_expires ON idempotency_keys (expires_at);
"#;

/// Persistent metadata store backed by SQLite.
///
/// All tables are created automatically on first connect via
/// [`SqliteStore::connect`]. Row bodies are stored as JSON alongside the
/// scalar columns the GC queries and the CAS predicate index on.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) a SQLite database and run migrations.
    ///
    /// `url` is a standard sqlx SQLite URL, e.g. `sqlite:///var/lib/bay/bay.db`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::Internal(format!("sqlite url: {e}")))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Internal(format!("sqlite connect: {e}")))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(MIGRATIONS)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Internal(format!("migration: {e}")))?;
        Ok(())
    }
}

// ── Helper conversions ────────────────────────────────────────────────────────

fn to_json<T: serde::Serialize>(v: &T) -> Result<String, StoreError> {
    serde_json::to_string(v).map_err(StoreError::Serialization)
}

fn from_json<T: serde::de::DeserializeOwned>(s: &str) -> Result<T, StoreError> {
    serde_json::from_str(s).map_err(StoreError::Serialization)
}

fn internal(e: sqlx::Error) -> StoreError {
    StoreError::Internal(e.to_string())
}

// ── MetadataStore implementation ──────────────────────────────────────────────

#[async_trait]
impl MetadataStore for SqliteStore {
    // ── Sandboxes ─────────────────────────────────────────────────────────────

    async fn create_sandbox(
        &self,
        sandbox: &SandboxRecord,
        managed_cargo: Option<&CargoRecord>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(internal)?;

        sqlx::query(
            "INSERT INTO sandboxes
               (id, owner, profile_id, cargo_id, version, deleted_at, expires_at, state, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(sandbox.id.as_str())
        .bind(sandbox.owner.as_str())
        .bind(sandbox.profile_id.as_str())
        .bind(sandbox.cargo_id.as_ref().map(|c| c.as_str().to_string()))
        .bind(sandbox.version as i64)
        .bind(sandbox.deleted_at)
        .bind(sandbox.expires_at)
        .bind(to_json(sandbox)?)
        .bind(sandbox.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(internal)?;

        if let Some(cargo) = managed_cargo {
            sqlx::query(
                "INSERT INTO cargos (id, owner, managed, managed_by, state)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(cargo.id.as_str())
            .bind(cargo.owner.as_str())
            .bind(cargo.managed)
            .bind(cargo.managed_by_sandbox_id.as_ref().map(|s| s.as_str().to_string()))
            .bind(to_json(cargo)?)
            .execute(&mut *tx)
            .await
            .map_err(internal)?;
        }

        tx.commit().await.map_err(internal)
    }

    async fn get_sandbox(&self, id: &SandboxId) -> Result<Option<SandboxRecord>, StoreError> {
        let row = sqlx::query("SELECT state FROM sandboxes WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(internal)?;
        row.map(|r| from_json(r.get::<String, _>(0).as_str())).transpose()
    }

    async fn list_sandboxes(
        &self,
        owner: &OwnerId,
        query: &SandboxQuery,
    ) -> Result<Vec<SandboxRecord>, StoreError> {
        let cursor = query.cursor.as_ref().map(|c| c.as_str()).unwrap_or("");
        let rows = match &query.profile_id {
            Some(profile) => {
                sqlx::query(
                    "SELECT state FROM sandboxes
                     WHERE owner = ?1 AND deleted_at IS NULL AND id > ?2 AND profile_id = ?3
                     ORDER BY id LIMIT ?4",
                )
                .bind(owner.as_str())
                .bind(cursor)
                .bind(profile.as_str())
                .bind(query.limit.max(1) as i64)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT state FROM sandboxes
                     WHERE owner = ?1 AND deleted_at IS NULL AND id > ?2
                     ORDER BY id LIMIT ?3",
                )
                .bind(owner.as_str())
                .bind(cursor)
                .bind(query.limit.max(1) as i64)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(internal)?;
        rows.iter()
            .map(|r| from_json(r.get::<String, _>(0).as_str()))
            .collect()
    }

    async fn update_sandbox(&self, record: &SandboxRecord) -> Result<SandboxRecord, StoreError> {
        let mut next = record.clone();
        next.version += 1;
        next.updated_at = Utc::now();

        let result = sqlx::query(
            "UPDATE sandboxes
             SET cargo_id = ?1, version = ?2, deleted_at = ?3, expires_at = ?4,
                 state = ?5, updated_at = ?6
             WHERE id = ?7 AND version = ?8",
        )
        .bind(next.cargo_id.as_ref().map(|c| c.as_str().to_string()))
        .bind(next.version as i64)
        .bind(next.deleted_at)
        .bind(next.expires_at)
        .bind(to_json(&next)?)
        .bind(next.updated_at)
        .bind(next.id.as_str())
        .bind(record.version as i64)
        .execute(&self.pool)
        .await
        .map_err(internal)?;

        if result.rows_affected() == 0 {
            // Lost the CAS, or the row is gone — disambiguate for the caller.
            let found = sqlx::query("SELECT version FROM sandboxes WHERE id = ?1")
                .bind(record.id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(internal)?;
            return match found {
                Some(row) => Err(StoreError::VersionConflict {
                    id: record.id.to_string(),
                    expected: record.version,
                    found: row.get::<i64, _>(0) as u64,
                }),
                None => Err(StoreError::SandboxNotFound(record.id.to_string())),
            };
        }
        Ok(next)
    }

    async fn count_live_sandboxes(&self, owner: &OwnerId) -> Result<u64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) FROM sandboxes WHERE owner = ?1 AND deleted_at IS NULL",
        )
        .bind(owner.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(internal)?;
        Ok(row.get::<i64, _>(0) as u64)
    }

    async fn count_sandboxes_referencing_cargo(
        &self,
        cargo_id: &CargoId,
    ) -> Result<u64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) FROM sandboxes WHERE cargo_id = ?1 AND deleted_at IS NULL",
        )
        .bind(cargo_id.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(internal)?;
        Ok(row.get::<i64, _>(0) as u64)
    }

    async fn expired_sandboxes(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<SandboxRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT state FROM sandboxes
             WHERE deleted_at IS NULL AND expires_at IS NOT NULL AND expires_at <= ?1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        rows.iter()
            .map(|r| from_json(r.get::<String, _>(0).as_str()))
            .collect()
    }

    async fn purge_tombstones(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM sandboxes WHERE deleted_at IS NOT NULL AND deleted_at <= ?1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(result.rows_affected())
    }

    // ── Sessions ──────────────────────────────────────────────────────────────

    async fn insert_session(&self, session: &SessionRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sessions (id, sandbox_id, observed_state, idle_expires_at, state)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(session.id.as_str())
        .bind(session.sandbox_id.as_str())
        .bind(session.observed_state.to_string())
        .bind(session.idle_expires_at)
        .bind(to_json(session)?)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(())
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<SessionRecord>, StoreError> {
        let row = sqlx::query("SELECT state FROM sessions WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(internal)?;
        row.map(|r| from_json(r.get::<String, _>(0).as_str())).transpose()
    }

    async fn update_session(&self, session: &SessionRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE sessions
             SET observed_state = ?1, idle_expires_at = ?2, state = ?3
             WHERE id = ?4",
        )
        .bind(session.observed_state.to_string())
        .bind(session.idle_expires_at)
        .bind(to_json(session)?)
        .bind(session.id.as_str())
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::SessionNotFound(session.id.to_string()));
        }
        Ok(())
    }

    async fn delete_session(&self, id: &SessionId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sessions WHERE id = ?1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(())
    }

    async fn active_session_for(
        &self,
        sandbox_id: &SandboxId,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT state FROM sessions
             WHERE sandbox_id = ?1
               AND observed_state IN ('pending', 'starting', 'running', 'degraded')
             LIMIT 1",
        )
        .bind(sandbox_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(internal)?;
        row.map(|r| from_json(r.get::<String, _>(0).as_str())).transpose()
    }

    async fn idle_sessions(&self, now: DateTime<Utc>) -> Result<Vec<SessionRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT state FROM sessions
             WHERE observed_state IN ('running', 'degraded') AND idle_expires_at <= ?1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        rows.iter()
            .map(|r| from_json(r.get::<String, _>(0).as_str()))
            .collect()
    }

    async fn failed_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let rows = sqlx::query("SELECT state FROM sessions WHERE observed_state = 'failed'")
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;
        rows.iter()
            .map(|r| from_json(r.get::<String, _>(0).as_str()))
            .collect()
    }

    async fn live_ids(&self) -> Result<LiveIds, StoreError> {
        let mut live = LiveIds::default();
        let rows = sqlx::query("SELECT id FROM sandboxes WHERE deleted_at IS NULL")
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;
        for row in rows {
            live.sandboxes.insert(SandboxId::new(row.get::<String, _>(0)));
        }
        let rows = sqlx::query("SELECT id FROM sessions")
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;
        for row in rows {
            live.sessions.insert(SessionId::new(row.get::<String, _>(0)));
        }
        let rows = sqlx::query("SELECT id FROM cargos")
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;
        for row in rows {
            live.cargos.insert(CargoId::new(row.get::<String, _>(0)));
        }
        Ok(live)
    }

    // ── Cargos ────────────────────────────────────────────────────────────────

    async fn insert_cargo(&self, cargo: &CargoRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO cargos (id, owner, managed, managed_by, state)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(cargo.id.as_str())
        .bind(cargo.owner.as_str())
        .bind(cargo.managed)
        .bind(cargo.managed_by_sandbox_id.as_ref().map(|s| s.as_str().to_string()))
        .bind(to_json(cargo)?)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(())
    }

    async fn get_cargo(&self, id: &CargoId) -> Result<Option<CargoRecord>, StoreError> {
        let row = sqlx::query("SELECT state FROM cargos WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(internal)?;
        row.map(|r| from_json(r.get::<String, _>(0).as_str())).transpose()
    }

    async fn list_cargos(&self, owner: &OwnerId) -> Result<Vec<CargoRecord>, StoreError> {
        let rows = sqlx::query("SELECT state FROM cargos WHERE owner = ?1 ORDER BY id")
            .bind(owner.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;
        rows.iter()
            .map(|r| from_json(r.get::<String, _>(0).as_str()))
            .collect()
    }

    async fn update_cargo(&self, cargo: &CargoRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE cargos SET owner = ?1, managed = ?2, managed_by = ?3, state = ?4
             WHERE id = ?5",
        )
        .bind(cargo.owner.as_str())
        .bind(cargo.managed)
        .bind(cargo.managed_by_sandbox_id.as_ref().map(|s| s.as_str().to_string()))
        .bind(to_json(cargo)?)
        .bind(cargo.id.as_str())
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::CargoNotFound(cargo.id.to_string()));
        }
        Ok(())
    }

    async fn delete_cargo(&self, id: &CargoId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM cargos WHERE id = ?1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(())
    }

    async fn orphaned_managed_cargos(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<CargoRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT c.state FROM cargos c
             LEFT JOIN sandboxes s ON s.id = c.managed_by
             WHERE c.managed = 1
               AND (s.id IS NULL OR (s.deleted_at IS NOT NULL AND s.deleted_at <= ?1))",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        rows.iter()
            .map(|r| from_json(r.get::<String, _>(0).as_str()))
            .collect()
    }

    // ── Idempotency ───────────────────────────────────────────────────────────

    async fn get_idempotency(
        &self,
        owner: &OwnerId,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT record FROM idempotency_keys WHERE owner = ?1 AND key = ?2",
        )
        .bind(owner.as_str())
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(internal)?;
        row.map(|r| from_json(r.get::<String, _>(0).as_str())).transpose()
    }

    async fn put_idempotency(&self, record: &IdempotencyRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO idempotency_keys (owner, key, expires_at, record)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (owner, key) DO NOTHING",
        )
        .bind(record.owner.as_str())
        .bind(&record.key)
        .bind(record.expires_at)
        .bind(to_json(record)?)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::DuplicateIdempotencyKey {
                owner: record.owner.to_string(),
                key: record.key.clone(),
            });
        }
        Ok(())
    }

    async fn purge_expired_idempotency(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at <= ?1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bay_domain::ProfileId;
    use chrono::Duration;

    async fn temp_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/bay.db", dir.path().display());
        let store = SqliteStore::connect(&url).await.unwrap();
        (dir, store)
    }

    fn sandbox(id: &str, ttl: Option<u64>) -> SandboxRecord {
        SandboxRecord::new(
            SandboxId::new(id),
            OwnerId::new("acme"),
            ProfileId::new("python-default"),
            None,
            ttl,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn round_trips_sandbox_with_managed_cargo() {
        let (_dir, store) = temp_store().await;
        let now = Utc::now();

        let mut sb = sandbox("sb-1", Some(600));
        sb.cargo_id = Some(CargoId::new("cargo-1"));
        let cargo = CargoRecord {
            id: CargoId::new("cargo-1"),
            owner: OwnerId::new("acme"),
            driver_ref: "vol-1".into(),
            managed: true,
            managed_by_sandbox_id: Some(sb.id.clone()),
            size_limit_mb: 512,
            created_at: now,
            last_accessed_at: now,
        };
        store.create_sandbox(&sb, Some(&cargo)).await.unwrap();

        let got = store.get_sandbox(&sb.id).await.unwrap().unwrap();
        assert_eq!(got.cargo_id, Some(CargoId::new("cargo-1")));
        assert!(store.get_cargo(&cargo.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cas_conflict_reports_found_version() {
        let (_dir, store) = temp_store().await;
        let sb = sandbox("sb-cas", None);
        store.create_sandbox(&sb, None).await.unwrap();

        let fresh = store.get_sandbox(&sb.id).await.unwrap().unwrap();
        store.update_sandbox(&fresh).await.unwrap();

        let err = store.update_sandbox(&fresh).await.unwrap_err();
        match err {
            StoreError::VersionConflict { expected, found, .. } => {
                assert_eq!(expected, 0);
                assert_eq!(found, 1);
            }
            other => panic!("expected VersionConflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn expired_and_tombstone_queries() {
        let (_dir, store) = temp_store().await;
        store.create_sandbox(&sandbox("sb-live", None), None).await.unwrap();
        store.create_sandbox(&sandbox("sb-exp", Some(1)), None).await.unwrap();

        let later = Utc::now() + Duration::seconds(10);
        let expired = store.expired_sandboxes(later).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id.as_str(), "sb-exp");

        let mut dead = expired.into_iter().next().unwrap();
        dead.tombstone(Utc::now());
        store.update_sandbox(&dead).await.unwrap();

        // Tombstoned rows drop out of the expiry scan and the live set.
        assert!(store.expired_sandboxes(later).await.unwrap().is_empty());
        let live = store.live_ids().await.unwrap();
        assert!(!live.sandboxes.contains(&SandboxId::new("sb-exp")));

        let purged = store.purge_tombstones(Utc::now() + Duration::hours(1)).await.unwrap();
        assert_eq!(purged, 1);
        assert!(store.get_sandbox(&SandboxId::new("sb-exp")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn session_lifecycle_and_idle_query() {
        let (_dir, store) = temp_store().await;
        let now = Utc::now();

        let mut sess = SessionRecord::new(
            SessionId::new("sess-1"),
            SandboxId::new("sb-1"),
            1,
            now - Duration::seconds(60),
        );
        sess.observed_state = crate::state::SessionState::Running;
        store.insert_session(&sess).await.unwrap();

        let active = store.active_session_for(&sess.sandbox_id).await.unwrap();
        assert!(active.is_some());

        let idle = store.idle_sessions(now).await.unwrap();
        assert_eq!(idle.len(), 1);

        store.delete_session(&sess.id).await.unwrap();
        assert!(store.get_session(&sess.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn idempotency_slot_is_insert_only() {
        let (_dir, store) = temp_store().await;
        let now = Utc::now();
        let rec = IdempotencyRecord {
            key: "k1".into(),
            owner: OwnerId::new("acme"),
            request_fingerprint: "fp".into(),
            response_status: 201,
            response_body: "{}".into(),
            created_at: now,
            expires_at: now + Duration::hours(24),
        };
        store.put_idempotency(&rec).await.unwrap();
        assert!(matches!(
            store.put_idempotency(&rec).await.unwrap_err(),
            StoreError::DuplicateIdempotencyKey { .. }
        ));
    }
}
