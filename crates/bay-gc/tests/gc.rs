//! Reconcile-pass tests: each reaper against a hand-crafted store/fabric
//! divergence, plus the full-cycle status snapshot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use bay_config::default_profiles;
use bay_domain::{OwnerId, Profile, ProfileId, RuntimeType, SandboxId};
use bay_driver::{Driver, LocalDriver, LABEL_MANAGED, LABEL_SANDBOX, LABEL_SESSION};
use bay_gc::{GcConfig, GcScheduler, GcTask};
use bay_orchestrator::{CargoManager, LockTable, ProfileRegistry, SandboxManager, SessionManager};
use bay_runtime::{
    CapabilityCall, CapabilityInfo, RuntimeApi, RuntimeConnector, RuntimeDescription,
    RuntimeError, RuntimeInfo, WorkspaceInfo,
};
use bay_store::{CargoRecord, InMemoryStore, MetadataStore};
use serde_json::{json, Value};

// ── Always-healthy runtime stub ───────────────────────────────────────────────

struct HealthyRuntime {
    runtime_type: RuntimeType,
}

#[async_trait]
impl RuntimeApi for HealthyRuntime {
    async fn health(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn meta(&self) -> Result<RuntimeDescription, RuntimeError> {
        let names: &[&str] = match self.runtime_type {
            RuntimeType::CodeRuntime => &["python", "shell", "filesystem"],
            RuntimeType::BrowserRuntime => &["browser"],
        };
        let capabilities: HashMap<String, CapabilityInfo> = names
            .iter()
            .map(|name| {
                (
                    name.to_string(),
                    CapabilityInfo { operations: vec!["exec".into()] },
                )
            })
            .collect();
        Ok(RuntimeDescription {
            runtime: RuntimeInfo {
                name: "stub".into(),
                version: "0.0.0".into(),
                api_version: "1.0".into(),
            },
            workspace: WorkspaceInfo { mount_path: "/workspace".into() },
            capabilities,
        })
    }

    async fn invoke(&self, call: &CapabilityCall) -> Result<Value, RuntimeError> {
        Ok(json!({ "echo": call.payload }))
    }
}

struct HealthyConnector;

impl RuntimeConnector for HealthyConnector {
    fn connect(&self, _endpoint: &str, runtime_type: RuntimeType) -> Arc<dyn RuntimeApi> {
        Arc::new(HealthyRuntime { runtime_type })
    }
}

// ── Harness ───────────────────────────────────────────────────────────────────

struct Harness {
    store: Arc<InMemoryStore>,
    driver: Arc<LocalDriver>,
    sessions: Arc<SessionManager>,
    sandboxes: Arc<SandboxManager>,
    locks: LockTable,
    scheduler: GcScheduler,
    owner: OwnerId,
}

fn harness() -> Harness {
    let store: Arc<InMemoryStore> = Arc::new(InMemoryStore::new());
    let driver = Arc::new(LocalDriver::new());
    let locks = LockTable::new();
    let registry = Arc::new(ProfileRegistry::new(default_profiles()));
    let connector: Arc<dyn RuntimeConnector> = Arc::new(HealthyConnector);

    let store_dyn: Arc<dyn MetadataStore> = store.clone();
    let driver_dyn: Arc<dyn Driver> = driver.clone();

    let sessions = Arc::new(
        SessionManager::new(
            store_dyn.clone(),
            driver_dyn.clone(),
            connector,
            Duration::from_secs(5),
        )
        .with_poll_interval(Duration::from_millis(10)),
    );
    let cargos = Arc::new(CargoManager::new(store_dyn.clone(), driver_dyn.clone()));
    let sandboxes = Arc::new(SandboxManager::new(
        store_dyn.clone(),
        locks.clone(),
        sessions.clone(),
        cargos.clone(),
        registry,
        None,
    ));
    let scheduler = GcScheduler::new(
        store_dyn,
        driver_dyn,
        locks.clone(),
        sandboxes.clone(),
        sessions.clone(),
        cargos,
        GcConfig {
            interval: Duration::from_secs(300),
            orphan_grace: Duration::from_secs(60),
            tombstone_retention: Duration::from_secs(900),
            idempotency_retention: Duration::from_secs(86_400),
        },
    );

    Harness {
        store,
        driver,
        sessions,
        sandboxes,
        locks,
        scheduler,
        owner: OwnerId::new("acme"),
    }
}

fn python_profile() -> Profile {
    default_profiles()
        .into_iter()
        .find(|p| p.id == ProfileId::new("python-default"))
        .unwrap()
}

impl Harness {
    async fn running_sandbox(&self) -> SandboxId {
        let sandbox = self
            .sandboxes
            .create(&self.owner, &ProfileId::new("python-default"), None, None)
            .await
            .unwrap();
        let profile = python_profile();
        let _guard = self.locks.lock(&sandbox.id).await;
        self.sessions
            .ensure_running(&sandbox.id, &profile)
            .await
            .unwrap();
        sandbox.id
    }
}

// ── Reaper tests ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn idle_session_reaped_sandbox_retained() {
    let h = harness();
    let id = h.running_sandbox().await;
    assert_eq!(h.driver.container_count().await, 1);

    // Backdate both idle deadlines past now.
    let mut session = h.store.active_session_for(&id).await.unwrap().unwrap();
    session.idle_expires_at = Utc::now() - chrono::Duration::seconds(10);
    h.store.update_session(&session).await.unwrap();
    let mut sandbox = h.store.get_sandbox(&id).await.unwrap().unwrap();
    sandbox.idle_expires_at = Some(Utc::now() - chrono::Duration::seconds(10));
    h.store.update_sandbox(&sandbox).await.unwrap();

    let report = h.scheduler.run_task(GcTask::IdleSessions).await;
    assert_eq!(report.reaped, 1);
    assert!(report.errors.is_empty());

    assert_eq!(h.driver.container_count().await, 0);
    assert_eq!(h.driver.network_count().await, 0);
    assert!(h.store.active_session_for(&id).await.unwrap().is_none());
    // The sandbox itself survives an idle reap.
    assert!(h.sandboxes.get(&h.owner, &id).await.is_ok());
}

#[tokio::test]
async fn keepalive_protects_idle_session() {
    let h = harness();
    let id = h.running_sandbox().await;

    let mut session = h.store.active_session_for(&id).await.unwrap().unwrap();
    session.idle_expires_at = Utc::now() - chrono::Duration::seconds(10);
    h.store.update_session(&session).await.unwrap();
    // Keepalive pushed the sandbox deadline out.
    let mut sandbox = h.store.get_sandbox(&id).await.unwrap().unwrap();
    sandbox.idle_expires_at = Some(Utc::now() + chrono::Duration::seconds(600));
    h.store.update_sandbox(&sandbox).await.unwrap();

    let report = h.scheduler.run_task(GcTask::IdleSessions).await;
    assert_eq!(report.reaped, 0);
    assert_eq!(h.driver.container_count().await, 1);
}

#[tokio::test]
async fn expired_sandbox_reaped_with_cascade() {
    let h = harness();
    let sandbox = h
        .sandboxes
        .create(&h.owner, &ProfileId::new("python-default"), None, Some(600))
        .await
        .unwrap();
    assert_eq!(h.driver.volume_count().await, 1);

    let mut expired = h.store.get_sandbox(&sandbox.id).await.unwrap().unwrap();
    expired.expires_at = Some(Utc::now() - chrono::Duration::seconds(5));
    h.store.update_sandbox(&expired).await.unwrap();

    let report = h.scheduler.run_task(GcTask::ExpiredSandboxes).await;
    assert_eq!(report.reaped, 1);

    assert!(h.sandboxes.get(&h.owner, &sandbox.id).await.is_err());
    assert_eq!(h.driver.volume_count().await, 0, "managed cargo cascaded");

    // Idempotent: a second pass finds nothing.
    let report = h.scheduler.run_task(GcTask::ExpiredSandboxes).await;
    assert_eq!(report.candidates, 0);
}

#[tokio::test]
async fn orphan_managed_cargo_reaped_after_retention() {
    let h = harness();
    let now = Utc::now();

    // A managed cargo whose sandbox row vanished entirely (crash between
    // volume create and the sandbox transaction).
    let volume = h
        .driver
        .create_volume("cargo-ghost", &Default::default())
        .await
        .unwrap();
    h.store
        .insert_cargo(&CargoRecord {
            id: bay_domain::CargoId::new("cargo-ghost"),
            owner: h.owner.clone(),
            driver_ref: volume,
            managed: true,
            managed_by_sandbox_id: Some(SandboxId::new("sb-never-existed")),
            size_limit_mb: 512,
            created_at: now,
            last_accessed_at: now,
        })
        .await
        .unwrap();

    let report = h.scheduler.run_task(GcTask::OrphanCargos).await;
    assert_eq!(report.reaped, 1);
    assert_eq!(h.driver.volume_count().await, 0);
    assert!(h
        .store
        .get_cargo(&bay_domain::CargoId::new("cargo-ghost"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn orphan_container_reaped_live_ones_kept() {
    let h = harness();
    let id = h.running_sandbox().await;
    assert_eq!(h.driver.container_count().await, 1);

    // A leftover container labeled to a session that has no metadata row,
    // old enough to clear the grace window.
    let mut labels = HashMap::new();
    labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
    labels.insert(LABEL_SANDBOX.to_string(), "sb-dead".to_string());
    labels.insert(LABEL_SESSION.to_string(), "sess-dead".to_string());
    h.driver
        .plant_container(
            "leftover-old",
            labels.clone(),
            Utc::now() - chrono::Duration::seconds(300),
        )
        .await;
    // Same orphan but created seconds ago: protected by the grace window.
    h.driver
        .plant_container("leftover-new", labels, Utc::now())
        .await;

    let report = h.scheduler.run_task(GcTask::OrphanResources).await;
    assert_eq!(report.reaped, 1);

    // The live session's container and the fresh leftover survive.
    assert_eq!(h.driver.container_count().await, 2);
    assert!(h.store.active_session_for(&id).await.unwrap().is_some());

    // Next cycle, once the grace window has passed, nothing protects it —
    // simulate by re-planting as old.
    let report = h.scheduler.run_task(GcTask::OrphanResources).await;
    assert_eq!(report.reaped, 0, "fresh leftover still inside grace");
}

#[tokio::test]
async fn full_cycle_reports_and_purges() {
    let h = harness();

    // One tombstone old enough to purge.
    let sandbox = h
        .sandboxes
        .create(&h.owner, &ProfileId::new("python-default"), None, None)
        .await
        .unwrap();
    h.sandboxes.delete(&h.owner, &sandbox.id).await.unwrap();
    let mut dead = h.store.get_sandbox(&sandbox.id).await.unwrap().unwrap();
    dead.deleted_at = Some(Utc::now() - chrono::Duration::seconds(3600));
    h.store.update_sandbox(&dead).await.unwrap();

    let status = h.scheduler.run_cycle().await;
    assert_eq!(status.cycles_completed, 1);
    assert_eq!(status.last_reports.len(), 4);
    assert!(status.last_cycle_finished_at.is_some());
    assert_eq!(status.purged_tombstones, 1);
    assert!(h.store.get_sandbox(&sandbox.id).await.unwrap().is_none());

    let again = h.scheduler.status().await;
    assert_eq!(again.cycles_completed, 1);
}
