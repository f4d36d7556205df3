use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use bay_driver::{Driver, ManagedResource};
use bay_orchestrator::{CargoManager, Error, LockTable, SandboxManager, SessionManager};
use bay_store::{LiveIds, MetadataStore};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::report::{GcStatus, GcTask, TaskReport};

#[derive(Debug, Clone)]
pub struct GcConfig {
    pub interval: Duration,
    /// Fabric resources younger than this are never reaped.
    pub orphan_grace: Duration,
    /// How long tombstoned sandboxes (and their managed cargos) linger.
    pub tombstone_retention: Duration,
    pub idempotency_retention: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            orphan_grace: Duration::from_secs(60),
            tombstone_retention: Duration::from_secs(900),
            idempotency_retention: Duration::from_secs(86_400),
        }
    }
}

/// Periodic reconciler: the store is desired state, the fabric is observed
/// state, and four independent tasks converge the two. Each task pulls
/// candidates, re-checks its predicate under the sandbox lock, and acts;
/// everything here is idempotent across cycles.
pub struct GcScheduler {
    store: Arc<dyn MetadataStore>,
    driver: Arc<dyn Driver>,
    locks: LockTable,
    sandboxes: Arc<SandboxManager>,
    sessions: Arc<SessionManager>,
    cargos: Arc<CargoManager>,
    config: GcConfig,
    status: RwLock<GcStatus>,
}

impl GcScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn MetadataStore>,
        driver: Arc<dyn Driver>,
        locks: LockTable,
        sandboxes: Arc<SandboxManager>,
        sessions: Arc<SessionManager>,
        cargos: Arc<CargoManager>,
        config: GcConfig,
    ) -> Self {
        Self {
            store,
            driver,
            locks,
            sandboxes,
            sessions,
            cargos,
            config,
            status: RwLock::new(GcStatus::default()),
        }
    }

    pub async fn status(&self) -> GcStatus {
        self.status.read().await.clone()
    }

    /// Run every task once, then the retention purges. Called at startup
    /// (before traffic) and by the interval loop.
    pub async fn run_cycle(&self) -> GcStatus {
        let started = Utc::now();
        let mut reports = Vec::with_capacity(GcTask::ALL.len());
        for task in GcTask::ALL {
            reports.push(self.run_task(task).await);
        }

        let now = Utc::now();
        let purged_tombstones = match self
            .store
            .purge_tombstones(now - chrono::Duration::from_std(self.config.tombstone_retention).unwrap_or_else(|_| chrono::Duration::seconds(900)))
            .await
        {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "tombstone purge failed");
                0
            }
        };
        let purged_idempotency = match self.store.purge_expired_idempotency(now).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "idempotency purge failed");
                0
            }
        };

        let mut status = self.status.write().await;
        status.cycles_completed += 1;
        status.last_cycle_started_at = Some(started);
        status.last_cycle_finished_at = Some(Utc::now());
        status.last_reports = reports;
        status.purged_tombstones += purged_tombstones;
        status.purged_idempotency_records += purged_idempotency;
        status.clone()
    }

    /// Run one task immediately. The admin trigger.
    pub async fn run_task(&self, task: GcTask) -> TaskReport {
        let started_at = Utc::now();
        let (candidates, reaped, errors) = match task {
            GcTask::IdleSessions => self.reap_idle_sessions().await,
            GcTask::ExpiredSandboxes => self.reap_expired_sandboxes().await,
            GcTask::OrphanCargos => self.reap_orphan_cargos().await,
            GcTask::OrphanResources => self.reap_orphan_resources().await,
        };
        let report = TaskReport {
            task,
            started_at,
            finished_at: Utc::now(),
            candidates,
            reaped,
            errors,
        };
        if report.reaped > 0 || !report.errors.is_empty() {
            info!(
                task = %task,
                candidates = report.candidates,
                reaped = report.reaped,
                errors = report.errors.len(),
                "gc task finished"
            );
        } else {
            debug!(task = %task, candidates = report.candidates, "gc task finished");
        }
        report
    }

    /// The interval loop. Runs until the owning task is aborted.
    pub async fn run_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; startup already ran a cycle.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.run_cycle().await;
        }
    }

    // ── Idle sessions (and failed-session sweep) ──────────────────────────────

    async fn reap_idle_sessions(&self) -> (usize, usize, Vec<String>) {
        let now = Utc::now();
        let mut errors = Vec::new();
        let mut reaped = 0;

        let idle = match self.store.idle_sessions(now).await {
            Ok(sessions) => sessions,
            Err(e) => return (0, 0, vec![format!("idle query: {e}")]),
        };
        let failed = match self.store.failed_sessions().await {
            Ok(sessions) => sessions,
            Err(e) => return (idle.len(), 0, vec![format!("failed query: {e}")]),
        };
        let candidates = idle.len() + failed.len();

        for session in idle {
            let _guard = self.locks.lock(&session.sandbox_id).await;
            // Re-check under the lock: a capability call or keepalive may
            // have raced the candidate pull.
            let fresh = match self.store.get_session(&session.id).await {
                Ok(Some(s)) => s,
                Ok(None) => continue,
                Err(e) => {
                    errors.push(format!("session {}: {e}", session.id));
                    continue;
                }
            };
            if !fresh.observed_state.is_serving() || fresh.idle_expires_at > now {
                continue;
            }
            let sandbox = match self.store.get_sandbox(&session.sandbox_id).await {
                Ok(Some(s)) => s,
                Ok(None) => continue,
                Err(e) => {
                    errors.push(format!("sandbox {}: {e}", session.sandbox_id));
                    continue;
                }
            };
            if sandbox.is_tombstoned() {
                continue;
            }
            // Keepalive pushes the sandbox idle deadline past now.
            if sandbox.idle_expires_at.map_or(false, |t| t > now) {
                continue;
            }
            match self.sessions.stop(&session.sandbox_id).await {
                Ok(_) => {
                    info!(sandbox_id = %session.sandbox_id, session_id = %session.id, "idle session reaped");
                    reaped += 1;
                }
                Err(e) => errors.push(format!("stop {}: {e}", session.sandbox_id)),
            }
        }

        for session in failed {
            let _guard = self.locks.lock(&session.sandbox_id).await;
            match self.store.get_session(&session.id).await {
                Ok(Some(fresh)) if fresh.observed_state == bay_store::SessionState::Failed => {
                    self.sessions.reap_failed(&fresh).await;
                    reaped += 1;
                }
                Ok(_) => {}
                Err(e) => errors.push(format!("session {}: {e}", session.id)),
            }
        }

        (candidates, reaped, errors)
    }

    // ── Expired sandboxes ─────────────────────────────────────────────────────

    async fn reap_expired_sandboxes(&self) -> (usize, usize, Vec<String>) {
        let now = Utc::now();
        let mut errors = Vec::new();
        let mut reaped = 0;

        let expired = match self.store.expired_sandboxes(now).await {
            Ok(sandboxes) => sandboxes,
            Err(e) => return (0, 0, vec![format!("expiry query: {e}")]),
        };
        let candidates = expired.len();

        for sandbox in expired {
            // delete_if_expired re-checks the predicate under the sandbox
            // lock, so a concurrent extend_ttl or delete makes this a no-op.
            match self.sandboxes.delete_if_expired(&sandbox.id, now).await {
                Ok(true) => {
                    info!(sandbox_id = %sandbox.id, "expired sandbox reaped");
                    reaped += 1;
                }
                Ok(false) => {}
                Err(Error::NotFound(_)) => {}
                Err(e) => errors.push(format!("delete {}: {e}", sandbox.id)),
            }
        }
        (candidates, reaped, errors)
    }

    // ── Orphan cargos ─────────────────────────────────────────────────────────

    async fn reap_orphan_cargos(&self) -> (usize, usize, Vec<String>) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.tombstone_retention)
                .unwrap_or_else(|_| chrono::Duration::seconds(900));
        let mut errors = Vec::new();
        let mut reaped = 0;

        let orphans = match self.store.orphaned_managed_cargos(cutoff).await {
            Ok(cargos) => cargos,
            Err(e) => return (0, 0, vec![format!("orphan cargo query: {e}")]),
        };
        let candidates = orphans.len();

        for cargo in orphans {
            match self.cargos.delete_managed(&cargo.id).await {
                Ok(()) => {
                    info!(cargo_id = %cargo.id, "orphan managed cargo reaped");
                    reaped += 1;
                }
                Err(e) => errors.push(format!("cargo {}: {e}", cargo.id)),
            }
        }
        (candidates, reaped, errors)
    }

    // ── Orphan fabric resources ───────────────────────────────────────────────

    async fn reap_orphan_resources(&self) -> (usize, usize, Vec<String>) {
        let mut errors = Vec::new();
        let mut reaped = 0;

        let live = match self.store.live_ids().await {
            Ok(live) => live,
            Err(e) => return (0, 0, vec![format!("live ids: {e}")]),
        };
        let resources = match self.driver.list_managed_resources().await {
            Ok(resources) => resources,
            Err(e) => return (0, 0, vec![format!("list resources: {e}")]),
        };

        let grace_cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.orphan_grace)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let candidates = resources.len();

        for resource in resources {
            // Conservative: never reap inside the creation grace window.
            if resource.created_at.map_or(false, |t| t > grace_cutoff) {
                continue;
            }
            if !is_orphan(&resource, &live) {
                continue;
            }
            match self.driver.destroy_resource(&resource).await {
                Ok(()) => {
                    info!(
                        kind = %resource.kind,
                        reference = %resource.reference,
                        "orphan fabric resource reaped"
                    );
                    reaped += 1;
                }
                Err(e) => errors.push(format!("{} {}: {e}", resource.kind, resource.reference)),
            }
        }
        (candidates, reaped, errors)
    }
}

/// A resource is judged by its most specific reference: a session-scoped
/// resource lives and dies with its session row, a volume with its cargo
/// row, anything else with its sandbox row. A managed resource referencing
/// nothing is unattributable and therefore an orphan.
fn is_orphan(resource: &ManagedResource, live: &LiveIds) -> bool {
    if let Some(session_id) = resource.session_id() {
        return !live.sessions.contains(&session_id);
    }
    if let Some(cargo_id) = resource.cargo_id() {
        return !live.cargos.contains(&cargo_id);
    }
    if let Some(sandbox_id) = resource.sandbox_id() {
        return !live.sandboxes.contains(&sandbox_id);
    }
    true
}
