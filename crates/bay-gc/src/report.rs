use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The four reconcile tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GcTask {
    IdleSessions,
    ExpiredSandboxes,
    OrphanCargos,
    OrphanResources,
}

impl GcTask {
    pub const ALL: [GcTask; 4] = [
        GcTask::IdleSessions,
        GcTask::ExpiredSandboxes,
        GcTask::OrphanCargos,
        GcTask::OrphanResources,
    ];

    pub fn parse(s: &str) -> Option<GcTask> {
        match s {
            "idle_sessions" => Some(GcTask::IdleSessions),
            "expired_sandboxes" => Some(GcTask::ExpiredSandboxes),
            "orphan_cargos" => Some(GcTask::OrphanCargos),
            "orphan_resources" => Some(GcTask::OrphanResources),
            _ => None,
        }
    }
}

impl std::fmt::Display for GcTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GcTask::IdleSessions => "idle_sessions",
            GcTask::ExpiredSandboxes => "expired_sandboxes",
            GcTask::OrphanCargos => "orphan_cargos",
            GcTask::OrphanResources => "orphan_resources",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of one task run. Partial failure is a warning, not an abort —
/// the candidate is re-attempted next cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub task: GcTask,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub candidates: usize,
    pub reaped: usize,
    pub errors: Vec<String>,
}

/// Rolling snapshot served by the admin surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GcStatus {
    pub cycles_completed: u64,
    pub last_cycle_started_at: Option<DateTime<Utc>>,
    pub last_cycle_finished_at: Option<DateTime<Utc>>,
    pub last_reports: Vec<TaskReport>,
    pub purged_tombstones: u64,
    pub purged_idempotency_records: u64,
}
