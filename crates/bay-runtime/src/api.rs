use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bay_domain::{Capability, RuntimeType};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RuntimeError;

/// Major API version Bay speaks. Runtimes advertising a different major are
/// rejected at session start.
pub const SUPPORTED_API_MAJOR: u32 = 1;

// ── Runtime self-description (`GET /meta`) ────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub name: String,
    pub version: String,
    /// "MAJOR" or "MAJOR.MINOR".
    pub api_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceInfo {
    pub mount_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityInfo {
    pub operations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeDescription {
    pub runtime: RuntimeInfo,
    pub workspace: WorkspaceInfo,
    pub capabilities: HashMap<String, CapabilityInfo>,
}

impl RuntimeDescription {
    /// Advertised capabilities Bay understands. Unknown names are ignored —
    /// a newer runtime may advertise families this Bay does not route.
    pub fn known_capabilities(&self) -> BTreeSet<Capability> {
        self.capabilities
            .keys()
            .filter_map(|name| Capability::parse(name))
            .collect()
    }

    pub fn api_version_compatible(&self) -> bool {
        self.runtime
            .api_version
            .split('.')
            .next()
            .and_then(|major| major.trim_start_matches('v').parse::<u32>().ok())
            .map_or(false, |major| major == SUPPORTED_API_MAJOR)
    }
}

// ── Adapter contract ──────────────────────────────────────────────────────────

/// One capability invocation, already routed to a container.
#[derive(Debug, Clone)]
pub struct CapabilityCall {
    pub capability: Capability,
    pub operation: String,
    pub payload: Value,
    pub timeout: Duration,
}

/// Transport to one runtime sidecar. Pure I/O with fault mapping; no
/// retries, no metadata access.
#[async_trait]
pub trait RuntimeApi: Send + Sync {
    /// Liveness + readiness probe.
    async fn health(&self) -> Result<(), RuntimeError>;

    async fn meta(&self) -> Result<RuntimeDescription, RuntimeError>;

    async fn invoke(&self, call: &CapabilityCall) -> Result<Value, RuntimeError>;
}

/// Factory seam: turns (endpoint, runtime kind) into a transport. The
/// production implementation builds HTTP clients; tests inject stubs.
pub trait RuntimeConnector: Send + Sync + 'static {
    fn connect(&self, endpoint: &str, runtime_type: RuntimeType) -> Arc<dyn RuntimeApi>;
}
