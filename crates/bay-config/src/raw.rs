use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Raw YAML representation of the server config file (bay.yml).
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RawConfig {
    #[serde(default)]
    pub server: RawServer,
    /// sqlx SQLite URL; absent means the ephemeral in-memory store.
    pub database_url: Option<String>,
    /// "local" or "docker".
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(default)]
    pub gc: RawGc,
    #[serde(default)]
    pub timeouts: RawTimeouts,
    #[serde(default)]
    pub limits: RawLimits,
    /// Absent → the built-in profile set.
    #[serde(default)]
    pub profiles: Vec<RawProfile>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RawServer {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Usually supplied via BAY_API_TOKEN rather than the file.
    pub api_token: Option<String>,
}

impl Default for RawServer {
    fn default() -> Self {
        Self { bind: default_bind(), port: default_port(), api_token: None }
    }
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8420
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RawGc {
    #[serde(default = "default_gc_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_orphan_grace")]
    pub orphan_grace_seconds: u64,
    #[serde(default = "default_tombstone_retention")]
    pub tombstone_retention_seconds: u64,
    #[serde(default = "default_idempotency_retention")]
    pub idempotency_retention_seconds: u64,
}

impl Default for RawGc {
    fn default() -> Self {
        Self {
            interval_seconds: default_gc_interval(),
            orphan_grace_seconds: default_orphan_grace(),
            tombstone_retention_seconds: default_tombstone_retention(),
            idempotency_retention_seconds: default_idempotency_retention(),
        }
    }
}

fn default_gc_interval() -> u64 {
    300
}

fn default_orphan_grace() -> u64 {
    60
}

fn default_tombstone_retention() -> u64 {
    900
}

fn default_idempotency_retention() -> u64 {
    86_400
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RawTimeouts {
    #[serde(default = "default_readiness")]
    pub readiness_seconds: u64,
    #[serde(default = "default_capability")]
    pub capability_default_seconds: u64,
    #[serde(default = "default_capability_ceiling")]
    pub capability_ceiling_seconds: u64,
    #[serde(default = "default_readiness")]
    pub driver_seconds: u64,
}

impl Default for RawTimeouts {
    fn default() -> Self {
        Self {
            readiness_seconds: default_readiness(),
            capability_default_seconds: default_capability(),
            capability_ceiling_seconds: default_capability_ceiling(),
            driver_seconds: default_readiness(),
        }
    }
}

fn default_readiness() -> u64 {
    120
}

fn default_capability() -> u64 {
    30
}

fn default_capability_ceiling() -> u64 {
    300
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RawLimits {
    pub max_sandboxes_per_owner: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RawProfile {
    pub id: String,
    pub containers: Vec<RawContainer>,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
    pub default_ttl_seconds: Option<u64>,
}

fn default_idle_timeout() -> u64 {
    600
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RawContainer {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub cpu: Option<f64>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub runtime_port: u16,
    /// "code_runtime" or "browser_runtime".
    pub runtime_type: String,
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub primary_for: Vec<String>,
}
