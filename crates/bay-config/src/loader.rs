use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::time::Duration;

use bay_domain::{Capability, ContainerSpec, Profile, ProfileId, ResourceLimits, RuntimeType};
use tracing::debug;

use crate::error::ConfigError;
use crate::raw::{RawConfig, RawContainer, RawProfile};

// ── Validated config ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverKind {
    Local,
    Docker,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub api_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GcSettings {
    pub interval: Duration,
    /// Resources younger than this are never reaped as orphans, to avoid
    /// racing an in-flight create.
    pub orphan_grace: Duration,
    pub tombstone_retention: Duration,
    pub idempotency_retention: Duration,
}

#[derive(Debug, Clone)]
pub struct TimeoutSettings {
    /// Total budget for the session readiness probe.
    pub readiness: Duration,
    pub capability_default: Duration,
    pub capability_ceiling: Duration,
    pub driver: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct LimitSettings {
    pub max_sandboxes_per_owner: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct BayConfig {
    pub server: ServerConfig,
    pub database_url: Option<String>,
    pub driver: DriverKind,
    pub gc: GcSettings,
    pub timeouts: TimeoutSettings,
    pub limits: LimitSettings,
    pub profiles: Vec<Profile>,
}

impl BayConfig {
    pub fn profile(&self, id: &ProfileId) -> Option<&Profile> {
        self.profiles.iter().find(|p| &p.id == id)
    }
}

/// Load and validate `bay.yml`. The built-in profile set applies when the
/// file declares none.
pub fn load_config(path: &Path) -> Result<BayConfig, ConfigError> {
    debug!("loading config from {}", path.display());
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let raw: RawConfig = serde_yaml::from_str(&content).map_err(|e| ConfigError::YamlParse {
        path: path.display().to_string(),
        source: e,
    })?;
    convert(raw, &path.display().to_string())
}

/// All-defaults config (local driver, ephemeral store, built-in profiles).
pub fn default_config() -> BayConfig {
    convert(RawConfig::default(), "<defaults>").expect("built-in defaults are valid")
}

fn convert(raw: RawConfig, path: &str) -> Result<BayConfig, ConfigError> {
    let driver = match raw.driver.as_deref() {
        None | Some("local") => DriverKind::Local,
        Some("docker") => DriverKind::Docker,
        Some(other) => {
            return Err(ConfigError::Conversion {
                path: path.to_string(),
                message: format!("unknown driver '{other}' (expected 'local' or 'docker')"),
            })
        }
    };

    let profiles = if raw.profiles.is_empty() {
        default_profiles()
    } else {
        raw.profiles
            .into_iter()
            .map(|p| convert_profile(p, path))
            .collect::<Result<Vec<_>, _>>()?
    };

    let mut seen = BTreeSet::new();
    for profile in &profiles {
        if !seen.insert(profile.id.clone()) {
            return Err(ConfigError::Conversion {
                path: path.to_string(),
                message: format!("duplicate profile id '{}'", profile.id),
            });
        }
        profile.validate()?;
    }

    if raw.timeouts.capability_default_seconds > raw.timeouts.capability_ceiling_seconds {
        return Err(ConfigError::Conversion {
            path: path.to_string(),
            message: "capability_default_seconds exceeds capability_ceiling_seconds".into(),
        });
    }

    Ok(BayConfig {
        server: ServerConfig {
            bind: raw.server.bind,
            port: raw.server.port,
            api_token: raw.server.api_token,
        },
        database_url: raw.database_url,
        driver,
        gc: GcSettings {
            interval: Duration::from_secs(raw.gc.interval_seconds),
            orphan_grace: Duration::from_secs(raw.gc.orphan_grace_seconds),
            tombstone_retention: Duration::from_secs(raw.gc.tombstone_retention_seconds),
            idempotency_retention: Duration::from_secs(raw.gc.idempotency_retention_seconds),
        },
        timeouts: TimeoutSettings {
            readiness: Duration::from_secs(raw.timeouts.readiness_seconds),
            capability_default: Duration::from_secs(raw.timeouts.capability_default_seconds),
            capability_ceiling: Duration::from_secs(raw.timeouts.capability_ceiling_seconds),
            driver: Duration::from_secs(raw.timeouts.driver_seconds),
        },
        limits: LimitSettings {
            max_sandboxes_per_owner: raw.limits.max_sandboxes_per_owner,
        },
        profiles,
    })
}

fn convert_profile(raw: RawProfile, path: &str) -> Result<Profile, ConfigError> {
    let containers = raw
        .containers
        .into_iter()
        .map(|c| convert_container(c, path))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Profile {
        id: ProfileId::new(raw.id),
        containers,
        idle_timeout_seconds: raw.idle_timeout_seconds,
        default_ttl_seconds: raw.default_ttl_seconds,
    })
}

fn convert_container(raw: RawContainer, path: &str) -> Result<ContainerSpec, ConfigError> {
    let runtime_type = match raw.runtime_type.as_str() {
        "code_runtime" => RuntimeType::CodeRuntime,
        "browser_runtime" => RuntimeType::BrowserRuntime,
        other => {
            return Err(ConfigError::Conversion {
                path: path.to_string(),
                message: format!("unknown runtime_type '{other}' on container '{}'", raw.name),
            })
        }
    };
    let capabilities = raw
        .capabilities
        .iter()
        .map(|c| parse_capability(c, &raw.name, path))
        .collect::<Result<BTreeSet<_>, _>>()?;
    let primary_for = raw
        .primary_for
        .iter()
        .map(|c| parse_capability(c, &raw.name, path))
        .collect::<Result<Vec<_>, _>>()?;

    let mut resources = ResourceLimits::default();
    if let Some(cpu) = raw.cpu {
        resources.cpu = cpu;
    }
    if let Some(memory_mb) = raw.memory_mb {
        resources.memory_mb = memory_mb;
    }

    Ok(ContainerSpec {
        name: raw.name,
        image: raw.image,
        resources,
        env: raw.env,
        runtime_port: raw.runtime_port,
        runtime_type,
        capabilities,
        primary_for,
    })
}

fn parse_capability(s: &str, container: &str, path: &str) -> Result<Capability, ConfigError> {
    Capability::parse(s).ok_or_else(|| ConfigError::Conversion {
        path: path.to_string(),
        message: format!("unknown capability '{s}' on container '{container}'"),
    })
}

// ── Built-in profiles ─────────────────────────────────────────────────────────

/// The profile set shipped with the binary: a single code-runtime group and
/// a code + browser pair.
pub fn default_profiles() -> Vec<Profile> {
    let code_caps: BTreeSet<Capability> =
        [Capability::Python, Capability::Shell, Capability::Filesystem]
            .into_iter()
            .collect();

    vec![
        Profile {
            id: ProfileId::new("python-default"),
            containers: vec![ContainerSpec {
                name: "ship".into(),
                image: "bay/ship:latest".into(),
                resources: ResourceLimits { cpu: 1.0, memory_mb: 2048 },
                env: HashMap::new(),
                runtime_port: 8700,
                runtime_type: RuntimeType::CodeRuntime,
                capabilities: code_caps.clone(),
                primary_for: vec![],
            }],
            idle_timeout_seconds: 600,
            default_ttl_seconds: Some(3600),
        },
        Profile {
            id: ProfileId::new("browser-python"),
            containers: vec![
                ContainerSpec {
                    name: "ship".into(),
                    image: "bay/ship:latest".into(),
                    resources: ResourceLimits { cpu: 1.0, memory_mb: 2048 },
                    env: HashMap::new(),
                    runtime_port: 8700,
                    runtime_type: RuntimeType::CodeRuntime,
                    capabilities: code_caps,
                    primary_for: vec![],
                },
                ContainerSpec {
                    name: "gull".into(),
                    image: "bay/gull:latest".into(),
                    resources: ResourceLimits { cpu: 2.0, memory_mb: 4096 },
                    env: HashMap::new(),
                    runtime_port: 8710,
                    runtime_type: RuntimeType::BrowserRuntime,
                    capabilities: [Capability::Browser].into_iter().collect(),
                    primary_for: vec![Capability::Browser],
                },
            ],
            idle_timeout_seconds: 600,
            default_ttl_seconds: Some(3600),
        },
    ]
}

// ── Environment overrides ─────────────────────────────────────────────────────

pub const ENV_API_TOKEN: &str = "BAY_API_TOKEN";
pub const ENV_DATABASE_URL: &str = "BAY_DATABASE_URL";
pub const ENV_DRIVER: &str = "BAY_DRIVER";
pub const ENV_BIND: &str = "BAY_BIND";
pub const ENV_PORT: &str = "BAY_PORT";
pub const ENV_GC_INTERVAL: &str = "BAY_GC_INTERVAL_SECS";

/// Apply overrides from an explicit map. Unknown keys are ignored;
/// malformed values are conversion errors, not silently dropped.
pub fn apply_overrides(
    config: &mut BayConfig,
    vars: &HashMap<String, String>,
) -> Result<(), ConfigError> {
    if let Some(token) = vars.get(ENV_API_TOKEN) {
        config.server.api_token = Some(token.clone());
    }
    if let Some(url) = vars.get(ENV_DATABASE_URL) {
        config.database_url = Some(url.clone());
    }
    if let Some(driver) = vars.get(ENV_DRIVER) {
        config.driver = match driver.as_str() {
            "local" => DriverKind::Local,
            "docker" => DriverKind::Docker,
            other => {
                return Err(ConfigError::Conversion {
                    path: ENV_DRIVER.to_string(),
                    message: format!("unknown driver '{other}'"),
                })
            }
        };
    }
    if let Some(bind) = vars.get(ENV_BIND) {
        config.server.bind = bind.clone();
    }
    if let Some(port) = vars.get(ENV_PORT) {
        config.server.port = port.parse().map_err(|_| ConfigError::Conversion {
            path: ENV_PORT.to_string(),
            message: format!("invalid port '{port}'"),
        })?;
    }
    if let Some(interval) = vars.get(ENV_GC_INTERVAL) {
        let seconds: u64 = interval.parse().map_err(|_| ConfigError::Conversion {
            path: ENV_GC_INTERVAL.to_string(),
            message: format!("invalid interval '{interval}'"),
        })?;
        config.gc.interval = Duration::from_secs(seconds);
    }
    Ok(())
}

/// Apply overrides from the process environment.
pub fn apply_env_overrides(config: &mut BayConfig) -> Result<(), ConfigError> {
    let vars: HashMap<String, String> = [
        ENV_API_TOKEN,
        ENV_DATABASE_URL,
        ENV_DRIVER,
        ENV_BIND,
        ENV_PORT,
        ENV_GC_INTERVAL,
    ]
    .iter()
    .filter_map(|k| std::env::var(k).ok().map(|v| (k.to_string(), v)))
    .collect();
    apply_overrides(config, &vars)
}
