use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::types::{Capability, ProfileId, RuntimeType};

/// CPU/memory limits applied to one container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Whole or fractional CPUs (1.0 = one core).
    pub cpu: f64,
    pub memory_mb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self { cpu: 1.0, memory_mb: 1024 }
    }
}

/// One container inside a profile's ordered group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Logical name; doubles as the container hostname so peers in the
    /// session network reach each other without discovery.
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub resources: ResourceLimits,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Port the runtime sidecar listens on inside the container.
    pub runtime_port: u16,
    pub runtime_type: RuntimeType,
    pub capabilities: BTreeSet<Capability>,
    /// Capabilities this container claims when several containers advertise
    /// the same one. Absent → profile list order breaks the tie.
    #[serde(default)]
    pub primary_for: Vec<Capability>,
}

/// An enumerated runtime specification — configuration, not stored per-sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: ProfileId,
    /// Ordered: containers are created and started in list order.
    pub containers: Vec<ContainerSpec>,
    pub idle_timeout_seconds: u64,
    /// None means sandboxes on this profile default to an infinite TTL.
    pub default_ttl_seconds: Option<u64>,
}

impl Profile {
    /// Structural validation: non-empty group, unique container names, and
    /// every `primary_for` claim backed by the container's own capability set.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.containers.is_empty() {
            return Err(DomainError::InvalidProfile {
                profile_id: self.id.to_string(),
                message: "profile has no containers".into(),
            });
        }

        let mut names = BTreeSet::new();
        for spec in &self.containers {
            if !names.insert(spec.name.as_str()) {
                return Err(DomainError::InvalidProfile {
                    profile_id: self.id.to_string(),
                    message: format!("duplicate container name '{}'", spec.name),
                });
            }
            for cap in &spec.primary_for {
                if !spec.capabilities.contains(cap) {
                    return Err(DomainError::InvalidProfile {
                        profile_id: self.id.to_string(),
                        message: format!(
                            "container '{}' claims primary_for {} without advertising it",
                            spec.name, cap
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    /// The set of capabilities any container in the group advertises.
    pub fn capabilities(&self) -> BTreeSet<Capability> {
        self.containers
            .iter()
            .flat_map(|c| c.capabilities.iter().copied())
            .collect()
    }

    /// Pick the container that serves `capability`.
    ///
    /// A container with an explicit `primary_for` claim wins; otherwise the
    /// first container (in list order) whose capability set contains it.
    pub fn select_container(&self, capability: Capability) -> Option<&ContainerSpec> {
        self.containers
            .iter()
            .find(|c| c.primary_for.contains(&capability))
            .or_else(|| {
                self.containers
                    .iter()
                    .find(|c| c.capabilities.contains(&capability))
            })
    }
}
