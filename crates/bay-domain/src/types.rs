use serde::{Deserialize, Serialize};

// ── Identifiers ──────────────────────────────────────────────────────────────

macro_rules! id_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                $name(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(
    /// The caller-visible durable handle to a runtime environment.
    SandboxId
);
id_newtype!(
    /// One generation of container group serving a sandbox.
    SessionId
);
id_newtype!(
    /// A persistent volume attached to sandboxes.
    CargoId
);
id_newtype!(
    /// An enumerated container-group specification.
    ProfileId
);
id_newtype!(
    /// The principal that owns sandboxes and cargos.
    OwnerId
);

// ── Enums ─────────────────────────────────────────────────────────────────────

/// A logical operation family a container can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Python,
    Shell,
    Filesystem,
    Browser,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::Python,
        Capability::Shell,
        Capability::Filesystem,
        Capability::Browser,
    ];

    /// Parse the path segment used on the HTTP surface (`/python/exec` etc.).
    pub fn parse(s: &str) -> Option<Capability> {
        match s {
            "python" => Some(Capability::Python),
            "shell" => Some(Capability::Shell),
            "filesystem" => Some(Capability::Filesystem),
            "browser" => Some(Capability::Browser),
            _ => None,
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Python => write!(f, "python"),
            Capability::Shell => write!(f, "shell"),
            Capability::Filesystem => write!(f, "filesystem"),
            Capability::Browser => write!(f, "browser"),
        }
    }
}

/// Which sidecar protocol a container speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeType {
    CodeRuntime,
    BrowserRuntime,
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeType::CodeRuntime => write!(f, "code_runtime"),
            RuntimeType::BrowserRuntime => write!(f, "browser_runtime"),
        }
    }
}

/// Container state as reported by the fabric. Bay never interprets more
/// than this — richer daemon states collapse into these five.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Exited,
    Missing,
    Unknown,
}

impl ContainerStatus {
    pub fn is_running(self) -> bool {
        matches!(self, ContainerStatus::Running)
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Missing => "missing",
            ContainerStatus::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}
