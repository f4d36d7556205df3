use bay_domain::{CargoId, SandboxId, SessionId};
use uuid::Uuid;

pub fn new_sandbox_id() -> SandboxId {
    SandboxId::new(format!("sb-{}", Uuid::new_v4().simple()))
}

pub fn new_session_id() -> SessionId {
    SessionId::new(format!("sess-{}", Uuid::new_v4().simple()))
}

pub fn new_cargo_id() -> CargoId {
    CargoId::new(format!("cargo-{}", Uuid::new_v4().simple()))
}
