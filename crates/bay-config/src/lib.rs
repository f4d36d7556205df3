pub mod error;
pub mod loader;
pub mod raw;

pub use error::ConfigError;
pub use loader::{
    apply_env_overrides, apply_overrides, default_config, default_profiles, load_config,
    BayConfig, DriverKind, GcSettings, LimitSettings, ServerConfig, TimeoutSettings,
    ENV_API_TOKEN, ENV_BIND, ENV_DATABASE_URL, ENV_DRIVER, ENV_GC_INTERVAL, ENV_PORT,
};
