mod cli;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bay_api::{build_app, AppState};
use bay_config::{apply_env_overrides, default_config, load_config, BayConfig, DriverKind};
use bay_driver::{DockerDriver, Driver, LocalDriver};
use bay_gc::{GcConfig, GcScheduler};
use bay_orchestrator::{
    CapabilityRouter, CargoManager, LockTable, ProfileRegistry, SandboxManager, SessionManager,
};
use bay_runtime::{HttpConnector, RuntimeConnector};
use bay_store::{InMemoryStore, MetadataStore, SqliteStore};

use cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let fmt = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false);
    if cli.log_json {
        fmt.json().init();
    } else {
        fmt.init();
    }

    let mut config = match &cli.config {
        Some(path) => load_config(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => default_config(),
    };
    apply_env_overrides(&mut config).context("applying environment overrides")?;

    let Some(api_token) = config.server.api_token.clone() else {
        bail!("no API token configured; set server.api_token or BAY_API_TOKEN");
    };

    let store = open_store(&config).await?;
    let driver = open_driver(&config).await?;
    let connector: Arc<dyn RuntimeConnector> = Arc::new(HttpConnector::new());

    let locks = LockTable::new();
    let registry = Arc::new(ProfileRegistry::new(config.profiles.clone()));
    let sessions = Arc::new(SessionManager::new(
        store.clone(),
        driver.clone(),
        connector.clone(),
        config.timeouts.readiness,
    ));
    let cargos = Arc::new(CargoManager::new(store.clone(), driver.clone()));
    let sandboxes = Arc::new(SandboxManager::new(
        store.clone(),
        locks.clone(),
        sessions.clone(),
        cargos.clone(),
        registry.clone(),
        config.limits.max_sandboxes_per_owner,
    ));
    let router = Arc::new(CapabilityRouter::new(
        store.clone(),
        sessions.clone(),
        locks.clone(),
        connector,
        registry.clone(),
        config.timeouts.capability_default,
        config.timeouts.capability_ceiling,
    ));
    let gc = Arc::new(GcScheduler::new(
        store.clone(),
        driver,
        locks,
        sandboxes.clone(),
        sessions,
        cargos.clone(),
        GcConfig {
            interval: config.gc.interval,
            orphan_grace: config.gc.orphan_grace,
            tombstone_retention: config.gc.tombstone_retention,
            idempotency_retention: config.gc.idempotency_retention,
        },
    ));

    // One reconcile pass before traffic: converge the fabric with whatever
    // the store says survived the last process.
    info!("running startup reconcile");
    gc.run_cycle().await;
    let gc_task = tokio::spawn(gc.clone().run_loop());

    let app = build_app(AppState {
        store,
        sandboxes,
        cargos,
        router,
        gc,
        registry,
        auth_token: Arc::new(api_token),
        idempotency_retention: config.gc.idempotency_retention,
    });

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr = %addr, "bay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    gc_task.abort();
    info!("clean shutdown");
    Ok(())
}

async fn open_store(config: &BayConfig) -> Result<Arc<dyn MetadataStore>> {
    match &config.database_url {
        Some(url) => {
            info!(url = %url, "using sqlite metadata store");
            let store = SqliteStore::connect(url)
                .await
                .with_context(|| format!("opening metadata store at {url}"))?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("no database_url configured; using in-memory store (state lost on exit)");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}

async fn open_driver(config: &BayConfig) -> Result<Arc<dyn Driver>> {
    match config.driver {
        DriverKind::Docker => {
            let driver = DockerDriver::connect()
                .await
                .context("docker driver handshake failed")?;
            Ok(Arc::new(driver))
        }
        DriverKind::Local => {
            warn!("using the simulated local driver; no real containers will run");
            Ok(Arc::new(LocalDriver::new()))
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to install ctrl-c handler");
    }
    info!("shutdown signal received");
}
