//! Daemon assembly: wires the store, event log, queue, worker and API.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info};

use cutover_api::{ApiState, build_router};
use cutover_core::CutoverConfig;
use cutover_rollout::{DeploymentWorker, JobEventBus, LocalController, StrategyEngine};
use cutover_state::{DeploymentRepo, EventLog, Notifier, StateStore, WorkQueue};

/// Load the config file (defaults when absent) and apply CLI overrides.
pub fn load_config(
    path: Option<&Path>,
    port: Option<u16>,
    data_dir: Option<PathBuf>,
) -> anyhow::Result<CutoverConfig> {
    let mut config = match path {
        Some(path) => CutoverConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CutoverConfig::default(),
    };
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(data_dir) = data_dir {
        config.storage.data_dir = data_dir;
    }
    config.validate()?;
    Ok(config)
}

/// Every long-lived component of a running daemon.
pub struct Components {
    pub notifier: Notifier,
    pub api: ApiState,
    pub worker: DeploymentWorker,
}

/// Open the store and build all components. `shutdown` cancels in-flight
/// rollout waits.
pub fn assemble(
    config: &CutoverConfig,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<Components> {
    std::fs::create_dir_all(&config.storage.data_dir).with_context(|| {
        format!(
            "creating data directory {}",
            config.storage.data_dir.display()
        )
    })?;
    let db_path = config.storage.db_path();
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let notifier = Notifier::new(config.stream.notify_capacity);
    let log = EventLog::new(store.clone(), notifier.clone());
    let repo = DeploymentRepo::new(store.clone(), WorkQueue::new(store.clone()));
    let bus = JobEventBus::new(config.stream.notify_capacity);
    let controller = Arc::new(LocalController::new(store.clone(), bus.clone()));

    let engine =
        StrategyEngine::new(controller, log.clone(), repo.clone()).with_cancel(shutdown);
    let worker = DeploymentWorker::new(repo.clone(), engine, config.worker.poll_interval())
        .with_max_concurrent(config.worker.max_concurrent);

    let api = ApiState {
        store,
        repo,
        log,
        bus,
        keepalive: config.stream.keepalive(),
    };

    Ok(Components {
        notifier,
        api,
        worker,
    })
}

pub async fn run_daemon(config: CutoverConfig) -> anyhow::Result<()> {
    info!("cutover daemon starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let Components {
        notifier,
        api,
        worker,
    } = assemble(&config, shutdown_rx.clone())?;

    // ── Start background tasks ─────────────────────────────────

    let worker_handle = tokio::spawn(async move {
        worker.run(shutdown_rx).await;
    });

    // ── Start API server ───────────────────────────────────────

    let router = build_router(api);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Open event streams end once the notifier closes.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for shutdown signal");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
        notifier.close();
    });

    server.await?;

    let _ = worker_handle.await;

    info!("cutover daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_apply_over_defaults() {
        let config = load_config(None, Some(9000), Some(PathBuf::from("/tmp/cutover-x"))).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.storage.data_dir, PathBuf::from("/tmp/cutover-x"));
        assert_eq!(config.stream.keepalive_secs, 30);
    }

    #[test]
    fn config_file_is_loaded_and_overridden() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cutover.toml");
        std::fs::write(&path, "[server]\nport = 7000\n\n[worker]\npoll_interval_ms = 50\n").unwrap();

        let config = load_config(Some(&path), None, None).unwrap();
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.worker.poll_interval_ms, 50);

        let config = load_config(Some(&path), Some(7001), None).unwrap();
        assert_eq!(config.server.port, 7001);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("absent.toml")), None, None).is_err());
    }

    #[tokio::test]
    async fn assemble_creates_database_in_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(None, None, Some(dir.path().join("state"))).unwrap();
        let (_tx, rx) = watch::channel(false);

        let components = assemble(&config, rx).unwrap();
        assert!(config.storage.db_path().exists());
        assert!(components.api.repo.queue().list().unwrap().is_empty());
    }
}
