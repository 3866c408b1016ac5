use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use fedagg_core::federated_learning::{spawn_persistence, MemoryStore, ModelStore, SledStore};
use fedagg_core::{watch_config_file, FederationConfig, RetryConfig, RoundCoordinator, RoundScheduler, StoreBackend};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Coordinator plus the background tasks that keep it moving: scheduler, store writer
/// and (optionally) the config file watcher.
pub struct FederationModule {
    coordinator: Arc<RoundCoordinator>,
    shutdown_tx: watch::Sender<bool>,
    scheduler: JoinHandle<()>,
    writer: JoinHandle<()>,
    watcher: Option<JoinHandle<()>>,
}

impl FederationModule {
    pub async fn new(cfg: &FederationConfig, config_file: Option<PathBuf>) -> Result<Self> {
        let store: Arc<dyn ModelStore> = match cfg.store.backend {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::Sled => {
                let path = cfg.store.path.as_ref().context("store.path is required for the sled backend")?;
                Arc::new(SledStore::open(path).with_context(|| format!("opening model store at {}", path.display()))?)
            }
        };
        let recovered = store.load().await.context("loading persisted rounds")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (persistence, writer) = spawn_persistence(store, cfg.persistence_queue, RetryConfig::default(), shutdown_rx.clone());
        let coordinator = RoundCoordinator::restore(cfg.model_dim, cfg.initial_parameters.clone(), cfg.round_settings(), recovered)?
            .with_persistence(persistence, cfg.persist_updates);
        let coordinator = Arc::new(coordinator);

        let scheduler = RoundScheduler::new(coordinator.clone(), cfg.round_interval()).spawn(shutdown_rx);
        let watcher = config_file.map(|path| {
            let c = coordinator.clone();
            watch_config_file(cfg.service_name.clone(), path, move |new_cfg| match c.update_settings(new_cfg.round_settings().into()) {
                Ok(s) => info!(min_devices = s.min_devices, manual_mode = s.manual_mode, strategy = s.strategy.name(), "round_settings_reloaded"),
                Err(e) => warn!(error = %e, "round_settings_reload_rejected"),
            })
        });

        info!(
            round = coordinator.current_round(),
            dimension = cfg.model_dim,
            backend = ?cfg.store.backend,
            interval_secs = cfg.round_interval_secs,
            "federation_module_initialized"
        );
        Ok(Self { coordinator, shutdown_tx, scheduler, writer, watcher })
    }

    pub fn coordinator(&self) -> Arc<RoundCoordinator> { self.coordinator.clone() }

    /// Stops the scheduler, then lets the store writer flush what is queued.
    pub async fn shutdown(self) -> Result<()> {
        if let Some(w) = self.watcher { w.abort(); }
        self.shutdown_tx.send_replace(true);
        self.scheduler.await.context("scheduler task")?;
        self.writer.await.context("persistence task")?;
        info!(round = self.coordinator.current_round(), "federation_module_shutdown");
        Ok(())
    }
}
