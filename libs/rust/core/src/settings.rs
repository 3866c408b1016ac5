//! Layered configuration: defaults, optional YAML file, then `FEDAGG__*` environment.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use notify::{EventKind, RecommendedWatcher, Watcher};
use serde::{Deserialize, Serialize};

use crate::federated_learning::{AggregationMethod, EmptyRoundPolicy, RoundSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sled,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Directory for the sled backend.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationConfig {
    pub service_name: String,
    pub log_level: String,
    pub http_port: u16,
    pub round_interval_secs: u64,
    pub min_devices: usize,
    pub model_dim: usize,
    #[serde(default)]
    pub initial_parameters: Option<Vec<f64>>,
    #[serde(default)]
    pub strategy: AggregationMethod,
    #[serde(default)]
    pub empty_round_policy: EmptyRoundPolicy,
    #[serde(default)]
    pub manual_mode: bool,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub persist_updates: bool,
    /// Capacity of the update-archive lane; models and round records are never bounded.
    pub persistence_queue: usize,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            service_name: "coordinator".into(),
            log_level: "info".into(),
            http_port: 8000,
            round_interval_secs: 1800,
            min_devices: 5,
            model_dim: 16,
            initial_parameters: None,
            strategy: AggregationMethod::FedAvg,
            empty_round_policy: EmptyRoundPolicy::Advance,
            manual_mode: false,
            store: StoreConfig::default(),
            persist_updates: false,
            persistence_queue: 1024,
        }
    }
}

impl FederationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.model_dim == 0 { bail!("model_dim must be positive"); }
        if self.min_devices == 0 { bail!("min_devices must be at least 1"); }
        if self.round_interval_secs == 0 { bail!("round_interval_secs must be positive"); }
        if self.persistence_queue == 0 { bail!("persistence_queue must be positive"); }
        if let Some(seed) = &self.initial_parameters {
            if seed.len() != self.model_dim { bail!("initial_parameters has {} values, model_dim is {}", seed.len(), self.model_dim); }
            if seed.iter().any(|v| !v.is_finite()) { bail!("initial_parameters must be finite"); }
        }
        if let Err(e) = self.strategy.validate() { bail!(e); }
        if self.store.backend == StoreBackend::Sled && self.store.path.is_none() { bail!("store.path is required for the sled backend"); }
        Ok(())
    }

    /// Subset of the configuration that can change while the coordinator runs.
    pub fn round_settings(&self) -> RoundSettings {
        RoundSettings {
            min_devices: self.min_devices,
            manual_mode: self.manual_mode,
            strategy: self.strategy,
            empty_round_policy: self.empty_round_policy,
        }
    }

    pub fn round_interval(&self) -> std::time::Duration { std::time::Duration::from_secs(self.round_interval_secs) }
}

/// Loads config using `FEDAGG_CONFIG_FILE` when set.
pub fn load_config(service: &str) -> Result<FederationConfig> {
    let file = std::env::var("FEDAGG_CONFIG_FILE").ok().map(PathBuf::from);
    load_config_from(service, file.as_deref())
}

pub fn load_config_from(service: &str, file: Option<&Path>) -> Result<FederationConfig> {
    let d = FederationConfig::default();
    let mut builder = config::Config::builder()
        .set_default("service_name", service)?
        .set_default("log_level", d.log_level)?
        .set_default("http_port", d.http_port as i64)?
        .set_default("round_interval_secs", d.round_interval_secs as i64)?
        .set_default("min_devices", d.min_devices as i64)?
        .set_default("model_dim", d.model_dim as i64)?
        .set_default("persistence_queue", d.persistence_queue as i64)?;
    if let Some(path) = file {
        builder = builder.add_source(config::File::from(path).format(config::FileFormat::Yaml).required(false));
    }
    builder = builder.add_source(config::Environment::with_prefix("FEDAGG").separator("__").try_parsing(true));
    let cfg: FederationConfig = builder.build()?.try_deserialize()?;
    cfg.validate()?;
    Ok(cfg)
}

/// Re-reads `path` on every modification and hands the validated result to `on_change`.
/// Invalid edits are logged and skipped.
pub fn watch_config_file<F>(service: String, path: PathBuf, on_change: F) -> tokio::task::JoinHandle<()>
where
    F: Fn(FederationConfig) + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = watch_loop(&service, &path, on_change).await { tracing::warn!(error=?e, "config watch loop exited"); }
    })
}

async fn watch_loop<F>(service: &str, path: &Path, on_change: F) -> Result<()>
where
    F: Fn(FederationConfig),
{
    use tokio::sync::mpsc;
    let (tx, mut rx) = mpsc::channel(8);
    let mut watcher = RecommendedWatcher::new(move |res| { let _ = tx.blocking_send(res); }, notify::Config::default())?;
    watcher.watch(path, notify::RecursiveMode::NonRecursive)?;
    while let Some(evt) = rx.recv().await {
        let Ok(ev) = evt else { continue };
        if !matches!(ev.kind, EventKind::Modify(_)) { continue; }
        match load_config_from(service, Some(path)) {
            Ok(cfg) => {
                tracing::info!(path=%path.display(), "config_reloaded");
                on_change(cfg);
            }
            Err(e) => tracing::warn!(error=%e, path=%path.display(), "config_reload_rejected"),
        }
    }
    Ok(())
}
