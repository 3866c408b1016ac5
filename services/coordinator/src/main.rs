use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use fedagg_core::{clear_ready, init_tracing, load_config_from, mark_ready};
use tokio::net::TcpListener;
use tracing::{info, warn};

mod api;
mod federation;

#[tokio::main]
async fn main() -> Result<()> {
    let config_file = std::env::var("FEDAGG_CONFIG_FILE").ok().map(PathBuf::from);
    let cfg = load_config_from("coordinator", config_file.as_deref())?;
    init_tracing(&cfg.service_name, &cfg.log_level)?;
    info!(?cfg, "config_loaded");

    let federation = federation::FederationModule::new(&cfg, config_file).await?;
    let app = api::router(federation.coordinator());

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http_port));
    let listener = TcpListener::bind(addr).await?;
    mark_ready();
    info!(%addr, "service_ready");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    clear_ready();
    federation.shutdown().await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await { warn!(error = %e, "ctrl_c_handler_failed"); }
    info!("shutdown_signal_received");
}
