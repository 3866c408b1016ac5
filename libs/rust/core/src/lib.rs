//! Core shared utilities and round-based aggregation engine for FedAgg services.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use axum::{http::{header, StatusCode}, response::IntoResponse, routing::get, Json, Router};
use once_cell::sync::{Lazy, OnceCell};
use prometheus::{Encoder, TextEncoder};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static TRACING_INIT: OnceCell<()> = OnceCell::new();
static NODE_LIVENESS: AtomicBool = AtomicBool::new(true);
static NODE_READINESS: AtomicBool = AtomicBool::new(false);

pub fn mark_ready() { NODE_READINESS.store(true, Ordering::SeqCst); }
pub fn clear_ready() { NODE_READINESS.store(false, Ordering::SeqCst); }
pub fn mark_not_live() { NODE_LIVENESS.store(false, Ordering::SeqCst); }

/// Installs the global subscriber once. `RUST_LOG` wins over `default_level`;
/// `FEDAGG_JSON_LOG=1` switches to flattened JSON lines.
pub fn init_tracing(service: &str, default_level: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var("FEDAGG_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_level))?;
        let registry = tracing_subscriber::registry().with(env_filter);
        if json {
            registry
                .with(fmt::layer().json().flatten_event(true).with_current_span(true).with_span_list(false))
                .try_init()?;
        } else {
            registry
                .with(fmt::layer().with_target(true).with_thread_ids(false).with_line_number(true))
                .try_init()?;
        }
        Ok(())
    })?;
    info!(service, "tracing_initialized");
    Ok(())
}

/// `/live`, `/ready` and `/metrics`, mergeable into any service router.
pub fn health_router<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/live", get(|| async { Json(serde_json::json!({"live": NODE_LIVENESS.load(Ordering::SeqCst)})) }))
        .route("/ready", get(|| async { Json(serde_json::json!({"ready": NODE_READINESS.load(Ordering::SeqCst)})) }))
        .route("/metrics", get(metrics_handler))
}

async fn metrics_handler() -> impl IntoResponse {
    Lazy::force(&metrics_ext::EXTENDED_METRICS);
    let metric_families = prometheus::gather();
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&metric_families, &mut buf) {
        return (StatusCode::INTERNAL_SERVER_ERROR, [(header::CONTENT_TYPE, "text/plain")], format!("encode error: {e}").into_bytes());
    }
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4")], buf)
}

pub mod settings;
pub mod resilience;
pub mod federated_learning;
pub mod metrics_ext; // prometheus groups for rounds and persistence

pub use resilience::{retry_async, RetryConfig};
pub use settings::{load_config, load_config_from, watch_config_file, FederationConfig, StoreBackend, StoreConfig};
pub use federated_learning::{
    AggregationError, AggregationMethod, CloseOutcome, CloseTrigger, EmptyRoundPolicy, GlobalModel, HistoryRange, LocalUpdate,
    ModelStore, Rejection, RoundCoordinator, RoundId, RoundRecord, RoundScheduler, RoundSettings, SettingsPatch, Status, SubmitReceipt,
};
pub use metrics_ext::{EXTENDED_METRICS, ExtendedMetrics};
