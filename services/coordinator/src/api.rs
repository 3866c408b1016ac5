//! HTTP surface of the coordinator. Handlers are thin: every decision lives in `RoundCoordinator`.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use fedagg_core::federated_learning::{ModelSummary, SettingsError};
use fedagg_core::{CloseOutcome, GlobalModel, HistoryRange, Rejection, RoundCoordinator, RoundId, RoundRecord, RoundSettings, SettingsPatch, Status, SubmitReceipt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::info;

type Shared = State<Arc<RoundCoordinator>>;

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub device_id: String,
    pub parameters: Vec<f64>,
    pub sample_count: u64,
    pub round: RoundId,
}

#[derive(Debug, Serialize)]
struct ServiceInfo {
    service: &'static str,
    version: &'static str,
    current_round: RoundId,
    model_round: RoundId,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("no model published for round {0}")]
    ModelNotFound(RoundId),
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Settings(_) => StatusCode::UNPROCESSABLE_ENTITY,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn router(coordinator: Arc<RoundCoordinator>) -> Router {
    Router::new()
        .route("/", get(service_info))
        .route("/api/v1/updates", post(submit_update))
        .route("/api/v1/model", get(current_model))
        .route("/api/v1/model/summary", get(model_summary))
        .route("/api/v1/models/:round", get(model_at))
        .route("/api/v1/history", get(history))
        .route("/api/v1/status", get(status))
        .route("/api/v1/aggregate", post(aggregate_now))
        .route("/api/v1/config", get(current_settings).patch(update_settings))
        .with_state(coordinator)
        .merge(fedagg_core::health_router())
}

async fn service_info(State(c): Shared) -> Json<ServiceInfo> {
    Json(ServiceInfo { service: "coordinator", version: env!("CARGO_PKG_VERSION"), current_round: c.current_round(), model_round: c.current_model().round })
}

fn rejection_status(r: &Rejection) -> StatusCode {
    match r {
        Rejection::StaleRound { .. } => StatusCode::CONFLICT,
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

async fn submit_update(State(c): Shared, Json(req): Json<SubmitRequest>) -> (StatusCode, Json<SubmitReceipt>) {
    let receipt = c.submit_update(req.device_id, req.parameters, req.sample_count, req.round);
    let status = receipt.reason.as_ref().map(rejection_status).unwrap_or(StatusCode::OK);
    (status, Json(receipt))
}

async fn current_model(State(c): Shared) -> Json<Arc<GlobalModel>> { Json(c.current_model()) }

async fn model_summary(State(c): Shared) -> Json<ModelSummary> { Json(c.current_model().summary()) }

async fn model_at(State(c): Shared, Path(round): Path<RoundId>) -> Result<Json<Arc<GlobalModel>>, ApiError> {
    c.model_at(round).map(Json).ok_or(ApiError::ModelNotFound(round))
}

async fn history(State(c): Shared, Query(range): Query<HistoryRange>) -> Json<Vec<RoundRecord>> { Json(c.history(range)) }

async fn status(State(c): Shared) -> Json<Status> { Json(c.status()) }

async fn aggregate_now(State(c): Shared) -> Json<CloseOutcome> {
    let outcome = c.trigger_aggregation_now();
    info!(?outcome, "manual_aggregation_requested");
    Json(outcome)
}

async fn current_settings(State(c): Shared) -> Json<RoundSettings> { Json(c.settings()) }

async fn update_settings(State(c): Shared, Json(p): Json<SettingsPatch>) -> Result<Json<RoundSettings>, ApiError> {
    Ok(Json(c.update_settings(p)?))
}
