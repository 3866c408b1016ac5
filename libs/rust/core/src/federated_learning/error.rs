use serde::Serialize;
use thiserror::Error;

use super::model::RoundId;

/// Why a single local update was refused. Never affects other devices.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rejection {
    #[error("update targets round {submitted} but round {open} is open")]
    StaleRound { submitted: RoundId, open: RoundId },
    #[error("expected {expected} parameters, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },
    #[error("sample_count must be positive")]
    InvalidSampleCount,
    #[error("parameter at index {index} is not finite")]
    NonFiniteParameters { index: usize },
}

impl Rejection {
    /// Stable label used for metrics and logs.
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::StaleRound { .. } => "stale_round",
            Rejection::ShapeMismatch { .. } => "shape_mismatch",
            Rejection::InvalidSampleCount => "invalid_sample_count",
            Rejection::NonFiniteParameters { .. } => "non_finite_parameters",
        }
    }
}

/// A snapshot could not be combined into a model.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AggregationError {
    #[error("no updates to aggregate")]
    Empty,
    #[error("device {device_id} has {actual} parameters, expected {expected}")]
    ShapeMismatch { device_id: String, expected: usize, actual: usize },
    #[error("aggregated parameter at index {index} is not finite")]
    NonFinite { index: usize },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend: {0}")]
    Backend(#[from] sled::Error),
    #[error("document encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("min_devices must be at least 1")]
    MinDevices,
    #[error("invalid strategy: {0}")]
    Strategy(String),
}
