//! Model representation shared by the ledger, aggregator and coordinator.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::aggregator::AggregationMethod;

pub type RoundId = u64;
pub type DeviceId = String;

/// A device's locally trained parameters for one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalUpdate {
    pub device_id: DeviceId,
    pub parameters: Vec<f64>,
    pub sample_count: u64,
    /// Round the device believes is open.
    pub round: RoundId,
    pub timestamp: DateTime<Utc>,
}

impl LocalUpdate {
    pub fn new(device_id: impl Into<DeviceId>, parameters: Vec<f64>, sample_count: u64, round: RoundId) -> Self {
        Self { device_id: device_id.into(), parameters, sample_count, round, timestamp: Utc::now() }
    }
}

/// Published global model. Immutable once built; shared behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalModel {
    pub round: RoundId,
    pub parameters: Vec<f64>,
    pub contributing_devices: BTreeSet<DeviceId>,
    pub total_samples: u64,
    pub strategy: Option<AggregationMethod>,
    pub created_at: DateTime<Utc>,
    pub checksum: String,
}

impl GlobalModel {
    /// Round 0 model, either zeros or caller-provided seed parameters.
    pub fn seed(parameters: Vec<f64>) -> Self {
        let checksum = parameters_checksum(&parameters);
        Self {
            round: 0,
            parameters,
            contributing_devices: BTreeSet::new(),
            total_samples: 0,
            strategy: None,
            created_at: Utc::now(),
            checksum,
        }
    }

    pub fn aggregated(
        round: RoundId,
        parameters: Vec<f64>,
        contributing_devices: BTreeSet<DeviceId>,
        total_samples: u64,
        strategy: AggregationMethod,
    ) -> Self {
        let checksum = parameters_checksum(&parameters);
        Self { round, parameters, contributing_devices, total_samples, strategy: Some(strategy), created_at: Utc::now(), checksum }
    }

    pub fn dimension(&self) -> usize { self.parameters.len() }

    pub fn summary(&self) -> ModelSummary {
        let n = self.parameters.len();
        let (mut min, mut max, mut sum) = (f64::INFINITY, f64::NEG_INFINITY, 0.0);
        for v in &self.parameters {
            min = min.min(*v);
            max = max.max(*v);
            sum += v;
        }
        let mean = if n == 0 { 0.0 } else { sum / n as f64 };
        let l2_norm = self.parameters.iter().map(|v| v * v).sum::<f64>().sqrt();
        ModelSummary {
            round: self.round,
            total_parameters: n,
            mean,
            min: if n == 0 { 0.0 } else { min },
            max: if n == 0 { 0.0 } else { max },
            l2_norm,
            checksum: self.checksum.clone(),
        }
    }
}

/// Lightweight statistics about a model, for status pages and analytics jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub round: RoundId,
    pub total_parameters: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub l2_norm: f64,
    pub checksum: String,
}

/// Hex SHA-256 over the little-endian bytes of every parameter.
pub fn parameters_checksum(parameters: &[f64]) -> String {
    let mut h = Sha256::new();
    for v in parameters { h.update(v.to_le_bytes()); }
    hex::encode(h.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_is_round_zero() {
        let m = GlobalModel::seed(vec![0.0, 0.0]);
        assert_eq!(m.round, 0);
        assert!(m.contributing_devices.is_empty());
        assert_eq!(m.total_samples, 0);
        assert_eq!(m.checksum, parameters_checksum(&[0.0, 0.0]));
    }

    #[test]
    fn checksum_tracks_parameters() {
        assert_ne!(parameters_checksum(&[1.0, 2.0]), parameters_checksum(&[2.0, 1.0]));
        assert_eq!(parameters_checksum(&[1.0, 2.0]).len(), 64);
    }

    #[test]
    fn summary_stats() {
        let m = GlobalModel::seed(vec![3.0, -4.0]);
        let s = m.summary();
        assert_eq!(s.total_parameters, 2);
        assert_eq!(s.min, -4.0);
        assert_eq!(s.max, 3.0);
        assert_eq!(s.mean, -0.5);
        assert_eq!(s.l2_norm, 5.0);
    }
}
