//! Aggregation strategies for combining a round's local updates.
//!
//! All strategies are pure. Inputs are put into a canonical order (by device id)
//! before any floating point accumulation, so the same set of updates produces
//! bit-identical output regardless of the order they arrived in.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::error::AggregationError;
use super::model::{GlobalModel, LocalUpdate, RoundId};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum AggregationMethod {
    /// Sample-weighted average (FedAvg).
    #[default]
    FedAvg,
    /// Unweighted mean, every device counts once.
    Mean,
    /// Server momentum: `beta * previous + (1 - beta) * fedavg`.
    Momentum { beta: f64 },
    /// Coordinate-wise mean after dropping `trim_ratio` of values from each end.
    TrimmedMean { trim_ratio: f64 },
    /// Coordinate-wise median.
    Median,
}

impl AggregationMethod {
    pub fn name(&self) -> &'static str {
        match self {
            AggregationMethod::FedAvg => "fedavg",
            AggregationMethod::Mean => "mean",
            AggregationMethod::Momentum { .. } => "momentum",
            AggregationMethod::TrimmedMean { .. } => "trimmed_mean",
            AggregationMethod::Median => "median",
        }
    }

    /// Checks strategy parameters are in range.
    pub fn validate(&self) -> Result<(), String> {
        match *self {
            AggregationMethod::Momentum { beta } if !(0.0..1.0).contains(&beta) => {
                Err(format!("momentum beta must be in [0, 1), got {beta}"))
            }
            AggregationMethod::TrimmedMean { trim_ratio } if !(0.0..0.5).contains(&trim_ratio) => {
                Err(format!("trim_ratio must be in [0, 0.5), got {trim_ratio}"))
            }
            _ => Ok(()),
        }
    }

    /// Combines `updates` into a new parameter vector.
    pub fn combine(&self, current: &GlobalModel, updates: &[LocalUpdate]) -> Result<Vec<f64>, AggregationError> {
        let ordered = canonical_order(updates)?;
        let combined = match *self {
            AggregationMethod::FedAvg => fed_avg(&ordered),
            AggregationMethod::Mean => mean(&ordered),
            AggregationMethod::Momentum { beta } => {
                let avg = fed_avg(&ordered);
                if current.parameters.len() != avg.len() {
                    // Seed dimension disagreeing with the updates means the seed was misconfigured.
                    return Err(AggregationError::ShapeMismatch {
                        device_id: "<global>".into(),
                        expected: avg.len(),
                        actual: current.parameters.len(),
                    });
                }
                current.parameters.iter().zip(avg).map(|(prev, a)| beta * prev + (1.0 - beta) * a).collect()
            }
            AggregationMethod::TrimmedMean { trim_ratio } => coordinate_wise(&ordered, |col| trimmed_mean(col, trim_ratio)),
            AggregationMethod::Median => coordinate_wise(&ordered, median),
        };
        if let Some(index) = combined.iter().position(|v| !v.is_finite()) {
            return Err(AggregationError::NonFinite { index });
        }
        Ok(combined)
    }
}

/// Builds the model for `round` from a non-empty set of updates.
pub fn aggregate(method: AggregationMethod, round: RoundId, current: &GlobalModel, updates: &[LocalUpdate]) -> Result<GlobalModel, AggregationError> {
    let parameters = method.combine(current, updates)?;
    let devices: BTreeSet<String> = updates.iter().map(|u| u.device_id.clone()).collect();
    let total_samples = updates.iter().fold(0u64, |acc, u| acc.saturating_add(u.sample_count));
    Ok(GlobalModel::aggregated(round, parameters, devices, total_samples, method))
}

fn canonical_order(updates: &[LocalUpdate]) -> Result<Vec<&LocalUpdate>, AggregationError> {
    let first = updates.first().ok_or(AggregationError::Empty)?;
    let dim = first.parameters.len();
    if let Some(bad) = updates.iter().find(|u| u.parameters.len() != dim) {
        return Err(AggregationError::ShapeMismatch {
            device_id: bad.device_id.clone(),
            expected: dim,
            actual: bad.parameters.len(),
        });
    }
    let mut ordered: Vec<&LocalUpdate> = updates.iter().collect();
    ordered.sort_by(|a, b| {
        a.device_id
            .cmp(&b.device_id)
            .then(a.sample_count.cmp(&b.sample_count))
            .then_with(|| cmp_params(&a.parameters, &b.parameters))
    });
    Ok(ordered)
}

fn cmp_params(a: &[f64], b: &[f64]) -> Ordering {
    a.iter().zip(b).map(|(x, y)| x.total_cmp(y)).find(|o| o.is_ne()).unwrap_or(Ordering::Equal)
}

fn fed_avg(updates: &[&LocalUpdate]) -> Vec<f64> {
    if let [only] = updates { return only.parameters.clone(); }
    let dim = updates[0].parameters.len();
    let mut acc = vec![0f64; dim];
    let mut total = 0f64;
    for u in updates {
        let w = u.sample_count as f64;
        total += w;
        for (slot, v) in acc.iter_mut().zip(&u.parameters) { *slot += w * v; }
    }
    // total > 0: the ledger refuses zero sample counts.
    for slot in &mut acc { *slot /= total; }
    acc
}

fn mean(updates: &[&LocalUpdate]) -> Vec<f64> {
    if let [only] = updates { return only.parameters.clone(); }
    let dim = updates[0].parameters.len();
    let n = updates.len() as f64;
    let mut acc = vec![0f64; dim];
    for u in updates {
        for (slot, v) in acc.iter_mut().zip(&u.parameters) { *slot += v; }
    }
    for slot in &mut acc { *slot /= n; }
    acc
}

fn coordinate_wise(updates: &[&LocalUpdate], reduce: impl Fn(&mut [f64]) -> f64) -> Vec<f64> {
    let dim = updates[0].parameters.len();
    let mut column = Vec::with_capacity(updates.len());
    (0..dim)
        .map(|i| {
            column.clear();
            column.extend(updates.iter().map(|u| u.parameters[i]));
            column.sort_by(f64::total_cmp);
            reduce(&mut column[..])
        })
        .collect()
}

/// `sorted` must be ascending and non-empty.
fn trimmed_mean(sorted: &mut [f64], trim_ratio: f64) -> f64 {
    let n = sorted.len();
    let mut k = (n as f64 * trim_ratio).floor() as usize;
    if 2 * k >= n { k = (n - 1) / 2; }
    let kept = &sorted[k..n - k];
    if let [only] = kept { return *only; }
    kept.iter().sum::<f64>() / kept.len() as f64
}

/// `sorted` must be ascending and non-empty.
fn median(sorted: &mut [f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 { sorted[n / 2] } else { (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0 }
}

/// Mean pairwise cosine similarity between the updates' parameter vectors.
///
/// 1.0 when fewer than two updates are present. Pairs involving a zero vector count as 0.
pub fn consensus_score(updates: &[LocalUpdate]) -> f64 {
    if updates.len() < 2 { return 1.0; }
    let mut ordered: Vec<&LocalUpdate> = updates.iter().collect();
    ordered.sort_by(|a, b| a.device_id.cmp(&b.device_id));
    let mut sum = 0.0;
    let mut pairs = 0usize;
    for i in 0..ordered.len() {
        for j in (i + 1)..ordered.len() {
            sum += cosine(&ordered[i].parameters, &ordered[j].parameters);
            pairs += 1;
        }
    }
    sum / pairs as f64
}

fn cosine(a: &[f64], b: &[f64]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if na == 0.0 || nb == 0.0 { return 0.0; }
    dot / (na * nb)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upd(id: &str, p: Vec<f64>, n: u64) -> LocalUpdate { LocalUpdate::new(id, p, n, 1) }

    #[test]
    fn fedavg_weights_by_samples() {
        let seed = GlobalModel::seed(vec![0.0, 0.0]);
        let updates = vec![upd("a", vec![1.0, 2.0], 10), upd("b", vec![3.0, 0.0], 30)];
        let model = aggregate(AggregationMethod::FedAvg, 1, &seed, &updates).unwrap();
        assert_eq!(model.parameters, vec![2.5, 0.5]);
        assert_eq!(model.total_samples, 40);
        assert_eq!(model.contributing_devices.len(), 2);
        assert_eq!(model.round, 1);
    }

    #[test]
    fn fedavg_is_permutation_invariant() {
        let seed = GlobalModel::seed(vec![0.0; 3]);
        let base = vec![
            upd("d1", vec![0.1, 0.7, -3.3], 7),
            upd("d2", vec![0.2, 1e-9, 5.5], 13),
            upd("d3", vec![0.3, 0.31, 1e6], 1),
            upd("d4", vec![-0.4, 2.0 / 3.0, 0.01], 101),
        ];
        let expected = AggregationMethod::FedAvg.combine(&seed, &base).unwrap();
        let mut rev = base.clone();
        rev.reverse();
        let mut rot = base.clone();
        rot.rotate_left(2);
        for perm in [rev, rot] {
            let got = AggregationMethod::FedAvg.combine(&seed, &perm).unwrap();
            let bits: Vec<u64> = got.iter().map(|v| v.to_bits()).collect();
            let want: Vec<u64> = expected.iter().map(|v| v.to_bits()).collect();
            assert_eq!(bits, want);
        }
    }

    #[test]
    fn single_update_is_returned_exactly() {
        let seed = GlobalModel::seed(vec![0.0; 3]);
        let only = vec![upd("solo", vec![0.1, 0.2, 0.7], 3)];
        for method in [AggregationMethod::FedAvg, AggregationMethod::Mean, AggregationMethod::Median, AggregationMethod::TrimmedMean { trim_ratio: 0.2 }] {
            assert_eq!(method.combine(&seed, &only).unwrap(), vec![0.1, 0.2, 0.7], "{}", method.name());
        }
    }

    #[test]
    fn mean_ignores_sample_counts() {
        let seed = GlobalModel::seed(vec![0.0]);
        let updates = vec![upd("a", vec![1.0], 1), upd("b", vec![3.0], 1000)];
        assert_eq!(AggregationMethod::Mean.combine(&seed, &updates).unwrap(), vec![2.0]);
    }

    #[test]
    fn momentum_blends_previous_model() {
        let seed = GlobalModel::seed(vec![10.0]);
        let updates = vec![upd("a", vec![0.0], 5)];
        let out = AggregationMethod::Momentum { beta: 0.5 }.combine(&seed, &updates).unwrap();
        assert_eq!(out, vec![5.0]);
    }

    #[test]
    fn trimmed_mean_drops_outliers() {
        let seed = GlobalModel::seed(vec![0.0]);
        let updates = vec![
            upd("a", vec![1.0], 1),
            upd("b", vec![2.0], 1),
            upd("c", vec![3.0], 1),
            upd("d", vec![4.0], 1),
            upd("evil", vec![1000.0], 1),
        ];
        let out = AggregationMethod::TrimmedMean { trim_ratio: 0.2 }.combine(&seed, &updates).unwrap();
        assert_eq!(out, vec![3.0]);
    }

    #[test]
    fn trimmed_mean_keeps_at_least_one_value() {
        let mut col = [1.0, 2.0];
        assert_eq!(trimmed_mean(&mut col, 0.49), 1.5);
        let mut col = [1.0, 5.0, 9.0];
        assert_eq!(trimmed_mean(&mut col, 0.49), 5.0);
    }

    #[test]
    fn median_even_and_odd() {
        let seed = GlobalModel::seed(vec![0.0]);
        let odd = vec![upd("a", vec![9.0], 1), upd("b", vec![1.0], 1), upd("c", vec![4.0], 1)];
        assert_eq!(AggregationMethod::Median.combine(&seed, &odd).unwrap(), vec![4.0]);
        let even = vec![upd("a", vec![1.0], 1), upd("b", vec![2.0], 1), upd("c", vec![4.0], 1), upd("d", vec![100.0], 1)];
        assert_eq!(AggregationMethod::Median.combine(&seed, &even).unwrap(), vec![3.0]);
    }

    #[test]
    fn empty_and_mismatched_inputs_fail() {
        let seed = GlobalModel::seed(vec![0.0, 0.0]);
        assert_eq!(AggregationMethod::FedAvg.combine(&seed, &[]), Err(AggregationError::Empty));
        let bad = vec![upd("a", vec![1.0, 2.0], 1), upd("b", vec![1.0], 1)];
        assert!(matches!(AggregationMethod::FedAvg.combine(&seed, &bad), Err(AggregationError::ShapeMismatch { .. })));
    }

    #[test]
    fn overflow_is_reported_as_non_finite() {
        let seed = GlobalModel::seed(vec![0.0]);
        let updates = vec![upd("a", vec![f64::MAX], u64::MAX), upd("b", vec![f64::MAX], u64::MAX)];
        assert_eq!(AggregationMethod::FedAvg.combine(&seed, &updates), Err(AggregationError::NonFinite { index: 0 }));
    }

    #[test]
    fn validate_ranges() {
        assert!(AggregationMethod::Momentum { beta: 1.0 }.validate().is_err());
        assert!(AggregationMethod::TrimmedMean { trim_ratio: 0.5 }.validate().is_err());
        assert!(AggregationMethod::TrimmedMean { trim_ratio: 0.1 }.validate().is_ok());
    }

    #[test]
    fn consensus_of_aligned_vectors_is_one() {
        let updates = vec![upd("a", vec![1.0, 1.0], 1), upd("b", vec![2.0, 2.0], 1)];
        assert!((consensus_score(&updates) - 1.0).abs() < 1e-12);
        let orth = vec![upd("a", vec![1.0, 0.0], 1), upd("b", vec![0.0, 1.0], 1)];
        assert!(consensus_score(&orth).abs() < 1e-12);
        assert_eq!(consensus_score(&orth[..1]), 1.0);
    }

    #[test]
    fn method_serde_is_tagged() {
        let json = serde_json::to_string(&AggregationMethod::TrimmedMean { trim_ratio: 0.1 }).unwrap();
        assert_eq!(json, r#"{"method":"trimmed_mean","trim_ratio":0.1}"#);
        let back: AggregationMethod = serde_json::from_str(r#"{"method":"fed_avg"}"#).unwrap();
        assert_eq!(back, AggregationMethod::FedAvg);
    }
}
