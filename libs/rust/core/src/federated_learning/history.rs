//! Append-only log of closed rounds.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::aggregator::AggregationMethod;
use super::model::{DeviceId, GlobalModel, RoundId};

/// What started a close attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseTrigger {
    Scheduled,
    Threshold,
    Manual,
}

impl CloseTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseTrigger::Scheduled => "scheduled",
            CloseTrigger::Threshold => "threshold",
            CloseTrigger::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundOutcome {
    /// New model published.
    Aggregated,
    /// No contributions; previous model kept.
    Empty,
    /// Aggregation failed; previous model kept.
    Failed,
}

impl RoundOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundOutcome::Aggregated => "aggregated",
            RoundOutcome::Empty => "empty",
            RoundOutcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub round: RoundId,
    pub outcome: RoundOutcome,
    pub trigger: CloseTrigger,
    pub contributing_devices: BTreeSet<DeviceId>,
    pub total_samples: u64,
    pub strategy: AggregationMethod,
    /// Mean pairwise cosine similarity of the contributions, when any.
    pub consensus: Option<f64>,
    /// Round of the model that was current once this round closed.
    pub model_round: RoundId,
    pub model_checksum: String,
    pub closed_at: DateTime<Utc>,
    pub error: Option<String>,
}

/// Inclusive round filter for history queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct HistoryRange {
    pub from: Option<RoundId>,
    pub to: Option<RoundId>,
    /// Keep only the newest `limit` records of the range.
    pub limit: Option<usize>,
}

impl HistoryRange {
    fn bounds(&self) -> RangeInclusive<RoundId> { self.from.unwrap_or(0)..=self.to.unwrap_or(RoundId::MAX) }
}

#[derive(Default)]
struct Log {
    records: Vec<RoundRecord>,
    models: BTreeMap<RoundId, Arc<GlobalModel>>,
    contributions: BTreeMap<DeviceId, u64>,
}

#[derive(Default)]
pub struct History {
    log: RwLock<Log>,
}

impl History {
    pub fn new() -> Self { Self::default() }

    /// Rebuilds the log from persisted records and models.
    pub fn restore(records: Vec<RoundRecord>, models: Vec<GlobalModel>) -> Self {
        let mut log = Log::default();
        for m in models { log.models.insert(m.round, Arc::new(m)); }
        for r in records { Self::append_locked(&mut log, r); }
        log.records.sort_by_key(|r| r.round);
        Self { log: RwLock::new(log) }
    }

    pub fn append(&self, record: RoundRecord, model: Option<Arc<GlobalModel>>) {
        let mut log = self.log.write();
        if let Some(m) = model { log.models.insert(m.round, m); }
        Self::append_locked(&mut log, record);
    }

    /// Keeps a model addressable by round without adding a record (the seed, or a restored model).
    pub fn remember(&self, model: Arc<GlobalModel>) { self.log.write().models.entry(model.round).or_insert(model); }

    fn append_locked(log: &mut Log, record: RoundRecord) {
        if record.outcome == RoundOutcome::Aggregated {
            for d in &record.contributing_devices { *log.contributions.entry(d.clone()).or_default() += 1; }
        }
        log.records.push(record);
    }

    pub fn records(&self, range: HistoryRange) -> Vec<RoundRecord> {
        let log = self.log.read();
        let bounds = range.bounds();
        let matched: Vec<&RoundRecord> = log.records.iter().filter(|r| bounds.contains(&r.round)).collect();
        let skip = range.limit.map(|l| matched.len().saturating_sub(l)).unwrap_or(0);
        matched.into_iter().skip(skip).cloned().collect()
    }

    pub fn model_at(&self, round: RoundId) -> Option<Arc<GlobalModel>> { self.log.read().models.get(&round).cloned() }

    pub fn len(&self) -> usize { self.log.read().records.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Rounds each device has contributed to an aggregated model.
    pub fn contributions(&self) -> BTreeMap<DeviceId, u64> { self.log.read().contributions.clone() }
}
