//! Round coordinator: owns the round state machine and the published model.
//!
//! Submissions go straight to the [`UpdateLedger`] under its own short lock. Closing a
//! round is serialized by a separate transition guard that concurrent triggers
//! `try_lock`, so a scheduler tick, a threshold crossing and a manual trigger that
//! race each other collapse into a single closure. The ledger snapshot and the switch
//! to the next round happen in one step; aggregation then runs against the frozen
//! snapshot while new submissions already land in the next round.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::aggregator::{aggregate, consensus_score, AggregationMethod};
use super::error::{Rejection, SettingsError};
use super::history::{CloseTrigger, History, HistoryRange, RoundOutcome, RoundRecord};
use super::ledger::UpdateLedger;
use super::model::{DeviceId, GlobalModel, LocalUpdate, RoundId};
use super::persistence::{PersistCommand, PersistenceHandle};
use super::store::Recovered;
use crate::metrics_ext::EXTENDED_METRICS;

/// What to do when a close is attempted on a round nobody contributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyRoundPolicy {
    /// Close it anyway: the round number advances and the previous model stays current.
    #[default]
    Advance,
    /// Leave the round open until someone contributes.
    Extend,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoundSettings {
    pub min_devices: usize,
    /// When set, reaching `min_devices` no longer closes the round.
    pub manual_mode: bool,
    pub strategy: AggregationMethod,
    pub empty_round_policy: EmptyRoundPolicy,
}

impl Default for RoundSettings {
    fn default() -> Self {
        Self {
            min_devices: 5,
            manual_mode: false,
            strategy: AggregationMethod::FedAvg,
            empty_round_policy: EmptyRoundPolicy::Advance,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SettingsPatch {
    pub min_devices: Option<usize>,
    pub manual_mode: Option<bool>,
    pub strategy: Option<AggregationMethod>,
    pub empty_round_policy: Option<EmptyRoundPolicy>,
}

impl From<RoundSettings> for SettingsPatch {
    fn from(s: RoundSettings) -> Self {
        Self {
            min_devices: Some(s.min_devices),
            manual_mode: Some(s.manual_mode),
            strategy: Some(s.strategy),
            empty_round_policy: Some(s.empty_round_policy),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitReceipt {
    pub accepted: bool,
    /// Round the update landed in, or the open round when rejected.
    pub round: RoundId,
    pub pending: usize,
    pub reason: Option<Rejection>,
}

/// Result of one close attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CloseOutcome {
    Aggregated { round: RoundId, devices: usize, total_samples: u64 },
    /// Zero contributions; round advanced, previous model kept.
    Empty { round: RoundId },
    /// Aggregation failed; round advanced, previous model kept.
    Failed { round: RoundId, error: String },
    /// Zero contributions under [`EmptyRoundPolicy::Extend`]; round left open.
    Extended { round: RoundId },
    /// The round this attempt targeted had already been closed.
    Superseded { expected: RoundId, open: RoundId },
    /// Another close was in progress; this attempt was folded into it.
    Busy,
}

impl CloseOutcome {
    /// True when this call closed a round.
    pub fn closed_round(&self) -> Option<RoundId> {
        match self {
            CloseOutcome::Aggregated { round, .. }
            | CloseOutcome::Empty { round }
            | CloseOutcome::Failed { round, .. } => Some(*round),
            _ => None,
        }
    }

    fn skip_reason(&self) -> &'static str {
        match self {
            CloseOutcome::Extended { .. } => "extended",
            CloseOutcome::Superseded { .. } => "superseded",
            CloseOutcome::Busy => "busy",
            _ => "closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    Open,
    Closing,
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub current_round: RoundId,
    /// How long the open round has been accepting updates.
    pub open_round_age_ms: u64,
    pub phase: RoundPhase,
    pub open_round_device_count: usize,
    pub min_devices_required: usize,
    pub manual_mode: bool,
    pub strategy: AggregationMethod,
    pub empty_round_policy: EmptyRoundPolicy,
    pub model_round: RoundId,
    pub model_dimension: usize,
    pub last_aggregation_time: Option<DateTime<Utc>>,
    pub rounds_closed: usize,
    pub unique_devices: usize,
    pub device_contributions: BTreeMap<DeviceId, u64>,
}

pub struct RoundCoordinator {
    ledger: UpdateLedger,
    published: ArcSwap<GlobalModel>,
    history: History,
    settings: RwLock<RoundSettings>,
    transition: Mutex<()>,
    closing: AtomicBool,
    last_aggregation: RwLock<Option<DateTime<Utc>>>,
    threshold_tx: watch::Sender<Option<RoundId>>,
    persistence: Option<PersistenceHandle>,
    persist_updates: bool,
}

impl RoundCoordinator {
    /// Fresh coordinator with round 0 seeded from `seed` (zeros when `None`); round 1 opens.
    pub fn new(dimension: usize, seed: Option<Vec<f64>>, settings: RoundSettings) -> anyhow::Result<Self> {
        let parameters = seed.unwrap_or_else(|| vec![0.0; dimension]);
        if parameters.len() != dimension {
            anyhow::bail!("seed has {} parameters, expected {}", parameters.len(), dimension);
        }
        Ok(Self::assemble(dimension, GlobalModel::seed(parameters), History::new(), 1, settings))
    }

    /// Resumes from stored state; falls back to [`RoundCoordinator::new`] when the store is empty.
    pub fn restore(dimension: usize, seed: Option<Vec<f64>>, settings: RoundSettings, recovered: Recovered) -> anyhow::Result<Self> {
        let Some(latest) = recovered.latest_model().cloned() else { return Self::new(dimension, seed, settings) };
        if latest.dimension() != dimension {
            anyhow::bail!(
                "stored model round {} has {} parameters, configured dimension is {}",
                latest.round,
                latest.dimension(),
                dimension
            );
        }
        let last_closed = recovered.records.iter().map(|r| r.round).max().unwrap_or(0).max(latest.round);
        let last_agg = recovered.records.iter().filter(|r| r.outcome == RoundOutcome::Aggregated).map(|r| r.closed_at).max();
        info!(model_round = latest.round, open_round = last_closed + 1, records = recovered.records.len(), "coordinator_restored");
        let history = History::restore(recovered.records, recovered.models);
        let coordinator = Self::assemble(dimension, latest, history, last_closed + 1, settings);
        *coordinator.last_aggregation.write() = last_agg;
        Ok(coordinator)
    }

    fn assemble(dimension: usize, model: GlobalModel, history: History, open_round: RoundId, settings: RoundSettings) -> Self {
        let (threshold_tx, _) = watch::channel(None);
        EXTENDED_METRICS.fl.open_round.set(open_round as i64);
        let model = Arc::new(model);
        history.remember(model.clone());
        Self {
            ledger: UpdateLedger::new(dimension, open_round),
            published: ArcSwap::new(model),
            history,
            settings: RwLock::new(settings),
            transition: Mutex::new(()),
            closing: AtomicBool::new(false),
            last_aggregation: RwLock::new(None),
            threshold_tx,
            persistence: None,
            persist_updates: false,
        }
    }

    /// Routes published models, round records and (optionally) accepted updates to a store writer.
    pub fn with_persistence(mut self, handle: PersistenceHandle, persist_updates: bool) -> Self {
        if self.history.is_empty() {
            // fresh start: make the seed recoverable too
            handle.enqueue(PersistCommand::Model(self.published.load_full()));
        }
        self.persistence = Some(handle);
        self.persist_updates = persist_updates;
        self
    }

    pub fn submit_update(&self, device_id: impl Into<DeviceId>, parameters: Vec<f64>, sample_count: u64, round: RoundId) -> SubmitReceipt {
        self.submit(LocalUpdate::new(device_id, parameters, sample_count, round))
    }

    pub fn submit(&self, update: LocalUpdate) -> SubmitReceipt {
        let metrics = &EXTENDED_METRICS.fl;
        let device_id = update.device_id.clone();
        let archived = if self.persist_updates && self.persistence.is_some() { Some(update.clone()) } else { None };
        match self.ledger.submit(update) {
            Ok(ack) => {
                metrics.updates_accepted_total.inc();
                metrics.pending_devices.set(ack.pending as i64);
                debug!(device_id = %device_id, round = ack.round, pending = ack.pending, replaced = ack.replaced, "update_accepted");
                if let (Some(u), Some(p)) = (archived, &self.persistence) { p.enqueue(PersistCommand::Update(u)); }
                let settings = *self.settings.read();
                if !settings.manual_mode && ack.pending >= settings.min_devices {
                    self.threshold_tx.send_replace(Some(ack.round));
                }
                SubmitReceipt { accepted: true, round: ack.round, pending: ack.pending, reason: None }
            }
            Err(rejection) => {
                metrics.updates_rejected_total.with_label_values(&[rejection.reason()]).inc();
                match &rejection {
                    Rejection::StaleRound { .. } => debug!(device_id = %device_id, %rejection, "update_rejected"),
                    _ => warn!(device_id = %device_id, %rejection, "update_rejected"),
                }
                let (round, pending) = (self.ledger.open_round(), self.ledger.pending());
                SubmitReceipt { accepted: false, round, pending, reason: Some(rejection) }
            }
        }
    }

    /// Same entry point as a scheduler tick, aimed at the round open when the call arrives.
    /// Racing another close (manual or scheduled) yields `Busy` or `Superseded`, never a second closure.
    pub fn trigger_aggregation_now(&self) -> CloseOutcome {
        let open = self.ledger.open_round();
        self.close_round(CloseTrigger::Manual, Some(open))
    }

    /// Attempts the OPEN → CLOSING → CLOSED transition.
    ///
    /// `expected` names the round the caller wants closed; if a different round is open the
    /// call is a no-op. `None` targets the currently open round.
    pub fn close_round(&self, trigger: CloseTrigger, expected: Option<RoundId>) -> CloseOutcome {
        let outcome = match self.transition.try_lock() {
            Some(_guard) => self.close_locked(trigger, expected),
            None => CloseOutcome::Busy,
        };
        if outcome.closed_round().is_none() {
            EXTENDED_METRICS.fl.close_attempts_skipped_total.with_label_values(&[outcome.skip_reason()]).inc();
            debug!(trigger = trigger.as_str(), ?outcome, "close_attempt_skipped");
        }
        outcome
    }

    fn close_locked(&self, trigger: CloseTrigger, expected: Option<RoundId>) -> CloseOutcome {
        let open = self.ledger.open_round();
        if let Some(expected) = expected {
            if expected != open { return CloseOutcome::Superseded { expected, open }; }
        }
        let settings = *self.settings.read();
        if settings.empty_round_policy == EmptyRoundPolicy::Extend && self.ledger.pending() == 0 {
            return CloseOutcome::Extended { round: open };
        }

        self.closing.store(true, Ordering::SeqCst);
        let snapshot = self.ledger.snapshot_and_advance();
        let round = snapshot.round;
        let round_age = snapshot.opened_at.elapsed();
        EXTENDED_METRICS.fl.open_round.set(round as i64 + 1);
        EXTENDED_METRICS.fl.pending_devices.set(0);

        let previous = self.published.load_full();
        let updates = snapshot.into_updates();
        let mut record = RoundRecord {
            round,
            outcome: RoundOutcome::Empty,
            trigger,
            contributing_devices: updates.iter().map(|u| u.device_id.clone()).collect(),
            total_samples: updates.iter().fold(0u64, |acc, u| acc.saturating_add(u.sample_count)),
            strategy: settings.strategy,
            consensus: None,
            model_round: previous.round,
            model_checksum: previous.checksum.clone(),
            closed_at: Utc::now(),
            error: None,
        };

        let (outcome, published) = if updates.is_empty() {
            info!(round, trigger = trigger.as_str(), "round_closed_empty");
            (CloseOutcome::Empty { round }, None)
        } else {
            let started = Instant::now();
            let result = aggregate(settings.strategy, round, &previous, &updates);
            EXTENDED_METRICS.fl.aggregation_latency_ms.observe(started.elapsed().as_secs_f64() * 1000.0);
            record.consensus = Some(consensus_score(&updates));
            match result {
                Ok(model) => {
                    let model = Arc::new(model);
                    self.published.store(model.clone());
                    *self.last_aggregation.write() = Some(model.created_at);
                    record.outcome = RoundOutcome::Aggregated;
                    record.model_round = model.round;
                    record.model_checksum = model.checksum.clone();
                    EXTENDED_METRICS.fl.participants_total.inc_by(updates.len() as u64);
                    info!(
                        round,
                        trigger = trigger.as_str(),
                        strategy = settings.strategy.name(),
                        devices = updates.len(),
                        total_samples = record.total_samples,
                        round_age_ms = round_age.as_millis() as u64,
                        "round_aggregated"
                    );
                    (CloseOutcome::Aggregated { round, devices: updates.len(), total_samples: record.total_samples }, Some(model))
                }
                Err(e) => {
                    warn!(round, trigger = trigger.as_str(), error = %e, "round_aggregation_failed");
                    record.outcome = RoundOutcome::Failed;
                    record.error = Some(e.to_string());
                    (CloseOutcome::Failed { round, error: e.to_string() }, None)
                }
            }
        };

        EXTENDED_METRICS.fl.rounds_total.with_label_values(&[record.outcome.as_str(), trigger.as_str()]).inc();
        self.history.append(record.clone(), published.clone());
        // Enqueued only after the model is current.
        if let Some(p) = &self.persistence {
            if let Some(model) = published { p.enqueue(PersistCommand::Model(model)); }
            p.enqueue(PersistCommand::Record(record));
        }
        self.closing.store(false, Ordering::SeqCst);
        outcome
    }

    /// Latest published model. Lock-free; never waits on a closing round.
    pub fn current_model(&self) -> Arc<GlobalModel> { self.published.load_full() }

    /// Model published by `round`, including the seed at round 0.
    pub fn model_at(&self, round: RoundId) -> Option<Arc<GlobalModel>> {
        let current = self.published.load_full();
        if current.round == round { return Some(current); }
        self.history.model_at(round)
    }

    pub fn history(&self, range: HistoryRange) -> Vec<RoundRecord> { self.history.records(range) }

    pub fn current_round(&self) -> RoundId { self.ledger.open_round() }

    pub fn dimension(&self) -> usize { self.ledger.dimension() }

    pub fn settings(&self) -> RoundSettings { *self.settings.read() }

    pub fn update_settings(&self, patch: SettingsPatch) -> Result<RoundSettings, SettingsError> {
        if patch.min_devices == Some(0) { return Err(SettingsError::MinDevices); }
        if let Some(s) = &patch.strategy { s.validate().map_err(SettingsError::Strategy)?; }
        let updated = {
            let mut s = self.settings.write();
            if let Some(v) = patch.min_devices { s.min_devices = v; }
            if let Some(v) = patch.manual_mode { s.manual_mode = v; }
            if let Some(v) = patch.strategy { s.strategy = v; }
            if let Some(v) = patch.empty_round_policy { s.empty_round_policy = v; }
            *s
        };
        info!(
            min_devices = updated.min_devices,
            manual_mode = updated.manual_mode,
            strategy = updated.strategy.name(),
            "round_settings_updated"
        );
        // A lowered threshold may already be met by the open round.
        self.notify_if_threshold_met();
        Ok(updated)
    }

    fn notify_if_threshold_met(&self) {
        let settings = *self.settings.read();
        let (round, pending) = (self.ledger.open_round(), self.ledger.pending());
        if !settings.manual_mode && pending > 0 && pending >= settings.min_devices {
            self.threshold_tx.send_replace(Some(round));
        }
    }

    #[cfg(test)]
    pub(crate) fn hold_transition(&self) -> parking_lot::MutexGuard<'_, ()> { self.transition.lock() }

    /// Notified with the round number whenever the open round reaches the device threshold.
    pub fn subscribe_threshold(&self) -> watch::Receiver<Option<RoundId>> { self.threshold_tx.subscribe() }

    pub fn status(&self) -> Status {
        let settings = *self.settings.read();
        let model = self.published.load();
        let contributions = self.history.contributions();
        let (current_round, open_for) = self.ledger.round_age();
        Status {
            current_round,
            open_round_age_ms: open_for.as_millis() as u64,
            phase: if self.closing.load(Ordering::SeqCst) { RoundPhase::Closing } else { RoundPhase::Open },
            open_round_device_count: self.ledger.pending(),
            min_devices_required: settings.min_devices,
            manual_mode: settings.manual_mode,
            strategy: settings.strategy,
            empty_round_policy: settings.empty_round_policy,
            model_round: model.round,
            model_dimension: model.dimension(),
            last_aggregation_time: *self.last_aggregation.read(),
            rounds_closed: self.history.len(),
            unique_devices: contributions.len(),
            device_contributions: contributions,
        }
    }
}
