//! Per-round holding area for local updates that have not been aggregated yet.

use std::collections::BTreeMap;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

use super::error::Rejection;
use super::model::{DeviceId, LocalUpdate, RoundId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Ack {
    pub round: RoundId,
    /// Distinct devices with an entry in the open round after this write.
    pub pending: usize,
    /// True when an earlier entry from the same device was overwritten.
    pub replaced: bool,
}

/// Frozen contents of a round, taken atomically with the switch to the next one.
#[derive(Debug)]
pub struct RoundSnapshot {
    pub round: RoundId,
    pub opened_at: Instant,
    pub entries: BTreeMap<DeviceId, LocalUpdate>,
}

impl RoundSnapshot {
    pub fn into_updates(self) -> Vec<LocalUpdate> { self.entries.into_values().collect() }
}

#[derive(Debug)]
struct OpenRound {
    round: RoundId,
    opened_at: Instant,
    entries: BTreeMap<DeviceId, LocalUpdate>,
}

pub struct UpdateLedger {
    dimension: usize,
    open: Mutex<OpenRound>,
}

impl UpdateLedger {
    pub fn new(dimension: usize, round: RoundId) -> Self {
        Self { dimension, open: Mutex::new(OpenRound { round, opened_at: Instant::now(), entries: BTreeMap::new() }) }
    }

    pub fn dimension(&self) -> usize { self.dimension }

    pub fn submit(&self, update: LocalUpdate) -> Result<Ack, Rejection> {
        // Shape checks need no lock.
        if update.parameters.len() != self.dimension {
            return Err(Rejection::ShapeMismatch { expected: self.dimension, actual: update.parameters.len() });
        }
        if update.sample_count == 0 { return Err(Rejection::InvalidSampleCount); }
        if let Some(index) = update.parameters.iter().position(|v| !v.is_finite()) {
            return Err(Rejection::NonFiniteParameters { index });
        }
        let mut open = self.open.lock();
        if update.round != open.round {
            return Err(Rejection::StaleRound { submitted: update.round, open: open.round });
        }
        let replaced = open.entries.insert(update.device_id.clone(), update).is_some();
        Ok(Ack { round: open.round, pending: open.entries.len(), replaced })
    }

    /// Takes every entry of the open round and opens the next one in the same critical section.
    pub fn snapshot_and_advance(&self) -> RoundSnapshot {
        let mut open = self.open.lock();
        let next = OpenRound { round: open.round + 1, opened_at: Instant::now(), entries: BTreeMap::new() };
        let closed = std::mem::replace(&mut *open, next);
        RoundSnapshot { round: closed.round, opened_at: closed.opened_at, entries: closed.entries }
    }

    pub fn open_round(&self) -> RoundId { self.open.lock().round }

    pub fn pending(&self) -> usize { self.open.lock().entries.len() }

    /// Round number and how long it has been open.
    pub fn round_age(&self) -> (RoundId, std::time::Duration) {
        let open = self.open.lock();
        (open.round, open.opened_at.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn last_write_wins_per_device() {
        let ledger = UpdateLedger::new(2, 1);
        let first = ledger.submit(LocalUpdate::new("a", vec![1.0, 1.0], 5, 1)).unwrap();
        assert!(!first.replaced);
        let second = ledger.submit(LocalUpdate::new("a", vec![9.0, 9.0], 7, 1)).unwrap();
        assert!(second.replaced);
        assert_eq!(second.pending, 1);
        let snap = ledger.snapshot_and_advance();
        assert_eq!(snap.entries.len(), 1);
        assert_eq!(snap.entries["a"].parameters, vec![9.0, 9.0]);
        assert_eq!(snap.entries["a"].sample_count, 7);
    }

    #[test]
    fn rejects_wrong_round_and_shape() {
        let ledger = UpdateLedger::new(2, 3);
        assert_eq!(ledger.submit(LocalUpdate::new("a", vec![1.0, 1.0], 5, 2)), Err(Rejection::StaleRound { submitted: 2, open: 3 }));
        assert_eq!(ledger.submit(LocalUpdate::new("a", vec![1.0], 5, 3)), Err(Rejection::ShapeMismatch { expected: 2, actual: 1 }));
        assert_eq!(ledger.submit(LocalUpdate::new("a", vec![1.0, 1.0], 0, 3)), Err(Rejection::InvalidSampleCount));
        assert_eq!(ledger.submit(LocalUpdate::new("a", vec![1.0, f64::NAN], 1, 3)), Err(Rejection::NonFiniteParameters { index: 1 }));
        assert_eq!(ledger.pending(), 0);
    }

    #[test]
    fn snapshot_opens_next_round() {
        let ledger = UpdateLedger::new(1, 1);
        ledger.submit(LocalUpdate::new("a", vec![1.0], 1, 1)).unwrap();
        let snap = ledger.snapshot_and_advance();
        assert_eq!(snap.round, 1);
        assert_eq!(ledger.open_round(), 2);
        assert_eq!(ledger.pending(), 0);
        // late submission for the closed round is classified, not lost silently
        assert!(matches!(ledger.submit(LocalUpdate::new("b", vec![1.0], 1, 1)), Err(Rejection::StaleRound { .. })));
        assert!(ledger.submit(LocalUpdate::new("b", vec![1.0], 1, 2)).is_ok());
    }

    #[test]
    fn concurrent_submissions_during_snapshot_are_accounted() {
        let ledger = Arc::new(UpdateLedger::new(1, 1));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    let mut outcomes = Vec::new();
                    for i in 0..200 {
                        let id = format!("t{t}-d{i}");
                        outcomes.push((id.clone(), ledger.submit(LocalUpdate::new(id, vec![1.0], 1, 1)).is_ok()));
                    }
                    outcomes
                })
            })
            .collect();
        std::thread::sleep(std::time::Duration::from_millis(1));
        let snap = ledger.snapshot_and_advance();
        let mut accepted = 0;
        for h in handles {
            for (id, ok) in h.join().unwrap() {
                // every acknowledged update is in the snapshot; every other one was refused as stale
                assert_eq!(ok, snap.entries.contains_key(&id));
                if ok { accepted += 1; }
            }
        }
        assert_eq!(accepted, snap.entries.len());
    }
}
