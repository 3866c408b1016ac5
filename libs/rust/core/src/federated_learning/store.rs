//! Durable storage boundary for published models, round records and archived updates.
//!
//! The coordinator never talks to a store inside a round transition; writes go
//! through the persistence queue and reads only happen at startup.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use sled::Db;

use super::error::StoreError;
use super::history::RoundRecord;
use super::model::{DeviceId, GlobalModel, LocalUpdate, RoundId};

/// Everything needed to resume after a restart.
#[derive(Debug, Default)]
pub struct Recovered {
    pub models: Vec<GlobalModel>,
    pub records: Vec<RoundRecord>,
}

impl Recovered {
    pub fn latest_model(&self) -> Option<&GlobalModel> { self.models.iter().max_by_key(|m| m.round) }
}

#[async_trait]
pub trait ModelStore: Send + Sync {
    async fn save_model(&self, model: &GlobalModel) -> Result<(), StoreError>;
    async fn append_record(&self, record: &RoundRecord) -> Result<(), StoreError>;
    async fn save_update(&self, update: &LocalUpdate) -> Result<(), StoreError>;
    async fn load(&self) -> Result<Recovered, StoreError>;
}

#[derive(Default)]
struct Documents {
    models: BTreeMap<RoundId, GlobalModel>,
    records: BTreeMap<RoundId, RoundRecord>,
    updates: BTreeMap<(RoundId, DeviceId), LocalUpdate>,
}

/// In-process store. Used when no durable backend is configured and in tests.
#[derive(Default)]
pub struct MemoryStore {
    docs: RwLock<Documents>,
    fail_next: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    /// Makes the next `n` writes fail with `StoreError::Unavailable`.
    pub fn fail_next_writes(&self, n: usize) { self.fail_next.store(n, Ordering::SeqCst); }

    fn check_available(&self) -> Result<(), StoreError> {
        let injected = self.fail_next.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok();
        if injected { return Err(StoreError::Unavailable("injected failure".into())); }
        Ok(())
    }

    pub fn model(&self, round: RoundId) -> Option<GlobalModel> { self.docs.read().models.get(&round).cloned() }
    pub fn record_count(&self) -> usize { self.docs.read().records.len() }
    pub fn update_count(&self) -> usize { self.docs.read().updates.len() }
}

#[async_trait]
impl ModelStore for MemoryStore {
    async fn save_model(&self, model: &GlobalModel) -> Result<(), StoreError> {
        self.check_available()?;
        self.docs.write().models.insert(model.round, model.clone());
        Ok(())
    }

    async fn append_record(&self, record: &RoundRecord) -> Result<(), StoreError> {
        self.check_available()?;
        self.docs.write().records.insert(record.round, record.clone());
        Ok(())
    }

    async fn save_update(&self, update: &LocalUpdate) -> Result<(), StoreError> {
        self.check_available()?;
        self.docs.write().updates.insert((update.round, update.device_id.clone()), update.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Recovered, StoreError> {
        let docs = self.docs.read();
        Ok(Recovered { models: docs.models.values().cloned().collect(), records: docs.records.values().cloned().collect() })
    }
}

/// sled-backed document store: JSON values in `models`, `history` and `updates` trees,
/// keyed by big-endian round number so iteration order is round order.
#[derive(Clone)]
pub struct SledStore {
    db: Db,
    models: sled::Tree,
    history: sled::Tree,
    updates: sled::Tree,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        let models = db.open_tree("models")?;
        let history = db.open_tree("history")?;
        let updates = db.open_tree("updates")?;
        Ok(Self { db, models, history, updates })
    }

    fn update_key(round: RoundId, device_id: &str) -> Vec<u8> {
        let mut key = round.to_be_bytes().to_vec();
        key.extend_from_slice(device_id.as_bytes());
        key
    }
}

#[async_trait]
impl ModelStore for SledStore {
    async fn save_model(&self, model: &GlobalModel) -> Result<(), StoreError> {
        self.models.insert(model.round.to_be_bytes(), serde_json::to_vec(model)?)?;
        self.db.flush_async().await?;
        Ok(())
    }

    async fn append_record(&self, record: &RoundRecord) -> Result<(), StoreError> {
        self.history.insert(record.round.to_be_bytes(), serde_json::to_vec(record)?)?;
        self.db.flush_async().await?;
        Ok(())
    }

    async fn save_update(&self, update: &LocalUpdate) -> Result<(), StoreError> {
        self.updates.insert(Self::update_key(update.round, &update.device_id), serde_json::to_vec(update)?)?;
        Ok(())
    }

    async fn load(&self) -> Result<Recovered, StoreError> {
        let mut out = Recovered::default();
        for kv in self.models.iter() {
            let (_, v) = kv?;
            out.models.push(serde_json::from_slice(&v)?);
        }
        for kv in self.history.iter() {
            let (_, v) = kv?;
            out.records.push(serde_json::from_slice(&v)?);
        }
        Ok(out)
    }
}
