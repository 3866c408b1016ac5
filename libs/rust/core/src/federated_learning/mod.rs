//! Federated learning module (round-based coordinator, ledger, aggregation, persistence)

pub mod aggregator;
pub mod coordinator;
pub mod error;
pub mod history;
pub mod ledger;
pub mod model;
pub mod persistence;
pub mod scheduler;
pub mod store;

pub use aggregator::{aggregate, consensus_score, AggregationMethod};
pub use coordinator::{
    CloseOutcome,
    EmptyRoundPolicy,
    RoundCoordinator,
    RoundPhase,
    RoundSettings,
    SettingsPatch,
    Status,
    SubmitReceipt,
};
pub use error::{AggregationError, Rejection, SettingsError, StoreError};
pub use history::{CloseTrigger, HistoryRange, RoundOutcome, RoundRecord};
pub use ledger::{Ack, UpdateLedger};
pub use model::{DeviceId, GlobalModel, LocalUpdate, ModelSummary, RoundId};
pub use persistence::{spawn_persistence, PersistCommand, PersistenceHandle};
pub use scheduler::RoundScheduler;
pub use store::{MemoryStore, ModelStore, Recovered, SledStore};
