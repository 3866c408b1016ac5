//! Background writer between the coordinator and a `ModelStore`.
//!
//! Published models and round records travel on their own unbounded lane: one pair
//! per closed round, and none may be lost. Archived local updates use a bounded lane
//! and are dropped (and counted) when it is full. The coordinator never waits on
//! either; the writer task owns all store I/O and retries with backoff.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::error::StoreError;
use super::history::RoundRecord;
use super::model::{GlobalModel, LocalUpdate};
use super::store::ModelStore;
use crate::metrics_ext::EXTENDED_METRICS;
use crate::resilience::{retry_async, RetryConfig};

#[derive(Debug, Clone)]
pub enum PersistCommand {
    Model(Arc<GlobalModel>),
    Record(RoundRecord),
    Update(LocalUpdate),
}

impl PersistCommand {
    fn kind(&self) -> &'static str {
        match self {
            PersistCommand::Model(_) => "model",
            PersistCommand::Record(_) => "record",
            PersistCommand::Update(_) => "update",
        }
    }
}

#[derive(Clone)]
pub struct PersistenceHandle {
    rounds: mpsc::UnboundedSender<PersistCommand>,
    archive: mpsc::Sender<PersistCommand>,
}

impl PersistenceHandle {
    /// Queues a write without waiting. Returns false when the document was dropped.
    ///
    /// Models and records are only refused once the writer has stopped.
    pub fn enqueue(&self, cmd: PersistCommand) -> bool {
        let kind = cmd.kind();
        let refused = match cmd {
            PersistCommand::Update(_) => match self.archive.try_send(cmd) {
                Ok(()) => None,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(kind, "persistence_queue_full");
                    Some("queue_full")
                }
                Err(mpsc::error::TrySendError::Closed(_)) => Some("writer_stopped"),
            },
            _ => self.rounds.send(cmd).err().map(|_| "writer_stopped"),
        };
        if let Some(reason) = refused {
            EXTENDED_METRICS.persistence.dropped_total.with_label_values(&[kind, reason]).inc();
        }
        refused.is_none()
    }
}

async fn apply(store: &dyn ModelStore, cmd: &PersistCommand) -> Result<(), StoreError> {
    match cmd {
        PersistCommand::Model(m) => store.save_model(m).await,
        PersistCommand::Record(r) => store.append_record(r).await,
        PersistCommand::Update(u) => store.save_update(u).await,
    }
}

struct Writer {
    store: Arc<dyn ModelStore>,
    rounds: mpsc::UnboundedReceiver<PersistCommand>,
    archive: mpsc::Receiver<PersistCommand>,
    retry: RetryConfig,
    shutdown: watch::Receiver<bool>,
}

impl Writer {
    async fn run(mut self) {
        let (mut rounds_open, mut archive_open) = (true, true);
        let mut interrupted = None;
        while rounds_open || archive_open {
            let cmd = tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                cmd = self.rounds.recv(), if rounds_open => match cmd {
                    Some(c) => c,
                    None => { rounds_open = false; continue }
                },
                cmd = self.archive.recv(), if archive_open => match cmd {
                    Some(c) => c,
                    None => { archive_open = false; continue }
                },
            };
            if !self.persist(&cmd).await {
                interrupted = Some(cmd);
                break;
            }
        }
        self.drain(interrupted).await;
        debug!("persistence_writer_stopped");
    }

    /// Retries `cmd` until it lands. Returns false if shutdown interrupted it.
    async fn persist(&mut self, cmd: &PersistCommand) -> bool {
        let kind = cmd.kind();
        loop {
            let store = self.store.as_ref();
            let attempt = retry_async(&self.retry, |_| apply(store, cmd));
            let res = tokio::select! {
                res = attempt => res,
                _ = self.shutdown.changed() => return false,
            };
            match res {
                Ok(()) => {
                    EXTENDED_METRICS.persistence.writes_total.with_label_values(&[kind]).inc();
                    debug!(kind, "persisted");
                    return true;
                }
                Err(e) => {
                    error!(kind, error = %e, "store_unavailable_backing_off");
                    tokio::select! {
                        _ = tokio::time::sleep(self.retry.max_delay) => {}
                        _ = self.shutdown.changed() => return false,
                    }
                }
            }
        }
    }

    /// Last pass: the interrupted document first, then round documents, then the archive.
    /// One attempt each; failures are dropped and counted.
    async fn drain(&mut self, interrupted: Option<PersistCommand>) {
        self.rounds.close();
        self.archive.close();
        let mut queued = Vec::new();
        queued.extend(interrupted);
        while let Ok(cmd) = self.rounds.try_recv() { queued.push(cmd); }
        while let Ok(cmd) = self.archive.try_recv() { queued.push(cmd); }
        let mut flushed = 0usize;
        for cmd in &queued {
            match apply(self.store.as_ref(), cmd).await {
                Ok(()) => {
                    EXTENDED_METRICS.persistence.writes_total.with_label_values(&[cmd.kind()]).inc();
                    flushed += 1;
                }
                Err(e) => {
                    EXTENDED_METRICS.persistence.dropped_total.with_label_values(&[cmd.kind(), "shutdown"]).inc();
                    warn!(kind = cmd.kind(), error = %e, "persistence_dropped_on_shutdown");
                }
            }
        }
        debug!(flushed, total = queued.len(), "persistence_queue_drained");
    }
}

/// Starts the writer; `archive_capacity` bounds the local-update lane only.
///
/// It exits once every `PersistenceHandle` is gone and both lanes are empty, or when
/// `shutdown` changes, after one last pass over whatever is still queued.
pub fn spawn_persistence(
    store: Arc<dyn ModelStore>,
    archive_capacity: usize,
    retry: RetryConfig,
    shutdown: watch::Receiver<bool>,
) -> (PersistenceHandle, JoinHandle<()>) {
    let (rounds_tx, rounds) = mpsc::unbounded_channel();
    let (archive_tx, archive) = mpsc::channel(archive_capacity.max(1));
    let writer = Writer { store, rounds, archive, retry, shutdown };
    let task = tokio::spawn(writer.run());
    (PersistenceHandle { rounds: rounds_tx, archive: archive_tx }, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federated_learning::store::MemoryStore;
    use std::time::Duration;

    fn fast_retry() -> RetryConfig {
        RetryConfig { max_retries: 2, base_delay: Duration::from_millis(5), max_delay: Duration::from_millis(20), jitter: 0.0 }
    }

    fn seed() -> PersistCommand { PersistCommand::Model(Arc::new(GlobalModel::seed(vec![4.0]))) }

    fn update(id: &str) -> PersistCommand { PersistCommand::Update(LocalUpdate::new(id, vec![1.0], 1, 1)) }

    #[tokio::test(start_paused = true)]
    async fn writes_survive_store_outage() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_writes(7); // more than one retry cycle
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (handle, task) = spawn_persistence(store.clone(), 8, fast_retry(), stop_rx);
        assert!(handle.enqueue(seed()));
        drop(handle);
        task.await.unwrap();
        assert_eq!(store.model(0).map(|m| m.parameters), Some(vec![4.0]));
    }

    #[tokio::test]
    async fn full_archive_drops_updates_but_keeps_models() {
        let store = Arc::new(MemoryStore::new());
        let (_stop_tx, stop_rx) = watch::channel(false);
        // Writer not yet polled: the archive lane fills immediately on a current-thread runtime.
        let (handle, task) = spawn_persistence(store.clone(), 1, fast_retry(), stop_rx);
        assert!(handle.enqueue(update("a")));
        assert!(!handle.enqueue(update("b")));
        for _ in 0..5 { assert!(handle.enqueue(seed())); }
        drop(handle);
        task.await.unwrap();
        assert_eq!(store.update_count(), 1);
        assert!(store.model(0).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_mid_retry_flushes_inflight_and_queued() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_writes(usize::MAX);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (handle, task) = spawn_persistence(store.clone(), 8, fast_retry(), stop_rx);
        assert!(handle.enqueue(seed()));
        assert!(handle.enqueue(update("a")));
        // writer is now stuck retrying the model
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.model(0).is_none());
        store.fail_next_writes(0);
        stop_tx.send_replace(true);
        task.await.unwrap();
        assert!(store.model(0).is_some());
        assert_eq!(store.update_count(), 1);
    }
}
