//! Drives round closure from two sources: a fixed interval and the device threshold.
//!
//! A tick only closes the round that was already open at the previous tick. When a
//! threshold (or manual) close happened in between, the tick re-arms on the new round
//! instead of cutting it short, so every round gets at least one full interval unless
//! the threshold closes it first.
//!
//! A threshold close that finds another transition in progress is retried shortly after,
//! since the notification that asked for it has already been consumed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::coordinator::{CloseOutcome, RoundCoordinator};
use super::history::CloseTrigger;
use super::model::RoundId;

const BUSY_RETRY: Duration = Duration::from_millis(10);

pub struct RoundScheduler {
    coordinator: Arc<RoundCoordinator>,
    interval: Duration,
    threshold: watch::Receiver<Option<RoundId>>,
}

impl RoundScheduler {
    /// Subscribes to threshold notifications immediately; crossings after this call are not missed.
    pub fn new(coordinator: Arc<RoundCoordinator>, interval: Duration) -> Self {
        let threshold = coordinator.subscribe_threshold();
        Self { coordinator, interval: interval.max(Duration::from_millis(1)), threshold }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> { tokio::spawn(self.run(shutdown)) }

    /// Runs until `shutdown` flips to true or its sender is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut armed = self.coordinator.current_round();
        let mut retry: Option<RoundId> = None;
        info!(interval_secs = self.interval.as_secs_f64(), round = armed, "round_scheduler_started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let open = self.coordinator.current_round();
                    if open != armed {
                        debug!(armed, open, "tick_rearmed_after_early_close");
                        armed = open;
                        continue;
                    }
                    let outcome = self.coordinator.close_round(CloseTrigger::Scheduled, Some(armed));
                    log_outcome(CloseTrigger::Scheduled, &outcome);
                    armed = self.coordinator.current_round();
                }
                changed = self.threshold.changed() => {
                    if changed.is_err() { break; }
                    let target = *self.threshold.borrow_and_update();
                    let Some(round) = target else { continue };
                    retry = self.close_on_threshold(round);
                }
                _ = tokio::time::sleep(BUSY_RETRY), if retry.is_some() => {
                    if let Some(round) = retry.take() {
                        retry = self.close_on_threshold(round);
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() { break; }
                }
            }
        }
        info!(round = self.coordinator.current_round(), "round_scheduler_stopped");
    }

    /// Returns the round again when the attempt lost the transition guard.
    fn close_on_threshold(&self, round: RoundId) -> Option<RoundId> {
        if self.coordinator.settings().manual_mode { return None; }
        let outcome = self.coordinator.close_round(CloseTrigger::Threshold, Some(round));
        log_outcome(CloseTrigger::Threshold, &outcome);
        (outcome == CloseOutcome::Busy).then_some(round)
    }
}

fn log_outcome(trigger: CloseTrigger, outcome: &CloseOutcome) {
    match outcome.closed_round() {
        Some(round) => debug!(trigger = trigger.as_str(), round, "scheduler_closed_round"),
        None => debug!(trigger = trigger.as_str(), ?outcome, "scheduler_close_skipped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federated_learning::coordinator::RoundSettings;
    use crate::federated_learning::history::HistoryRange;

    fn coordinator(min_devices: usize) -> Arc<RoundCoordinator> {
        Arc::new(RoundCoordinator::new(1, None, RoundSettings { min_devices, ..Default::default() }).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn interval_closes_open_round() {
        let c = coordinator(5);
        let (_stop, stop_rx) = watch::channel(false);
        let _task = RoundScheduler::new(c.clone(), Duration::from_secs(10)).spawn(stop_rx);
        c.submit_update("a", vec![3.0], 4, 1);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(c.current_round(), 2);
        assert_eq!(c.current_model().parameters, vec![3.0]);
        // nothing submitted in round 2: the next tick closes it as empty
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(c.current_round(), 3);
        let records = c.history(HistoryRange::default());
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.trigger == CloseTrigger::Scheduled));
        assert_eq!(c.current_model().round, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn threshold_closes_without_waiting_for_tick() {
        let c = coordinator(2);
        let (_stop, stop_rx) = watch::channel(false);
        let _task = RoundScheduler::new(c.clone(), Duration::from_secs(3600)).spawn(stop_rx);
        c.submit_update("a", vec![1.0], 1, 1);
        c.submit_update("b", vec![3.0], 1, 1);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(c.current_round(), 2);
        assert_eq!(c.history(HistoryRange::default())[0].trigger, CloseTrigger::Threshold);
        assert_eq!(c.current_model().parameters, vec![2.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_after_early_close_rearms_instead_of_closing() {
        let c = coordinator(2);
        let (_stop, stop_rx) = watch::channel(false);
        let _task = RoundScheduler::new(c.clone(), Duration::from_secs(10)).spawn(stop_rx);
        c.submit_update("a", vec![1.0], 1, 1);
        c.submit_update("b", vec![1.0], 1, 1);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(c.current_round(), 2);
        c.submit_update("c", vec![1.0], 1, 2);
        tokio::time::sleep(Duration::from_secs(10)).await; // tick at t=10 sees a fresh round
        assert_eq!(c.current_round(), 2);
        assert_eq!(c.status().open_round_device_count, 1);
        tokio::time::sleep(Duration::from_secs(10)).await; // tick at t=20 closes it
        assert_eq!(c.current_round(), 3);
        assert_eq!(c.current_model().contributing_devices.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn threshold_close_retries_after_busy() {
        let c = coordinator(2);
        let held = c.hold_transition();
        let (_stop, stop_rx) = watch::channel(false);
        let _task = RoundScheduler::new(c.clone(), Duration::from_secs(3600)).spawn(stop_rx);
        c.submit_update("a", vec![1.0], 1, 1);
        c.submit_update("b", vec![3.0], 1, 1);
        tokio::time::sleep(Duration::from_millis(5)).await;
        // the notification was consumed by an attempt that found the guard taken
        assert_eq!(c.current_round(), 1);
        drop(held);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(c.current_round(), 2);
        let records = c.history(HistoryRange::default());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].trigger, CloseTrigger::Threshold);
        assert_eq!(c.current_model().parameters, vec![2.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_the_loop() {
        let c = coordinator(1);
        let (stop, stop_rx) = watch::channel(false);
        let task = RoundScheduler::new(c.clone(), Duration::from_secs(10)).spawn(stop_rx);
        stop.send_replace(true);
        task.await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(c.current_round(), 1);
    }
}
